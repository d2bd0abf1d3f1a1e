//! A byte-level writer for module files, used to assemble test inputs
//! without a compiler.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use ovum::module::ModuleVersion;
use ovum::token::{Token, TokenKind};
use ovum::vm::{Vm, VmParams};

pub const METHOD_PUBLIC: u32 = 0x0001;
pub const METHOD_INTERNAL: u32 = 0x0002;
pub const METHOD_INSTANCE: u32 = 0x0100;
pub const METHOD_CTOR: u32 = 0x0200;

pub const FIELD_PUBLIC: u32 = 0x0001;
pub const FIELD_PRIVATE: u32 = 0x0008;
pub const FIELD_INSTANCE: u32 = 0x0100;
pub const FIELD_HAS_VALUE: u32 = 0x0200;

pub const TYPE_PUBLIC: u32 = 0x0001;

pub const OVERLOAD_VAR_END: u32 = 0x0001;
pub const OVERLOAD_VIRTUAL: u32 = 0x0100;
pub const OVERLOAD_ABSTRACT: u32 = 0x0200;
pub const OVERLOAD_NATIVE: u32 = 0x1000;
pub const OVERLOAD_SHORT_HEADER: u32 = 0x2000;

pub const PARAM_BY_REF: u32 = 0x0001;

pub const TRY_CATCH: u32 = 1;
pub const TRY_FINALLY: u32 = 2;

pub struct OverloadDef {
	pub flags: u32,
	/// (name token, param flags)
	pub params: Vec<(u32, u32)>,
	pub optional_param_count: u16,
	pub locals: u16,
	pub max_stack: u16,
	pub try_blocks: Vec<TryBlockDef>,
	/// Raw bytecode, placed in the method block.
	pub body: Vec<u8>,
}

impl OverloadDef {
	pub fn from_code(locals: u16, max_stack: u16, body: Vec<u8>) -> Self {
		Self {
			flags: 0,
			params: Vec::new(),
			optional_param_count: 0,
			locals,
			max_stack,
			try_blocks: Vec::new(),
			body,
		}
	}
}

pub enum TryBlockDef {
	Finally {
		try_start: u32,
		try_end: u32,
		finally_start: u32,
		finally_end: u32,
	},
	Catch {
		try_start: u32,
		try_end: u32,
		/// (caught type token, catch start, catch end)
		clauses: Vec<(u32, u32, u32)>,
	},
}

pub struct MethodDef {
	pub flags: u32,
	pub name_token: u32,
	pub overloads: Vec<OverloadDef>,
}

pub struct FieldDef {
	pub flags: u32,
	pub name_token: u32,
	/// (type token, raw value) for constant fields
	pub constant: Option<(u32, i64)>,
}

pub struct PropertyDef {
	pub name_token: u32,
	pub getter: u32,
	pub setter: u32,
}

pub struct TypeDef {
	pub flags: u32,
	pub name_token: u32,
	pub base_token: u32,
	pub shared_token: u32,
	pub fields: Vec<FieldDef>,
	pub methods: Vec<MethodDef>,
	pub properties: Vec<PropertyDef>,
	/// (operator index, method token)
	pub operators: Vec<(u32, u32)>,
}

impl TypeDef {
	pub fn new(flags: u32, name_token: u32) -> Self {
		Self {
			flags,
			name_token,
			base_token: 0,
			shared_token: 0,
			fields: Vec::new(),
			methods: Vec::new(),
			properties: Vec::new(),
			operators: Vec::new(),
		}
	}
}

pub struct ModuleFileBuilder {
	version: ModuleVersion,
	strings: Vec<String>,
	module_refs: Vec<(u32, ModuleVersion)>,
	types: Vec<TypeDef>,
	functions: Vec<MethodDef>,
	/// (flags, name token, type token, raw value)
	constants: Vec<(u32, u32, u32, i64)>,
	main_token: u32,
}

impl ModuleFileBuilder {
	pub fn new(name: &str, version: ModuleVersion) -> Self {
		let mut builder = Self {
			version,
			strings: Vec::new(),
			module_refs: Vec::new(),
			types: Vec::new(),
			functions: Vec::new(),
			constants: Vec::new(),
			main_token: 0,
		};
		builder.intern(name);
		builder
	}

	/// Interns a string in the module's string table, returning its token.
	pub fn intern(&mut self, value: &str) -> u32 {
		if let Some(i) = self.strings.iter().position(|s| s == value) {
			return Token::new(TokenKind::String, i + 1).raw();
		}
		self.strings.push(value.to_string());
		Token::new(TokenKind::String, self.strings.len()).raw()
	}

	pub fn add_module_ref(&mut self, name: &str, version: ModuleVersion) -> u32 {
		let name_token = self.intern(name);
		self.module_refs.push((name_token, version));
		Token::new(TokenKind::ModuleRef, self.module_refs.len()).raw()
	}

	pub fn add_type(&mut self, ty: TypeDef) -> u32 {
		self.types.push(ty);
		Token::new(TokenKind::TypeDef, self.types.len()).raw()
	}

	pub fn add_function(&mut self, function: MethodDef) -> u32 {
		self.functions.push(function);
		Token::new(TokenKind::FunctionDef, self.functions.len()).raw()
	}

	pub fn add_simple_function(
		&mut self,
		name: &str,
		locals: u16,
		max_stack: u16,
		body: Vec<u8>,
	) -> u32 {
		let name_token = self.intern(name);
		self.add_function(MethodDef {
			flags: METHOD_PUBLIC,
			name_token,
			overloads: vec![OverloadDef::from_code(locals, max_stack, body)],
		})
	}

	pub fn add_constant(&mut self, flags: u32, name: &str, type_token: u32, value: i64) {
		let name_token = self.intern(name);
		self.constants.push((flags, name_token, type_token, value));
	}

	pub fn set_main(&mut self, token: u32) {
		self.main_token = token;
	}

	pub fn build(&self) -> Vec<u8> {
		// Method bodies are collected into the method block; overload body
		// fields reference (offset, length) within it.
		let mut bodies = Vec::new();

		let string_section = sized(&self.string_table());
		let module_ref_section = sized(&self.module_ref_table());
		let type_ref_section = sized(&[]);
		let function_ref_section = sized(&[]);
		let field_ref_section = sized(&[]);
		let method_ref_section = sized(&[]);
		let type_def_section = sized(&self.type_def_table(&mut bodies));
		let function_def_section = sized(&self.function_def_table(&mut bodies));
		let constant_section = sized(&self.constant_table());

		let sections_len = string_section.len()
			+ module_ref_section.len()
			+ type_ref_section.len()
			+ function_ref_section.len()
			+ field_ref_section.len()
			+ method_ref_section.len()
			+ type_def_section.len()
			+ function_def_section.len()
			+ constant_section.len()
			+ 4; // main method token

		// Fixed header (16) + module meta (52), then the sections, then the
		// method block with its size prefix.
		let method_block_offset = (16 + 52 + sections_len) as u32;

		let mut out = Vec::new();
		out.extend_from_slice(b"OVMM");
		put_u32(&mut out, 0x0000_0100);
		out.extend_from_slice(&[0u8; 8]);

		put_u32(&mut out, Token::new(TokenKind::String, 1).raw());
		put_i32(&mut out, self.version.major);
		put_i32(&mut out, self.version.minor);
		put_i32(&mut out, self.version.patch);
		put_i32(&mut out, self.version.revision);
		put_u32(&mut out, 0); // string map (empty)
		put_i32(&mut out, 0); // native library (none)
		put_i32(&mut out, self.types.len() as i32);
		put_i32(&mut out, self.functions.len() as i32);
		put_i32(&mut out, self.constants.len() as i32);
		put_i32(&mut out, self.field_count() as i32);
		put_i32(&mut out, self.method_count() as i32);
		put_u32(&mut out, method_block_offset);

		out.extend_from_slice(&string_section);
		out.extend_from_slice(&module_ref_section);
		out.extend_from_slice(&type_ref_section);
		out.extend_from_slice(&function_ref_section);
		out.extend_from_slice(&field_ref_section);
		out.extend_from_slice(&method_ref_section);
		out.extend_from_slice(&type_def_section);
		out.extend_from_slice(&function_def_section);
		out.extend_from_slice(&constant_section);
		put_u32(&mut out, self.main_token);

		assert_eq!(out.len(), method_block_offset as usize);
		put_u32(&mut out, bodies.len() as u32);
		out.extend_from_slice(&bodies);
		out
	}

	pub fn write_to(&self, path: &Path) {
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(path, self.build()).unwrap();
	}

	fn field_count(&self) -> usize {
		self.types.iter().map(|t| t.fields.len()).sum()
	}

	fn method_count(&self) -> usize {
		self.types.iter().map(|t| t.methods.len()).sum()
	}

	fn string_table(&self) -> Vec<u8> {
		let mut out = Vec::new();
		put_i32(&mut out, self.strings.len() as i32);
		for (i, value) in self.strings.iter().enumerate() {
			put_u32(&mut out, Token::new(TokenKind::String, i + 1).raw());
			let units: Vec<u16> = value.encode_utf16().collect();
			put_i32(&mut out, units.len() as i32);
			for unit in units {
				out.extend_from_slice(&unit.to_le_bytes());
			}
		}
		out
	}

	fn module_ref_table(&self) -> Vec<u8> {
		if self.module_refs.is_empty() {
			return Vec::new();
		}
		let mut out = Vec::new();
		put_i32(&mut out, self.module_refs.len() as i32);
		for (i, (name_token, version)) in self.module_refs.iter().enumerate() {
			put_u32(&mut out, Token::new(TokenKind::ModuleRef, i + 1).raw());
			put_u32(&mut out, *name_token);
			put_i32(&mut out, version.major);
			put_i32(&mut out, version.minor);
			put_i32(&mut out, version.patch);
			put_i32(&mut out, version.revision);
		}
		out
	}

	fn type_def_table(&self, bodies: &mut Vec<u8>) -> Vec<u8> {
		if self.types.is_empty() {
			return Vec::new();
		}
		let mut field_token = 0usize;
		let mut method_token = 0usize;

		let mut out = Vec::new();
		put_i32(&mut out, self.types.len() as i32);
		for (i, ty) in self.types.iter().enumerate() {
			put_u32(&mut out, Token::new(TokenKind::TypeDef, i + 1).raw());
			put_u32(&mut out, ty.flags);
			put_u32(&mut out, ty.name_token);
			put_u32(&mut out, ty.base_token);
			put_u32(&mut out, ty.shared_token);
			let member_count = ty.fields.len() + ty.methods.len() + ty.properties.len();
			put_i32(&mut out, member_count as i32);

			// Fields
			let mut fields = Vec::new();
			if !ty.fields.is_empty() {
				put_i32(&mut fields, ty.fields.len() as i32);
				for field in &ty.fields {
					field_token += 1;
					put_u32(&mut fields, Token::new(TokenKind::FieldDef, field_token).raw());
					put_u32(&mut fields, field.flags);
					put_u32(&mut fields, field.name_token);
					if let Some((type_token, value)) = field.constant {
						put_u32(&mut fields, type_token);
						put_i64(&mut fields, value);
					}
				}
			}
			out.extend_from_slice(&sized(&fields));

			// Methods
			let mut methods = Vec::new();
			if !ty.methods.is_empty() {
				put_i32(&mut methods, ty.methods.len() as i32);
				for method in &ty.methods {
					method_token += 1;
					put_u32(&mut methods, Token::new(TokenKind::MethodDef, method_token).raw());
					write_method(&mut methods, method, bodies);
				}
			}
			out.extend_from_slice(&sized(&methods));

			// Properties
			let mut properties = Vec::new();
			if !ty.properties.is_empty() {
				put_i32(&mut properties, ty.properties.len() as i32);
				for property in &ty.properties {
					put_u32(&mut properties, property.name_token);
					put_u32(&mut properties, property.getter);
					put_u32(&mut properties, property.setter);
				}
			}
			out.extend_from_slice(&sized(&properties));

			// Operators
			let mut operators = Vec::new();
			if !ty.operators.is_empty() {
				put_i32(&mut operators, ty.operators.len() as i32);
				for (op, method) in &ty.operators {
					put_u32(&mut operators, *op);
					put_u32(&mut operators, *method);
				}
			}
			out.extend_from_slice(&sized(&operators));

			// Native initializer (none)
			put_i32(&mut out, 0);
		}
		out
	}

	fn function_def_table(&self, bodies: &mut Vec<u8>) -> Vec<u8> {
		if self.functions.is_empty() {
			return Vec::new();
		}
		let mut out = Vec::new();
		put_i32(&mut out, self.functions.len() as i32);
		for (i, function) in self.functions.iter().enumerate() {
			put_u32(&mut out, Token::new(TokenKind::FunctionDef, i + 1).raw());
			write_method(&mut out, function, bodies);
		}
		out
	}

	fn constant_table(&self) -> Vec<u8> {
		if self.constants.is_empty() {
			return Vec::new();
		}
		let mut out = Vec::new();
		put_i32(&mut out, self.constants.len() as i32);
		for (i, (flags, name_token, type_token, value)) in self.constants.iter().enumerate() {
			put_u32(&mut out, Token::new(TokenKind::ConstantDef, i + 1).raw());
			put_u32(&mut out, *flags);
			put_u32(&mut out, *name_token);
			put_u32(&mut out, *type_token);
			put_i64(&mut out, *value);
		}
		out
	}
}

fn write_method(out: &mut Vec<u8>, method: &MethodDef, bodies: &mut Vec<u8>) {
	put_u32(out, method.flags);
	put_u32(out, method.name_token);

	let mut overloads = Vec::new();
	put_i32(&mut overloads, method.overloads.len() as i32);
	for overload in &method.overloads {
		put_u32(&mut overloads, overload.flags);
		overloads.extend_from_slice(&(overload.params.len() as u16).to_le_bytes());
		for (name_token, flags) in &overload.params {
			put_u32(&mut overloads, *name_token);
			put_u32(&mut overloads, *flags);
		}

		if overload.flags & OVERLOAD_SHORT_HEADER == 0 {
			overloads.extend_from_slice(&overload.optional_param_count.to_le_bytes());
			overloads.extend_from_slice(&overload.locals.to_le_bytes());
			overloads.extend_from_slice(&overload.max_stack.to_le_bytes());
			overloads.extend_from_slice(&sized(&try_block_table(&overload.try_blocks)));
		}

		if overload.flags & OVERLOAD_ABSTRACT == 0 {
			let offset = bodies.len() as u32;
			bodies.extend_from_slice(&overload.body);
			put_u32(&mut overloads, offset);
			put_u32(&mut overloads, overload.body.len() as u32);
		}
	}

	put_u32(out, overloads.len() as u32);
	out.extend_from_slice(&overloads);
}

fn try_block_table(blocks: &[TryBlockDef]) -> Vec<u8> {
	if blocks.is_empty() {
		return Vec::new();
	}
	let mut out = Vec::new();
	put_i32(&mut out, blocks.len() as i32);
	for block in blocks {
		match block {
			TryBlockDef::Finally { try_start, try_end, finally_start, finally_end } => {
				put_u32(&mut out, TRY_FINALLY);
				put_u32(&mut out, *try_start);
				put_u32(&mut out, *try_end);
				put_u32(&mut out, *finally_start);
				put_u32(&mut out, *finally_end);
			}
			TryBlockDef::Catch { try_start, try_end, clauses } => {
				put_u32(&mut out, TRY_CATCH);
				put_u32(&mut out, *try_start);
				put_u32(&mut out, *try_end);
				let mut payload = Vec::new();
				put_i32(&mut payload, clauses.len() as i32);
				for (token, start, end) in clauses {
					put_u32(&mut payload, *token);
					put_u32(&mut payload, *start);
					put_u32(&mut payload, *end);
				}
				out.extend_from_slice(&sized(&payload));
			}
		}
	}
	out
}

fn sized(payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 4);
	put_u32(&mut out, payload.len() as u32);
	if !payload.is_empty() {
		out.extend_from_slice(payload);
	}
	out
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
	out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
	out.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, value: i64) {
	out.extend_from_slice(&value.to_le_bytes());
}

/// A fresh startup directory under the system temp dir, plus a VM rooted in
/// it.
pub fn vm_in_temp_dir(test: &str) -> (std::rc::Rc<Vm>, PathBuf) {
	static COUNTER: AtomicUsize = AtomicUsize::new(0);
	let dir = std::env::temp_dir().join(format!(
		"ovum-test-{}-{}-{}",
		std::process::id(),
		test,
		COUNTER.fetch_add(1, Ordering::Relaxed),
	));
	std::fs::create_dir_all(&dir).unwrap();
	let vm = Vm::new(VmParams {
		startup_path: dir.clone(),
		..VmParams::default()
	});
	(vm, dir)
}

pub const V1: ModuleVersion = ModuleVersion { major: 1, minor: 0, patch: 0, revision: 0 };
