//! The method initializer: a verifier-rewriter that turns a freshly loaded
//! overload's on-disk bytecode into the form the interpreter executes. It
//! runs the first time the overload is needed and is a four-stage pipeline:
//! decode, branch/region fix-up, a worklist dataflow pass that computes stack
//! heights and applies peephole rewrites, and emission.

use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::error::{MethodInitError, MethodInitErrorKind};
use crate::ee::instructions::{
	BranchCondition, ExecOp, InstrFlags, InstrKind, Instruction, LocalOffset, Opcode, StackChange,
	BODY_ALIGNMENT,
};
use crate::ee::methodbuilder::MethodBuilder;
use crate::ee::refsignature::{RefSignature, RefSignatureBuilder, RefSignaturePool};
use crate::module::Module;
use crate::object::field::Field;
use crate::object::member::MemberFlags;
use crate::object::method::{
	DebugSymbols, Method, MethodBody, MethodFlags, MethodOverload, TryBlock, TryBlockHandler,
};
use crate::object::r#type::{Type, TypeFlags};
use crate::vm::Vm;

/// Initializes `method`'s body if it has not been initialized yet. On success
/// the rewritten body replaces the raw one, the overload is flagged as
/// initialized, and the set of types whose static constructors must run
/// before the body executes is returned. The caller drains that set, guarding
/// each type with its static-ctor running flag to catch re-entry.
///
/// On failure the overload is left uninitialized; a well-formed module never
/// produces an error here.
pub fn initialize_method(
	vm: &Rc<Vm>,
	method: &Rc<MethodOverload>,
) -> Result<Vec<Rc<Type>>, MethodInitError> {
	if method.is_initialized() {
		return Ok(Vec::new());
	}

	let raw = match &*method.body() {
		MethodBody::Raw(bytes) => bytes.clone(),
		// Native and abstract overloads have nothing to rewrite.
		MethodBody::Native(_) | MethodBody::Missing | MethodBody::Initialized(_) => {
			method.add_flags(MethodFlags::INITED);
			return Ok(Vec::new());
		}
	};

	trace!(method = %method.name(), bytes = raw.len(), "initializing method");

	let init = MethodInitializer {
		vm,
		module: method.module(),
		method: method.clone(),
	};
	init.run(&raw)
}

struct MethodInitializer<'a> {
	vm: &'a Rc<Vm>,
	module: Rc<Module>,
	method: Rc<MethodOverload>,
}

impl MethodInitializer<'_> {
	fn run(&self, raw: &[u8]) -> Result<Vec<Rc<Type>>, MethodInitError> {
		let mut builder = MethodBuilder::new();

		self.read_instructions(raw, &mut builder)?;
		if builder.is_empty() {
			return Err(self.error(None, MethodInitErrorKind::UnexpectedEndOfBody));
		}

		self.init_branch_offsets(&mut builder)?;
		let mut try_blocks = self.init_try_block_offsets(&builder)?;
		let mut debug_symbols = self.init_debug_symbol_offsets(&builder);

		self.calculate_stack_heights(&mut builder, &try_blocks)?;
		builder.perform_removals();

		self.write_initialized_body(&mut builder);
		Self::finalize_try_block_offsets(&builder, &mut try_blocks);
		Self::finalize_debug_symbol_offsets(&builder, &mut debug_symbols);

		self.method.set_try_blocks(try_blocks.into_boxed_slice());
		self.method.set_debug_symbols(debug_symbols);
		self.method.add_flags(MethodFlags::INITED);

		Ok(builder.take_types_to_initialize())
	}

	fn error(&self, instruction: Option<usize>, kind: MethodInitErrorKind) -> MethodInitError {
		MethodInitError {
			method: self.method.name().to_string(),
			instruction,
			kind,
		}
	}

	/*** Token resolution helpers ***/

	fn type_from_token(&self, token: u32) -> Result<Rc<Type>, MethodInitErrorKind> {
		let ty = self
			.module
			.type_by_token_raw(token)
			.ok_or(MethodInitErrorKind::UnresolvedToken(token))?;

		if ty.flags() & TypeFlags::PROTECTION == TypeFlags::INTERNAL
			&& !Rc::ptr_eq(&ty.module(), &self.module)
		{
			return Err(MethodInitErrorKind::InaccessibleType);
		}
		Ok(ty)
	}

	fn string_from_token(&self, token: u32) -> Result<crate::strings::IStr, MethodInitErrorKind> {
		self.module
			.string_by_token_raw(token)
			.ok_or(MethodInitErrorKind::UnresolvedToken(token))
	}

	fn method_from_token(&self, token: u32) -> Result<Rc<Method>, MethodInitErrorKind> {
		let result = self
			.module
			.method_by_token_raw(token)
			.ok_or(MethodInitErrorKind::UnresolvedToken(token))?;

		if result.is_static() {
			let from_type = self.method.decl_type();
			// Static methods are verified here; instance methods are
			// dispatched (and checked) through the instance at call time.
			let accessible = match result.decl_type() {
				Some(_) => result.is_accessible(
					from_type.as_ref(),
					from_type.as_ref(),
					Some(&self.module),
				),
				None => {
					result.flags() & MemberFlags::ACCESS_LEVEL == MemberFlags::PUBLIC
						|| Rc::ptr_eq(&result.module(), &self.module)
				}
			};
			if !accessible {
				return Err(MethodInitErrorKind::InaccessibleMember);
			}
		}
		Ok(result)
	}

	/// Resolves a call target and picks the overload for `argc` stack slots
	/// (including the instance, when the method takes one).
	fn method_overload_from_token(
		&self,
		token: u32,
		argc: u16,
	) -> Result<(Rc<MethodOverload>, u16), MethodInitErrorKind> {
		let method = self.method_from_token(token)?;
		let instance_offset = if method.is_static() { 0 } else { 1 };
		let named_argc = argc
			.checked_sub(instance_offset)
			.ok_or(MethodInitErrorKind::NoMatchingOverload)?;
		let overload = method
			.resolve_overload(named_argc)
			.ok_or(MethodInitErrorKind::NoMatchingOverload)?;
		Ok((overload, named_argc))
	}

	fn field_from_token(
		&self,
		token: u32,
		should_be_static: bool,
	) -> Result<Rc<Field>, MethodInitErrorKind> {
		let field = self
			.module
			.field_by_token_raw(token)
			.ok_or(MethodInitErrorKind::UnresolvedToken(token))?;

		if field.is_static() {
			let from_type = self.method.decl_type();
			if !field.is_accessible(None, from_type.as_ref(), Some(&self.module)) {
				return Err(MethodInitErrorKind::InaccessibleMember);
			}
		}
		if field.is_static() != should_be_static {
			return Err(MethodInitErrorKind::FieldStaticMismatch);
		}
		Ok(field)
	}

	/// Newobj targets must be concrete, non-primitive types with an
	/// accessible instance constructor of the right arity.
	fn ensure_constructible(
		&self,
		ty: &Rc<Type>,
		argc: u16,
	) -> Result<Rc<MethodOverload>, MethodInitErrorKind> {
		if ty.is_primitive() || ty.is_abstract() || ty.is_static() {
			return Err(MethodInitErrorKind::TypeNotConstructible);
		}
		let ctor = ty
			.instance_ctor()
			.ok_or(MethodInitErrorKind::TypeNotConstructible)?;
		let from_type = self.method.decl_type();
		if !ctor.is_accessible(Some(ty), from_type.as_ref(), Some(&self.module)) {
			return Err(MethodInitErrorKind::TypeNotConstructible);
		}
		ctor.resolve_overload(argc)
			.ok_or(MethodInitErrorKind::NoMatchingOverload)
	}

	/*** Stage 1: decoding ***/

	fn read_instructions(
		&self,
		raw: &[u8],
		builder: &mut MethodBuilder,
	) -> Result<(), MethodInitError> {
		let refs = RefSignature::new(self.method.ref_signature(), self.vm.ref_signatures());
		// The ref signature reserves bit 0 for the instance; for static
		// methods argument 0 is the first named parameter, at bit 1.
		let arg_ref_offset = self.method.group().is_static() as u32;

		let mut pos = 0usize;
		while pos < raw.len() {
			let start = pos;
			let index = builder.len();
			let at = |kind| self.error(Some(index), kind);

			let opcode_byte = raw[pos];
			pos += 1;
			let opcode = Opcode::try_from(opcode_byte)
				.map_err(|_| at(MethodInitErrorKind::InvalidOpcode(opcode_byte)))?;

			let mut r = BodyReader { raw, pos, index };
			let instr = self.decode_one(opcode, &mut r, builder, &refs, arg_ref_offset)?;
			pos = r.pos;

			builder.append(start as u32, (pos - start) as u32, instr);
		}
		Ok(())
	}

	fn decode_one(
		&self,
		opcode: Opcode,
		r: &mut BodyReader,
		builder: &mut MethodBuilder,
		refs: &RefSignature,
		arg_ref_offset: u32,
	) -> Result<Instruction, MethodInitError> {
		use InstrKind::*;

		let method = self.method.clone();
		let index = r.index;
		let fail =
			|kind: MethodInitErrorKind| -> MethodInitError { self.error(Some(index), kind) };

		let load_arg = |arg: u16| -> Instruction {
			let mut instr = Instruction::new(LoadLocal {
				source: LocalOffset(method.arg_offset(arg)),
			});
			if refs.is_param_ref(arg as u32 + arg_ref_offset) {
				instr.flags |= InstrFlags::PUSHES_REF;
			}
			instr
		};
		let store_arg = |arg: u16| -> Instruction {
			Instruction::new(StoreLocal { target: LocalOffset(method.arg_offset(arg)) })
		};
		let load_local = |local: u16| -> Instruction {
			Instruction::new(LoadLocal { source: LocalOffset(method.local_offset(local)) })
		};
		let store_local = |local: u16| -> Instruction {
			Instruction::new(StoreLocal { target: LocalOffset(method.local_offset(local)) })
		};

		let instr = match opcode {
			Opcode::nop => Instruction::new(Nop),
			Opcode::dup => Instruction::new(Dup),
			Opcode::pop => Instruction::new(Pop),

			// Arguments
			Opcode::ldarg_0 | Opcode::ldarg_1 | Opcode::ldarg_2 | Opcode::ldarg_3 => {
				load_arg(opcode as u16 - Opcode::ldarg_0 as u16)
			}
			Opcode::ldarg_s => load_arg(r.read_u8(self)? as u16),
			Opcode::ldarg => load_arg(r.read_u16(self)?),
			Opcode::starg_s => store_arg(r.read_u8(self)? as u16),
			Opcode::starg => store_arg(r.read_u16(self)?),

			// Locals
			Opcode::ldloc_0 | Opcode::ldloc_1 | Opcode::ldloc_2 | Opcode::ldloc_3 => {
				load_local(opcode as u16 - Opcode::ldloc_0 as u16)
			}
			Opcode::stloc_0 | Opcode::stloc_1 | Opcode::stloc_2 | Opcode::stloc_3 => {
				store_local(opcode as u16 - Opcode::stloc_0 as u16)
			}
			Opcode::ldloc_s => load_local(r.read_u8(self)? as u16),
			Opcode::ldloc => load_local(r.read_u16(self)?),
			Opcode::stloc_s => store_local(r.read_u8(self)? as u16),
			Opcode::stloc => store_local(r.read_u16(self)?),

			// Values and object initialisation
			Opcode::ldnull => Instruction::new(LoadNull),
			Opcode::ldfalse => Instruction::new(LoadBool { value: false }),
			Opcode::ldtrue => Instruction::new(LoadBool { value: true }),
			Opcode::ldc_i_m1
			| Opcode::ldc_i_0
			| Opcode::ldc_i_1
			| Opcode::ldc_i_2
			| Opcode::ldc_i_3
			| Opcode::ldc_i_4
			| Opcode::ldc_i_5
			| Opcode::ldc_i_6
			| Opcode::ldc_i_7
			| Opcode::ldc_i_8 => Instruction::new(LoadInt {
				value: opcode as i64 - Opcode::ldc_i_0 as i64,
			}),
			Opcode::ldc_i_s => Instruction::new(LoadInt { value: r.read_i8(self)? as i64 }),
			Opcode::ldc_i_m => Instruction::new(LoadInt { value: r.read_i32(self)? as i64 }),
			Opcode::ldc_i => Instruction::new(LoadInt { value: r.read_i64(self)? }),
			Opcode::ldc_u => Instruction::new(LoadUInt { value: r.read_u64(self)? }),
			Opcode::ldc_r => Instruction::new(LoadReal { value: r.read_f64(self)? }),
			Opcode::ldstr => {
				let value = self.string_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadString { value })
			}
			Opcode::ldargc => Instruction::new(LoadArgCount),
			Opcode::ldenum_s => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadEnum { ty, value: r.read_i32(self)? as i64 })
			}
			Opcode::ldenum => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadEnum { ty, value: r.read_i64(self)? })
			}
			Opcode::newobj_s | Opcode::newobj => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				let argc = match opcode {
					Opcode::newobj_s => r.read_u8(self)? as u16,
					_ => r.read_u16(self)?,
				};
				let ctor = self.ensure_constructible(&ty, argc).map_err(fail)?;
				Instruction::new(NewObject { ty, argc, ctor })
			}

			// Invocation
			Opcode::call_0 | Opcode::call_1 | Opcode::call_2 | Opcode::call_3 => {
				Instruction::new(Call { argc: opcode as u16 - Opcode::call_0 as u16 })
			}
			Opcode::call_s => Instruction::new(Call { argc: r.read_u8(self)? as u16 }),
			Opcode::call => Instruction::new(Call { argc: r.read_u16(self)? }),
			Opcode::scall_s | Opcode::scall => {
				let token = r.read_u32(self)?;
				let argc = match opcode {
					Opcode::scall_s => r.read_u8(self)? as u16,
					_ => r.read_u16(self)?,
				};
				let (overload, named_argc) =
					self.method_overload_from_token(token, argc).map_err(fail)?;
				Instruction::new(StaticCall { argc: named_argc, overload })
			}
			Opcode::apply => Instruction::new(Apply),
			Opcode::sapply => {
				let target = self.method_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(StaticApply { method: target })
			}

			// Control flow
			Opcode::retnull => Instruction::new(RetNull),
			Opcode::ret => Instruction::new(Ret),
			Opcode::br_s => Instruction::new(Branch {
				target: r.read_i8(self)? as i32,
				is_leave: false,
			}),
			Opcode::brnull_s => Instruction::new(CondBranch {
				target: r.read_i8(self)? as i32,
				condition: BranchCondition::IfNull,
			}),
			Opcode::brinst_s => Instruction::new(CondBranch {
				target: r.read_i8(self)? as i32,
				condition: BranchCondition::NotNull,
			}),
			Opcode::brfalse_s => Instruction::new(CondBranch {
				target: r.read_i8(self)? as i32,
				condition: BranchCondition::IfFalse,
			}),
			Opcode::brtrue_s => Instruction::new(CondBranch {
				target: r.read_i8(self)? as i32,
				condition: BranchCondition::IfTrue,
			}),
			Opcode::brref_s | Opcode::brnref_s => Instruction::new(BranchIfRef {
				target: r.read_i8(self)? as i32,
				branch_if_same: opcode == Opcode::brref_s,
			}),
			Opcode::brtype_s => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(BranchIfType { target: r.read_i8(self)? as i32, ty })
			}
			Opcode::br => Instruction::new(Branch { target: r.read_i32(self)?, is_leave: false }),
			Opcode::brnull => Instruction::new(CondBranch {
				target: r.read_i32(self)?,
				condition: BranchCondition::IfNull,
			}),
			Opcode::brinst => Instruction::new(CondBranch {
				target: r.read_i32(self)?,
				condition: BranchCondition::NotNull,
			}),
			Opcode::brfalse => Instruction::new(CondBranch {
				target: r.read_i32(self)?,
				condition: BranchCondition::IfFalse,
			}),
			Opcode::brtrue => Instruction::new(CondBranch {
				target: r.read_i32(self)?,
				condition: BranchCondition::IfTrue,
			}),
			Opcode::brref | Opcode::brnref => Instruction::new(BranchIfRef {
				target: r.read_i32(self)?,
				branch_if_same: opcode == Opcode::brref,
			}),
			Opcode::brtype => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(BranchIfType { target: r.read_i32(self)?, ty })
			}
			Opcode::switch_s | Opcode::switch => {
				let count = r.read_u16(self)? as usize;
				let mut targets = Vec::with_capacity(count);
				for _ in 0..count {
					let target = match opcode {
						Opcode::switch_s => r.read_i8(self)? as i32,
						_ => r.read_i32(self)?,
					};
					targets.push(target);
				}
				Instruction::new(Switch { targets })
			}

			// Operators
			Opcode::add
			| Opcode::sub
			| Opcode::or
			| Opcode::xor
			| Opcode::mul
			| Opcode::div
			| Opcode::rem
			| Opcode::and
			| Opcode::pow
			| Opcode::shl
			| Opcode::shr
			| Opcode::hashop
			| Opcode::dollar
			| Opcode::plus
			| Opcode::neg
			| Opcode::not
			| Opcode::eq
			| Opcode::cmp => {
				let op = crate::object::r#type::Operator::try_from(
					opcode as u32 - Opcode::add as u32,
				)
				.expect("operator opcodes mirror the operator table");
				Instruction::new(ExecOperator { op: ExecOp::Operator(op) })
			}
			Opcode::lt => Instruction::new(ExecOperator { op: ExecOp::CmpLt }),
			Opcode::gt => Instruction::new(ExecOperator { op: ExecOp::CmpGt }),
			Opcode::lte => Instruction::new(ExecOperator { op: ExecOp::CmpLte }),
			Opcode::gte => Instruction::new(ExecOperator { op: ExecOp::CmpGte }),
			Opcode::concat => Instruction::new(ExecOperator { op: ExecOp::Concat }),

			// Misc. data
			Opcode::list_0 => Instruction::new(CreateList { capacity: 0 }),
			Opcode::list_s => Instruction::new(CreateList { capacity: r.read_u8(self)? as u32 }),
			Opcode::list => Instruction::new(CreateList { capacity: r.read_u32(self)? }),
			Opcode::hash_0 => Instruction::new(CreateHash { capacity: 0 }),
			Opcode::hash_s => Instruction::new(CreateHash { capacity: r.read_u8(self)? as u32 }),
			Opcode::hash => Instruction::new(CreateHash { capacity: r.read_u32(self)? }),
			Opcode::lditer => Instruction::new(LoadIterator),
			Opcode::ldtype => Instruction::new(LoadTypeOf),

			// Fields
			Opcode::ldfld => {
				let field = self.field_from_token(r.read_u32(self)?, false).map_err(fail)?;
				Instruction::new(LoadField { field })
			}
			Opcode::stfld => {
				let field = self.field_from_token(r.read_u32(self)?, false).map_err(fail)?;
				Instruction::new(StoreField { field })
			}
			Opcode::ldsfld => {
				let field = self.field_from_token(r.read_u32(self)?, true).map_err(fail)?;
				builder.add_type_to_initialize(&field.decl_type());
				Instruction::new(LoadStaticField { field })
			}
			Opcode::stsfld => {
				let field = self.field_from_token(r.read_u32(self)?, true).map_err(fail)?;
				builder.add_type_to_initialize(&field.decl_type());
				Instruction::new(StoreStaticField { field })
			}

			// Named member access
			Opcode::ldmem => {
				let name = self.string_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadMember { name })
			}
			Opcode::stmem => {
				let name = self.string_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(StoreMember { name })
			}

			// Indexers
			Opcode::ldidx_1 => Instruction::new(LoadIndexer { argc: 1 }),
			Opcode::ldidx_s => Instruction::new(LoadIndexer { argc: r.read_u8(self)? as u16 }),
			Opcode::ldidx => Instruction::new(LoadIndexer { argc: r.read_u16(self)? }),
			Opcode::stidx_1 => Instruction::new(StoreIndexer { argc: 1 }),
			Opcode::stidx_s => Instruction::new(StoreIndexer { argc: r.read_u8(self)? as u16 }),
			Opcode::stidx => Instruction::new(StoreIndexer { argc: r.read_u16(self)? }),

			// Global/static functions and type tokens
			Opcode::ldsfn => {
				let target = self.method_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadStaticFunction { method: target })
			}
			Opcode::ldtypetkn => {
				let ty = self.type_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::new(LoadTypeToken { ty })
			}

			// Exception handling
			Opcode::throw => Instruction::new(Throw),
			Opcode::rethrow => Instruction::new(Rethrow),
			Opcode::leave_s => Instruction::new(Branch {
				target: r.read_i8(self)? as i32,
				is_leave: true,
			}),
			Opcode::leave => Instruction::new(Branch { target: r.read_i32(self)?, is_leave: true }),
			Opcode::endfinally => Instruction::new(EndFinally),

			// Call member
			Opcode::callmem_s | Opcode::callmem => {
				let name = self.string_from_token(r.read_u32(self)?).map_err(fail)?;
				let argc = match opcode {
					Opcode::callmem_s => r.read_u8(self)? as u16,
					_ => r.read_u16(self)?,
				};
				Instruction::new(CallMember { name, argc })
			}

			// References
			Opcode::ldmemref => {
				let name = self.string_from_token(r.read_u32(self)?).map_err(fail)?;
				Instruction::with_flags(LoadMemberRef { name }, InstrFlags::PUSHES_REF)
			}
			Opcode::ldargref_s | Opcode::ldargref => {
				let arg = match opcode {
					Opcode::ldargref_s => r.read_u8(self)? as u16,
					_ => r.read_u16(self)?,
				};
				if refs.is_param_ref(arg as u32 + arg_ref_offset) {
					// The parameter already holds a reference; load it as-is.
					Instruction::with_flags(
						LoadLocal { source: LocalOffset(method.arg_offset(arg)) },
						InstrFlags::PUSHES_REF,
					)
				} else {
					Instruction::with_flags(
						LoadLocalRef { local: LocalOffset(method.arg_offset(arg)) },
						InstrFlags::PUSHES_REF,
					)
				}
			}
			Opcode::ldlocref_s | Opcode::ldlocref => {
				let local = match opcode {
					Opcode::ldlocref_s => r.read_u8(self)? as u16,
					_ => r.read_u16(self)?,
				};
				Instruction::with_flags(
					LoadLocalRef { local: LocalOffset(method.local_offset(local)) },
					InstrFlags::PUSHES_REF,
				)
			}
			Opcode::ldfldref => {
				let field = self.field_from_token(r.read_u32(self)?, false).map_err(fail)?;
				Instruction::with_flags(LoadFieldRef { field }, InstrFlags::PUSHES_REF)
			}
			Opcode::ldsfldref => {
				let field = self.field_from_token(r.read_u32(self)?, true).map_err(fail)?;
				builder.add_type_to_initialize(&field.decl_type());
				Instruction::with_flags(LoadStaticFieldRef { field }, InstrFlags::PUSHES_REF)
			}
		};
		Ok(instr)
	}

	/*** Stage 2: offset initialization ***/

	/// Translates branch and switch targets from byte-relative offsets into
	/// instruction indices, marking the targets.
	fn init_branch_offsets(&self, builder: &mut MethodBuilder) -> Result<(), MethodInitError> {
		if !builder.has_branches() {
			return Ok(());
		}

		for i in 0..builder.len() {
			let base = builder.original_offset(i) as i64 + builder.original_size(i) as i64;

			if builder.instr(i).is_branch() {
				let relative = builder.instr(i).branch_target().unwrap_or(0) as i64;
				let target = self.resolve_branch_target(builder, i, base + relative)?;
				*builder.instr_mut(i).branch_target_mut().unwrap() = target as i32;
				builder.add_branch(target);
			} else if builder.instr(i).is_switch() {
				let relatives = builder.instr(i).switch_targets().unwrap_or(&[]).to_vec();
				let mut resolved = Vec::with_capacity(relatives.len());
				for relative in relatives {
					let target = self.resolve_branch_target(builder, i, base + relative as i64)?;
					resolved.push(target as i32);
					builder.add_branch(target);
				}
				*builder.instr_mut(i).switch_targets_mut().unwrap() = resolved;
			}
		}
		Ok(())
	}

	fn resolve_branch_target(
		&self,
		builder: &MethodBuilder,
		index: usize,
		byte_offset: i64,
	) -> Result<usize, MethodInitError> {
		let resolved = u32::try_from(byte_offset)
			.ok()
			.and_then(|offset| builder.find_index(offset))
			.filter(|target| *target < builder.len());
		resolved.ok_or_else(|| self.error(Some(index), MethodInitErrorKind::InvalidBranchOffset))
	}

	/// Translates try-region boundaries into instruction indices, resolving
	/// any caught types the module reader had to defer. Operates on a copy;
	/// the overload is only updated once the whole rewrite succeeds.
	fn init_try_block_offsets(
		&self,
		builder: &MethodBuilder,
	) -> Result<Vec<TryBlock>, MethodInitError> {
		let mut blocks: Vec<TryBlock> = self.method.try_blocks().to_vec();
		for block in &mut blocks {
			block.try_start = self.region_index(builder, block.try_start)?;
			block.try_end = self.region_index(builder, block.try_end)?;
			match &mut block.handler {
				TryBlockHandler::Catch { clauses } => {
					for clause in clauses.iter_mut() {
						if clause.caught_type.is_none() {
							clause.caught_type = Some(
								self.type_from_token(clause.caught_type_token)
									.map_err(|kind| self.error(None, kind))?,
							);
						}
						clause.catch_start = self.region_index(builder, clause.catch_start)?;
						clause.catch_end = self.region_index(builder, clause.catch_end)?;
					}
				}
				TryBlockHandler::Finally { finally_start, finally_end } => {
					*finally_start = self.region_index(builder, *finally_start)?;
					*finally_end = self.region_index(builder, *finally_end)?;
				}
			}
		}
		Ok(blocks)
	}

	fn region_index(
		&self,
		builder: &MethodBuilder,
		byte_offset: u32,
	) -> Result<u32, MethodInitError> {
		builder
			.find_index(byte_offset)
			.map(|i| i as u32)
			.ok_or_else(|| self.error(None, MethodInitErrorKind::InvalidBranchOffset))
	}

	/// Debug spans follow the same translation; a range that no longer
	/// resolves is left alone rather than failing the method.
	fn init_debug_symbol_offsets(&self, builder: &MethodBuilder) -> Option<DebugSymbols> {
		let mut symbols = self.method.debug_symbols().clone()?;
		for loc in symbols.symbols.iter_mut() {
			if let Some(index) = builder.find_index(loc.start_offset) {
				loc.start_offset = index as u32;
			}
			if let Some(index) = builder.find_index(loc.end_offset) {
				loc.end_offset = index as u32;
			}
		}
		Some(symbols)
	}

	/*** Stage 3: stack heights and peephole rewrites ***/

	fn calculate_stack_heights(
		&self,
		builder: &mut MethodBuilder,
		try_blocks: &[TryBlock],
	) -> Result<(), MethodInitError> {
		let mut stack = StackManager::new(self.method.max_stack(), self.vm.ref_signatures());

		// The first instruction is always reachable. Catch and finally
		// handlers are never reached by fallthrough or branching, so each is
		// seeded as a branch of its own; a catch starts with the exception
		// on the stack.
		stack.enqueue_with_height(0, 0);
		for block in try_blocks {
			match &block.handler {
				TryBlockHandler::Catch { clauses } => {
					for clause in clauses.iter() {
						stack.enqueue_with_height(1, clause.catch_start as i32);
					}
				}
				TryBlockHandler::Finally { finally_start, .. } => {
					stack.enqueue_with_height(0, *finally_start as i32);
				}
			}
		}

		while let Some(first) = stack.dequeue() {
			let mut index = first as usize;
			let mut prev: Option<usize> = None;

			loop {
				if index >= builder.len() {
					return Err(self.error(
						Some(index),
						MethodInitErrorKind::InvalidBranchOffset,
					));
				}

				if let Some(recorded) = builder.stack_height(index) {
					// Already visited along another path: heights and
					// referenceness must agree at the merge point.
					if recorded != stack.height() {
						return Err(
							self.error(Some(index), MethodInitErrorKind::InconsistentStack)
						);
					}
					if builder.instr(index).has_branches()
						&& builder.ref_signature(index) != stack.full_signature()
					{
						return Err(
							self.error(Some(index), MethodInitErrorKind::InconsistentStack)
						);
					}
					break;
				}

				let height = stack.height();
				builder.set_stack_height(index, height);
				if builder.instr(index).has_branches() {
					builder.set_ref_signature(index, stack.full_signature());
				}

				self.update_input_output(builder, index, prev, height)?;

				let sc = builder.instr(index).stack_change();
				if sc.removed > 0 && height >= sc.removed {
					if builder.instr(index).accepts_refs() {
						if self.verify_call_refs(builder.instr(index), &stack).is_some() {
							return Err(self
								.error(Some(index), MethodInitErrorKind::InconsistentStack));
						}
					} else if stack.has_refs(sc.removed) {
						return Err(
							self.error(Some(index), MethodInitErrorKind::StackHasRefs)
						);
					}
				}

				let pushes_ref = builder.instr(index).pushes_ref();
				stack
					.apply(sc, pushes_ref)
					.map_err(|kind| self.error(Some(index), kind))?;

				if builder.instr(index).is_branch() {
					if builder.instr(index).is_conditional_branch() {
						let target = builder.instr(index).branch_target().unwrap();
						stack.enqueue(target);
						self.try_fuse_comparison(builder, index, prev);
					} else {
						// Unconditional: continue at the target.
						let target = builder.instr(index).branch_target().unwrap();
						prev = None;
						index = target as usize;
						continue;
					}
				} else if builder.instr(index).is_switch() {
					for target in builder.instr(index).switch_targets().unwrap_or(&[]) {
						stack.enqueue(*target);
					}
				} else if builder.instr(index).is_terminator() {
					break;
				}

				prev = Some(index);
				index += 1;
			}
		}

		Ok(())
	}

	/// Assigns the instruction's input and output slots, applying the
	/// store/pop output-redirection and load/dup input-redirection rewrites
	/// where the shape allows. Rewrites only apply when there is a previous
	/// instruction in the linear sequence and the current instruction has no
	/// incoming branches.
	fn update_input_output(
		&self,
		builder: &mut MethodBuilder,
		index: usize,
		prev: Option<usize>,
		height: u16,
	) -> Result<(), MethodInitError> {
		let sc = builder.instr(index).stack_change();

		if sc.removed > 0 {
			let mut handled = false;

			if let Some(p) = prev {
				if !builder.instr(index).has_branches() {
					let prev_has_output = builder.instr(p).has_output();
					let prev_single = builder.instr(p).stack_change().added == 1
						|| builder.instr(p).is_dup();

					if prev_has_output && prev_single {
						if builder.instr(index).is_store_local() {
							// Send prev's result straight to the target
							// local; the store disappears.
							let target = match &builder.instr(index).kind {
								InstrKind::StoreLocal { target } => *target,
								_ => unreachable!(),
							};
							builder.instr_mut(p).update_output(target, false);
							builder.mark_for_removal(index);
							handled = true;
						} else if matches!(builder.instr(index).kind, InstrKind::Pop) {
							// Write the result to its stack slot but leave it
							// uncounted; the pop disappears.
							let slot =
								LocalOffset(self.method.stack_offset(height.saturating_sub(1)));
							builder.instr_mut(p).update_output(slot, false);
							builder.mark_for_removal(index);
							handled = true;
						}
					}

					if !handled && !builder.instr(index).requires_stack_input() {
						if builder.instr(p).is_load_local() {
							// Feed the consumer straight from the local and
							// drop the load.
							let source = match &builder.instr(p).kind {
								InstrKind::LoadLocal { source } => *source,
								_ => unreachable!(),
							};
							builder.instr_mut(index).update_input(source, false);
							builder.mark_for_removal(p);
							handled = true;
						} else if builder.instr(p).is_dup()
							&& builder.instr(index).is_conditional_branch()
						{
							// dup feeding a conditional branch: branch on the
							// dup's source and drop the dup.
							let source = builder.instr(p).input;
							builder.instr_mut(index).update_input(source, false);
							builder.mark_for_removal(p);
							handled = true;
						}
					}
				}
			}

			if !handled {
				let base =
					LocalOffset(self.method.stack_offset(height.saturating_sub(sc.removed)));
				builder.instr_mut(index).update_input(base, true);
			}
		}

		if builder.instr(index).has_output() {
			let slot = LocalOffset(self.method.stack_offset(height.saturating_sub(sc.removed)));
			builder.instr_mut(index).update_output(slot, true);
		}

		Ok(())
	}

	/// Comparison followed by brtrue/brfalse becomes a single fused branch.
	fn try_fuse_comparison(&self, builder: &mut MethodBuilder, index: usize, prev: Option<usize>) {
		let Some(p) = prev else { return };
		if builder.instr(index).has_branches() {
			return;
		}

		let negated = match &builder.instr(index).kind {
			InstrKind::CondBranch { condition: BranchCondition::IfTrue, .. } => false,
			InstrKind::CondBranch { condition: BranchCondition::IfFalse, .. } => true,
			_ => return,
		};
		let target = builder.instr(index).branch_target().unwrap();

		let Some(op) = (match &builder.instr(p).kind {
			InstrKind::ExecOperator { op } => op.comparison(),
			_ => None,
		}) else {
			return;
		};

		let mut fused =
			Instruction::new(InstrKind::BranchComparison { target, op, negated });
		fused.input = builder.instr(p).input;
		fused.input_from_stack = builder.instr(p).input_from_stack;
		fused.flags = builder.instr(p).flags & InstrFlags::HAS_BRANCHES;
		builder.set_instruction(p, fused);
		builder.mark_for_removal(index);
	}

	fn verify_call_refs(&self, instr: &Instruction, stack: &StackManager) -> Option<u16> {
		let pool = self.vm.ref_signatures();
		match &instr.kind {
			InstrKind::StaticCall { argc, overload } => {
				let has_instance = overload.is_instance();
				let slots = argc + has_instance as u16;
				let first_bit = if has_instance { 0 } else { 1 };
				let signature = stack.arg_signature(slots, first_bit);
				overload.verify_ref_signature(pool, signature, *argc)
			}
			InstrKind::NewObject { argc, ctor, .. } => {
				// The instance does not exist yet; only named arguments are
				// on the stack.
				let signature = stack.arg_signature(*argc, 1);
				ctor.verify_ref_signature(pool, signature, *argc)
			}
			_ => None,
		}
	}

	/*** Stage 4: emission and finalization ***/

	fn write_initialized_body(&self, builder: &mut MethodBuilder) {
		builder.assign_offsets();

		let mut buffer = Vec::with_capacity(builder.byte_size() as usize);
		for i in 0..builder.len() {
			let resolve = |target: i32| builder.offset_of_new_index(target) as u64;
			builder.instr(i).write_bytes(&mut buffer, &resolve);
			debug_assert_eq!(buffer.len() % BODY_ALIGNMENT, 0);
		}

		// The raw on-disk body is discarded here.
		self.method.set_body(MethodBody::Initialized(buffer.into_boxed_slice()));
	}

	fn finalize_try_block_offsets(builder: &MethodBuilder, blocks: &mut [TryBlock]) {
		for block in blocks {
			block.try_start = builder.new_offset(block.try_start);
			block.try_end = builder.new_offset(block.try_end);
			match &mut block.handler {
				TryBlockHandler::Catch { clauses } => {
					for clause in clauses.iter_mut() {
						clause.catch_start = builder.new_offset(clause.catch_start);
						clause.catch_end = builder.new_offset(clause.catch_end);
					}
				}
				TryBlockHandler::Finally { finally_start, finally_end } => {
					*finally_start = builder.new_offset(*finally_start);
					*finally_end = builder.new_offset(*finally_end);
				}
			}
		}
	}

	fn finalize_debug_symbol_offsets(builder: &MethodBuilder, symbols: &mut Option<DebugSymbols>) {
		let Some(symbols) = symbols else { return };
		for loc in symbols.symbols.iter_mut() {
			loc.start_offset = builder.new_offset(loc.start_offset);
			loc.end_offset = builder.new_offset(loc.end_offset);
		}
	}
}

/// Cursor over the raw bytecode with method-init error reporting.
struct BodyReader<'a> {
	raw: &'a [u8],
	pos: usize,
	index: usize,
}

macro_rules! body_reader_primitives {
	($($name: ident: $ty: ty),*) => {
		$(
			fn $name(&mut self, init: &MethodInitializer) -> Result<$ty, MethodInitError> {
				const SIZE: usize = std::mem::size_of::<$ty>();
				let end = self.pos + SIZE;
				if end > self.raw.len() {
					return Err(init.error(
						Some(self.index),
						MethodInitErrorKind::UnexpectedEndOfBody,
					));
				}
				let mut bytes = [0u8; SIZE];
				bytes.copy_from_slice(&self.raw[self.pos..end]);
				self.pos = end;
				Ok(<$ty>::from_le_bytes(bytes))
			}
		)*
	};
}

impl BodyReader<'_> {
	body_reader_primitives! {
		read_u8: u8,
		read_i8: i8,
		read_u16: u16,
		read_i32: i32,
		read_u32: u32,
		read_i64: i64,
		read_u64: u64,
		read_f64: f64
	}
}

#[derive(Copy, Clone, Default)]
struct StackEntry {
	is_ref: bool,
}

/// Tracks the abstract evaluation stack per pending branch. The front of the
/// queue is the branch currently being walked.
struct StackManager<'a> {
	max_stack: u16,
	branches: VecDeque<BranchState>,
	pool: &'a RefSignaturePool,
}

struct BranchState {
	first_instr: i32,
	stack: Vec<StackEntry>,
}

impl<'a> StackManager<'a> {
	fn new(max_stack: u16, pool: &'a RefSignaturePool) -> Self {
		// A sentinel branch keeps the first dequeue uniform.
		let mut branches = VecDeque::new();
		branches.push_back(BranchState { first_instr: -1, stack: Vec::new() });
		Self { max_stack, branches, pool }
	}

	fn current(&self) -> &BranchState {
		self.branches.front().expect("the branch queue is never empty while walking")
	}

	fn height(&self) -> u16 {
		self.current().stack.len() as u16
	}

	/// Queues a branch continuing with the current stack.
	fn enqueue(&mut self, first_instr: i32) {
		let stack = self.current().stack.clone();
		self.branches.push_back(BranchState { first_instr, stack });
	}

	/// Queues a branch with a fresh stack of `height` non-reference values.
	fn enqueue_with_height(&mut self, height: u16, first_instr: i32) {
		self.branches.push_back(BranchState {
			first_instr,
			stack: vec![StackEntry::default(); height as usize],
		});
	}

	fn dequeue(&mut self) -> Option<i32> {
		self.branches.pop_front();
		self.branches.front().map(|b| b.first_instr)
	}

	fn apply(&mut self, change: StackChange, push_ref: bool) -> Result<(), MethodInitErrorKind> {
		let max_stack = self.max_stack;
		let current = self.branches.front_mut().expect("branch queue is empty");
		let height = current.stack.len();
		if height < change.removed as usize {
			return Err(MethodInitErrorKind::StackUnderflow);
		}
		let new_height = height - change.removed as usize + change.added as usize;
		if new_height > max_stack as usize {
			return Err(MethodInitErrorKind::StackOverflow);
		}
		current.stack.truncate(height - change.removed as usize);
		current
			.stack
			.extend(std::iter::repeat(StackEntry { is_ref: push_ref }).take(change.added as usize));
		Ok(())
	}

	fn has_refs(&self, count: u16) -> bool {
		let stack = &self.current().stack;
		stack.iter().rev().take(count as usize).any(|e| e.is_ref)
	}

	/// Referenceness of the whole stack, interned; used to compare merge
	/// points reached along different paths.
	fn full_signature(&self) -> u32 {
		let stack = &self.current().stack;
		let mut builder = RefSignatureBuilder::new(stack.len() as u32 + 1);
		for (i, entry) in stack.iter().enumerate() {
			if entry.is_ref {
				builder.set_param(i as u32, true);
			}
		}
		builder.commit(self.pool)
	}

	/// Referenceness of the top `slots` stack entries as an argument
	/// signature. `first_bit` is 0 when the bottom slot is the instance and
	/// 1 otherwise (bit 0 stays reserved for the absent instance).
	fn arg_signature(&self, slots: u16, first_bit: u32) -> u32 {
		let stack = &self.current().stack;
		let origin = stack.len() - slots as usize;
		let mut builder = RefSignatureBuilder::new(slots as u32 + first_bit + 1);
		for i in 0..slots as usize {
			if stack[origin + i].is_ref {
				builder.set_param(i as u32 + first_bit, true);
			}
		}
		builder.commit(self.pool)
	}
}
