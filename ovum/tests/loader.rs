mod common;

use std::rc::Rc;

use ovum::error::ModuleLoadErrorKind;
use ovum::module::{Module, ModuleVersion};
use ovum::object::r#type::Operator;
use ovum::object::Member;
use ovum::token::{Token, TokenKind};
use ovum::value::{ValueData, VALUE_SIZE};

use common::*;

#[test]
fn truncated_file_fails_before_entering_the_pool() {
	let (vm, dir) = vm_in_temp_dir("truncated");
	let path = dir.join("empty.ovm");

	let mut bytes = Vec::new();
	bytes.extend_from_slice(b"OVMM");
	bytes.extend_from_slice(&0x0000_0100u32.to_le_bytes());
	bytes.extend_from_slice(&[0u8; 8]);
	std::fs::write(&path, bytes).unwrap();

	let err = Module::open(&vm, &path, None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::UnexpectedEndOfFile));
	assert!(vm.module_pool().is_empty());
}

#[test]
fn bad_magic_is_rejected() {
	let (vm, dir) = vm_in_temp_dir("magic");
	let path = dir.join("bad.ovm");

	let mut bytes = ModuleFileBuilder::new("bad", V1).build();
	bytes[..4].copy_from_slice(b"OVMX");
	std::fs::write(&path, bytes).unwrap();

	let err = Module::open(&vm, &path, None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::BadMagic));
	assert!(vm.module_pool().is_empty());
}

#[test]
fn unsupported_format_version_is_rejected() {
	let (vm, dir) = vm_in_temp_dir("version");
	let path = dir.join("future.ovm");

	let mut bytes = ModuleFileBuilder::new("future", V1).build();
	bytes[4..8].copy_from_slice(&0x0000_0200u32.to_le_bytes());
	std::fs::write(&path, bytes).unwrap();

	let err = Module::open(&vm, &path, None).unwrap_err();
	assert!(matches!(
		err.kind,
		ModuleLoadErrorKind::UnsupportedFormatVersion(0x0000_0200)
	));
}

#[test]
fn dependencies_load_through_the_finder_and_pool() {
	let (vm, dir) = vm_in_temp_dir("finder");
	let m2_version = ModuleVersion::new(2, 3, 0, 0);

	ModuleFileBuilder::new("M2", m2_version)
		.write_to(&dir.join("lib").join("M2-2.3.0.0").join("M2.ovm"));

	let mut m1 = ModuleFileBuilder::new("M1", V1);
	m1.add_module_ref("M2", m2_version);
	m1.write_to(&dir.join("M1.ovm"));

	let m1 = vm.open_module("M1", None).unwrap();
	assert!(m1.is_fully_opened());

	// Both opens of (name, version) observe the same module.
	let by_version = vm.module_pool().get("M2", Some(&m2_version)).unwrap();
	let by_name = vm.module_pool().get("M2", None).unwrap();
	assert!(Rc::ptr_eq(&by_version, &by_name));
	assert!(Rc::ptr_eq(&by_version, &m1.find_module_ref("M2").unwrap()));
	assert_eq!(by_version.version(), m2_version);

	// A duplicate (name, version) cannot be loaded again.
	let err = Module::open(&vm, &dir.join("M1.ovm"), None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::ModuleAlreadyLoaded));
}

#[test]
fn dependency_version_mismatch_fails() {
	let (vm, dir) = vm_in_temp_dir("wrong-version");

	ModuleFileBuilder::new("Dep", V1).write_to(&dir.join("Dep.ovm"));

	let mut root = ModuleFileBuilder::new("Root", V1);
	root.add_module_ref("Dep", ModuleVersion::new(9, 9, 9, 9));
	root.write_to(&dir.join("Root.ovm"));

	let err = vm.open_module("Root", None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::WrongDependencyVersion));
	assert!(vm.module_pool().is_empty());
}

#[test]
fn circular_dependencies_are_detected_and_unwound() {
	let (vm, dir) = vm_in_temp_dir("cycle");

	let mut m1 = ModuleFileBuilder::new("M1", V1);
	m1.add_module_ref("M2", V1);
	m1.write_to(&dir.join("M1.ovm"));

	let mut m2 = ModuleFileBuilder::new("M2", V1);
	m2.add_module_ref("M1", V1);
	m2.write_to(&dir.join("M2.ovm"));

	let err = vm.open_module("M1", None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::CircularDependency));
	// Nothing partially loaded survives.
	assert!(vm.module_pool().is_empty());
}

#[test]
fn missing_modules_are_reported() {
	let (vm, _dir) = vm_in_temp_dir("missing");
	let err = vm.open_module("NoSuchModule", None).unwrap_err();
	assert!(matches!(err.kind, ModuleLoadErrorKind::ModuleNotFound { .. }));
}

#[test]
fn tokens_resolve_only_through_their_own_table() {
	let (vm, dir) = vm_in_temp_dir("tokens");

	let mut builder = ModuleFileBuilder::new("tokens", V1);
	builder.add_simple_function("f", 0, 8, vec![ovum::ee::instructions::Opcode::retnull as u8]);
	builder.write_to(&dir.join("tokens.ovm"));

	let module = vm.open_module("tokens", None).unwrap();

	let function_token = Token::new(TokenKind::FunctionDef, 1);
	assert!(module.method_by_token(function_token).is_some());

	// The same index under the wrong kind finds nothing.
	assert!(module.method_by_token(Token::new(TokenKind::FieldDef, 1)).is_none());
	assert!(module.field_by_token(function_token).is_none());
	assert!(module.type_by_token(function_token).is_none());
	assert!(module.string_by_token(Token::new(TokenKind::TypeDef, 1)).is_none());

	// Out-of-range indices find nothing either.
	assert!(module.method_by_token(Token::new(TokenKind::FunctionDef, 2)).is_none());
}

#[test]
fn module_strings_are_interned() {
	let (vm, dir) = vm_in_temp_dir("strings");

	let mut builder = ModuleFileBuilder::new("strmod", V1);
	builder.add_simple_function("greet", 0, 8, vec![ovum::ee::instructions::Opcode::retnull as u8]);
	builder.write_to(&dir.join("strmod.ovm"));

	let module = vm.open_module("strmod", None).unwrap();

	// Token lookup, name lookup and re-interning all observe one string.
	let by_token = module.string_by_token(Token::new(TokenKind::String, 1)).unwrap();
	assert_eq!(by_token, vm.intern("strmod"));
	assert_eq!(*module.name(), vm.intern("strmod"));
	assert_eq!(
		module.string_by_token(Token::new(TokenKind::String, 2)).unwrap(),
		vm.intern("greet"),
	);
}

#[test]
fn types_members_and_operators_are_materialized() {
	let (vm, dir) = vm_in_temp_dir("typedefs");
	let retnull = vec![ovum::ee::instructions::Opcode::retnull as u8];

	let mut builder = ModuleFileBuilder::new("geometry", V1);
	let point_name = builder.intern("test.Point");
	let x_name = builder.intern("x");
	let new_name = builder.intern(".new");
	let get_x_name = builder.intern("get_x");
	let prop_name = builder.intern("X");
	let eq_name = builder.intern("equalsOp");
	let a_name = builder.intern("a");
	let b_name = builder.intern("b");

	let mut point = TypeDef::new(TYPE_PUBLIC, point_name);
	point.fields.push(FieldDef {
		flags: FIELD_PUBLIC | FIELD_INSTANCE,
		name_token: x_name,
		constant: None,
	});
	point.methods.push(MethodDef {
		flags: METHOD_PUBLIC | METHOD_INSTANCE | METHOD_CTOR,
		name_token: new_name,
		overloads: vec![OverloadDef {
			flags: OVERLOAD_SHORT_HEADER,
			..OverloadDef::from_code(0, 8, retnull.clone())
		}],
	});
	point.methods.push(MethodDef {
		flags: METHOD_PUBLIC | METHOD_INSTANCE,
		name_token: get_x_name,
		overloads: vec![OverloadDef {
			flags: OVERLOAD_SHORT_HEADER,
			..OverloadDef::from_code(0, 8, retnull.clone())
		}],
	});
	point.methods.push(MethodDef {
		flags: METHOD_PUBLIC,
		name_token: eq_name,
		overloads: vec![OverloadDef {
			flags: OVERLOAD_SHORT_HEADER,
			params: vec![(a_name, 0), (b_name, 0)],
			..OverloadDef::from_code(0, 8, retnull.clone())
		}],
	});
	point.properties.push(PropertyDef {
		name_token: prop_name,
		getter: Token::new(TokenKind::MethodDef, 2).raw(),
		setter: 0,
	});
	point.operators.push((Operator::Equals as u32, Token::new(TokenKind::MethodDef, 3).raw()));
	builder.add_type(point);
	builder.write_to(&dir.join("geometry.ovm"));

	let module = vm.open_module("geometry", None).unwrap();
	let ty = module.find_type(&vm.intern("test.Point"), false).unwrap();

	assert_eq!(ty.member_count(), 5);
	assert_eq!(ty.instance_size(), VALUE_SIZE as u32);
	assert_eq!(ty.total_size(), VALUE_SIZE as u32);

	let Some(Member::Field(x)) = ty.get_member(&vm.intern("x")) else {
		panic!("x must be a field");
	};
	assert_eq!(x.offset(), 0);
	assert!(!x.is_static());

	assert!(ty.instance_ctor().is_some(), "`.new` becomes the instance constructor");

	let Some(Member::Property(prop)) = ty.get_member(&vm.intern("X")) else {
		panic!("X must be a property");
	};
	assert!(prop.getter().is_some());
	assert!(prop.setter().is_none());

	let equals = ty.operator(Operator::Equals).expect("operator table slot filled");
	assert_eq!(equals.param_count(), 2);
}

#[test]
fn base_methods_are_wired_up_the_inheritance_chain() {
	let (vm, dir) = vm_in_temp_dir("base-methods");
	let retnull = vec![ovum::ee::instructions::Opcode::retnull as u8];

	let mut builder = ModuleFileBuilder::new("hierarchy", V1);
	let a_name = builder.intern("test.A");
	let b_name = builder.intern("test.B");
	let m_name = builder.intern("m");

	let overload = |body: &Vec<u8>| OverloadDef {
		flags: OVERLOAD_SHORT_HEADER,
		..OverloadDef::from_code(0, 8, body.clone())
	};

	let mut a = TypeDef::new(TYPE_PUBLIC, a_name);
	a.methods.push(MethodDef {
		flags: METHOD_PUBLIC | METHOD_INSTANCE,
		name_token: m_name,
		overloads: vec![overload(&retnull)],
	});
	let a_token = builder.add_type(a);

	let mut b = TypeDef::new(TYPE_PUBLIC, b_name);
	b.base_token = a_token;
	b.methods.push(MethodDef {
		flags: METHOD_PUBLIC | METHOD_INSTANCE,
		name_token: m_name,
		overloads: vec![overload(&retnull)],
	});
	builder.add_type(b);
	builder.write_to(&dir.join("hierarchy.ovm"));

	let module = vm.open_module("hierarchy", None).unwrap();
	let a = module.find_type(&vm.intern("test.A"), false).unwrap();
	let b = module.find_type(&vm.intern("test.B"), false).unwrap();

	assert!(Rc::ptr_eq(b.base_type().unwrap(), &a));

	let Some(Member::Method(a_m)) = a.get_member(&vm.intern("m")) else { panic!() };
	let Some(Member::Method(b_m)) = b.get_member(&vm.intern("m")) else { panic!() };
	assert!(a_m.base_method().is_none());
	assert!(Rc::ptr_eq(&b_m.base_method().unwrap(), &a_m));
}

#[test]
fn primitive_typed_constants_resolve() {
	let (vm, dir) = vm_in_temp_dir("constants");

	let mut builder = ModuleFileBuilder::new("consts", V1);
	let flags_name = builder.intern("test.Flags");
	let ty = TypeDef::new(0x2200 /* primitive */ | TYPE_PUBLIC, flags_name);
	let type_token = builder.add_type(ty);
	builder.add_constant(0, "answer", type_token, 42);
	builder.write_to(&dir.join("consts.ovm"));

	let module = vm.open_module("consts", None).unwrap();
	let value = module.find_constant(&vm.intern("answer"), false).unwrap();
	assert!(matches!(value.data, ValueData::Int(42)));
}

#[test]
fn ref_signatures_compare_across_short_and_long_forms() {
	let (vm, dir) = vm_in_temp_dir("refsig");

	let mut builder = ModuleFileBuilder::new("refs", V1);
	let f_name = builder.intern("f");
	let a_name = builder.intern("a");
	let b_name = builder.intern("b");
	builder.add_function(MethodDef {
		flags: METHOD_PUBLIC,
		name_token: f_name,
		overloads: vec![OverloadDef {
			flags: OVERLOAD_SHORT_HEADER,
			params: vec![(a_name, 0), (b_name, PARAM_BY_REF)],
			..OverloadDef::from_code(0, 8, vec![ovum::ee::instructions::Opcode::retnull as u8])
		}],
	});
	builder.write_to(&dir.join("refs.ovm"));

	let module = vm.open_module("refs", None).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap();

	// Bit 0 is the instance slot, so parameter b lives at bit 2.
	assert_eq!(overload.ref_signature(), 0b100);

	let pool = vm.ref_signatures();
	assert_eq!(overload.verify_ref_signature(pool, 0b100, 2), None);

	// The same by-ref set expressed as an interned long signature matches
	// through the pairwise walk.
	let mut long = ovum::ee::RefSignatureBuilder::new(40);
	long.set_param(2, true);
	let long_code = long.commit(pool);
	assert_ne!(long_code, 0b100);
	assert_eq!(overload.verify_ref_signature(pool, long_code, 2), None);

	// A mismatched argument is pinpointed.
	assert_eq!(overload.verify_ref_signature(pool, 0b010, 2), Some(1));
}
