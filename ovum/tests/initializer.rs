mod common;

use std::rc::Rc;

use ovum::ee::instructions::{decode_body, Opcode, Opi};
use ovum::error::MethodInitErrorKind;
use ovum::initialize_method;
use ovum::object::method::{MethodBody, MethodOverload, TryBlockHandler};
use ovum::token::{Token, TokenKind};

use common::*;

/// Loads a module containing one global function with the given body and
/// returns its first overload.
fn function_overload(
	test: &str,
	locals: u16,
	max_stack: u16,
	body: Vec<u8>,
) -> (Rc<ovum::vm::Vm>, Rc<MethodOverload>) {
	let (vm, dir) = vm_in_temp_dir(test);
	let mut builder = ModuleFileBuilder::new("m", V1);
	builder.add_simple_function("f", locals, max_stack, body);
	builder.write_to(&dir.join("m.ovm"));

	let module = vm.open_module("m", None).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap().clone();
	(vm, overload)
}

fn initialized_bytes(overload: &MethodOverload) -> Box<[u8]> {
	match &*overload.body() {
		MethodBody::Initialized(bytes) => bytes.clone(),
		other => panic!("expected an initialized body, found {other:?}"),
	}
}

#[test]
fn constant_return_keeps_a_single_ret() {
	let (vm, overload) =
		function_overload("ret", 0, 8, vec![Opcode::ldc_i_1 as u8, Opcode::ret as u8]);

	let types = initialize_method(&vm, &overload).unwrap();
	assert!(types.is_empty());
	assert!(overload.is_initialized());

	let body = initialized_bytes(&overload);
	let instructions = decode_body(&body).unwrap();
	let opcodes: Vec<Opi> = instructions.iter().map(|i| i.opcode).collect();
	assert_eq!(opcodes, vec![Opi::ldc_i, Opi::ret]);

	// The constant goes straight into the return slot (stack slot 0).
	assert_eq!(instructions[0].operands, vec![1, 0]);
}

#[test]
fn initialization_is_idempotent() {
	let (vm, overload) =
		function_overload("idempotent", 0, 8, vec![Opcode::ldc_i_1 as u8, Opcode::ret as u8]);

	initialize_method(&vm, &overload).unwrap();
	let first = initialized_bytes(&overload);

	// The INITED flag gates the second run entirely.
	let types = initialize_method(&vm, &overload).unwrap();
	assert!(types.is_empty());
	let second = initialized_bytes(&overload);
	assert_eq!(first, second);
}

#[test]
fn comparison_and_branch_fuse() {
	let (vm, overload) = function_overload(
		"fuse",
		0,
		8,
		vec![
			Opcode::ldc_i_3 as u8,
			Opcode::ldc_i_4 as u8,
			Opcode::lt as u8,
			Opcode::brtrue_s as u8,
			1, // over the fallthrough retnull
			Opcode::retnull as u8,
			Opcode::retnull as u8,
		],
	);

	initialize_method(&vm, &overload).unwrap();
	let body = initialized_bytes(&overload);
	let instructions = decode_body(&body).unwrap();

	let opcodes: Vec<Opi> = instructions.iter().map(|i| i.opcode).collect();
	assert_eq!(
		opcodes,
		vec![Opi::ldc_i, Opi::ldc_i, Opi::brlt, Opi::retnull, Opi::retnull],
	);

	// The fused branch reads the two constants' stack slots and jumps to the
	// second retnull.
	let brlt = &instructions[2];
	assert_eq!(brlt.operands[0], 0, "comparison operands start at stack slot 0");
	assert_eq!(brlt.operands[1], instructions[4].offset as u64);
}

#[test]
fn branch_targets_land_on_instruction_starts() {
	let (vm, overload) = function_overload(
		"targets",
		0,
		8,
		vec![
			Opcode::ldtrue as u8,
			Opcode::brtrue_s as u8,
			2, // over ldc_i_1 + pop
			Opcode::ldc_i_1 as u8,
			Opcode::pop as u8,
			Opcode::retnull as u8,
		],
	);

	initialize_method(&vm, &overload).unwrap();
	let body = initialized_bytes(&overload);
	let instructions = decode_body(&body).unwrap();

	let starts: Vec<u64> = instructions.iter().map(|i| i.offset as u64).collect();
	for instr in &instructions {
		if let Some(operand) = instr.opcode.branch_operand_index() {
			let target = instr.operands[operand];
			assert_eq!(target % 8, 0, "targets are aligned");
			assert!(starts.contains(&target), "target {target} is an instruction start");
		}
	}
}

#[test]
fn merge_points_require_consistent_stack_heights() {
	// The branch path reaches the final retnull with an empty stack, the
	// fallthrough path reaches it with one extra value.
	let (vm, overload) = function_overload(
		"merge",
		0,
		8,
		vec![
			Opcode::ldtrue as u8,
			Opcode::brtrue_s as u8,
			1, // to retnull
			Opcode::ldc_i_1 as u8,
			Opcode::retnull as u8,
		],
	);

	let err = initialize_method(&vm, &overload).unwrap_err();
	assert!(matches!(err.kind, MethodInitErrorKind::InconsistentStack));
	assert!(!overload.is_initialized());
}

#[test]
fn stack_underflow_is_rejected() {
	let (vm, overload) = function_overload("underflow", 0, 8, vec![Opcode::pop as u8]);
	let err = initialize_method(&vm, &overload).unwrap_err();
	assert!(matches!(err.kind, MethodInitErrorKind::StackUnderflow));
}

#[test]
fn exceeding_max_stack_is_rejected() {
	let (vm, overload) = function_overload(
		"overflow",
		0,
		1,
		vec![Opcode::ldc_i_1 as u8, Opcode::ldc_i_2 as u8, Opcode::retnull as u8],
	);
	let err = initialize_method(&vm, &overload).unwrap_err();
	assert!(matches!(err.kind, MethodInitErrorKind::StackOverflow));
}

#[test]
fn static_field_access_queues_the_declaring_type() {
	let (vm, dir) = vm_in_temp_dir("static-init");

	let mut builder = ModuleFileBuilder::new("m", V1);
	let holder_name = builder.intern("test.Holder");
	let counter_name = builder.intern("counter");
	let mut holder = TypeDef::new(TYPE_PUBLIC, holder_name);
	holder.fields.push(FieldDef {
		flags: FIELD_PUBLIC, // static
		name_token: counter_name,
		constant: None,
	});
	builder.add_type(holder);

	let field_token = Token::new(TokenKind::FieldDef, 1).raw();
	let mut body = vec![Opcode::ldsfld as u8];
	body.extend_from_slice(&field_token.to_le_bytes());
	body.push(Opcode::pop as u8);
	body.push(Opcode::retnull as u8);
	builder.add_simple_function("f", 0, 8, body);
	builder.write_to(&dir.join("m.ovm"));

	let module = vm.open_module("m", None).unwrap();
	let holder = module.find_type(&vm.intern("test.Holder"), false).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap().clone();

	let types = initialize_method(&vm, &overload).unwrap();
	assert_eq!(types.len(), 1);
	assert!(Rc::ptr_eq(&types[0], &holder));

	// The load's result was redirected and the pop eliminated.
	let body = initialized_bytes(&overload);
	let opcodes: Vec<Opi> = decode_body(&body).unwrap().iter().map(|i| i.opcode).collect();
	assert_eq!(opcodes, vec![Opi::ldsfld, Opi::retnull]);
}

#[test]
fn try_regions_translate_to_rewritten_offsets() {
	let (vm, dir) = vm_in_temp_dir("finally");

	let mut builder = ModuleFileBuilder::new("m", V1);
	let f_name = builder.intern("f");
	builder.add_function(MethodDef {
		flags: METHOD_PUBLIC,
		name_token: f_name,
		overloads: vec![OverloadDef {
			try_blocks: vec![TryBlockDef::Finally {
				try_start: 0,
				try_end: 1,
				finally_start: 1,
				finally_end: 2,
			}],
			..OverloadDef::from_code(
				0,
				8,
				vec![Opcode::retnull as u8, Opcode::endfinally as u8],
			)
		}],
	});
	builder.write_to(&dir.join("m.ovm"));

	let module = vm.open_module("m", None).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap().clone();
	initialize_method(&vm, &overload).unwrap();

	let blocks = overload.try_blocks();
	assert_eq!(blocks.len(), 1);
	let block = &blocks[0];
	assert!(block.try_start < block.try_end);
	let TryBlockHandler::Finally { finally_start, finally_end } = &block.handler else {
		panic!("expected a finally handler");
	};
	assert!(*finally_start >= block.try_end);
	assert!(finally_start < finally_end);
}

#[test]
fn catch_handlers_start_with_the_exception_on_the_stack() {
	let (vm, dir) = vm_in_temp_dir("catch");

	let mut builder = ModuleFileBuilder::new("m", V1);
	let error_name = builder.intern("test.Error");
	let error_token = builder.add_type(TypeDef::new(TYPE_PUBLIC, error_name));

	let f_name = builder.intern("f");
	builder.add_function(MethodDef {
		flags: METHOD_PUBLIC,
		name_token: f_name,
		overloads: vec![OverloadDef {
			try_blocks: vec![TryBlockDef::Catch {
				try_start: 0,
				try_end: 1,
				clauses: vec![(error_token, 1, 3)],
			}],
			..OverloadDef::from_code(
				0,
				8,
				vec![Opcode::retnull as u8, Opcode::pop as u8, Opcode::retnull as u8],
			)
		}],
	});
	builder.write_to(&dir.join("m.ovm"));

	let module = vm.open_module("m", None).unwrap();
	let error_type = module.find_type(&vm.intern("test.Error"), false).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap().clone();
	initialize_method(&vm, &overload).unwrap();

	let blocks = overload.try_blocks();
	let block = &blocks[0];
	assert!(block.try_start < block.try_end);
	let TryBlockHandler::Catch { clauses } = &block.handler else {
		panic!("expected a catch handler");
	};
	let clause = &clauses[0];
	assert!(clause.catch_start >= block.try_end);
	assert!(clause.catch_start < clause.catch_end);
	assert!(Rc::ptr_eq(clause.caught_type.as_ref().unwrap(), &error_type));
}

#[test]
fn unresolved_caught_type_fails_initialization() {
	let (vm, dir) = vm_in_temp_dir("bad-catch");

	let mut builder = ModuleFileBuilder::new("m", V1);
	let f_name = builder.intern("f");
	builder.add_function(MethodDef {
		flags: METHOD_PUBLIC,
		name_token: f_name,
		overloads: vec![OverloadDef {
			try_blocks: vec![TryBlockDef::Catch {
				try_start: 0,
				try_end: 1,
				clauses: vec![(Token::new(TokenKind::TypeRef, 5).raw(), 1, 2)],
			}],
			..OverloadDef::from_code(
				0,
				8,
				vec![Opcode::retnull as u8, Opcode::retnull as u8],
			)
		}],
	});
	builder.write_to(&dir.join("m.ovm"));

	let module = vm.open_module("m", None).unwrap();
	let f = module.find_global_function(&vm.intern("f"), false).unwrap();
	let overload = f.overload(0).unwrap().clone();

	let err = initialize_method(&vm, &overload).unwrap_err();
	assert!(matches!(err.kind, MethodInitErrorKind::UnresolvedToken(_)));
	assert!(!overload.is_initialized());
	assert!(matches!(&*overload.body(), MethodBody::Raw(_)));
}
