use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use bitflags::bitflags;

use crate::object::field::Field;
use crate::object::method::{Method, MethodOverload};
use crate::object::r#type::{Operator, Type};
use crate::strings::IStr;
use crate::utilities::round_to_multiple_of;

/// Rewritten method bodies are a sequence of records aligned to this many
/// bytes: one opcode byte, padding, then 8-byte little-endian operand words.
pub const BODY_ALIGNMENT: usize = 8;

macro_rules! define_opcodes {
	(
		$(#[$attr: meta])*
		enum $name: ident {
			$($ident: ident = $discriminant: literal),*
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		$(#[$attr])*
		pub enum $name {
			$($ident = $discriminant),*
		}

		impl TryFrom<u8> for $name {
			type Error = ();
			fn try_from(value: u8) -> Result<Self, Self::Error> {
				match value {
					$($discriminant => Ok($name::$ident),)*
					_ => Err(()),
				}
			}
		}
	};
}

define_opcodes! {
	/// The on-disk opcode set, as produced by the compiler.
	enum Opcode {
		nop = 0x00,
		dup = 0x01,
		pop = 0x02,

		ldarg_0 = 0x03,
		ldarg_1 = 0x04,
		ldarg_2 = 0x05,
		ldarg_3 = 0x06,
		ldarg_s = 0x07,
		ldarg = 0x08,
		starg_s = 0x09,
		starg = 0x0A,

		ldloc_0 = 0x0B,
		ldloc_1 = 0x0C,
		ldloc_2 = 0x0D,
		ldloc_3 = 0x0E,
		stloc_0 = 0x0F,
		stloc_1 = 0x10,
		stloc_2 = 0x11,
		stloc_3 = 0x12,
		ldloc_s = 0x13,
		ldloc = 0x14,
		stloc_s = 0x15,
		stloc = 0x16,

		ldnull = 0x17,
		ldfalse = 0x18,
		ldtrue = 0x19,
		ldc_i_m1 = 0x1A,
		ldc_i_0 = 0x1B,
		ldc_i_1 = 0x1C,
		ldc_i_2 = 0x1D,
		ldc_i_3 = 0x1E,
		ldc_i_4 = 0x1F,
		ldc_i_5 = 0x20,
		ldc_i_6 = 0x21,
		ldc_i_7 = 0x22,
		ldc_i_8 = 0x23,
		ldc_i_s = 0x24,
		ldc_i_m = 0x25,
		ldc_i = 0x26,
		ldc_u = 0x27,
		ldc_r = 0x28,
		ldstr = 0x29,
		ldargc = 0x2A,
		ldenum_s = 0x2B,
		ldenum = 0x2C,

		newobj_s = 0x2D,
		newobj = 0x2E,

		call_0 = 0x2F,
		call_1 = 0x30,
		call_2 = 0x31,
		call_3 = 0x32,
		call_s = 0x33,
		call = 0x34,
		scall_s = 0x35,
		scall = 0x36,
		apply = 0x37,
		sapply = 0x38,

		retnull = 0x39,
		ret = 0x3A,

		br_s = 0x3B,
		brnull_s = 0x3C,
		brinst_s = 0x3D,
		brfalse_s = 0x3E,
		brtrue_s = 0x3F,
		brref_s = 0x40,
		brnref_s = 0x41,
		brtype_s = 0x42,
		br = 0x43,
		brnull = 0x44,
		brinst = 0x45,
		brfalse = 0x46,
		brtrue = 0x47,
		brref = 0x48,
		brnref = 0x49,
		brtype = 0x4A,
		switch_s = 0x4B,
		switch = 0x4C,

		add = 0x4D,
		sub = 0x4E,
		or = 0x4F,
		xor = 0x50,
		mul = 0x51,
		div = 0x52,
		rem = 0x53,
		and = 0x54,
		pow = 0x55,
		shl = 0x56,
		shr = 0x57,
		hashop = 0x58,
		dollar = 0x59,
		plus = 0x5A,
		neg = 0x5B,
		not = 0x5C,
		eq = 0x5D,
		cmp = 0x5E,
		lt = 0x5F,
		gt = 0x60,
		lte = 0x61,
		gte = 0x62,
		concat = 0x63,

		list_0 = 0x64,
		list_s = 0x65,
		list = 0x66,
		hash_0 = 0x67,
		hash_s = 0x68,
		hash = 0x69,
		lditer = 0x6A,
		ldtype = 0x6B,

		ldfld = 0x6C,
		stfld = 0x6D,
		ldsfld = 0x6E,
		stsfld = 0x6F,
		ldmem = 0x70,
		stmem = 0x71,

		ldidx_1 = 0x72,
		ldidx_s = 0x73,
		ldidx = 0x74,
		stidx_1 = 0x75,
		stidx_s = 0x76,
		stidx = 0x77,

		ldsfn = 0x78,
		ldtypetkn = 0x79,

		throw = 0x7A,
		rethrow = 0x7B,
		leave_s = 0x7C,
		leave = 0x7D,
		endfinally = 0x7E,

		callmem_s = 0x7F,
		callmem = 0x80,

		ldmemref = 0x81,
		ldargref_s = 0x82,
		ldargref = 0x83,
		ldlocref_s = 0x84,
		ldlocref = 0x85,
		ldfldref = 0x86,
		ldsfldref = 0x87
	}
}

define_opcodes! {
	/// The rewritten opcode set the interpreter executes. A superset of the
	/// on-disk set: the `_l`/`_s` pairs distinguish operands read from a
	/// local slot from operands popped off the stack, and the `br*` fused
	/// forms combine a comparison with a conditional branch.
	enum Opi {
		nop = 0x00,
		pop = 0x01,
		dup = 0x02,

		mvloc_ll = 0x03,
		mvloc_ls = 0x04,
		mvloc_sl = 0x05,
		mvloc_ss = 0x06,

		ldnull = 0x07,
		ldfalse = 0x08,
		ldtrue = 0x09,
		ldc_i = 0x0A,
		ldc_u = 0x0B,
		ldc_r = 0x0C,
		ldstr = 0x0D,
		ldargc = 0x0E,
		ldenum = 0x0F,

		newobj = 0x10,
		list = 0x11,
		hash = 0x12,
		lditer = 0x13,
		ldtype = 0x14,

		ldfld = 0x15,
		stfld = 0x16,
		ldsfld = 0x17,
		stsfld = 0x18,
		ldmem = 0x19,
		stmem = 0x1A,
		ldidx = 0x1B,
		stidx = 0x1C,
		ldsfn = 0x1D,
		ldtypetkn = 0x1E,

		call = 0x1F,
		scall = 0x20,
		apply = 0x21,
		sapply = 0x22,
		callmem = 0x23,

		ret = 0x24,
		retnull = 0x25,

		br = 0x26,
		leave = 0x27,
		brnull_l = 0x28,
		brnull_s = 0x29,
		brinst_l = 0x2A,
		brinst_s = 0x2B,
		brfalse_l = 0x2C,
		brfalse_s = 0x2D,
		brtrue_l = 0x2E,
		brtrue_s = 0x2F,
		brtype_l = 0x30,
		brtype_s = 0x31,
		brref = 0x32,
		brnref = 0x33,
		switch = 0x34,

		add = 0x35,
		sub = 0x36,
		or = 0x37,
		xor = 0x38,
		mul = 0x39,
		div = 0x3A,
		rem = 0x3B,
		and = 0x3C,
		pow = 0x3D,
		shl = 0x3E,
		shr = 0x3F,
		hashop = 0x40,
		dollar = 0x41,
		plus = 0x42,
		neg = 0x43,
		not = 0x44,
		concat = 0x45,

		eq_l = 0x46,
		eq_s = 0x47,
		lt_l = 0x48,
		lt_s = 0x49,
		gt_l = 0x4A,
		gt_s = 0x4B,
		lte_l = 0x4C,
		lte_s = 0x4D,
		gte_l = 0x4E,
		gte_s = 0x4F,

		breq = 0x50,
		brlt = 0x51,
		brgt = 0x52,
		brlte = 0x53,
		brgte = 0x54,
		brneq = 0x55,
		brnlt = 0x56,
		brngt = 0x57,
		brnlte = 0x58,
		brngte = 0x59,

		throw = 0x5A,
		rethrow = 0x5B,
		endfinally = 0x5C,

		ldmemref = 0x5D,
		ldlocref = 0x5E,
		ldfldref = 0x5F,
		ldsfldref = 0x60,

		cmp = 0x61
	}
}

/// How many values an instruction pops and pushes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StackChange {
	pub removed: u16,
	pub added: u16,
}

impl StackChange {
	pub const EMPTY: StackChange = StackChange { removed: 0, added: 0 };

	pub const fn new(removed: u16, added: u16) -> Self {
		Self { removed, added }
	}
}

/// A frame-relative byte offset: negative for arguments, then locals, then
/// evaluation-stack slots.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct LocalOffset(pub i32);

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct InstrFlags: u16 {
		/// At least one branch or switch targets this instruction.
		const HAS_BRANCHES = 0x01;
		/// The produced value is a reference.
		const PUSHES_REF   = 0x02;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
	IfNull,
	NotNull,
	IfFalse,
	IfTrue,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ComparisonOp {
	Eq,
	Lt,
	Gt,
	Lte,
	Gte,
}

/// Operand of the operator-dispatch instruction: one of the 18 user-definable
/// operators, a comparison shorthand, or string concatenation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecOp {
	Operator(Operator),
	CmpLt,
	CmpGt,
	CmpLte,
	CmpGte,
	Concat,
}

impl ExecOp {
	pub fn arity(&self) -> u16 {
		match self {
			ExecOp::Operator(op) => op.arity(),
			_ => 2,
		}
	}

	/// The comparison this operator fuses with a following brtrue/brfalse,
	/// if any.
	pub fn comparison(&self) -> Option<ComparisonOp> {
		match self {
			ExecOp::Operator(Operator::Equals) => Some(ComparisonOp::Eq),
			ExecOp::CmpLt => Some(ComparisonOp::Lt),
			ExecOp::CmpGt => Some(ComparisonOp::Gt),
			ExecOp::CmpLte => Some(ComparisonOp::Lte),
			ExecOp::CmpGte => Some(ComparisonOp::Gte),
			_ => None,
		}
	}
}

/// One decoded instruction. `input`/`output` are assigned during the
/// dataflow pass: `input` is the base of the consumed slots (or a redirected
/// local), `output` the slot the produced value is written to.
#[derive(Debug, Clone)]
pub struct Instruction {
	pub kind: InstrKind,
	pub flags: InstrFlags,
	pub input: LocalOffset,
	pub output: LocalOffset,
	pub input_from_stack: bool,
	pub output_on_stack: bool,
}

#[derive(Clone)]
pub enum InstrKind {
	Nop,
	Pop,
	Dup,
	LoadLocal { source: LocalOffset },
	StoreLocal { target: LocalOffset },
	LoadNull,
	LoadBool { value: bool },
	LoadInt { value: i64 },
	LoadUInt { value: u64 },
	LoadReal { value: f64 },
	LoadString { value: IStr },
	LoadArgCount,
	LoadEnum { ty: Rc<Type>, value: i64 },
	NewObject { ty: Rc<Type>, argc: u16, ctor: Rc<MethodOverload> },
	Call { argc: u16 },
	StaticCall { argc: u16, overload: Rc<MethodOverload> },
	Apply,
	StaticApply { method: Rc<Method> },
	CallMember { name: IStr, argc: u16 },
	Ret,
	RetNull,
	Branch { target: i32, is_leave: bool },
	CondBranch { target: i32, condition: BranchCondition },
	BranchIfType { target: i32, ty: Rc<Type> },
	BranchIfRef { target: i32, branch_if_same: bool },
	BranchComparison { target: i32, op: ComparisonOp, negated: bool },
	Switch { targets: Vec<i32> },
	ExecOperator { op: ExecOp },
	CreateList { capacity: u32 },
	CreateHash { capacity: u32 },
	LoadIterator,
	LoadTypeOf,
	LoadField { field: Rc<Field> },
	StoreField { field: Rc<Field> },
	LoadStaticField { field: Rc<Field> },
	StoreStaticField { field: Rc<Field> },
	LoadMember { name: IStr },
	StoreMember { name: IStr },
	LoadIndexer { argc: u16 },
	StoreIndexer { argc: u16 },
	LoadStaticFunction { method: Rc<Method> },
	LoadTypeToken { ty: Rc<Type> },
	Throw,
	Rethrow,
	EndFinally,
	LoadMemberRef { name: IStr },
	LoadLocalRef { local: LocalOffset },
	LoadFieldRef { field: Rc<Field> },
	LoadStaticFieldRef { field: Rc<Field> },
}

impl Debug for InstrKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		// The derived impl would print whole object graphs; names suffice.
		f.write_str(self.mnemonic())
	}
}

impl Instruction {
	pub fn new(kind: InstrKind) -> Self {
		Self {
			kind,
			flags: InstrFlags::empty(),
			input: LocalOffset(0),
			output: LocalOffset(0),
			input_from_stack: true,
			output_on_stack: true,
		}
	}

	pub fn with_flags(kind: InstrKind, flags: InstrFlags) -> Self {
		let mut instr = Self::new(kind);
		instr.flags = flags;
		instr
	}

	pub fn stack_change(&self) -> StackChange {
		use InstrKind::*;
		match &self.kind {
			Nop | RetNull | Rethrow | EndFinally => StackChange::EMPTY,
			Pop | StoreLocal { .. } | Ret | Throw => StackChange::new(1, 0),
			Dup => StackChange::new(1, 2),
			LoadLocal { .. } | LoadNull | LoadBool { .. } | LoadInt { .. } | LoadUInt { .. }
			| LoadReal { .. } | LoadString { .. } | LoadArgCount | LoadEnum { .. }
			| CreateList { .. } | CreateHash { .. } | LoadStaticField { .. }
			| LoadStaticFunction { .. } | LoadTypeToken { .. } | LoadLocalRef { .. }
			| LoadStaticFieldRef { .. } => StackChange::new(0, 1),
			NewObject { argc, .. } => StackChange::new(*argc, 1),
			Call { argc } | CallMember { argc, .. } => StackChange::new(argc + 1, 1),
			StaticCall { argc, overload } => {
				StackChange::new(argc + overload.instance_offset(), 1)
			}
			Apply => StackChange::new(2, 1),
			StaticApply { .. } => StackChange::new(1, 1),
			Branch { .. } => StackChange::EMPTY,
			CondBranch { .. } | BranchIfType { .. } | Switch { .. } => StackChange::new(1, 0),
			BranchIfRef { .. } | BranchComparison { .. } => StackChange::new(2, 0),
			ExecOperator { op } => StackChange::new(op.arity(), 1),
			LoadIterator | LoadTypeOf | LoadField { .. } | LoadMember { .. }
			| LoadMemberRef { .. } | LoadFieldRef { .. } => StackChange::new(1, 1),
			StoreField { .. } | StoreMember { .. } => StackChange::new(2, 0),
			LoadIndexer { argc } => StackChange::new(argc + 1, 1),
			StoreIndexer { argc } => StackChange::new(argc + 2, 0),
			StoreStaticField { .. } => StackChange::new(1, 0),
		}
	}

	/// Whether the instruction writes a produced value to its output slot.
	pub fn has_output(&self) -> bool {
		self.stack_change().added > 0
	}

	pub fn has_input(&self) -> bool {
		self.stack_change().removed > 0
	}

	/// Instructions whose single operand may be fed straight from a local
	/// slot; everything else needs its operands contiguous on the stack.
	pub fn requires_stack_input(&self) -> bool {
		!matches!(self.kind, InstrKind::CondBranch { .. } | InstrKind::BranchIfType { .. })
	}

	pub fn is_branch(&self) -> bool {
		matches!(
			self.kind,
			InstrKind::Branch { .. }
				| InstrKind::CondBranch { .. }
				| InstrKind::BranchIfType { .. }
				| InstrKind::BranchIfRef { .. }
				| InstrKind::BranchComparison { .. }
		)
	}

	/// Branches that fall through when not taken.
	pub fn is_conditional_branch(&self) -> bool {
		self.is_branch() && !matches!(self.kind, InstrKind::Branch { .. })
	}

	pub fn is_switch(&self) -> bool {
		matches!(self.kind, InstrKind::Switch { .. })
	}

	pub fn is_dup(&self) -> bool {
		matches!(self.kind, InstrKind::Dup)
	}

	pub fn is_load_local(&self) -> bool {
		matches!(self.kind, InstrKind::LoadLocal { .. })
	}

	pub fn is_store_local(&self) -> bool {
		matches!(self.kind, InstrKind::StoreLocal { .. })
	}

	/// Terminators end the linear walk of a branch.
	pub fn is_terminator(&self) -> bool {
		matches!(
			self.kind,
			InstrKind::Ret | InstrKind::RetNull | InstrKind::Throw | InstrKind::Rethrow
				| InstrKind::EndFinally
		)
	}

	/// Instructions with a statically known callee verify the referenceness
	/// of their stack arguments against the callee's ref signature.
	pub fn accepts_refs(&self) -> bool {
		matches!(self.kind, InstrKind::StaticCall { .. } | InstrKind::NewObject { .. })
	}

	pub fn pushes_ref(&self) -> bool {
		self.flags.contains(InstrFlags::PUSHES_REF)
	}

	pub fn has_branches(&self) -> bool {
		self.flags.contains(InstrFlags::HAS_BRANCHES)
	}

	pub fn update_input(&mut self, offset: LocalOffset, from_stack: bool) {
		self.input = offset;
		self.input_from_stack = from_stack;
	}

	pub fn update_output(&mut self, offset: LocalOffset, on_stack: bool) {
		self.output = offset;
		self.output_on_stack = on_stack;
	}

	/// The single branch target, when the instruction has one.
	pub fn branch_target(&self) -> Option<i32> {
		match &self.kind {
			InstrKind::Branch { target, .. }
			| InstrKind::CondBranch { target, .. }
			| InstrKind::BranchIfType { target, .. }
			| InstrKind::BranchIfRef { target, .. }
			| InstrKind::BranchComparison { target, .. } => Some(*target),
			_ => None,
		}
	}

	pub fn branch_target_mut(&mut self) -> Option<&mut i32> {
		match &mut self.kind {
			InstrKind::Branch { target, .. }
			| InstrKind::CondBranch { target, .. }
			| InstrKind::BranchIfType { target, .. }
			| InstrKind::BranchIfRef { target, .. }
			| InstrKind::BranchComparison { target, .. } => Some(target),
			_ => None,
		}
	}

	pub fn switch_targets(&self) -> Option<&[i32]> {
		match &self.kind {
			InstrKind::Switch { targets } => Some(targets),
			_ => None,
		}
	}

	pub fn switch_targets_mut(&mut self) -> Option<&mut Vec<i32>> {
		match &mut self.kind {
			InstrKind::Switch { targets } => Some(targets),
			_ => None,
		}
	}

	/// The rewritten opcode this instruction serializes as.
	pub fn opi(&self) -> Opi {
		use InstrKind::*;
		match &self.kind {
			Nop => Opi::nop,
			Pop => Opi::pop,
			Dup => Opi::dup,
			LoadLocal { .. } => match self.output_on_stack {
				true => Opi::mvloc_ls,
				false => Opi::mvloc_ll,
			},
			StoreLocal { .. } => match self.input_from_stack {
				true => Opi::mvloc_sl,
				false => Opi::mvloc_ll,
			},
			LoadNull => Opi::ldnull,
			LoadBool { value: false } => Opi::ldfalse,
			LoadBool { value: true } => Opi::ldtrue,
			LoadInt { .. } => Opi::ldc_i,
			LoadUInt { .. } => Opi::ldc_u,
			LoadReal { .. } => Opi::ldc_r,
			LoadString { .. } => Opi::ldstr,
			LoadArgCount => Opi::ldargc,
			LoadEnum { .. } => Opi::ldenum,
			NewObject { .. } => Opi::newobj,
			Call { .. } => Opi::call,
			StaticCall { .. } => Opi::scall,
			Apply => Opi::apply,
			StaticApply { .. } => Opi::sapply,
			CallMember { .. } => Opi::callmem,
			Ret => Opi::ret,
			RetNull => Opi::retnull,
			Branch { is_leave: false, .. } => Opi::br,
			Branch { is_leave: true, .. } => Opi::leave,
			CondBranch { condition, .. } => {
				let local = !self.input_from_stack;
				match (condition, local) {
					(BranchCondition::IfNull, true) => Opi::brnull_l,
					(BranchCondition::IfNull, false) => Opi::brnull_s,
					(BranchCondition::NotNull, true) => Opi::brinst_l,
					(BranchCondition::NotNull, false) => Opi::brinst_s,
					(BranchCondition::IfFalse, true) => Opi::brfalse_l,
					(BranchCondition::IfFalse, false) => Opi::brfalse_s,
					(BranchCondition::IfTrue, true) => Opi::brtrue_l,
					(BranchCondition::IfTrue, false) => Opi::brtrue_s,
				}
			}
			BranchIfType { .. } => match self.input_from_stack {
				true => Opi::brtype_s,
				false => Opi::brtype_l,
			},
			BranchIfRef { branch_if_same: true, .. } => Opi::brref,
			BranchIfRef { branch_if_same: false, .. } => Opi::brnref,
			BranchComparison { op, negated, .. } => match (op, negated) {
				(ComparisonOp::Eq, false) => Opi::breq,
				(ComparisonOp::Lt, false) => Opi::brlt,
				(ComparisonOp::Gt, false) => Opi::brgt,
				(ComparisonOp::Lte, false) => Opi::brlte,
				(ComparisonOp::Gte, false) => Opi::brgte,
				(ComparisonOp::Eq, true) => Opi::brneq,
				(ComparisonOp::Lt, true) => Opi::brnlt,
				(ComparisonOp::Gt, true) => Opi::brngt,
				(ComparisonOp::Lte, true) => Opi::brnlte,
				(ComparisonOp::Gte, true) => Opi::brngte,
			},
			Switch { .. } => Opi::switch,
			ExecOperator { op } => match op {
				ExecOp::Operator(Operator::Add) => Opi::add,
				ExecOp::Operator(Operator::Sub) => Opi::sub,
				ExecOp::Operator(Operator::Or) => Opi::or,
				ExecOp::Operator(Operator::Xor) => Opi::xor,
				ExecOp::Operator(Operator::Mul) => Opi::mul,
				ExecOp::Operator(Operator::Div) => Opi::div,
				ExecOp::Operator(Operator::Mod) => Opi::rem,
				ExecOp::Operator(Operator::And) => Opi::and,
				ExecOp::Operator(Operator::Pow) => Opi::pow,
				ExecOp::Operator(Operator::Shl) => Opi::shl,
				ExecOp::Operator(Operator::Shr) => Opi::shr,
				ExecOp::Operator(Operator::Hash) => Opi::hashop,
				ExecOp::Operator(Operator::Dollar) => Opi::dollar,
				ExecOp::Operator(Operator::Plus) => Opi::plus,
				ExecOp::Operator(Operator::Neg) => Opi::neg,
				ExecOp::Operator(Operator::Not) => Opi::not,
				ExecOp::Operator(Operator::Equals) => match self.input_from_stack {
					true => Opi::eq_s,
					false => Opi::eq_l,
				},
				ExecOp::Operator(Operator::Compare) => Opi::cmp,
				ExecOp::CmpLt => match self.input_from_stack {
					true => Opi::lt_s,
					false => Opi::lt_l,
				},
				ExecOp::CmpGt => match self.input_from_stack {
					true => Opi::gt_s,
					false => Opi::gt_l,
				},
				ExecOp::CmpLte => match self.input_from_stack {
					true => Opi::lte_s,
					false => Opi::lte_l,
				},
				ExecOp::CmpGte => match self.input_from_stack {
					true => Opi::gte_s,
					false => Opi::gte_l,
				},
				ExecOp::Concat => Opi::concat,
			},
			CreateList { .. } => Opi::list,
			CreateHash { .. } => Opi::hash,
			LoadIterator => Opi::lditer,
			LoadTypeOf => Opi::ldtype,
			LoadField { .. } => Opi::ldfld,
			StoreField { .. } => Opi::stfld,
			LoadStaticField { .. } => Opi::ldsfld,
			StoreStaticField { .. } => Opi::stsfld,
			LoadMember { .. } => Opi::ldmem,
			StoreMember { .. } => Opi::stmem,
			LoadIndexer { .. } => Opi::ldidx,
			StoreIndexer { .. } => Opi::stidx,
			LoadStaticFunction { .. } => Opi::ldsfn,
			LoadTypeToken { .. } => Opi::ldtypetkn,
			Throw => Opi::throw,
			Rethrow => Opi::rethrow,
			EndFinally => Opi::endfinally,
			LoadMemberRef { .. } => Opi::ldmemref,
			LoadLocalRef { .. } => Opi::ldlocref,
			LoadFieldRef { .. } => Opi::ldfldref,
			LoadStaticFieldRef { .. } => Opi::ldsfldref,
		}
	}

	/// Number of 8-byte operand words the instruction serializes.
	pub fn operand_count(&self) -> usize {
		use InstrKind::*;
		match &self.kind {
			Nop | Pop | Ret | RetNull | Throw | Rethrow | EndFinally => 0,
			Branch { .. } => 1,
			Dup | LoadLocal { .. } | StoreLocal { .. } => 2,
			LoadNull | LoadBool { .. } | LoadArgCount => 1,
			LoadInt { .. } | LoadUInt { .. } | LoadReal { .. } | LoadString { .. } => 2,
			LoadEnum { .. } => 3,
			NewObject { .. } => 4,
			Call { .. } => 3,
			StaticCall { .. } => 4,
			Apply => 2,
			StaticApply { .. } => 3,
			CallMember { .. } => 4,
			CondBranch { .. } => 2,
			BranchIfType { .. } => 3,
			BranchIfRef { .. } | BranchComparison { .. } => 2,
			Switch { targets } => 2 + targets.len(),
			ExecOperator { .. } => 2,
			CreateList { .. } | CreateHash { .. } => 2,
			LoadIterator | LoadTypeOf => 2,
			LoadField { .. } | LoadMember { .. } => 3,
			StoreField { .. } | StoreMember { .. } => 2,
			LoadStaticField { .. } => 2,
			StoreStaticField { .. } => 2,
			LoadIndexer { .. } => 3,
			StoreIndexer { .. } => 2,
			LoadStaticFunction { .. } | LoadTypeToken { .. } => 2,
			LoadMemberRef { .. } => 3,
			LoadLocalRef { .. } => 2,
			LoadFieldRef { .. } => 3,
			LoadStaticFieldRef { .. } => 2,
		}
	}

	/// Encoded size, aligned for the interpreter.
	pub fn emitted_size(&self) -> usize {
		round_to_multiple_of::<BODY_ALIGNMENT>(1 + self.operand_count() * 8)
	}

	/// Serializes the instruction. `resolve_target` maps a (post-removal)
	/// instruction index to its byte offset in the emitted body.
	pub fn write_bytes(&self, buffer: &mut Vec<u8>, resolve_target: &dyn Fn(i32) -> u64) {
		use InstrKind::*;

		let start = buffer.len();
		buffer.push(self.opi() as u8);
		while (buffer.len() - start) % BODY_ALIGNMENT != 0 {
			buffer.push(0);
		}

		let word = |buffer: &mut Vec<u8>, value: u64| {
			buffer.extend_from_slice(&value.to_le_bytes());
		};
		let input = self.input.0 as i64 as u64;
		let output = self.output.0 as i64 as u64;

		match &self.kind {
			Nop | Pop | Ret | RetNull | Throw | Rethrow | EndFinally => {}
			Dup => {
				word(buffer, input);
				word(buffer, output);
			}
			LoadLocal { source } => {
				word(buffer, source.0 as i64 as u64);
				word(buffer, output);
			}
			StoreLocal { target } => {
				word(buffer, input);
				word(buffer, target.0 as i64 as u64);
			}
			LoadNull | LoadArgCount => word(buffer, output),
			LoadBool { .. } => word(buffer, output),
			LoadInt { value } => {
				word(buffer, *value as u64);
				word(buffer, output);
			}
			LoadUInt { value } => {
				word(buffer, *value);
				word(buffer, output);
			}
			LoadReal { value } => {
				word(buffer, value.to_bits());
				word(buffer, output);
			}
			LoadString { value } => {
				word(buffer, value.as_str().as_ptr() as u64);
				word(buffer, output);
			}
			LoadEnum { ty, value } => {
				word(buffer, Rc::as_ptr(ty) as u64);
				word(buffer, *value as u64);
				word(buffer, output);
			}
			NewObject { ty, argc, .. } => {
				word(buffer, Rc::as_ptr(ty) as u64);
				word(buffer, *argc as u64);
				word(buffer, input);
				word(buffer, output);
			}
			Call { argc } => {
				word(buffer, *argc as u64);
				word(buffer, input);
				word(buffer, output);
			}
			StaticCall { argc, overload } => {
				word(buffer, Rc::as_ptr(overload) as u64);
				word(buffer, *argc as u64);
				word(buffer, input);
				word(buffer, output);
			}
			Apply => {
				word(buffer, input);
				word(buffer, output);
			}
			StaticApply { method } => {
				word(buffer, Rc::as_ptr(method) as u64);
				word(buffer, input);
				word(buffer, output);
			}
			CallMember { name, argc } => {
				word(buffer, name.as_str().as_ptr() as u64);
				word(buffer, *argc as u64);
				word(buffer, input);
				word(buffer, output);
			}
			Branch { target, .. } => word(buffer, resolve_target(*target)),
			CondBranch { target, .. } => {
				word(buffer, input);
				word(buffer, resolve_target(*target));
			}
			BranchIfType { target, ty } => {
				word(buffer, Rc::as_ptr(ty) as u64);
				word(buffer, input);
				word(buffer, resolve_target(*target));
			}
			BranchIfRef { target, .. } => {
				word(buffer, input);
				word(buffer, resolve_target(*target));
			}
			BranchComparison { target, .. } => {
				word(buffer, input);
				word(buffer, resolve_target(*target));
			}
			Switch { targets } => {
				word(buffer, targets.len() as u64);
				word(buffer, input);
				for target in targets {
					word(buffer, resolve_target(*target));
				}
			}
			ExecOperator { .. } => {
				word(buffer, input);
				word(buffer, output);
			}
			CreateList { capacity } | CreateHash { capacity } => {
				word(buffer, *capacity as u64);
				word(buffer, output);
			}
			LoadIterator | LoadTypeOf => {
				word(buffer, input);
				word(buffer, output);
			}
			LoadField { field } | LoadFieldRef { field } => {
				word(buffer, Rc::as_ptr(field) as u64);
				word(buffer, input);
				word(buffer, output);
			}
			StoreField { field } => {
				word(buffer, Rc::as_ptr(field) as u64);
				word(buffer, input);
			}
			LoadStaticField { field } | LoadStaticFieldRef { field } => {
				word(buffer, Rc::as_ptr(field) as u64);
				word(buffer, output);
			}
			StoreStaticField { field } => {
				word(buffer, Rc::as_ptr(field) as u64);
				word(buffer, input);
			}
			LoadMember { name } | LoadMemberRef { name } => {
				word(buffer, name.as_str().as_ptr() as u64);
				word(buffer, input);
				word(buffer, output);
			}
			StoreMember { name } => {
				word(buffer, name.as_str().as_ptr() as u64);
				word(buffer, input);
			}
			LoadIndexer { argc } => {
				word(buffer, *argc as u64);
				word(buffer, input);
				word(buffer, output);
			}
			StoreIndexer { argc } => {
				word(buffer, *argc as u64);
				word(buffer, input);
			}
			LoadStaticFunction { method } => {
				word(buffer, Rc::as_ptr(method) as u64);
				word(buffer, output);
			}
			LoadTypeToken { ty } => {
				word(buffer, Rc::as_ptr(ty) as u64);
				word(buffer, output);
			}
			LoadLocalRef { local } => {
				word(buffer, local.0 as i64 as u64);
				word(buffer, output);
			}
		}
	}
}

impl InstrKind {
	pub fn mnemonic(&self) -> &'static str {
		use InstrKind::*;
		match self {
			Nop => "nop",
			Pop => "pop",
			Dup => "dup",
			LoadLocal { .. } => "ldloc",
			StoreLocal { .. } => "stloc",
			LoadNull => "ldnull",
			LoadBool { .. } => "ldbool",
			LoadInt { .. } => "ldc.i",
			LoadUInt { .. } => "ldc.u",
			LoadReal { .. } => "ldc.r",
			LoadString { .. } => "ldstr",
			LoadArgCount => "ldargc",
			LoadEnum { .. } => "ldenum",
			NewObject { .. } => "newobj",
			Call { .. } => "call",
			StaticCall { .. } => "scall",
			Apply => "apply",
			StaticApply { .. } => "sapply",
			CallMember { .. } => "callmem",
			Ret => "ret",
			RetNull => "retnull",
			Branch { is_leave: false, .. } => "br",
			Branch { is_leave: true, .. } => "leave",
			CondBranch { .. } => "brcond",
			BranchIfType { .. } => "brtype",
			BranchIfRef { .. } => "brref",
			BranchComparison { .. } => "brcmp",
			Switch { .. } => "switch",
			ExecOperator { .. } => "operator",
			CreateList { .. } => "list",
			CreateHash { .. } => "hash",
			LoadIterator => "lditer",
			LoadTypeOf => "ldtype",
			LoadField { .. } => "ldfld",
			StoreField { .. } => "stfld",
			LoadStaticField { .. } => "ldsfld",
			StoreStaticField { .. } => "stsfld",
			LoadMember { .. } => "ldmem",
			StoreMember { .. } => "stmem",
			LoadIndexer { .. } => "ldidx",
			StoreIndexer { .. } => "stidx",
			LoadStaticFunction { .. } => "ldsfn",
			LoadTypeToken { .. } => "ldtypetkn",
			Throw => "throw",
			Rethrow => "rethrow",
			EndFinally => "endfinally",
			LoadMemberRef { .. } => "ldmemref",
			LoadLocalRef { .. } => "ldlocref",
			LoadFieldRef { .. } => "ldfldref",
			LoadStaticFieldRef { .. } => "ldsfldref",
		}
	}
}

impl Opi {
	/// Operand word count for fixed-size opcodes; `switch` is variable and
	/// returns None.
	pub fn fixed_operand_count(&self) -> Option<usize> {
		use Opi::*;
		Some(match self {
			nop | pop | ret | retnull | throw | rethrow | endfinally => 0,
			br | leave => 1,
			ldnull | ldfalse | ldtrue | ldargc => 1,
			dup | mvloc_ll | mvloc_ls | mvloc_sl | mvloc_ss => 2,
			ldc_i | ldc_u | ldc_r | ldstr => 2,
			ldenum => 3,
			newobj => 4,
			list | hash => 2,
			lditer | ldtype => 2,
			ldfld | ldmem | ldmemref | ldfldref => 3,
			stfld | stmem => 2,
			ldsfld | stsfld | ldsfldref => 2,
			ldidx => 3,
			stidx => 2,
			ldsfn | ldtypetkn => 2,
			call => 3,
			scall => 4,
			apply => 2,
			sapply => 3,
			callmem => 4,
			brnull_l | brnull_s | brinst_l | brinst_s | brfalse_l | brfalse_s | brtrue_l
			| brtrue_s => 2,
			brtype_l | brtype_s => 3,
			brref | brnref => 2,
			switch => return None,
			add | sub | or | xor | mul | div | rem | and | pow | shl | shr | hashop | dollar
			| concat => 2,
			plus | neg | not => 2,
			eq_l | eq_s | lt_l | lt_s | gt_l | gt_s | lte_l | lte_s | gte_l | gte_s => 2,
			breq | brlt | brgt | brlte | brgte | brneq | brnlt | brngt | brnlte | brngte => 2,
			cmp => 2,
			ldlocref => 2,
		})
	}

	/// Whether the opcode transfers control to an absolute byte offset, and
	/// which operand word holds it.
	pub fn branch_operand_index(&self) -> Option<usize> {
		use Opi::*;
		match self {
			br | leave => Some(0),
			brnull_l | brnull_s | brinst_l | brinst_s | brfalse_l | brfalse_s | brtrue_l
			| brtrue_s | brref | brnref => Some(1),
			brtype_l | brtype_s => Some(2),
			breq | brlt | brgt | brlte | brgte | brneq | brnlt | brngt | brnlte | brngte => {
				Some(1)
			}
			_ => None,
		}
	}
}

/// One record decoded back out of a rewritten body.
#[derive(Debug, Clone)]
pub struct EmittedInstruction {
	pub offset: usize,
	pub opcode: Opi,
	pub operands: Vec<u64>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidBody {
	pub offset: usize,
}

/// Walks a rewritten body back into records. The interpreter consumes the
/// same layout; tests use this to check branch targets and alignment.
pub fn decode_body(body: &[u8]) -> Result<Vec<EmittedInstruction>, InvalidBody> {
	let mut out = Vec::new();
	let mut pos = 0usize;
	while pos < body.len() {
		let offset = pos;
		let opcode = Opi::try_from(body[pos]).map_err(|_| InvalidBody { offset })?;
		pos = round_to_multiple_of::<BODY_ALIGNMENT>(pos + 1);

		let mut read_word = |pos: &mut usize| -> Result<u64, InvalidBody> {
			let end = *pos + 8;
			if end > body.len() {
				return Err(InvalidBody { offset });
			}
			let mut bytes = [0u8; 8];
			bytes.copy_from_slice(&body[*pos..end]);
			*pos = end;
			Ok(u64::from_le_bytes(bytes))
		};

		let operands = match opcode.fixed_operand_count() {
			Some(count) => {
				let mut operands = Vec::with_capacity(count);
				for _ in 0..count {
					operands.push(read_word(&mut pos)?);
				}
				operands
			}
			None => {
				// switch: count, value, then count targets
				let count = read_word(&mut pos)?;
				let mut operands = Vec::with_capacity(count as usize + 2);
				operands.push(count);
				operands.push(read_word(&mut pos)?);
				for _ in 0..count {
					operands.push(read_word(&mut pos)?);
				}
				operands
			}
		};

		out.push(EmittedInstruction { offset, opcode, operands });
	}
	Ok(out)
}
