use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::token::Token;

/// A fatal error raised while opening a module file. Carries the path of the
/// file being read; any partially registered module has already been removed
/// from the pool by the time this reaches the caller.
#[derive(Debug, Error)]
#[error("failed to load module {}: {kind}", file.display())]
pub struct ModuleLoadError {
	pub file: PathBuf,
	#[source]
	pub kind: ModuleLoadErrorKind,
}

impl ModuleLoadError {
	pub fn new(file: &Path, kind: ModuleLoadErrorKind) -> Self {
		Self { file: file.to_path_buf(), kind }
	}
}

#[derive(Debug, Error)]
pub enum ModuleLoadErrorKind {
	#[error("invalid magic number in file")]
	BadMagic,
	#[error("unsupported module file format version {0:#010X}")]
	UnsupportedFormatVersion(u32),
	#[error("unexpected end of file")]
	UnexpectedEndOfFile,
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("not enough memory to complete the load")]
	OutOfMemory,
	#[error("the actual size of the {0} table did not match the declared size")]
	SectionSizeMismatch(&'static str),
	#[error("invalid token {0:#010X}")]
	InvalidToken(u32),
	#[error("out-of-order or misplaced {0} token")]
	WrongTokenInTable(&'static str),
	#[error("unresolved token {0:?}")]
	UnresolvedToken(Token),
	#[error("could not resolve {what} named {name:?}")]
	UnresolvedName { what: &'static str, name: String },
	#[error("{what} does not refer to the right kind of member: {name:?}")]
	WrongMemberKind { what: &'static str, name: String },
	#[error("malformed module header")]
	InvalidHeader,
	#[error("invalid string payload in module file")]
	InvalidString,
	#[error("could not locate module {name}")]
	ModuleNotFound { name: String },
	#[error("module is already loaded")]
	ModuleAlreadyLoaded,
	#[error("circular dependency detected")]
	CircularDependency,
	#[error("dependent module has the wrong version")]
	WrongDependencyVersion,
	#[error("duplicate global member name {0:?}")]
	DuplicateGlobalMember(String),
	#[error("duplicate member name {0:?} in type")]
	DuplicateMemberName(String),
	#[error("a type cannot have itself as its base type")]
	BaseTypeIsSelf,
	#[error("a shared type must be a TypeDef and cannot be the type itself")]
	InvalidSharedType,
	#[error("length of {0} table differs from the count in the module header")]
	TableCountMismatch(&'static str),
	#[error("method found without overloads")]
	MethodWithoutOverloads,
	#[error("the field flags hasValue and instance cannot be used together")]
	ConstantInstanceField,
	#[error("constant type must be primitive or the standard String type")]
	InvalidConstantType,
	#[error("property accessor must be a MethodDef of the same type")]
	InvalidPropertyAccessor,
	#[error("property getter and setter must have matching flags")]
	PropertyAccessorMismatch,
	#[error("property must have at least one accessor")]
	PropertyWithoutAccessors,
	#[error("invalid operator index {0}")]
	InvalidOperator(u32),
	#[error("duplicate operator declaration")]
	DuplicateOperator,
	#[error("operator method must be a MethodDef of the same type with an overload of the operator's arity")]
	InvalidOperatorMethod,
	#[error("invalid try block in method header")]
	InvalidTryBlock,
	#[error("could not load the native library declared by the module: {0}")]
	NativeLibraryLoad(std::io::Error),
	#[error("could not locate native entry point {0:?}")]
	MissingNativeEntryPoint(String),
	#[error("missing instance initializer for standard type in native library")]
	MissingStandardTypeIniter,
	#[error("main method token must be a MethodDef or FunctionDef")]
	MainMethodNotDef,
	#[error("main method cannot be an instance method")]
	MainMethodIsInstance,
}

/// A fatal error raised while rewriting a method body. The overload is left
/// uninitialized.
#[derive(Debug, Error)]
#[error("could not initialize method {method:?} (at instruction {instruction:?}): {kind}")]
pub struct MethodInitError {
	pub method: String,
	pub instruction: Option<usize>,
	#[source]
	pub kind: MethodInitErrorKind,
}

#[derive(Debug, Error)]
pub enum MethodInitErrorKind {
	#[error("invalid opcode {0:#04X} encountered")]
	InvalidOpcode(u8),
	#[error("unexpected end of method body")]
	UnexpectedEndOfBody,
	#[error("invalid branch offset")]
	InvalidBranchOffset,
	#[error("unresolved token {0:#010X}")]
	UnresolvedToken(u32),
	#[error("the member is inaccessible from this location")]
	InaccessibleMember,
	#[error("the type is not accessible from outside its declaring module")]
	InaccessibleType,
	#[error("could not find an overload that takes the specified number of arguments")]
	NoMatchingOverload,
	#[error("the field has the wrong staticness for this instruction")]
	FieldStaticMismatch,
	#[error("the type cannot be used with the newobj instruction")]
	TypeNotConstructible,
	#[error("there are not enough values on the stack")]
	StackUnderflow,
	#[error("the evaluation stack exceeds the method's declared max stack")]
	StackOverflow,
	#[error("instruction reached with inconsistent stack height or referenceness")]
	InconsistentStack,
	#[error("the instruction does not take references on the stack")]
	StackHasRefs,
}

/// Errors surfaced at the native ABI boundary only.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum InvocationError {
	#[error("the call stack is owned by another thread")]
	WrongThread,
	#[error("the synchronization primitive is busy")]
	Busy,
	#[error("the blocking operation was interrupted")]
	Interrupted,
}
