//! The C ABI exposed to native extension modules. Handles are raw pointers
//! to VM-owned objects; modules (and everything they own) live for the life
//! of the VM, so handles obtained from a loaded module never dangle.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::os::raw::c_char;
use std::rc::Rc;

use crate::module::{GlobalMemberKind, Module, ModuleVersion};
use crate::object::field::{Field, Property};
use crate::object::member::Member;
use crate::object::method::{Method, MethodFlags, MethodOverload};
use crate::object::r#type::{Finalizer, NativeFieldKind, Operator, ReferenceWalker, Type};
use crate::os::RawSymbol;
use crate::strings::IStr;
use crate::value::{Value, ValueData};
use crate::vm::Vm;

pub mod containers;

pub use containers::Slice;

pub type VmHandle = *const Vm;
pub type ModuleHandle = *const Module;
pub type TypeHandle = *const Type;
pub type MethodHandle = *const Method;
pub type OverloadHandle = *const MethodOverload;
pub type FieldHandle = *const Field;
pub type PropertyHandle = *const Property;

/// Signature of the well-known `OvumModuleMain` symbol.
pub type NativeModuleMain = unsafe extern "C" fn(ModuleHandle);

/// Signature of a per-type native initializer.
pub type TypeIniter = unsafe extern "C" fn(TypeHandle);

/// A constant value crossing the ABI.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct FfiValue {
	pub type_: TypeHandle,
	/// 0 = int, 1 = uint, 2 = real, 3 = string
	pub kind: u8,
	pub int_value: i64,
	pub uint_value: u64,
	pub real_value: f64,
	pub string: Slice<'static, u8>,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct GlobalMemberInfo {
	pub flags: u32,
	pub name: Slice<'static, u8>,
	/// 1 = type, 2 = function, 3 = constant
	pub kind: u32,
	pub type_: TypeHandle,
	pub function: MethodHandle,
	pub constant: FfiValue,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct MemberInfo {
	/// 1 = field, 2 = method, 3 = property
	pub kind: u32,
	pub flags: u32,
	pub field: FieldHandle,
	pub method: MethodHandle,
	pub property: PropertyHandle,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ParamInfo {
	pub name: Slice<'static, u8>,
	pub is_optional: bool,
	pub is_variadic: bool,
	pub is_by_ref: bool,
}

/// Extends a borrowed string view to the handle lifetime. Sound because the
/// backing storage is interned in the VM string pool and never freed.
fn string_slice(value: &IStr) -> Slice<'static, u8> {
	unsafe { std::mem::transmute::<Slice<u8>, Slice<'static, u8>>(Slice::from(value.as_str())) }
}

fn lookup_name(module: &Module, name: Slice<u8>) -> Option<IStr> {
	let name = std::str::from_utf8(name.as_ref()).ok()?;
	// Unknown contents cannot name anything: every loaded name is interned.
	module.vm().strings().get(name)
}

fn ffi_value(value: &Value) -> FfiValue {
	let mut out = FfiValue {
		type_: Rc::as_ptr(&value.ty),
		kind: 0,
		int_value: 0,
		uint_value: 0,
		real_value: 0.0,
		string: Slice::empty(),
	};
	match &value.data {
		ValueData::Int(v) => {
			out.kind = 0;
			out.int_value = *v;
		}
		ValueData::UInt(v) => {
			out.kind = 1;
			out.uint_value = *v;
		}
		ValueData::Real(v) => {
			out.kind = 2;
			out.real_value = *v;
		}
		ValueData::String(v) => {
			out.kind = 3;
			out.string = string_slice(v);
		}
	}
	out
}

fn member_info(member: &Member) -> MemberInfo {
	let mut out = MemberInfo {
		kind: 0,
		flags: member.flags().bits(),
		field: std::ptr::null(),
		method: std::ptr::null(),
		property: std::ptr::null(),
	};
	match member {
		Member::Field(f) => {
			out.kind = 1;
			out.field = Rc::as_ptr(f);
		}
		Member::Method(m) => {
			out.kind = 2;
			out.method = Rc::as_ptr(m);
		}
		Member::Property(p) => {
			out.kind = 3;
			out.property = Rc::as_ptr(p);
		}
	}
	out
}

fn global_member_info(member: &crate::module::GlobalMember) -> GlobalMemberInfo {
	let mut out = GlobalMemberInfo {
		flags: member.flags.bits(),
		name: string_slice(&member.name),
		kind: 0,
		type_: std::ptr::null(),
		function: std::ptr::null(),
		constant: FfiValue {
			type_: std::ptr::null(),
			kind: 0,
			int_value: 0,
			uint_value: 0,
			real_value: 0.0,
			string: Slice::empty(),
		},
	};
	match &member.kind {
		GlobalMemberKind::Type(ty) => {
			out.kind = 1;
			out.type_ = Rc::as_ptr(ty);
		}
		GlobalMemberKind::Function(f) => {
			out.kind = 2;
			out.function = Rc::as_ptr(f);
		}
		GlobalMemberKind::Constant(value) => {
			out.kind = 3;
			out.constant = ffi_value(value);
		}
	}
	out
}

/*** Module introspection ***/

#[no_mangle]
pub unsafe extern "C" fn FindModule(
	vm: VmHandle,
	name: Slice<u8>,
	version: *const ModuleVersion,
) -> ModuleHandle {
	let vm = &*vm;
	let Ok(name) = std::str::from_utf8(name.as_ref()) else {
		return std::ptr::null();
	};
	let version = version.as_ref();
	match vm.module_pool().get(name, version) {
		Some(module) => Rc::as_ptr(&module),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetName(module: ModuleHandle) -> Slice<'static, u8> {
	string_slice((*module).name())
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetVersion(module: ModuleHandle, version: *mut ModuleVersion) {
	*version = (*module).version();
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetFileName(module: ModuleHandle) -> Slice<'static, u8> {
	let bytes = (*module).file_name().as_os_str().as_encoded_bytes();
	std::mem::transmute::<Slice<u8>, Slice<'static, u8>>(Slice::from(bytes))
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetGlobalMemberCount(module: ModuleHandle) -> i32 {
	(*module).global_member_count() as i32
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetGlobalMemberByIndex(
	module: ModuleHandle,
	index: i32,
	result: *mut GlobalMemberInfo,
) -> bool {
	if index < 0 {
		return false;
	}
	match (*module).global_member_by_index(index as usize) {
		Some(member) => {
			*result = global_member_info(&member);
			true
		}
		None => false,
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_GetGlobalMember(
	module: ModuleHandle,
	name: Slice<u8>,
	include_internal: bool,
	result: *mut GlobalMemberInfo,
) -> bool {
	let module = &*module;
	let Some(name) = lookup_name(module, name) else { return false };
	match module.find_member(&name, include_internal) {
		Some(member) => {
			*result = global_member_info(&member);
			true
		}
		None => false,
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_FindType(
	module: ModuleHandle,
	name: Slice<u8>,
	include_internal: bool,
) -> TypeHandle {
	let module = &*module;
	let Some(name) = lookup_name(module, name) else {
		return std::ptr::null();
	};
	match module.find_type(&name, include_internal) {
		Some(ty) => Rc::as_ptr(&ty),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_FindGlobalFunction(
	module: ModuleHandle,
	name: Slice<u8>,
	include_internal: bool,
) -> MethodHandle {
	let module = &*module;
	let Some(name) = lookup_name(module, name) else {
		return std::ptr::null();
	};
	match module.find_global_function(&name, include_internal) {
		Some(function) => Rc::as_ptr(&function),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_FindConstant(
	module: ModuleHandle,
	name: Slice<u8>,
	include_internal: bool,
	result: *mut FfiValue,
) -> bool {
	let module = &*module;
	let Some(name) = lookup_name(module, name) else { return false };
	match module.find_constant(&name, include_internal) {
		Some(value) => {
			*result = ffi_value(&value);
			true
		}
		None => false,
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_FindNativeFunction(
	module: ModuleHandle,
	name: *const c_char,
) -> RawSymbol {
	let name = std::ffi::CStr::from_ptr(name);
	match (*module).find_native_entry_point(name) {
		Some(symbol) => symbol,
		None => std::ptr::null_mut(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Module_FindDependency(
	module: ModuleHandle,
	name: Slice<u8>,
) -> ModuleHandle {
	let Ok(name) = std::str::from_utf8(name.as_ref()) else {
		return std::ptr::null();
	};
	match (*module).find_module_ref(name) {
		Some(dependency) => Rc::as_ptr(&dependency),
		None => std::ptr::null(),
	}
}

/*** Type introspection ***/

#[no_mangle]
pub unsafe extern "C" fn Type_GetFlags(ty: TypeHandle) -> u32 {
	(*ty).flags().bits()
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetFullName(ty: TypeHandle) -> Slice<'static, u8> {
	string_slice((*ty).full_name())
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetBaseType(ty: TypeHandle) -> TypeHandle {
	match (*ty).base_type() {
		Some(base) => Rc::as_ptr(base),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetDeclModule(ty: TypeHandle) -> ModuleHandle {
	Rc::as_ptr(&(*ty).module())
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetMemberCount(ty: TypeHandle) -> i32 {
	(*ty).member_count() as i32
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetMemberByIndex(
	ty: TypeHandle,
	index: i32,
	result: *mut MemberInfo,
) -> bool {
	if index < 0 {
		return false;
	}
	match (*ty).member_by_index(index as usize) {
		Some(member) => {
			*result = member_info(&member);
			true
		}
		None => false,
	}
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetMember(
	ty: TypeHandle,
	name: Slice<u8>,
	result: *mut MemberInfo,
) -> bool {
	let ty = &*ty;
	let Some(name) = lookup_name(&ty.module(), name) else { return false };
	match ty.get_member(&name) {
		Some(member) => {
			*result = member_info(&member);
			true
		}
		None => false,
	}
}

/// Like `Type_GetMember`, but walks the inheritance chain and checks that the
/// member is accessible from `from_type`.
#[no_mangle]
pub unsafe extern "C" fn Type_FindMember(
	ty: TypeHandle,
	name: Slice<u8>,
	from_type: TypeHandle,
	result: *mut MemberInfo,
) -> bool {
	Rc::increment_strong_count(ty);
	let ty = Rc::from_raw(ty);

	let Some(name) = lookup_name(&ty.module(), name) else { return false };
	let Some(member) = ty.find_member(&name) else { return false };

	let from_type = if from_type.is_null() {
		None
	} else {
		Rc::increment_strong_count(from_type);
		Some(Rc::from_raw(from_type))
	};
	let from_module = from_type.as_ref().map(|t| t.module());

	let accessible = match &member {
		Member::Field(f) => f.is_accessible(Some(&ty), from_type.as_ref(), from_module.as_ref()),
		Member::Method(m) => m.is_accessible(Some(&ty), from_type.as_ref(), from_module.as_ref()),
		Member::Property(p) => crate::object::member::is_accessible(
			p.flags(),
			Some(&p.decl_type()),
			Some(&p.decl_type().module()),
			Some(&ty),
			from_type.as_ref(),
			from_module.as_ref(),
		),
	};
	if !accessible {
		return false;
	}
	*result = member_info(&member);
	true
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetOperator(ty: TypeHandle, op: u32) -> OverloadHandle {
	let Ok(op) = Operator::try_from(op) else {
		return std::ptr::null();
	};
	match (*ty).operator(op) {
		Some(overload) => Rc::as_ptr(&overload),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetFieldOffset(ty: TypeHandle) -> u32 {
	(*ty).fields_offset()
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetInstanceSize(ty: TypeHandle) -> u32 {
	(*ty).instance_size()
}

#[no_mangle]
pub unsafe extern "C" fn Type_GetTotalSize(ty: TypeHandle) -> u32 {
	(*ty).total_size()
}

#[no_mangle]
pub unsafe extern "C" fn Type_SetInstanceSize(ty: TypeHandle, size: u32) {
	(*ty).set_instance_size(size)
}

#[no_mangle]
pub unsafe extern "C" fn Type_SetFinalizer(ty: TypeHandle, finalizer: Option<Finalizer>) {
	(*ty).set_finalizer(finalizer)
}

#[no_mangle]
pub unsafe extern "C" fn Type_SetReferenceWalker(ty: TypeHandle, walker: ReferenceWalker) {
	(*ty).set_reference_walker(walker)
}

/// Declares to the GC that `offset` within a custom instance layout holds
/// data of the given kind.
#[no_mangle]
pub unsafe extern "C" fn Type_AddNativeField(
	ty: TypeHandle,
	offset: usize,
	kind: NativeFieldKind,
) {
	(*ty).add_native_field(offset, kind)
}

#[no_mangle]
pub unsafe extern "C" fn Type_SetConstructorIsAllocator(ty: TypeHandle, value: bool) {
	use crate::object::r#type::TypeFlags;
	match value {
		true => (*ty).add_flags(TypeFlags::CTOR_IS_ALLOCATOR),
		false => (*ty).remove_flags(TypeFlags::CTOR_IS_ALLOCATOR),
	}
}

/*** Method introspection ***/

#[no_mangle]
pub unsafe extern "C" fn Method_IsConstructor(method: MethodHandle) -> bool {
	(*method).is_ctor()
}

#[no_mangle]
pub unsafe extern "C" fn Method_GetOverloadCount(method: MethodHandle) -> i32 {
	(*method).overload_count() as i32
}

#[no_mangle]
pub unsafe extern "C" fn Method_GetOverload(method: MethodHandle, index: i32) -> OverloadHandle {
	if index < 0 {
		return std::ptr::null();
	}
	match (*method).overload(index as usize) {
		Some(overload) => Rc::as_ptr(overload),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Method_GetBaseMethod(method: MethodHandle) -> MethodHandle {
	match (*method).base_method() {
		Some(base) => Rc::as_ptr(&base),
		None => std::ptr::null(),
	}
}

#[no_mangle]
pub unsafe extern "C" fn Method_Accepts(method: MethodHandle, argc: i32) -> bool {
	if !(0..=u16::MAX as i32).contains(&argc) {
		return false;
	}
	(*method).accepts(argc as u16)
}

#[no_mangle]
pub unsafe extern "C" fn Method_FindOverload(method: MethodHandle, argc: i32) -> OverloadHandle {
	if !(0..=u16::MAX as i32).contains(&argc) {
		return std::ptr::null();
	}
	match (*method).resolve_overload(argc as u16) {
		Some(overload) => Rc::as_ptr(&overload),
		None => std::ptr::null(),
	}
}

/*** Overload introspection ***/

#[no_mangle]
pub unsafe extern "C" fn Overload_GetFlags(overload: OverloadHandle) -> u32 {
	(*overload).flags().bits()
}

#[no_mangle]
pub unsafe extern "C" fn Overload_GetParamCount(overload: OverloadHandle) -> i32 {
	(*overload).param_count() as i32
}

#[no_mangle]
pub unsafe extern "C" fn Overload_GetParameter(
	overload: OverloadHandle,
	index: i32,
	result: *mut ParamInfo,
) -> bool {
	let overload = &*overload;
	if index < 0 || index as usize >= overload.param_names().len() {
		return false;
	}
	let index = index as usize;
	let param_count = overload.param_count() as usize;
	let optional = overload.optional_param_count() as usize;

	let is_variadic = overload.is_variadic()
		&& if overload.flags().contains(MethodFlags::VAR_START) {
			index == 0
		} else {
			index == param_count - 1
		};

	let vm = overload.module().vm();
	let refs = crate::ee::refsignature::RefSignature::new(
		overload.ref_signature(),
		vm.ref_signatures(),
	);

	*result = ParamInfo {
		name: string_slice(&overload.param_names()[index]),
		is_optional: index >= param_count.saturating_sub(optional),
		is_variadic,
		// Slot 0 is reserved for the instance.
		is_by_ref: refs.is_param_ref(index as u32 + 1),
	};
	true
}

#[no_mangle]
pub unsafe extern "C" fn Overload_GetMethod(overload: OverloadHandle) -> MethodHandle {
	Rc::as_ptr(&(*overload).group())
}
