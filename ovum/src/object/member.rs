use std::rc::Rc;

use bitflags::bitflags;

use crate::module::Module;
use crate::object::field::{Field, Property};
use crate::object::method::Method;
use crate::object::r#type::Type;
use crate::strings::IStr;

bitflags! {
	/// Flags shared by all type members and global functions.
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct MemberFlags: u32 {
		const PUBLIC       = 0x0001;
		const INTERNAL     = 0x0002;
		const PROTECTED    = 0x0004;
		const PRIVATE      = 0x0008;
		const ACCESS_LEVEL = 0x000F;

		const FIELD        = 0x0010;
		const METHOD       = 0x0020;
		const PROPERTY     = 0x0040;
		const KIND         = 0x0070;

		const INSTANCE     = 0x0100;
		const CTOR         = 0x0200;
		const HAS_VALUE    = 0x0400;
		const IMPL         = 0x1000;
	}
}

/// A named member of a type.
#[derive(Debug, Clone)]
pub enum Member {
	Field(Rc<Field>),
	Method(Rc<Method>),
	Property(Rc<Property>),
}

impl Member {
	pub fn flags(&self) -> MemberFlags {
		match self {
			Member::Field(f) => f.flags(),
			Member::Method(m) => m.flags(),
			Member::Property(p) => p.flags(),
		}
	}

	pub fn name(&self) -> &IStr {
		match self {
			Member::Field(f) => f.name(),
			Member::Method(m) => m.name(),
			Member::Property(p) => p.name(),
		}
	}

	pub fn is_static(&self) -> bool {
		!self.flags().contains(MemberFlags::INSTANCE)
	}

	pub fn as_method(&self) -> Option<&Rc<Method>> {
		match self {
			Member::Method(m) => Some(m),
			_ => None,
		}
	}

	pub fn as_field(&self) -> Option<&Rc<Field>> {
		match self {
			Member::Field(f) => Some(f),
			_ => None,
		}
	}
}

/// Shared accessibility check. `inst_type` is the type of the instance the
/// member is accessed through (None for static access), `from_type` and
/// `from_module` identify the location the access happens from.
pub(crate) fn is_accessible(
	flags: MemberFlags,
	decl_type: Option<&Rc<Type>>,
	decl_module: Option<&Rc<Module>>,
	inst_type: Option<&Rc<Type>>,
	from_type: Option<&Rc<Type>>,
	from_module: Option<&Rc<Module>>,
) -> bool {
	match flags & MemberFlags::ACCESS_LEVEL {
		MemberFlags::PUBLIC => true,
		MemberFlags::INTERNAL => match (decl_module, from_module) {
			(Some(decl), Some(from)) => Rc::ptr_eq(decl, from),
			_ => false,
		},
		MemberFlags::PRIVATE => match (decl_type, from_type) {
			(Some(decl), Some(from)) => Rc::ptr_eq(decl, from),
			_ => false,
		},
		MemberFlags::PROTECTED => {
			let Some(decl) = decl_type else { return false };
			let Some(from) = from_type else { return false };
			if !from.derives_from(decl) {
				return false;
			}
			match inst_type {
				Some(inst) => inst.derives_from(from),
				None => true,
			}
		}
		_ => false,
	}
}
