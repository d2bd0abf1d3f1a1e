pub mod field;
pub mod member;
pub mod method;
pub mod r#type;

pub use field::{Field, Property};
pub use member::{Member, MemberFlags};
pub use method::{
	CatchClause, Method, MethodBody, MethodFlags, MethodOverload, TryBlock, TryBlockHandler,
	TryBlockKind,
};
pub use r#type::{NativeFieldKind, Operator, Type, TypeFlags};

/// Member names with reserved meaning. `.new` is the instance constructor,
/// `.iter` the iterator accessor and `.init` the static constructor; none of
/// them participate in base-method override wiring.
pub mod special_names {
	pub const NEW: &str = ".new";
	pub const ITER: &str = ".iter";
	pub const INIT: &str = ".init";
}
