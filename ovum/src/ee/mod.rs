pub mod instructions;
pub mod methodbuilder;
pub mod methodinitializer;
pub mod refsignature;

pub use methodinitializer::initialize_method;
pub use refsignature::{RefSignature, RefSignatureBuilder, RefSignaturePool};
