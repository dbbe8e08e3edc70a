pub mod error;
pub mod ir;
pub mod logic;
pub mod vpr;
pub mod weaver;

// Re-export commonly used types
pub use error::WeaverError;
pub use weaver::expr::{Check, CheckExpr};
pub use weaver::{weave, CallStyle, CollectedMethod, CollectedProgram, Location, RuntimeCheck};
