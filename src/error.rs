//! Error types for the weaving pass.
//!
//! Every error is fatal: the weaver never drops or weakens a residual
//! check to make progress, and it never guesses which program point an
//! obligation belongs to.

use thiserror::Error;

/// High level error produced while weaving a program.
#[derive(Debug, Error)]
pub enum WeaverError {
    /// The IR body and the verifier statement list disagree while being
    /// walked in lock-step.
    #[error("structural mismatch in method '{method}': {detail}")]
    StructuralMismatch { method: String, detail: String },

    /// A verifier expression uses a construct the check algebra does not
    /// model, or violates an encoding convention (for example a heap
    /// field whose name is not of the form `struct$field`).
    #[error("invalid expression at verifier node {node}: {detail}")]
    InvalidExpression { node: u32, detail: String },

    /// A specification was malformed for the purpose it was consulted
    /// for, or a permission walk reached a location it could not
    /// associate with any specification clause.
    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    /// A substitution during call-site permission population could not
    /// resolve a formal parameter to an actual argument.
    #[error("unknown variable or parameter '{name}' in method '{method}'")]
    UnknownVariable { name: String, method: String },

    /// A residual check carried a position tag combination that no
    /// collection rule accepts.
    #[error("unhandled check position at verifier node {node}: {detail}")]
    UnhandledPosition { node: u32, detail: String },

    /// A residual check referenced a verifier node the location index
    /// does not cover.
    #[error("verifier node {node} is not reachable from any indexed specification or statement")]
    UnknownNode { node: u32 },

    /// A name lookup against the program failed (method, struct,
    /// predicate, or struct field).
    #[error("undefined {kind} '{name}'")]
    Undefined { kind: &'static str, name: String },
}

impl WeaverError {
    pub fn undefined(kind: &'static str, name: impl Into<String>) -> Self {
        WeaverError::Undefined {
            kind,
            name: name.into(),
        }
    }
}
