//! The weaver: collects residual obligations against the IR and
//! injects the runtime enforcement code.
//!
//! Collection is a pure pass over the inputs; injection mutates the IR
//! in place. [`weave`] runs both.

pub mod checker;
pub mod collector;
pub mod expr;
pub mod runtime;

use std::collections::BTreeSet;

use crate::error::WeaverError;
use crate::ir::{self, OpId};
use crate::logic::{Disjunction, TermId};
use crate::vpr;

use self::expr::{Check, CheckExpr};

/// Where a runtime check fires. Identity is structural: the operation
/// id plus the phase relative to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// Immediately before the operation.
    Pre(OpId),
    /// Immediately after the operation.
    Post(OpId),
    /// At the head of each loop iteration.
    LoopStart(OpId),
    /// At the end of each loop iteration.
    LoopEnd(OpId),
    /// On entry to the method.
    MethodPre,
    /// On every exit from the method.
    MethodPost,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Pre(op) => write!(f, "pre {}", op),
            Location::Post(op) => write!(f, "post {}", op),
            Location::LoopStart(op) => write!(f, "loop-start {}", op),
            Location::LoopEnd(op) => write!(f, "loop-end {}", op),
            Location::MethodPre => write!(f, "method entry"),
            Location::MethodPost => write!(f, "method exit"),
        }
    }
}

/// An interned condition term: at `location`, `value` holds, asked
/// about only under `when`. Term ids are dense and assigned in
/// first-seen order along the verifier trace, so a term's `when` only
/// references earlier terms.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionTerm {
    pub id: TermId,
    pub location: Location,
    pub value: CheckExpr,
    /// Disjunction of the contexts in which this term is consulted;
    /// `None` once simplification shows it unconditional.
    pub when: Option<Disjunction>,
}

/// The guard of a runtime check.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// A DNF over interned condition terms, produced from the
    /// verifier's branch trace.
    Trace(Disjunction),
    /// A check expression evaluated directly at the insertion point;
    /// produced by specification walks whose guards have no trace to
    /// intern against.
    Immediate(CheckExpr),
}

/// One woven obligation: `check` must hold at `location` whenever
/// `when` evaluates true (unconditionally when absent).
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeCheck {
    pub location: Location,
    pub check: Check,
    pub when: Option<Condition>,
}

/// How a method participates in the permission-passing convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStyle {
    /// The entry point; creates the permission root.
    Main,
    /// Precise precondition and postcondition.
    Precise,
    /// Precise precondition, imprecise postcondition.
    PrecisePre,
    /// Imprecise precondition.
    Imprecise,
}

impl CallStyle {
    /// Classify a method by the precision of its specification.
    pub fn of(method: &ir::Method) -> CallStyle {
        if method.name == "main" {
            CallStyle::Main
        } else if ir::spec_is_imprecise(method.precondition.as_ref()) {
            CallStyle::Imprecise
        } else if ir::spec_is_imprecise(method.postcondition.as_ref()) {
            CallStyle::PrecisePre
        } else {
            CallStyle::Precise
        }
    }

    /// Whether callers must pass permission objects to this method.
    pub fn receives_permissions(&self) -> bool {
        matches!(self, CallStyle::PrecisePre | CallStyle::Imprecise)
    }
}

impl std::fmt::Display for CallStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStyle::Main => write!(f, "main"),
            CallStyle::Precise => write!(f, "precise"),
            CallStyle::PrecisePre => write!(f, "precise-pre"),
            CallStyle::Imprecise => write!(f, "imprecise"),
        }
    }
}

/// A call site inside a method body.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeSite {
    pub op: OpId,
    pub callee: String,
}

/// An allocation site inside a method body.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationSite {
    pub op: OpId,
    /// Variable the allocation binds.
    pub target: String,
    /// Struct name for `AllocStruct`; `None` for bare value cells.
    pub struct_name: Option<String>,
}

/// Everything the collector learned about one method.
#[derive(Clone, Debug)]
pub struct CollectedMethod {
    pub name: String,
    /// Surviving condition terms, in id order.
    pub conditions: Vec<ConditionTerm>,
    /// Runtime checks in (location, first-seen) order.
    pub checks: Vec<RuntimeCheck>,
    pub returns: Vec<OpId>,
    pub invokes: Vec<InvokeSite>,
    pub allocations: Vec<AllocationSite>,
    pub has_implicit_return: bool,
    pub call_style: CallStyle,
    /// Locations whose originating specification was re-walked for
    /// permission separation.
    pub full_walk_locations: BTreeSet<Location>,
}

impl CollectedMethod {
    /// Whether any of this method's own checks needs ownership
    /// tracking at run time.
    pub fn has_access_checks(&self) -> bool {
        self.checks.iter().any(|c| c.check.is_access_check())
    }
}

/// Collector output for the whole program.
#[derive(Clone, Debug)]
pub struct CollectedProgram {
    pub methods: Vec<CollectedMethod>,
}

impl CollectedProgram {
    pub fn method(&self, name: &str) -> Option<&CollectedMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Whether any method in the program emitted an accessibility or
    /// separation check. When true the whole program adopts the
    /// permission-passing calling convention.
    pub fn requires_tracking(&self) -> bool {
        self.methods.iter().any(CollectedMethod::has_access_checks)
    }
}

/// The bundled weaver input the external toolchain hands over: the IR
/// program, the verifier rendering of it, and the residual-check
/// table.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct WeaveInput {
    pub program: ir::Program,
    pub verifier: vpr::Program,
    #[serde(default)]
    pub checks: vpr::CheckTable,
}

/// Run the full weaving pass: collect every residual obligation, then
/// inject the runtime enforcement code into `program`.
pub fn weave(
    program: &mut ir::Program,
    verifier: &vpr::Program,
    table: &vpr::CheckTable,
) -> Result<CollectedProgram, WeaverError> {
    program.renumber();
    let collected = collector::collect(program, verifier, table)?;
    checker::inject(program, &collected)?;
    Ok(collected)
}
