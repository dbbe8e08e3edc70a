//! The collector: maps each residual check onto an IR insertion site,
//! interns branch conditions into shared condition terms, enumerates
//! separation obligations, and classifies methods by call style.
//!
//! The collector never mutates the input IR; its output drives the
//! injector.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::WeaverError;
use crate::ir::{self, AssertKind, OpId, OpKind};
use crate::logic::{self, Conjunction, Disjunction, Term, TermId};
use crate::vpr;

use super::expr::{Check, CheckExpr, FieldRef, PredicateRef};
use super::{
    AllocationSite, CallStyle, CollectedMethod, CollectedProgram, Condition, ConditionTerm,
    InvokeSite, Location, RuntimeCheck,
};

/// Collect every method of `program` against the verifier output.
pub fn collect(
    program: &ir::Program,
    verifier: &vpr::Program,
    table: &vpr::CheckTable,
) -> Result<CollectedProgram, WeaverError> {
    let mut methods = Vec::new();
    let mut claimed: HashSet<vpr::NodeId> = HashSet::new();

    for method in &program.methods {
        let vmethod = verifier.method_named(&method.name).ok_or_else(|| {
            WeaverError::StructuralMismatch {
                method: method.name.clone(),
                detail: "no verifier method of this name".to_string(),
            }
        })?;
        let index = Indexer::index(method, vmethod)?;
        claimed.extend(index.nodes.keys().copied());
        methods.push(collect_method(program, verifier, method, table, &index)?);
    }

    // Every residual check must land somewhere.
    for entry in &table.entries {
        if !entry.checks.is_empty() && !claimed.contains(&entry.node) {
            return Err(WeaverError::UnknownNode { node: entry.node });
        }
    }

    Ok(CollectedProgram { methods })
}

/// Location index values: body nodes resolve to an operation without a
/// phase (the phase comes from the check's position tag), method-level
/// nodes resolve directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Indexed {
    AtOp(OpId),
    MethodPre,
    MethodPost,
}

/// Phase A output: the node-to-location map for one method, plus the
/// operation lookup the later phases need.
struct Index<'a> {
    method: &'a ir::Method,
    nodes: HashMap<vpr::NodeId, Indexed>,
    ops: HashMap<OpId, &'a ir::Op>,
    /// Verifier nodes of each loop's invariant formulas.
    invariants: HashMap<OpId, BTreeSet<vpr::NodeId>>,
}

struct Indexer<'a> {
    out: Index<'a>,
}

impl<'a> Indexer<'a> {
    /// Walk the IR body and the verifier statement list in lock-step.
    /// Every divergence is a fatal structural mismatch.
    fn index(method: &'a ir::Method, vmethod: &'a vpr::Method) -> Result<Index<'a>, WeaverError> {
        let mut indexer = Indexer {
            out: Index {
                method,
                nodes: HashMap::new(),
                ops: HashMap::new(),
                invariants: HashMap::new(),
            },
        };
        for pre in &vmethod.pres {
            indexer.record_exp(pre, Indexed::MethodPre);
        }
        for post in &vmethod.posts {
            indexer.record_exp(post, Indexed::MethodPost);
        }
        indexer.walk_block(&method.body, &vmethod.body)?;
        Ok(indexer.out)
    }

    fn mismatch(&self, detail: impl Into<String>) -> WeaverError {
        WeaverError::StructuralMismatch {
            method: self.out.method.name.clone(),
            detail: detail.into(),
        }
    }

    fn record_exp(&mut self, exp: &vpr::Exp, loc: Indexed) {
        self.out.nodes.insert(exp.id, loc);
        match &exp.kind {
            vpr::ExpKind::Binary { left, right, .. } => {
                self.record_exp(left, loc);
                self.record_exp(right, loc);
            }
            vpr::ExpKind::Unary { operand, .. } => self.record_exp(operand, loc),
            vpr::ExpKind::FieldAccess { receiver, .. } => self.record_exp(receiver, loc),
            vpr::ExpKind::FieldAccessPredicate { access } => self.record_exp(access, loc),
            vpr::ExpKind::PredicateAccess { args, .. } => {
                for arg in args {
                    self.record_exp(arg, loc);
                }
            }
            vpr::ExpKind::PredicateAccessPredicate { access } => self.record_exp(access, loc),
            vpr::ExpKind::Conditional { cond, then, els } => {
                self.record_exp(cond, loc);
                self.record_exp(then, loc);
                self.record_exp(els, loc);
            }
            vpr::ExpKind::IntLit(_)
            | vpr::ExpKind::BoolLit(_)
            | vpr::ExpKind::NullLit
            | vpr::ExpKind::LocalVar(_) => {}
        }
    }

    fn walk_block(&mut self, ops: &'a [ir::Op], stmts: &'a [vpr::Stmt]) -> Result<(), WeaverError> {
        let mut stmts = stmts.iter();
        for op in ops {
            self.out.ops.insert(op.id, op);
            let at = Indexed::AtOp(op.id);
            match &op.kind {
                // Imperative asserts exist only in the IR.
                OpKind::Assert {
                    kind: AssertKind::Imperative,
                    ..
                } => {}
                OpKind::Assert {
                    kind: AssertKind::Specification,
                    ..
                } => {
                    let stmt = self.next_stmt(&mut stmts, op, "assert")?;
                    match &stmt.kind {
                        vpr::StmtKind::Assert { exp } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(exp, at);
                        }
                        other => {
                            return Err(self.expected(op, "assert", other));
                        }
                    }
                }
                // Void returns exist only in the IR; value returns
                // consume the verifier's result assignment.
                OpKind::Return { value: None } => {}
                OpKind::Return { value: Some(_) } => {
                    let stmt = self.next_stmt(&mut stmts, op, "result assignment")?;
                    match &stmt.kind {
                        vpr::StmtKind::LocalAssign { value, .. } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(value, at);
                        }
                        other => {
                            return Err(self.expected(op, "result assignment", other));
                        }
                    }
                }
                OpKind::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    let stmt = self.next_stmt(&mut stmts, op, "if")?;
                    match &stmt.kind {
                        vpr::StmtKind::If {
                            cond,
                            then_body,
                            else_body,
                        } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(cond, at);
                            self.walk_block(then_branch, then_body)?;
                            self.walk_block(else_branch, else_body)?;
                        }
                        other => return Err(self.expected(op, "if", other)),
                    }
                }
                OpKind::While { body, .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "while")?;
                    match &stmt.kind {
                        vpr::StmtKind::While {
                            cond,
                            invariants,
                            body: vbody,
                        } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(cond, at);
                            let mut inv_nodes = BTreeSet::new();
                            for inv in invariants {
                                self.record_exp(inv, at);
                                collect_nodes(inv, &mut inv_nodes);
                            }
                            self.out.invariants.insert(op.id, inv_nodes);
                            self.walk_block(body, vbody)?;
                        }
                        other => return Err(self.expected(op, "while", other)),
                    }
                }
                OpKind::Invoke { args, .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "method call")?;
                    match &stmt.kind {
                        vpr::StmtKind::MethodCall { args: vargs, .. } => {
                            self.out.nodes.insert(stmt.id, at);
                            for arg in vargs {
                                self.record_exp(arg, at);
                            }
                            if args.len() != vargs.len() {
                                return Err(self.mismatch(format!(
                                    "call at {} has {} arguments, verifier has {}",
                                    op.id,
                                    args.len(),
                                    vargs.len()
                                )));
                            }
                        }
                        other => return Err(self.expected(op, "method call", other)),
                    }
                }
                OpKind::AllocValue { .. } | OpKind::AllocStruct { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "allocation")?;
                    match &stmt.kind {
                        vpr::StmtKind::New { .. } => {
                            self.out.nodes.insert(stmt.id, at);
                        }
                        other => return Err(self.expected(op, "allocation", other)),
                    }
                }
                OpKind::Assign { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "local assignment")?;
                    match &stmt.kind {
                        vpr::StmtKind::LocalAssign { value, .. } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(value, at);
                        }
                        other => return Err(self.expected(op, "local assignment", other)),
                    }
                }
                OpKind::AssignMember { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "field assignment")?;
                    match &stmt.kind {
                        vpr::StmtKind::FieldAssign { access, value } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(access, at);
                            self.record_exp(value, at);
                        }
                        other => return Err(self.expected(op, "field assignment", other)),
                    }
                }
                OpKind::Fold { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "fold")?;
                    match &stmt.kind {
                        vpr::StmtKind::Fold { access } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(access, at);
                        }
                        other => return Err(self.expected(op, "fold", other)),
                    }
                }
                OpKind::Unfold { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "unfold")?;
                    match &stmt.kind {
                        vpr::StmtKind::Unfold { access } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(access, at);
                        }
                        other => return Err(self.expected(op, "unfold", other)),
                    }
                }
                OpKind::Error { .. } => {
                    let stmt = self.next_stmt(&mut stmts, op, "error assertion")?;
                    match &stmt.kind {
                        vpr::StmtKind::Assert { exp } => {
                            self.out.nodes.insert(stmt.id, at);
                            self.record_exp(exp, at);
                        }
                        other => return Err(self.expected(op, "error assertion", other)),
                    }
                }
            }
        }
        if let Some(extra) = stmts.next() {
            return Err(self.mismatch(format!(
                "verifier {} statement has no corresponding operation",
                extra.kind.kind_name()
            )));
        }
        Ok(())
    }

    fn next_stmt<'s>(
        &self,
        stmts: &mut std::slice::Iter<'s, vpr::Stmt>,
        op: &ir::Op,
        wanted: &str,
    ) -> Result<&'s vpr::Stmt, WeaverError> {
        stmts.next().ok_or_else(|| {
            self.mismatch(format!(
                "operation {} expects a verifier {} statement, but the verifier body is exhausted",
                op.id, wanted
            ))
        })
    }

    fn expected(&self, op: &ir::Op, wanted: &str, got: &vpr::StmtKind) -> WeaverError {
        self.mismatch(format!(
            "operation {} expects a verifier {} statement, found {}",
            op.id,
            wanted,
            got.kind_name()
        ))
    }
}

fn collect_nodes(exp: &vpr::Exp, out: &mut BTreeSet<vpr::NodeId>) {
    out.insert(exp.id);
    match &exp.kind {
        vpr::ExpKind::Binary { left, right, .. } => {
            collect_nodes(left, out);
            collect_nodes(right, out);
        }
        vpr::ExpKind::Unary { operand, .. } => collect_nodes(operand, out),
        vpr::ExpKind::FieldAccess { receiver, .. } => collect_nodes(receiver, out),
        vpr::ExpKind::FieldAccessPredicate { access } => collect_nodes(access, out),
        vpr::ExpKind::PredicateAccess { args, .. } => {
            for arg in args {
                collect_nodes(arg, out);
            }
        }
        vpr::ExpKind::PredicateAccessPredicate { access } => collect_nodes(access, out),
        vpr::ExpKind::Conditional { cond, then, els } => {
            collect_nodes(cond, out);
            collect_nodes(then, out);
            collect_nodes(els, out);
        }
        vpr::ExpKind::IntLit(_)
        | vpr::ExpKind::BoolLit(_)
        | vpr::ExpKind::NullLit
        | vpr::ExpKind::LocalVar(_) => {}
    }
}

/// Condition-term interner keyed by `(location, value)`.
struct Interner {
    ids: HashMap<(Location, CheckExpr), TermId>,
    terms: Vec<TermData>,
}

struct TermData {
    location: Location,
    value: CheckExpr,
    when: Disjunction,
}

impl Interner {
    fn new() -> Self {
        Interner {
            ids: HashMap::new(),
            terms: Vec::new(),
        }
    }

    /// Intern `(location, value)`, recording the conjunction of outer
    /// terms under which this term is being consulted.
    fn intern(&mut self, location: Location, value: CheckExpr, outer: &Conjunction) -> TermId {
        let id = match self.ids.get(&(location, value.clone())) {
            Some(id) => *id,
            None => {
                let id = self.terms.len() as TermId;
                self.terms.push(TermData {
                    location,
                    value: value.clone(),
                    when: Disjunction::new(),
                });
                self.ids.insert((location, value), id);
                id
            }
        };
        self.terms[id as usize].when.insert(outer.clone());
        id
    }
}

/// Ordered accumulation of trace-guarded checks, merged by
/// `(location, check)`.
struct CheckAcc {
    order: Vec<(Location, Check)>,
    dnf: HashMap<(Location, Check), Disjunction>,
}

impl CheckAcc {
    fn new() -> Self {
        CheckAcc {
            order: Vec::new(),
            dnf: HashMap::new(),
        }
    }

    fn add(&mut self, location: Location, check: Check, conjunction: Conjunction) {
        let key = (location, check);
        if !self.dnf.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.dnf.entry(key).or_default().insert(conjunction);
    }
}

fn collect_method(
    program: &ir::Program,
    verifier: &vpr::Program,
    method: &ir::Method,
    table: &vpr::CheckTable,
    index: &Index<'_>,
) -> Result<CollectedMethod, WeaverError> {
    let mut interner = Interner::new();
    let mut acc = CheckAcc::new();
    let mut walk_locations: BTreeSet<Location> = BTreeSet::new();

    // Phases B and C: resolve each residual check's location, intern
    // its branch-condition stack, and merge equal checks.
    for entry in &table.entries {
        if !index.nodes.contains_key(&entry.node) {
            continue;
        }
        for check in &entry.checks {
            let location = resolve_check_location(verifier, index, entry.node, check)?;

            let mut conjunction = Conjunction::new();
            for frame in &check.branches {
                let frame_loc = resolve_frame_location(verifier, index, frame)?;
                let expr = CheckExpr::from_viper(&frame.cond, method)?;
                let (value, positive) = expr.into_polarized();
                let id = interner.intern(frame_loc, value, &conjunction);
                conjunction.insert(Term { id, positive });
            }

            let lowered = Check::from_viper(&check.check, method)?;

            // Phase D marking: access checks found inside a
            // specification formula require a full permission walk of
            // that formula.
            let positioned = check.position.kind != vpr::PositionKind::Value
                || check.position.within.is_some();
            let at_boundary = matches!(location, Location::MethodPre | Location::MethodPost);
            if lowered.is_accessibility() && (positioned || at_boundary) {
                walk_locations.insert(location);
            }

            acc.add(location, lowered, conjunction);
        }
    }

    // Phase D: enumerate permissions at each marked location and emit
    // separation checks when more than one permission may overlap.
    let mut separations: Vec<RuntimeCheck> = Vec::new();
    for &location in &walk_locations {
        let perms = enumerate_permissions(program, index, location)?;
        let distinct: HashSet<&Permission> = perms.iter().map(|p| &p.perm).collect();
        // A single permission cannot overlap itself.
        if distinct.len() <= 1 {
            continue;
        }
        let mut seen: HashSet<(Check, Option<CheckExpr>)> = HashSet::new();
        for EnumeratedPermission { perm, cond } in perms {
            let check = match perm {
                Permission::Field(field) => Check::FieldSeparation(field),
                Permission::Predicate(pred) => Check::PredicateSeparation(pred),
            };
            if seen.insert((check.clone(), cond.clone())) {
                separations.push(RuntimeCheck {
                    location,
                    check,
                    when: cond.map(Condition::Immediate),
                });
            }
        }
    }

    // Phase E: simplify every guard, then drop condition terms no
    // surviving check reaches.
    let mut checks: Vec<RuntimeCheck> = Vec::new();
    let mut referenced: BTreeSet<TermId> = BTreeSet::new();
    for key in &acc.order {
        let dnf = logic::simplify(&acc.dnf[key]);
        let when = if dnf.is_trivially_true() {
            None
        } else {
            referenced.extend(dnf.referenced_terms());
            Some(Condition::Trace(dnf))
        };
        checks.push(RuntimeCheck {
            location: key.0,
            check: key.1.clone(),
            when,
        });
    }
    checks.extend(separations);

    let simplified: Vec<Disjunction> = interner
        .terms
        .iter()
        .map(|t| logic::simplify(&t.when))
        .collect();

    // Close the referenced set over term guards: materialising a live
    // term reads the terms its own guard mentions.
    let mut frontier: Vec<TermId> = referenced.iter().copied().collect();
    while let Some(id) = frontier.pop() {
        for dep in simplified[id as usize].referenced_terms() {
            if referenced.insert(dep) {
                frontier.push(dep);
            }
        }
    }

    let conditions: Vec<ConditionTerm> = interner
        .terms
        .iter()
        .enumerate()
        .filter(|(id, _)| referenced.contains(&(*id as TermId)))
        .map(|(id, term)| {
            let when = &simplified[id];
            ConditionTerm {
                id: id as TermId,
                location: term.location,
                value: term.value.clone(),
                when: if when.is_trivially_true() {
                    None
                } else {
                    Some(when.clone())
                },
            }
        })
        .collect();

    // Phases F and G plus the body enumerations the injector needs.
    let mut returns = Vec::new();
    let mut invokes = Vec::new();
    let mut allocations = Vec::new();
    enumerate_sites(&method.body, &mut returns, &mut invokes, &mut allocations);

    Ok(CollectedMethod {
        name: method.name.clone(),
        conditions,
        checks,
        returns,
        invokes,
        allocations,
        has_implicit_return: block_falls_through(&method.body),
        call_style: CallStyle::of(method),
        full_walk_locations: walk_locations,
    })
}

/// Phase B: reclassify a residual check's position tag into a concrete
/// IR location.
fn resolve_check_location(
    verifier: &vpr::Program,
    index: &Index<'_>,
    node: vpr::NodeId,
    check: &vpr::ResidualCheck,
) -> Result<Location, WeaverError> {
    let indexed = *index
        .nodes
        .get(&node)
        .ok_or(WeaverError::UnknownNode { node })?;

    let unhandled = |detail: String| WeaverError::UnhandledPosition { node, detail };

    match indexed {
        Indexed::MethodPre | Indexed::MethodPost => {
            // Method-level checks admit only plain value positions.
            if check.position.kind != vpr::PositionKind::Value || check.position.within.is_some() {
                return Err(unhandled(format!(
                    "position {} at a method boundary",
                    check.position.describe()
                )));
            }
            Ok(match indexed {
                Indexed::MethodPre => Location::MethodPre,
                _ => Location::MethodPost,
            })
        }
        Indexed::AtOp(op_id) => {
            let op = index.ops[&op_id];
            match (check.position.kind, check.position.within) {
                (vpr::PositionKind::Value, None | Some(vpr::Refinement::InCall)) => {
                    match &op.kind {
                        OpKind::Invoke { method: callee, .. } => {
                            if context_in_callee_post(verifier, callee, check.context)? {
                                Ok(Location::Post(op_id))
                            } else {
                                Ok(Location::Pre(op_id))
                            }
                        }
                        _ if check.position.within.is_some() => Err(unhandled(
                            "call refinement on a non-call operation".to_string(),
                        )),
                        _ => Ok(Location::Pre(op_id)),
                    }
                }
                (vpr::PositionKind::Value, Some(vpr::Refinement::InFold)) => match &op.kind {
                    OpKind::Fold { .. } => Ok(Location::Pre(op_id)),
                    _ => Err(unhandled("fold refinement on a non-fold operation".into())),
                },
                (vpr::PositionKind::Value, Some(vpr::Refinement::InUnfold)) => match &op.kind {
                    OpKind::Unfold { .. } => Ok(Location::Pre(op_id)),
                    _ => Err(unhandled(
                        "unfold refinement on a non-unfold operation".into(),
                    )),
                },
                (kind, None) => {
                    if !matches!(op.kind, OpKind::While { .. }) {
                        return Err(unhandled(format!(
                            "loop position {:?} on a non-loop operation",
                            kind
                        )));
                    }
                    match kind {
                        vpr::PositionKind::LoopBefore => Ok(Location::Pre(op_id)),
                        vpr::PositionKind::LoopAfter => Ok(Location::Post(op_id)),
                        vpr::PositionKind::LoopBegin => {
                            // Loop-start positions that point outside
                            // the invariant are verifier artefacts for
                            // the program point after the loop.
                            let inside = index
                                .invariants
                                .get(&op_id)
                                .map(|nodes| nodes.contains(&node))
                                .unwrap_or(false);
                            if inside {
                                Ok(Location::LoopStart(op_id))
                            } else {
                                Ok(Location::Post(op_id))
                            }
                        }
                        vpr::PositionKind::LoopEnd => Ok(Location::LoopEnd(op_id)),
                        vpr::PositionKind::Value => unreachable!("handled above"),
                    }
                }
                (kind, Some(refinement)) => Err(unhandled(format!(
                    "loop position {:?} with {:?} refinement",
                    kind, refinement
                ))),
            }
        }
    }
}

/// Resolve the location a branch-condition frame is evaluated at. A
/// frame with an `origin` was encountered inside a callee's
/// specification; it is materialised at the call site, on the side of
/// the call its context dictates.
fn resolve_frame_location(
    verifier: &vpr::Program,
    index: &Index<'_>,
    frame: &vpr::BranchCond,
) -> Result<Location, WeaverError> {
    let node = frame.origin.unwrap_or(frame.at);
    let indexed = *index
        .nodes
        .get(&node)
        .ok_or(WeaverError::UnknownNode { node })?;

    match indexed {
        Indexed::MethodPre => Ok(Location::MethodPre),
        Indexed::MethodPost => Ok(Location::MethodPost),
        Indexed::AtOp(op_id) => {
            let op = index.ops[&op_id];
            match &op.kind {
                // Loop-head conditions are refreshed at every
                // iteration boundary; the injector seeds them before
                // the loop as well.
                OpKind::While { .. } => Ok(Location::LoopStart(op_id)),
                OpKind::Invoke { method: callee, .. } if frame.origin.is_some() => {
                    if context_in_callee_post(verifier, callee, frame.at)? {
                        Ok(Location::Post(op_id))
                    } else {
                        Ok(Location::Pre(op_id))
                    }
                }
                _ => Ok(Location::Pre(op_id)),
            }
        }
    }
}

fn context_in_callee_post(
    verifier: &vpr::Program,
    callee: &str,
    node: vpr::NodeId,
) -> Result<bool, WeaverError> {
    let vmethod = verifier
        .method_named(callee)
        .ok_or_else(|| WeaverError::undefined("verifier method", callee))?;
    Ok(vmethod.post_contains(node))
}

/// A permission named by a specification.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Field(FieldRef),
    Predicate(PredicateRef),
}

/// A permission enumerated by a specification walk, with the path
/// condition under which the specification grants it.
#[derive(Clone, Debug, PartialEq)]
pub struct EnumeratedPermission {
    pub perm: Permission,
    pub cond: Option<CheckExpr>,
}

/// Enumerate every accessibility assertion in the precise part of a
/// specification, substituting `subst` for free variables, replacing
/// result references with `result`, and splitting conditionals under
/// conjoined path conditions.
pub fn spec_permissions(
    spec: &ir::Expression,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
) -> Result<Vec<EnumeratedPermission>, WeaverError> {
    let mut out = Vec::new();
    walk_spec(spec, None, subst, result, &mut out)?;
    Ok(out)
}

/// Phase D: find the specification a location originates from and
/// enumerate every accessibility assertion of its precise part, with
/// actual arguments substituted for formal parameters and conditional
/// branches split under their path conditions.
fn enumerate_permissions(
    program: &ir::Program,
    index: &Index<'_>,
    location: Location,
) -> Result<Vec<EnumeratedPermission>, WeaverError> {
    let method = index.method;
    let (spec, subst, result) = match location {
        Location::MethodPre => (method.precondition.as_ref(), HashMap::new(), None),
        Location::MethodPost => (
            method.postcondition.as_ref(),
            HashMap::new(),
            Some(CheckExpr::Result),
        ),
        Location::Pre(op_id)
        | Location::Post(op_id)
        | Location::LoopStart(op_id)
        | Location::LoopEnd(op_id) => {
            let op = index.ops[&op_id];
            match &op.kind {
                OpKind::Invoke {
                    method: callee_name,
                    args,
                    target,
                } => {
                    let callee = program
                        .method_named(callee_name)
                        .ok_or_else(|| WeaverError::undefined("method", callee_name))?;
                    let subst = bind_formals(&callee.params, args, callee_name, &method.name)?;
                    let result = match target {
                        Some(t) => Some(CheckExpr::from_ir(t)?),
                        None => None,
                    };
                    let spec = if matches!(location, Location::Pre(_)) {
                        callee.precondition.as_ref()
                    } else {
                        callee.postcondition.as_ref()
                    };
                    (spec, subst, result)
                }
                OpKind::While { invariant, .. } => (invariant.as_ref(), HashMap::new(), None),
                OpKind::Assert { value, .. } => (Some(value), HashMap::new(), None),
                OpKind::Fold { predicate, args } | OpKind::Unfold { predicate, args } => {
                    let pred = program
                        .predicate_named(predicate)
                        .ok_or_else(|| WeaverError::undefined("predicate", predicate))?;
                    let subst = bind_formals(&pred.params, args, predicate, &method.name)?;
                    (Some(&pred.body), subst, None)
                }
                other => {
                    return Err(WeaverError::InvalidSpecification(format!(
                        "no specification governs a permission walk at a {} operation",
                        other.kind_name()
                    )));
                }
            }
        }
    };

    match spec {
        Some(spec) => spec_permissions(spec, &subst, result.as_ref()),
        None => Ok(Vec::new()),
    }
}

fn bind_formals(
    params: &[ir::Parameter],
    args: &[ir::Expression],
    callee: &str,
    caller: &str,
) -> Result<HashMap<String, CheckExpr>, WeaverError> {
    let mut map = HashMap::new();
    for (i, param) in params.iter().enumerate() {
        let arg = args.get(i).ok_or_else(|| WeaverError::UnknownVariable {
            name: format!("{}.{}", callee, param.name),
            method: caller.to_string(),
        })?;
        map.insert(param.name.clone(), CheckExpr::from_ir(arg)?);
    }
    Ok(map)
}

fn walk_spec(
    spec: &ir::Expression,
    cond: Option<CheckExpr>,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
    out: &mut Vec<EnumeratedPermission>,
) -> Result<(), WeaverError> {
    match spec {
        ir::Expression::Binary {
            op: ir::BinaryOp::And,
            left,
            right,
        } => {
            walk_spec(left, cond.clone(), subst, result, out)?;
            walk_spec(right, cond, subst, result, out)
        }
        // Only the precise part of an imprecise formula is walked.
        ir::Expression::Imprecise(inner) => match inner {
            Some(inner) => walk_spec(inner, cond, subst, result, out),
            None => Ok(()),
        },
        ir::Expression::Accessibility(member) => {
            let lowered = lower_member(member, subst, result)?;
            out.push(EnumeratedPermission {
                perm: Permission::Field(lowered),
                cond,
            });
            Ok(())
        }
        ir::Expression::PredicateInstance { name, args } => {
            let args = args
                .iter()
                .map(|a| CheckExpr::from_ir(a).map(|e| apply_result(e.substitute(subst), result)))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(EnumeratedPermission {
                perm: Permission::Predicate(PredicateRef {
                    name: name.clone(),
                    args,
                }),
                cond,
            });
            Ok(())
        }
        ir::Expression::Conditional { cond: c, then, els } => {
            let guard = apply_result(CheckExpr::from_ir(c)?.substitute(subst), result);
            let then_cond = conjoin(cond.clone(), guard.clone());
            let else_cond = conjoin(cond, CheckExpr::not(guard));
            walk_spec(then, then_cond, subst, result, out)?;
            walk_spec(els, else_cond, subst, result, out)
        }
        // Value conjuncts carry no permissions.
        _ => Ok(()),
    }
}

fn lower_member(
    member: &ir::Expression,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
) -> Result<FieldRef, WeaverError> {
    match apply_result(CheckExpr::from_ir(member)?.substitute(subst), result) {
        CheckExpr::Field {
            root,
            struct_name,
            field,
        } => Ok(FieldRef {
            root: *root,
            struct_name,
            field,
        }),
        other => Err(WeaverError::InvalidSpecification(format!(
            "accessibility of '{}' is not a trackable field",
            other
        ))),
    }
}

fn apply_result(expr: CheckExpr, result: Option<&CheckExpr>) -> CheckExpr {
    match result {
        Some(replacement) => expr.replace_result(replacement),
        None => expr,
    }
}

fn conjoin(cond: Option<CheckExpr>, guard: CheckExpr) -> Option<CheckExpr> {
    Some(match cond {
        Some(c) => CheckExpr::and(c, guard),
        None => guard,
    })
}

fn enumerate_sites(
    ops: &[ir::Op],
    returns: &mut Vec<OpId>,
    invokes: &mut Vec<InvokeSite>,
    allocations: &mut Vec<AllocationSite>,
) {
    for op in ops {
        match &op.kind {
            OpKind::Return { .. } => returns.push(op.id),
            OpKind::Invoke { method, .. } => invokes.push(InvokeSite {
                op: op.id,
                callee: method.clone(),
            }),
            OpKind::AllocStruct {
                target,
                struct_name,
            } => allocations.push(AllocationSite {
                op: op.id,
                target: target.clone(),
                struct_name: Some(struct_name.clone()),
            }),
            OpKind::AllocValue { target, .. } => allocations.push(AllocationSite {
                op: op.id,
                target: target.clone(),
                struct_name: None,
            }),
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                enumerate_sites(then_branch, returns, invokes, allocations);
                enumerate_sites(else_branch, returns, invokes, allocations);
            }
            OpKind::While { body, .. } => enumerate_sites(body, returns, invokes, allocations),
            _ => {}
        }
    }
}

/// Phase G: whether execution can fall off the end of a block.
pub fn block_falls_through(ops: &[ir::Op]) -> bool {
    match ops.last() {
        None => true,
        Some(op) => match &op.kind {
            OpKind::Return { .. } => false,
            OpKind::While { cond, .. } => !matches!(cond, ir::Expression::BoolLit(true)),
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => block_falls_through(then_branch) || block_falls_through(else_branch),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expression, Method, Op, Type};

    fn ret(value: Option<Expression>) -> Op {
        Op::new(OpKind::Return { value })
    }

    #[test]
    fn empty_body_falls_through() {
        assert!(block_falls_through(&[]));
    }

    #[test]
    fn trailing_return_does_not_fall_through() {
        assert!(!block_falls_through(&[ret(Some(Expression::IntLit(0)))]));
    }

    #[test]
    fn infinite_loop_does_not_fall_through() {
        let body = vec![Op::new(OpKind::While {
            cond: Expression::BoolLit(true),
            invariant: None,
            body: vec![],
        })];
        assert!(!block_falls_through(&body));
    }

    #[test]
    fn bounded_loop_falls_through() {
        let body = vec![Op::new(OpKind::While {
            cond: Expression::Var("running".into()),
            invariant: None,
            body: vec![],
        })];
        assert!(block_falls_through(&body));
    }

    #[test]
    fn if_falls_through_unless_both_branches_return() {
        let both = vec![Op::new(OpKind::If {
            cond: Expression::Var("b".into()),
            then_branch: vec![ret(None)],
            else_branch: vec![ret(None)],
        })];
        assert!(!block_falls_through(&both));

        let one = vec![Op::new(OpKind::If {
            cond: Expression::Var("b".into()),
            then_branch: vec![ret(None)],
            else_branch: vec![],
        })];
        assert!(block_falls_through(&one));
    }

    #[test]
    fn call_style_classification() {
        let mut m = Method {
            name: "helper".into(),
            returns: None,
            params: vec![],
            precondition: None,
            postcondition: None,
            variables: vec![],
            body: vec![],
        };
        assert_eq!(CallStyle::of(&m), CallStyle::Precise);

        m.postcondition = Some(Expression::Imprecise(None));
        assert_eq!(CallStyle::of(&m), CallStyle::PrecisePre);

        m.precondition = Some(Expression::Imprecise(None));
        assert_eq!(CallStyle::of(&m), CallStyle::Imprecise);

        m.name = "main".into();
        assert_eq!(CallStyle::of(&m), CallStyle::Main);
    }

    #[test]
    fn spec_walk_splits_conditionals() {
        let acc = |name: &str, field: &str| {
            Expression::Accessibility(Box::new(Expression::Field {
                root: Box::new(Expression::Var(name.into())),
                struct_name: "node".into(),
                field: field.into(),
            }))
        };
        let spec = Expression::Conditional {
            cond: Box::new(Expression::Var("b".into())),
            then: Box::new(acc("x", "value")),
            els: Box::new(acc("y", "value")),
        };
        let out = spec_permissions(&spec, &HashMap::new(), None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].cond, Some(CheckExpr::Var("b".into())));
        assert_eq!(out[1].cond, Some(CheckExpr::not(CheckExpr::Var("b".into()))));
    }

    #[test]
    fn spec_walk_skips_imprecise_marker() {
        let acc = Expression::Accessibility(Box::new(Expression::Field {
            root: Box::new(Expression::Var("x".into())),
            struct_name: "node".into(),
            field: "value".into(),
        }));
        let spec = Expression::Imprecise(Some(Box::new(Expression::and(
            acc,
            Expression::BoolLit(true),
        ))));
        let out = spec_permissions(&spec, &HashMap::new(), None).unwrap();
        assert_eq!(out.len(), 1);

        let none = spec_permissions(&Expression::Imprecise(None), &HashMap::new(), None).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn formal_binding_rejects_arity_mismatch() {
        let params = vec![ir::Parameter {
            name: "x".into(),
            ty: Type::Int,
        }];
        let err = bind_formals(&params, &[], "callee", "caller").unwrap_err();
        assert!(matches!(err, WeaverError::UnknownVariable { .. }));
    }
}
