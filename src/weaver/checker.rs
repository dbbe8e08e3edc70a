//! The injector: lowers the collector's output into executable IR.
//!
//! For each collected method this pass materialises condition
//! variables, emits guarded runtime checks, and threads the two
//! permission objects and the instance counter through method
//! signatures, call sites, allocations and returns.

use std::collections::{HashMap, HashSet};

use crate::error::WeaverError;
use crate::ir::{
    self, AssertKind, Expression, Method, Op, OpId, OpKind, Parameter, Type, ID_FIELD,
};
use crate::logic::Disjunction;

use super::collector::{spec_permissions, EnumeratedPermission, Permission};
use super::expr::{Check, CheckExpr, FieldRef, PredicateRef};
use super::runtime;
use super::{CallStyle, CollectedMethod, CollectedProgram, Condition, Location, RuntimeCheck};

/// Name of the dynamic permission object in woven code.
pub const DYNAMIC_FIELDS: &str = "_dynamic_fields";
/// Name of the static permission object in woven code.
pub const STATIC_FIELDS: &str = "_static_fields";
/// Name of the instance counter cell.
pub const INSTANCE_COUNTER: &str = "_instance_counter";
/// Name of the per-method result temporary.
pub const RESULT_VAR: &str = "_result";

fn cond_var(id: u32) -> String {
    format!("_cond_{}", id)
}

/// Inject runtime enforcement into `program` according to `collected`.
pub fn inject(program: &mut ir::Program, collected: &CollectedProgram) -> Result<(), WeaverError> {
    let info = ProgramInfo::build(program, collected)?;

    if info.tracking {
        for s in &mut program.structs {
            s.add_id_field();
        }
    }

    for cm in &collected.methods {
        let idx = program
            .methods
            .iter()
            .position(|m| m.name == cm.name)
            .ok_or_else(|| WeaverError::undefined("method", &cm.name))?;
        let plan = MethodWeaver::build(&info, cm, &program.methods[idx])?;
        plan.apply(&mut program.methods[idx]);
    }
    Ok(())
}

/// Per-struct layout snapshot taken before mutation. `n_fields` counts
/// the declared (trackable) fields; the synthetic id is not a tracked
/// permission.
struct StructLayout {
    n_fields: usize,
    indices: HashMap<String, usize>,
}

/// Program-wide facts the per-method weaving needs.
struct ProgramInfo {
    tracking: bool,
    styles: HashMap<String, CallStyle>,
    /// Methods that carry permission objects in scope: those that
    /// receive them, and `Main`/`Precise` methods that have access
    /// checks of their own or call a permission-receiving method.
    frames: HashMap<String, bool>,
    /// Enumerated precondition permissions, in formal terms.
    pre_perms: HashMap<String, Vec<EnumeratedPermission>>,
    /// Enumerated postcondition permissions, in formal terms.
    post_perms: HashMap<String, Vec<EnumeratedPermission>>,
    /// Formal parameter names per method, pre-weaving.
    params: HashMap<String, Vec<String>>,
    /// Whether the method's postcondition is precise.
    precise_post: HashMap<String, bool>,
    structs: HashMap<String, StructLayout>,
}

impl ProgramInfo {
    fn build(program: &ir::Program, collected: &CollectedProgram) -> Result<Self, WeaverError> {
        let tracking = collected.requires_tracking();

        let mut styles = HashMap::new();
        for cm in &collected.methods {
            styles.insert(cm.name.clone(), cm.call_style);
        }

        let mut frames = HashMap::new();
        for cm in &collected.methods {
            let mut frame = cm.call_style.receives_permissions() || cm.has_access_checks();
            if !frame {
                for site in &cm.invokes {
                    let style = styles
                        .get(&site.callee)
                        .ok_or_else(|| WeaverError::undefined("method", &site.callee))?;
                    if style.receives_permissions() {
                        frame = true;
                        break;
                    }
                }
            }
            frames.insert(cm.name.clone(), frame);
        }

        let mut pre_perms = HashMap::new();
        let mut post_perms = HashMap::new();
        let mut precise_post = HashMap::new();
        if tracking {
            let empty = HashMap::new();
            for method in &program.methods {
                let style = styles[&method.name];
                if frames[&method.name] {
                    pre_perms.insert(
                        method.name.clone(),
                        clause_permissions(method.precondition.as_ref(), &empty)?,
                    );
                }
                if style == CallStyle::Imprecise {
                    post_perms.insert(
                        method.name.clone(),
                        clause_permissions(method.postcondition.as_ref(), &empty)?,
                    );
                }
                precise_post.insert(
                    method.name.clone(),
                    !ir::spec_is_imprecise(method.postcondition.as_ref()),
                );
            }
        }

        let mut params = HashMap::new();
        for method in &program.methods {
            params.insert(
                method.name.clone(),
                method.params.iter().map(|p| p.name.clone()).collect(),
            );
        }

        let mut structs = HashMap::new();
        for s in &program.structs {
            let declared: Vec<&ir::StructField> =
                s.fields.iter().filter(|f| f.name != ID_FIELD).collect();
            let indices = declared
                .iter()
                .enumerate()
                .map(|(i, f)| (f.name.clone(), i))
                .collect();
            structs.insert(
                s.name.clone(),
                StructLayout {
                    n_fields: declared.len(),
                    indices,
                },
            );
        }

        Ok(ProgramInfo {
            tracking,
            styles,
            frames,
            pre_perms,
            post_perms,
            params,
            precise_post,
            structs,
        })
    }

    fn layout(&self, struct_name: &str) -> Result<&StructLayout, WeaverError> {
        self.structs
            .get(struct_name)
            .ok_or_else(|| WeaverError::undefined("struct", struct_name))
    }

    fn field_index(&self, field: &FieldRef) -> Result<usize, WeaverError> {
        self.layout(&field.struct_name)?
            .indices
            .get(&field.field)
            .copied()
            .ok_or_else(|| {
                WeaverError::undefined("struct field", format!("{}.{}", field.struct_name, field.field))
            })
    }
}

fn clause_permissions(
    clause: Option<&Expression>,
    subst: &HashMap<String, CheckExpr>,
) -> Result<Vec<EnumeratedPermission>, WeaverError> {
    match clause {
        Some(spec) => match spec.precise_part() {
            Some(precise) => spec_permissions(precise, subst, None),
            None => Ok(Vec::new()),
        },
        None => Ok(Vec::new()),
    }
}

/// All the code to be spliced into one method, keyed by insertion
/// point. Built against the unmodified method, then applied in a
/// single rewrite of the body.
struct MethodWeaver<'a> {
    info: &'a ProgramInfo,
    cm: &'a CollectedMethod,
    result_var: Option<String>,
    entry: Vec<Op>,
    exit: Vec<Op>,
    before: HashMap<OpId, Vec<Op>>,
    after_setup: HashMap<OpId, Vec<Op>>,
    after_checks: HashMap<OpId, Vec<Op>>,
    loop_start: HashMap<OpId, Vec<Op>>,
    loop_end: HashMap<OpId, Vec<Op>>,
    /// Loop-head condition refreshes, appended after the loop-end
    /// checks so every iteration boundary re-evaluates them.
    loop_refresh: HashMap<OpId, Vec<Op>>,
    appended_args: HashMap<OpId, Vec<Expression>>,
    new_params: Vec<Parameter>,
    new_vars: Vec<(String, Type)>,
}

impl<'a> MethodWeaver<'a> {
    fn build(
        info: &'a ProgramInfo,
        cm: &'a CollectedMethod,
        method: &Method,
    ) -> Result<MethodWeaver<'a>, WeaverError> {
        let needs_result = method.returns.is_some()
            && (method_post_used(cm) || checks_mention_result(cm));
        let mut weaver = MethodWeaver {
            info,
            cm,
            result_var: needs_result.then(|| RESULT_VAR.to_string()),
            entry: Vec::new(),
            exit: Vec::new(),
            before: HashMap::new(),
            after_setup: HashMap::new(),
            after_checks: HashMap::new(),
            loop_start: HashMap::new(),
            loop_end: HashMap::new(),
            loop_refresh: HashMap::new(),
            appended_args: HashMap::new(),
            new_params: Vec::new(),
            new_vars: Vec::new(),
        };
        if let (Some(name), Some(ty)) = (&weaver.result_var, &method.returns) {
            weaver.new_vars.push((name.clone(), ty.clone()));
        }

        weaver.build_signature_and_entry()?;
        weaver.materialise_conditions()?;
        weaver.emit_checks()?;
        weaver.thread_call_sites(method)?;
        weaver.thread_allocations()?;
        weaver.build_exit_joins();
        Ok(weaver)
    }

    fn frame(&self) -> bool {
        self.info.frames.get(&self.cm.name).copied().unwrap_or(false)
    }

    fn counter(&self) -> Expression {
        Expression::Var(INSTANCE_COUNTER.to_string())
    }

    fn dynamic(&self) -> Expression {
        Expression::Var(DYNAMIC_FIELDS.to_string())
    }

    fn static_fields(&self) -> Expression {
        Expression::Var(STATIC_FIELDS.to_string())
    }

    /// Calling convention and entry setup for this method's style.
    fn build_signature_and_entry(&mut self) -> Result<(), WeaverError> {
        let style = self.cm.call_style;

        if style == CallStyle::Main {
            // The entry point always establishes the id-minting
            // infrastructure, checks or not.
            self.new_vars
                .push((INSTANCE_COUNTER.to_string(), runtime::counter_type()));
            self.entry.push(Op::new(OpKind::AllocValue {
                target: INSTANCE_COUNTER.to_string(),
                ty: Type::Int,
            }));
            self.entry.push(Op::new(OpKind::AssignMember {
                member: Expression::Deref(Box::new(self.counter())),
                value: Expression::IntLit(0),
            }));
        }

        if !self.info.tracking {
            return Ok(());
        }

        match style {
            CallStyle::Main => {}
            CallStyle::Precise => {
                self.new_params.push(Parameter {
                    name: INSTANCE_COUNTER.to_string(),
                    ty: runtime::counter_type(),
                });
            }
            CallStyle::PrecisePre => {
                self.new_params.push(Parameter {
                    name: DYNAMIC_FIELDS.to_string(),
                    ty: runtime::owned_fields_type(),
                });
                self.new_params.push(Parameter {
                    name: INSTANCE_COUNTER.to_string(),
                    ty: runtime::counter_type(),
                });
            }
            CallStyle::Imprecise => {
                self.new_params.push(Parameter {
                    name: DYNAMIC_FIELDS.to_string(),
                    ty: runtime::owned_fields_type(),
                });
                self.new_params.push(Parameter {
                    name: STATIC_FIELDS.to_string(),
                    ty: runtime::owned_fields_type(),
                });
                self.new_params.push(Parameter {
                    name: INSTANCE_COUNTER.to_string(),
                    ty: runtime::counter_type(),
                });
            }
        }

        if !self.frame() {
            return Ok(());
        }

        match style {
            CallStyle::Main | CallStyle::Precise => {
                // A locally-tracking precise frame owns both halves;
                // its dynamic half starts from its own precondition.
                self.alloc_owned(DYNAMIC_FIELDS);
                self.alloc_owned(STATIC_FIELDS);
                let perms = self.info.pre_perms[&self.cm.name].clone();
                let ops = self.populate(self.dynamic(), &perms, &HashMap::new(), None)?;
                self.entry.extend(ops);
            }
            CallStyle::PrecisePre => {
                // The static half is rebuilt locally from the precise
                // precondition; the dynamic half arrives from the
                // caller.
                self.alloc_owned(STATIC_FIELDS);
                let perms = self.info.pre_perms[&self.cm.name].clone();
                let ops = self.populate(self.static_fields(), &perms, &HashMap::new(), None)?;
                self.entry.extend(ops);
            }
            CallStyle::Imprecise => {}
        }
        Ok(())
    }

    fn alloc_owned(&mut self, name: &str) {
        self.new_vars
            .push((name.to_string(), runtime::owned_fields_type()));
        self.entry.push(Op::new(OpKind::AllocStruct {
            target: name.to_string(),
            struct_name: runtime::OWNED_FIELDS_STRUCT.to_string(),
        }));
        self.entry.push(runtime::call(
            runtime::INIT_FIELDS,
            vec![Expression::Var(name.to_string()), self.counter()],
        ));
    }

    /// Step 1: materialise condition variables in id order.
    fn materialise_conditions(&mut self) -> Result<(), WeaverError> {
        for term in &self.cm.conditions {
            let name = cond_var(term.id);
            self.new_vars.push((name.clone(), Type::Bool));
            let value = term.value.to_ir(self.result_var.as_deref())?;
            let assigned = match &term.when {
                Some(when) => Expression::Conditional {
                    cond: Box::new(self.disjunction_to_expr(when)),
                    then: Box::new(value),
                    els: Box::new(Expression::BoolLit(false)),
                },
                None => value,
            };
            let assign = Op::new(OpKind::Assign {
                target: name,
                value: assigned,
            });
            match term.location {
                Location::Pre(op) => self.before.entry(op).or_default().push(assign),
                Location::Post(op) => self.after_checks.entry(op).or_default().push(assign),
                Location::LoopStart(op) => {
                    // Seed before the loop, refresh at every iteration
                    // boundary; both in-body and after-loop readers see
                    // the latest loop-head evaluation.
                    self.before.entry(op).or_default().push(assign.clone());
                    self.loop_refresh.entry(op).or_default().push(assign);
                }
                Location::LoopEnd(op) => self.loop_end.entry(op).or_default().push(assign),
                Location::MethodPre => self.entry.push(assign),
                Location::MethodPost => self.exit.push(assign),
            }
        }
        Ok(())
    }

    fn disjunction_to_expr(&self, d: &Disjunction) -> Expression {
        let mut disj: Option<Expression> = None;
        for conjunction in d.conjunctions() {
            let mut conj: Option<Expression> = None;
            for term in conjunction.terms() {
                let var = Expression::Var(cond_var(term.id));
                let lit = if term.positive {
                    var
                } else {
                    Expression::not(var)
                };
                conj = Some(match conj {
                    Some(acc) => Expression::and(acc, lit),
                    None => lit,
                });
            }
            let conj = conj.unwrap_or(Expression::BoolLit(true));
            disj = Some(match disj {
                Some(acc) => Expression::Binary {
                    op: ir::BinaryOp::Or,
                    left: Box::new(acc),
                    right: Box::new(conj),
                },
                None => conj,
            });
        }
        disj.unwrap_or(Expression::BoolLit(false))
    }

    /// Step 2: every runtime check becomes `if (when) { <assertion> }`
    /// at its location. Separation checks at an imprecise call site
    /// are deferred into the call prologue, where the fresh static
    /// half is in scope.
    fn emit_checks(&mut self) -> Result<(), WeaverError> {
        let imprecise_calls: HashSet<OpId> = self
            .cm
            .invokes
            .iter()
            .filter(|site| self.info.styles.get(&site.callee) == Some(&CallStyle::Imprecise))
            .map(|site| site.op)
            .collect();

        for rc in &self.cm.checks {
            let deferred = matches!(rc.location, Location::Pre(op) if imprecise_calls.contains(&op))
                && matches!(rc.check, Check::FieldSeparation(_) | Check::PredicateSeparation(_));
            if deferred {
                continue;
            }
            let op = self.check_to_op(rc)?;
            match rc.location {
                Location::Pre(id) => self.before.entry(id).or_default().push(op),
                Location::Post(id) => self.after_checks.entry(id).or_default().push(op),
                Location::LoopStart(id) => self.loop_start.entry(id).or_default().push(op),
                Location::LoopEnd(id) => self.loop_end.entry(id).or_default().push(op),
                Location::MethodPre => self.entry.push(op),
                Location::MethodPost => self.exit.push(op),
            }
        }
        Ok(())
    }

    fn check_to_op(&self, rc: &RuntimeCheck) -> Result<Op, WeaverError> {
        let result_var = self.result_var.as_deref();
        let inner = match &rc.check {
            Check::Expr(e) => Op::new(OpKind::Assert {
                value: e.to_ir(result_var)?,
                kind: AssertKind::Imperative,
            }),
            Check::FieldAccessibility(field) => runtime::call(
                runtime::ASSERT_ACC,
                vec![
                    self.dynamic(),
                    self.object_id(field)?,
                    Expression::IntLit(self.info.field_index(field)? as i64),
                ],
            ),
            Check::FieldSeparation(field) => runtime::call(
                runtime::ASSERT_DISJOINT_ACC,
                vec![
                    self.static_fields(),
                    self.dynamic(),
                    self.object_id(field)?,
                    Expression::IntLit(self.info.field_index(field)? as i64),
                ],
            ),
            Check::PredicateAccessibility(pred) => {
                let mut args = vec![self.dynamic()];
                args.extend(self.predicate_args(pred)?);
                runtime::call(runtime::predicate_assert(&pred.name), args)
            }
            Check::PredicateSeparation(pred) => {
                let mut args = vec![self.static_fields(), self.dynamic()];
                args.extend(self.predicate_args(pred)?);
                runtime::call(runtime::predicate_assert_disjoint(&pred.name), args)
            }
        };

        Ok(match &rc.when {
            None => inner,
            Some(Condition::Trace(d)) => guard(self.disjunction_to_expr(d), inner),
            Some(Condition::Immediate(e)) => guard(e.to_ir(result_var)?, inner),
        })
    }

    fn object_id(&self, field: &FieldRef) -> Result<Expression, WeaverError> {
        Ok(Expression::Field {
            root: Box::new(field.root.to_ir(self.result_var.as_deref())?),
            struct_name: field.struct_name.clone(),
            field: ID_FIELD.to_string(),
        })
    }

    fn predicate_args(&self, pred: &PredicateRef) -> Result<Vec<Expression>, WeaverError> {
        pred.args
            .iter()
            .map(|a| a.to_ir(self.result_var.as_deref()))
            .collect()
    }

    /// Step 3 (call sites): append convention arguments and, for
    /// imprecise callees, build the permission transfer around the
    /// call.
    fn thread_call_sites(&mut self, method: &Method) -> Result<(), WeaverError> {
        if !self.info.tracking {
            return Ok(());
        }

        // Separation checks deferred into prologues, grouped by site.
        let mut deferred: HashMap<OpId, Vec<RuntimeCheck>> = HashMap::new();
        for rc in &self.cm.checks {
            if let Location::Pre(op) = rc.location {
                if matches!(
                    rc.check,
                    Check::FieldSeparation(_) | Check::PredicateSeparation(_)
                ) {
                    deferred.entry(op).or_default().push(rc.clone());
                }
            }
        }

        let sites = self.cm.invokes.clone();
        for (site_index, site) in sites.iter().enumerate() {
            let style = *self
                .info
                .styles
                .get(&site.callee)
                .ok_or_else(|| WeaverError::undefined("method", &site.callee))?;
            match style {
                CallStyle::Main => {
                    return Err(WeaverError::InvalidSpecification(format!(
                        "method '{}' invokes the entry point", method.name
                    )));
                }
                CallStyle::Precise => {
                    let counter = self.counter();
                    self.appended_args.entry(site.op).or_default().push(counter);
                }
                CallStyle::PrecisePre => {
                    let args = self.appended_args.entry(site.op).or_default();
                    args.push(Expression::Var(DYNAMIC_FIELDS.to_string()));
                    args.push(Expression::Var(INSTANCE_COUNTER.to_string()));
                }
                CallStyle::Imprecise => {
                    let seps = deferred.remove(&site.op).unwrap_or_default();
                    self.imprecise_call(method, site.op, &site.callee, site_index, seps)?;
                }
            }
        }

        // Any remaining deferred separation checks belong to
        // non-imprecise locations and were emitted in place already.
        Ok(())
    }

    /// The §-style prologue/epilogue around a call into an imprecise
    /// callee: save the static pointer, carve the callee's static out
    /// of the dynamic pool, and reverse the transfer after the call.
    fn imprecise_call(
        &mut self,
        method: &Method,
        op: OpId,
        callee: &str,
        site_index: usize,
        separations: Vec<RuntimeCheck>,
    ) -> Result<(), WeaverError> {
        let (args, target) = invoke_parts(method, op).ok_or_else(|| {
            WeaverError::undefined("call site", format!("{}@{}", callee, op))
        })?;
        let formals = self
            .info
            .params
            .get(callee)
            .ok_or_else(|| WeaverError::undefined("method", callee))?;
        let subst = bind_actuals(formals, &args, callee, &method.name)?;

        let saved = format!("_saved_static_{}", site_index);
        self.new_vars
            .push((saved.clone(), runtime::owned_fields_type()));

        let mut pro = Vec::new();
        pro.push(Op::new(OpKind::Assign {
            target: saved.clone(),
            value: self.static_fields(),
        }));
        pro.push(Op::new(OpKind::AllocStruct {
            target: STATIC_FIELDS.to_string(),
            struct_name: runtime::OWNED_FIELDS_STRUCT.to_string(),
        }));
        pro.push(runtime::call(
            runtime::INIT_FIELDS,
            vec![self.static_fields(), self.counter()],
        ));
        let pre_perms = self.info.pre_perms[callee].clone();
        pro.extend(self.populate(self.static_fields(), &pre_perms, &subst, None)?);

        // Separation is checked while both halves are populated,
        // before the transfer empties the overlap out of the dynamic.
        for rc in &separations {
            pro.push(self.check_to_op(rc)?);
        }

        pro.push(runtime::call(
            runtime::JOIN,
            vec![self.dynamic(), Expression::Var(saved.clone())],
        ));
        pro.push(runtime::call(
            runtime::DISJOIN,
            vec![self.dynamic(), self.static_fields()],
        ));
        self.before.entry(op).or_default().extend(pro);

        let call_args = self.appended_args.entry(op).or_default();
        call_args.push(Expression::Var(DYNAMIC_FIELDS.to_string()));
        call_args.push(Expression::Var(STATIC_FIELDS.to_string()));
        call_args.push(Expression::Var(INSTANCE_COUNTER.to_string()));

        // Epilogue: rebuild the static from the callee's postcondition,
        // fold it back into the dynamic pool, then restore this frame's
        // own static and re-carve it.
        let mut epi = Vec::new();
        epi.push(Op::new(OpKind::AllocStruct {
            target: STATIC_FIELDS.to_string(),
            struct_name: runtime::OWNED_FIELDS_STRUCT.to_string(),
        }));
        epi.push(runtime::call(
            runtime::INIT_FIELDS,
            vec![self.static_fields(), self.counter()],
        ));
        let post_perms = self.info.post_perms[callee].clone();
        let result = match &target {
            Some(t) => Some(CheckExpr::from_ir(t)?),
            None => None,
        };
        if result.is_none() && mentions_result(&post_perms) {
            return Err(WeaverError::InvalidSpecification(format!(
                "postcondition of '{}' grants a result permission, but the call has no target",
                callee
            )));
        }
        epi.extend(self.populate(self.static_fields(), &post_perms, &subst, result.as_ref())?);
        epi.push(runtime::call(
            runtime::JOIN,
            vec![self.dynamic(), self.static_fields()],
        ));
        epi.push(Op::new(OpKind::Assign {
            target: STATIC_FIELDS.to_string(),
            value: Expression::Var(saved),
        }));
        epi.push(runtime::call(
            runtime::DISJOIN,
            vec![self.dynamic(), self.static_fields()],
        ));
        self.after_setup.entry(op).or_default().extend(epi);
        Ok(())
    }

    /// Emit `add` calls registering every enumerated permission with
    /// `fields`, honouring conditional grants.
    fn populate(
        &self,
        fields: Expression,
        perms: &[EnumeratedPermission],
        subst: &HashMap<String, CheckExpr>,
        result: Option<&CheckExpr>,
    ) -> Result<Vec<Op>, WeaverError> {
        let mut ops = Vec::new();
        for ep in perms {
            let op = match &ep.perm {
                Permission::Field(field) => {
                    let field = resolve_field(field, subst, result);
                    let layout = self.info.layout(&field.struct_name)?;
                    runtime::call(
                        runtime::ADD_FIELD_ACCESS,
                        vec![
                            fields.clone(),
                            self.object_id(&field)?,
                            Expression::IntLit(layout.n_fields as i64),
                            Expression::IntLit(self.info.field_index(&field)? as i64),
                        ],
                    )
                }
                Permission::Predicate(pred) => {
                    let pred = resolve_predicate(pred, subst, result);
                    let mut args = vec![fields.clone()];
                    args.extend(self.predicate_args(&pred)?);
                    runtime::call(runtime::predicate_add(&pred.name), args)
                }
            };
            let op = match &ep.cond {
                Some(cond) => {
                    let cond = apply(cond, subst, result).to_ir(self.result_var.as_deref())?;
                    guard(cond, op)
                }
                None => op,
            };
            ops.push(op);
        }
        Ok(ops)
    }

    /// Step 4: allocation bookkeeping.
    fn thread_allocations(&mut self) -> Result<(), WeaverError> {
        if !self.info.tracking {
            return Ok(());
        }
        let frame = self.frame();
        for site in &self.cm.allocations {
            let Some(struct_name) = &site.struct_name else {
                // Bare value cells carry no tracked fields.
                continue;
            };
            let id_member = Expression::Field {
                root: Box::new(Expression::Var(site.target.clone())),
                struct_name: struct_name.clone(),
                field: ID_FIELD.to_string(),
            };
            let ops = if frame {
                let layout = self.info.layout(struct_name)?;
                vec![runtime::call_into(
                    runtime::ADD_STRUCT_ACCESS,
                    vec![self.dynamic(), Expression::IntLit(layout.n_fields as i64)],
                    id_member,
                )]
            } else {
                vec![
                    Op::new(OpKind::AssignMember {
                        member: id_member,
                        value: Expression::Deref(Box::new(self.counter())),
                    }),
                    Op::new(OpKind::AssignMember {
                        member: Expression::Deref(Box::new(self.counter())),
                        value: Expression::Binary {
                            op: ir::BinaryOp::Add,
                            left: Box::new(Expression::Deref(Box::new(self.counter()))),
                            right: Box::new(Expression::IntLit(1)),
                        },
                    }),
                ]
            };
            let slot = self.after_setup.entry(site.op).or_default();
            let mut rest = std::mem::take(slot);
            slot.extend(ops);
            slot.append(&mut rest);
        }
        Ok(())
    }

    /// Step 5: permission hand-back on method exit.
    fn build_exit_joins(&mut self) {
        if !self.info.tracking {
            return;
        }
        let style = self.cm.call_style;
        let precise_post = self
            .info
            .precise_post
            .get(&self.cm.name)
            .copied()
            .unwrap_or(true);
        let hand_back = style == CallStyle::PrecisePre
            || (style == CallStyle::Imprecise && precise_post);
        if hand_back {
            self.exit.push(runtime::call(
                runtime::JOIN,
                vec![self.dynamic(), self.static_fields()],
            ));
        }
    }

    /// Splice everything into the method.
    fn apply(mut self, method: &mut Method) {
        for param in std::mem::take(&mut self.new_params) {
            method.params.push(param);
        }
        let body = std::mem::take(&mut method.body);
        let mut new_body = std::mem::take(&mut self.entry);
        new_body.extend(self.rewrite_block(body));
        if self.cm.has_implicit_return && !self.exit.is_empty() {
            new_body.extend(self.exit.iter().cloned());
        }
        method.body = new_body;
        for (name, ty) in std::mem::take(&mut self.new_vars) {
            method.declare(name, ty);
        }
    }

    fn rewrite_block(&self, ops: Vec<Op>) -> Vec<Op> {
        let mut out = Vec::new();
        for mut op in ops {
            if let Some(pre) = self.before.get(&op.id) {
                out.extend(pre.iter().cloned());
            }
            let id = op.id;
            match op.kind {
                OpKind::Return { value } => {
                    if self.exit.is_empty() {
                        out.push(Op {
                            id,
                            kind: OpKind::Return { value },
                        });
                    } else {
                        let value = match (value, &self.result_var) {
                            (Some(v), Some(result)) => {
                                out.push(Op::new(OpKind::Assign {
                                    target: result.clone(),
                                    value: v,
                                }));
                                Some(Expression::Var(result.clone()))
                            }
                            (value, _) => value,
                        };
                        out.extend(self.exit.iter().cloned());
                        out.push(Op {
                            id,
                            kind: OpKind::Return { value },
                        });
                    }
                    continue;
                }
                OpKind::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    op.kind = OpKind::If {
                        cond,
                        then_branch: self.rewrite_block(then_branch),
                        else_branch: self.rewrite_block(else_branch),
                    };
                    out.push(op);
                }
                OpKind::While {
                    cond,
                    invariant,
                    body,
                } => {
                    let mut new_inner = self
                        .loop_start
                        .get(&id)
                        .cloned()
                        .unwrap_or_default();
                    new_inner.extend(self.rewrite_block(body));
                    if let Some(end) = self.loop_end.get(&id) {
                        new_inner.extend(end.iter().cloned());
                    }
                    if let Some(refresh) = self.loop_refresh.get(&id) {
                        new_inner.extend(refresh.iter().cloned());
                    }
                    op.kind = OpKind::While {
                        cond,
                        invariant,
                        body: new_inner,
                    };
                    out.push(op);
                }
                OpKind::Invoke {
                    method: callee,
                    mut args,
                    target,
                } => {
                    if let Some(extra) = self.appended_args.get(&id) {
                        args.extend(extra.iter().cloned());
                    }
                    op.kind = OpKind::Invoke {
                        method: callee,
                        args,
                        target,
                    };
                    out.push(op);
                }
                other => {
                    op.kind = other;
                    out.push(op);
                }
            }
            if let Some(setup) = self.after_setup.get(&id) {
                out.extend(setup.iter().cloned());
            }
            if let Some(checks) = self.after_checks.get(&id) {
                out.extend(checks.iter().cloned());
            }
        }
        out
    }
}

fn guard(cond: Expression, inner: Op) -> Op {
    Op::new(OpKind::If {
        cond,
        then_branch: vec![inner],
        else_branch: vec![],
    })
}

fn method_post_used(cm: &CollectedMethod) -> bool {
    cm.conditions
        .iter()
        .any(|t| t.location == Location::MethodPost)
        || cm.checks.iter().any(|c| c.location == Location::MethodPost)
}

fn checks_mention_result(cm: &CollectedMethod) -> bool {
    fn check_mentions(check: &Check) -> bool {
        match check {
            Check::Expr(e) => e.mentions_result(),
            Check::FieldAccessibility(f) | Check::FieldSeparation(f) => f.root.mentions_result(),
            Check::PredicateAccessibility(p) | Check::PredicateSeparation(p) => {
                p.args.iter().any(CheckExpr::mentions_result)
            }
        }
    }
    cm.checks.iter().any(|c| {
        check_mentions(&c.check)
            || matches!(&c.when, Some(Condition::Immediate(e)) if e.mentions_result())
    }) || cm.conditions.iter().any(|t| t.value.mentions_result())
}

fn mentions_result(perms: &[EnumeratedPermission]) -> bool {
    perms.iter().any(|ep| {
        let in_perm = match &ep.perm {
            Permission::Field(f) => f.root.mentions_result(),
            Permission::Predicate(p) => p.args.iter().any(CheckExpr::mentions_result),
        };
        in_perm || ep.cond.as_ref().is_some_and(CheckExpr::mentions_result)
    })
}

fn resolve_field(
    field: &FieldRef,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
) -> FieldRef {
    let mut out = field.substitute(subst);
    if let Some(result) = result {
        out.root = out.root.replace_result(result);
    }
    out
}

fn resolve_predicate(
    pred: &PredicateRef,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
) -> PredicateRef {
    let mut out = pred.substitute(subst);
    if let Some(result) = result {
        out.args = out.args.iter().map(|a| a.replace_result(result)).collect();
    }
    out
}

fn apply(
    expr: &CheckExpr,
    subst: &HashMap<String, CheckExpr>,
    result: Option<&CheckExpr>,
) -> CheckExpr {
    let out = expr.substitute(subst);
    match result {
        Some(result) => out.replace_result(result),
        None => out,
    }
}

fn bind_actuals(
    params: &[String],
    args: &[Expression],
    callee: &str,
    caller: &str,
) -> Result<HashMap<String, CheckExpr>, WeaverError> {
    let mut map = HashMap::new();
    for (i, param) in params.iter().enumerate() {
        let arg = args.get(i).ok_or_else(|| WeaverError::UnknownVariable {
            name: format!("{}.{}", callee, param),
            method: caller.to_string(),
        })?;
        map.insert(param.clone(), CheckExpr::from_ir(arg)?);
    }
    Ok(map)
}

fn invoke_parts(method: &Method, op: OpId) -> Option<(Vec<Expression>, Option<Expression>)> {
    fn find(ops: &[Op], op: OpId) -> Option<(Vec<Expression>, Option<Expression>)> {
        for candidate in ops {
            if candidate.id == op {
                if let OpKind::Invoke { args, target, .. } = &candidate.kind {
                    return Some((args.clone(), target.clone()));
                }
            }
            match &candidate.kind {
                OpKind::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    if let Some(found) = find(then_branch, op).or_else(|| find(else_branch, op)) {
                        return Some(found);
                    }
                }
                OpKind::While { body, .. } => {
                    if let Some(found) = find(body, op) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
        None
    }
    find(&method.body, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_wraps_in_conditional() {
        let inner = Op::new(OpKind::Assert {
            value: Expression::BoolLit(true),
            kind: AssertKind::Imperative,
        });
        let wrapped = guard(Expression::Var("_cond_0".into()), inner);
        match wrapped.kind {
            OpKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                assert_eq!(cond, Expression::Var("_cond_0".into()));
                assert_eq!(then_branch.len(), 1);
                assert!(else_branch.is_empty());
            }
            other => panic!("expected guard, got {:?}", other),
        }
    }

    #[test]
    fn actual_binding_resolves_formals_in_order() {
        let formals = vec!["a".to_string(), "b".to_string()];
        let args = vec![Expression::Var("x".into()), Expression::IntLit(3)];
        let map = bind_actuals(&formals, &args, "callee", "caller").unwrap();
        assert_eq!(map["a"], CheckExpr::Var("x".into()));
        assert_eq!(map["b"], CheckExpr::IntLit(3));

        let err = bind_actuals(&formals, &args[..1], "callee", "caller").unwrap_err();
        assert!(matches!(err, WeaverError::UnknownVariable { .. }));
    }

    #[test]
    fn field_resolution_substitutes_and_replaces_result() {
        let field = FieldRef {
            root: CheckExpr::Result,
            struct_name: "node".into(),
            field: "value".into(),
        };
        let resolved = resolve_field(
            &field,
            &HashMap::new(),
            Some(&CheckExpr::Var("out".into())),
        );
        assert_eq!(resolved.root, CheckExpr::Var("out".into()));
    }

    #[test]
    fn condition_variable_names_follow_term_ids() {
        assert_eq!(cond_var(0), "_cond_0");
        assert_eq!(cond_var(17), "_cond_17");
    }
}
