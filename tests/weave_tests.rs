//! End-to-end weaving scenarios over literal IR and verifier input.

use gvw::ir::{
    self, AssertKind, BinaryOp, Expression, Method, Op, OpKind, Parameter, StructDef, StructField,
    Type, ID_FIELD,
};
use gvw::vpr::{
    self, BranchCond, CheckEntry, CheckPosition, CheckTable, PositionKind, Refinement,
    ResidualCheck,
};
use gvw::weaver::checker::{DYNAMIC_FIELDS, INSTANCE_COUNTER, STATIC_FIELDS};
use gvw::weaver::{collector, runtime, weave, CallStyle, Location};

fn node_struct() -> StructDef {
    StructDef {
        name: "node".into(),
        fields: vec![StructField {
            name: "value".into(),
            ty: Type::Int,
        }],
    }
}

fn method(name: &str, returns: Option<Type>, params: Vec<Parameter>, body: Vec<Op>) -> Method {
    Method {
        name: name.into(),
        returns,
        params,
        precondition: None,
        postcondition: None,
        variables: vec![],
        body,
    }
}

fn param(name: &str, ty: Type) -> Parameter {
    Parameter {
        name: name.into(),
        ty,
    }
}

fn node_param(name: &str) -> Parameter {
    param(name, Type::Struct("node".into()))
}

fn acc_value(root: &str) -> Expression {
    Expression::Accessibility(Box::new(Expression::Field {
        root: Box::new(Expression::Var(root.into())),
        struct_name: "node".into(),
        field: "value".into(),
    }))
}

fn assign_value(root: &str) -> Op {
    Op::new(OpKind::AssignMember {
        member: Expression::Field {
            root: Box::new(Expression::Var(root.into())),
            struct_name: "node".into(),
            field: "value".into(),
        },
        value: Expression::IntLit(0),
    })
}

fn ret_zero() -> Op {
    Op::new(OpKind::Return {
        value: Some(Expression::IntLit(0)),
    })
}

fn e(id: u32, kind: vpr::ExpKind) -> vpr::Exp {
    vpr::Exp::new(id, kind)
}

fn st(id: u32, kind: vpr::StmtKind) -> vpr::Stmt {
    vpr::Stmt { id, kind }
}

fn lvar(id: u32, name: &str) -> vpr::Exp {
    e(id, vpr::ExpKind::LocalVar(name.into()))
}

/// `acc(root.node$value)` with the three node ids given in order:
/// predicate, access, receiver.
fn vacc(ids: [u32; 3], root: &str) -> vpr::Exp {
    e(
        ids[0],
        vpr::ExpKind::FieldAccessPredicate {
            access: Box::new(e(
                ids[1],
                vpr::ExpKind::FieldAccess {
                    receiver: Box::new(lvar(ids[2], root)),
                    field: "node$value".into(),
                },
            )),
        },
    )
}

fn result_assign(stmt_id: u32, value_id: u32) -> vpr::Stmt {
    st(
        stmt_id,
        vpr::StmtKind::LocalAssign {
            target: "$result".into(),
            value: e(value_id, vpr::ExpKind::IntLit(0)),
        },
    )
}

fn new_stmt(id: u32, target: &str) -> vpr::Stmt {
    st(
        id,
        vpr::StmtKind::New {
            target: target.into(),
            fields: vec!["node$value".into()],
        },
    )
}

fn field_assign(ids: [u32; 4], root: &str) -> vpr::Stmt {
    st(
        ids[0],
        vpr::StmtKind::FieldAssign {
            access: e(
                ids[1],
                vpr::ExpKind::FieldAccess {
                    receiver: Box::new(lvar(ids[2], root)),
                    field: "node$value".into(),
                },
            ),
            value: e(ids[3], vpr::ExpKind::IntLit(0)),
        },
    )
}

fn vmethod(name: &str, pres: Vec<vpr::Exp>, posts: Vec<vpr::Exp>, body: Vec<vpr::Stmt>) -> vpr::Method {
    vpr::Method {
        name: name.into(),
        pres,
        posts,
        body,
    }
}

fn table(entries: Vec<(u32, Vec<ResidualCheck>)>) -> CheckTable {
    CheckTable {
        entries: entries
            .into_iter()
            .map(|(node, checks)| CheckEntry { node, checks })
            .collect(),
    }
}

fn acc_check(formula: vpr::Exp, context: u32, within: Option<Refinement>) -> ResidualCheck {
    ResidualCheck {
        check: formula,
        context,
        position: CheckPosition {
            kind: PositionKind::Value,
            within,
        },
        branches: vec![],
    }
}

fn is_invoke(op: &Op, name: &str) -> bool {
    matches!(&op.kind, OpKind::Invoke { method, .. } if method == name)
}

fn invoke_position(ops: &[Op], name: &str) -> usize {
    ops.iter()
        .position(|op| is_invoke(op, name))
        .unwrap_or_else(|| panic!("no call to {} in block", name))
}

/// Scenario: empty main with an empty residual table. Only the
/// instance counter is established.
#[test]
fn empty_main_gets_only_the_counter() {
    let mut program = ir::Program {
        structs: vec![],
        predicates: vec![],
        methods: vec![method("main", Some(Type::Int), vec![], vec![ret_zero()])],
    };
    let verifier = vpr::Program {
        methods: vec![vmethod("main", vec![], vec![], vec![result_assign(1, 2)])],
    };

    let collected = weave(&mut program, &verifier, &table(vec![])).unwrap();
    assert!(!collected.requires_tracking());

    let body = &program.methods[0].body;
    assert_eq!(body.len(), 3);
    match &body[0].kind {
        OpKind::AllocValue { target, ty } => {
            assert_eq!(target, INSTANCE_COUNTER);
            assert_eq!(*ty, Type::Int);
        }
        other => panic!("expected counter allocation first, got {:?}", other),
    }
    match &body[1].kind {
        OpKind::AssignMember { member, value } => {
            assert_eq!(
                *member,
                Expression::Deref(Box::new(Expression::Var(INSTANCE_COUNTER.into())))
            );
            assert_eq!(*value, Expression::IntLit(0));
        }
        other => panic!("expected counter zeroing, got {:?}", other),
    }
    assert!(matches!(body[2].kind, OpKind::Return { .. }));
}

/// Scenario: a single field-access check in precise context. The
/// assertion lands immediately before the assignment, the struct gains
/// its id field, and the allocation is registered.
#[test]
fn field_access_check_in_precise_context() {
    let mut program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![method(
            "main",
            Some(Type::Int),
            vec![],
            vec![
                Op::new(OpKind::AllocStruct {
                    target: "x".into(),
                    struct_name: "node".into(),
                }),
                assign_value("x"),
                ret_zero(),
            ],
        )],
    };
    let verifier = vpr::Program {
        methods: vec![vmethod(
            "main",
            vec![],
            vec![],
            vec![
                new_stmt(10, "x"),
                field_assign([14, 11, 12, 13], "x"),
                result_assign(15, 16),
            ],
        )],
    };
    let checks = table(vec![(14, vec![acc_check(vacc([20, 21, 22], "x"), 14, None)])]);

    let collected = weave(&mut program, &verifier, &checks).unwrap();
    assert!(collected.requires_tracking());

    let id_index = program.structs[0].field_index(ID_FIELD);
    assert_eq!(id_index, Some(1), "id field is appended after `value`");

    let body = &program.methods[0].body;
    let assign_at = body
        .iter()
        .position(|op| matches!(op.kind, OpKind::AssignMember { member: Expression::Field { .. }, .. }))
        .expect("woven body keeps the assignment");

    // The accessibility assertion immediately precedes the assignment.
    match &body[assign_at - 1].kind {
        OpKind::Invoke { method, args, .. } => {
            assert_eq!(method, runtime::ASSERT_ACC);
            assert_eq!(args[0], Expression::Var(DYNAMIC_FIELDS.into()));
            assert_eq!(
                args[1],
                Expression::Field {
                    root: Box::new(Expression::Var("x".into())),
                    struct_name: "node".into(),
                    field: ID_FIELD.into(),
                }
            );
            assert_eq!(args[2], Expression::IntLit(0));
        }
        other => panic!("expected assert_acc before the assignment, got {:?}", other),
    }

    // The allocation is followed by struct registration.
    let alloc_at = body
        .iter()
        .position(|op| matches!(&op.kind, OpKind::AllocStruct { struct_name, .. } if struct_name == "node"))
        .expect("allocation survives");
    match &body[alloc_at + 1].kind {
        OpKind::Invoke { method, target, .. } => {
            assert_eq!(method, runtime::ADD_STRUCT_ACCESS);
            assert!(target.is_some(), "registration assigns the fresh id");
        }
        other => panic!("expected add_struct_access after allocation, got {:?}", other),
    }
}

/// Two allocations in a purely precise method mint distinct ids: each
/// `_id` write reads the counter and is followed by its own increment,
/// so the second allocation observes a bumped counter.
#[test]
fn allocations_in_precise_context_mint_distinct_ids() {
    let mut program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![
            method(
                "main",
                Some(Type::Int),
                vec![],
                vec![
                    Op::new(OpKind::AllocStruct {
                        target: "z".into(),
                        struct_name: "node".into(),
                    }),
                    assign_value("z"),
                    Op::new(OpKind::Invoke {
                        method: "fill".into(),
                        args: vec![],
                        target: None,
                    }),
                    ret_zero(),
                ],
            ),
            method(
                "fill",
                None,
                vec![],
                vec![
                    Op::new(OpKind::AllocStruct {
                        target: "x".into(),
                        struct_name: "node".into(),
                    }),
                    Op::new(OpKind::AllocStruct {
                        target: "y".into(),
                        struct_name: "node".into(),
                    }),
                    Op::new(OpKind::Return { value: None }),
                ],
            ),
        ],
    };
    let verifier = vpr::Program {
        methods: vec![
            vmethod(
                "main",
                vec![],
                vec![],
                vec![
                    new_stmt(10, "z"),
                    field_assign([14, 11, 12, 13], "z"),
                    st(
                        17,
                        vpr::StmtKind::MethodCall {
                            method: "fill".into(),
                            args: vec![],
                            targets: vec![],
                        },
                    ),
                    result_assign(15, 16),
                ],
            ),
            vmethod(
                "fill",
                vec![],
                vec![],
                vec![new_stmt(20, "x"), new_stmt(21, "y")],
            ),
        ],
    };
    let checks = table(vec![(14, vec![acc_check(vacc([30, 31, 32], "z"), 14, None)])]);

    let collected = weave(&mut program, &verifier, &checks).unwrap();
    assert!(collected.requires_tracking());
    assert_eq!(
        collected.method("fill").unwrap().call_style,
        CallStyle::Precise
    );

    // The precise callee takes only the counter pointer.
    let fill = &program.methods[1];
    assert_eq!(fill.params.len(), 1);
    assert_eq!(fill.params[0].name, INSTANCE_COUNTER);
    assert!(!fill.body.iter().any(|op| matches!(op.kind, OpKind::Invoke { .. })));

    let deref_counter =
        Expression::Deref(Box::new(Expression::Var(INSTANCE_COUNTER.into())));
    let mut id_writes = Vec::new();
    for (i, op) in fill.body.iter().enumerate() {
        let OpKind::AllocStruct { target, .. } = &op.kind else {
            continue;
        };
        // The allocation is followed by an id write from the counter
        // and then the increment.
        match &fill.body[i + 1].kind {
            OpKind::AssignMember { member, value } => {
                assert_eq!(
                    *member,
                    Expression::Field {
                        root: Box::new(Expression::Var(target.clone())),
                        struct_name: "node".into(),
                        field: ID_FIELD.into(),
                    }
                );
                assert_eq!(*value, deref_counter);
            }
            other => panic!("expected id write after allocation, got {:?}", other),
        }
        match &fill.body[i + 2].kind {
            OpKind::AssignMember { member, value } => {
                assert_eq!(*member, deref_counter);
                assert_eq!(
                    *value,
                    Expression::Binary {
                        op: BinaryOp::Add,
                        left: Box::new(deref_counter.clone()),
                        right: Box::new(Expression::IntLit(1)),
                    }
                );
            }
            other => panic!("expected counter increment, got {:?}", other),
        }
        id_writes.push((target.clone(), i + 1, i + 2));
    }

    // Two id writes with distinct targets, and the first allocation's
    // increment lands before the second allocation's id read.
    assert_eq!(id_writes.len(), 2);
    assert_ne!(id_writes[0].0, id_writes[1].0);
    assert!(id_writes[0].2 < id_writes[1].1);
}

fn branch_scenario(branch_cond: vpr::Exp) -> (ir::Program, vpr::Program, CheckTable) {
    let program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![method(
            "main",
            Some(Type::Int),
            vec![],
            vec![
                Op::new(OpKind::AllocStruct {
                    target: "x".into(),
                    struct_name: "node".into(),
                }),
                Op::new(OpKind::Assign {
                    target: "b".into(),
                    value: Expression::BoolLit(true),
                }),
                Op::new(OpKind::If {
                    cond: Expression::Var("b".into()),
                    then_branch: vec![assign_value("x")],
                    else_branch: vec![],
                }),
                ret_zero(),
            ],
        )],
    };
    let verifier = vpr::Program {
        methods: vec![vmethod(
            "main",
            vec![],
            vec![],
            vec![
                new_stmt(20, "x"),
                st(
                    21,
                    vpr::StmtKind::LocalAssign {
                        target: "b".into(),
                        value: e(22, vpr::ExpKind::BoolLit(true)),
                    },
                ),
                st(
                    28,
                    vpr::StmtKind::If {
                        cond: lvar(23, "b"),
                        then_body: vec![field_assign([24, 25, 26, 27], "x")],
                        else_body: vec![],
                    },
                ),
                result_assign(29, 30),
            ],
        )],
    };
    let checks = table(vec![(
        24,
        vec![ResidualCheck {
            check: vacc([40, 41, 42], "x"),
            context: 24,
            position: CheckPosition {
                kind: PositionKind::Value,
                within: None,
            },
            branches: vec![BranchCond {
                cond: branch_cond,
                at: 28,
                origin: None,
            }],
        }],
    )]);
    (program, verifier, checks)
}

/// Scenario: a check guarded by a branch condition. A condition term
/// is materialised before the `if`, and the check is wrapped in it.
#[test]
fn branch_condition_becomes_a_condition_variable() {
    let (mut program, verifier, checks) = branch_scenario(lvar(31, "b"));
    let collected = weave(&mut program, &verifier, &checks).unwrap();

    let main = collected.method("main").unwrap();
    assert_eq!(main.conditions.len(), 1);
    assert_eq!(main.conditions[0].value, gvw::CheckExpr::Var("b".into()));
    assert!(main.conditions[0].when.is_none());

    let body = &program.methods[0].body;
    let if_at = body
        .iter()
        .position(|op| matches!(op.kind, OpKind::If { .. }))
        .expect("branch survives");
    match &body[if_at - 1].kind {
        OpKind::Assign { target, value } => {
            assert_eq!(target, "_cond_0");
            assert_eq!(*value, Expression::Var("b".into()));
        }
        other => panic!("expected condition materialisation, got {:?}", other),
    }

    let OpKind::If { then_branch, .. } = &body[if_at].kind else {
        panic!("expected if");
    };
    match &then_branch[0].kind {
        OpKind::If { cond, then_branch: guarded, .. } => {
            assert_eq!(*cond, Expression::Var("_cond_0".into()));
            assert!(is_invoke(&guarded[0], runtime::ASSERT_ACC));
        }
        other => panic!("expected guarded check, got {:?}", other),
    }
}

/// Scenario: a negated branch condition interns the positive term and
/// records negative polarity.
#[test]
fn negated_branch_condition_keeps_positive_term() {
    let negated = e(
        31,
        vpr::ExpKind::Unary {
            op: vpr::UnOp::Not,
            operand: Box::new(lvar(32, "b")),
        },
    );
    let (mut program, verifier, checks) = branch_scenario(negated);
    let collected = weave(&mut program, &verifier, &checks).unwrap();

    let main = collected.method("main").unwrap();
    assert_eq!(main.conditions.len(), 1);
    assert_eq!(
        main.conditions[0].value,
        gvw::CheckExpr::Var("b".into()),
        "the term is interned positively"
    );

    let body = &program.methods[0].body;
    let if_at = body
        .iter()
        .position(|op| matches!(op.kind, OpKind::If { .. }))
        .expect("branch survives");
    let OpKind::If { then_branch, .. } = &body[if_at].kind else {
        panic!("expected if");
    };
    match &then_branch[0].kind {
        OpKind::If { cond, .. } => {
            assert_eq!(
                *cond,
                Expression::not(Expression::Var("_cond_0".into())),
                "the guard negates the materialised term"
            );
        }
        other => panic!("expected guarded check, got {:?}", other),
    }
}

/// Scenario: two accessibility checks at one call site require
/// separation in addition to the individual assertions.
#[test]
fn overlapping_call_preconditions_get_separation_checks() {
    let callee_pre = Expression::and(acc_value("x"), acc_value("y"));
    let mut program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![
            method(
                "main",
                Some(Type::Int),
                vec![],
                vec![
                    Op::new(OpKind::AllocStruct {
                        target: "x".into(),
                        struct_name: "node".into(),
                    }),
                    Op::new(OpKind::AllocStruct {
                        target: "y".into(),
                        struct_name: "node".into(),
                    }),
                    Op::new(OpKind::Invoke {
                        method: "use_two".into(),
                        args: vec![Expression::Var("x".into()), Expression::Var("y".into())],
                        target: None,
                    }),
                    ret_zero(),
                ],
            ),
            {
                let mut m = method(
                    "use_two",
                    None,
                    vec![node_param("x"), node_param("y")],
                    vec![],
                );
                m.precondition = Some(callee_pre);
                m
            },
        ],
    };
    let verifier = vpr::Program {
        methods: vec![
            vmethod(
                "main",
                vec![],
                vec![],
                vec![
                    new_stmt(40, "x"),
                    new_stmt(41, "y"),
                    st(
                        44,
                        vpr::StmtKind::MethodCall {
                            method: "use_two".into(),
                            args: vec![lvar(42, "x"), lvar(43, "y")],
                            targets: vec![],
                        },
                    ),
                    result_assign(45, 46),
                ],
            ),
            vmethod(
                "use_two",
                vec![e(
                    50,
                    vpr::ExpKind::Binary {
                        op: vpr::BinOp::And,
                        left: Box::new(vacc([51, 52, 53], "x")),
                        right: Box::new(vacc([54, 55, 56], "y")),
                    },
                )],
                vec![],
                vec![],
            ),
        ],
    };
    let checks = table(vec![(
        44,
        vec![
            acc_check(vacc([60, 61, 62], "x"), 51, Some(Refinement::InCall)),
            acc_check(vacc([63, 64, 65], "y"), 54, Some(Refinement::InCall)),
        ],
    )]);

    let collected = weave(&mut program, &verifier, &checks).unwrap();

    let main = collected.method("main").unwrap();
    assert_eq!(
        main.full_walk_locations.len(),
        1,
        "the call site is marked for a full permission walk"
    );
    let separations = main
        .checks
        .iter()
        .filter(|c| matches!(c.check, gvw::Check::FieldSeparation(_)))
        .count();
    assert_eq!(separations, 2);

    let body = &program.methods[0].body;
    let call_at = invoke_position(body, "use_two");
    let window = &body[call_at - 4..call_at];
    assert!(is_invoke(&window[0], runtime::ASSERT_ACC));
    assert!(is_invoke(&window[1], runtime::ASSERT_ACC));
    assert!(is_invoke(&window[2], runtime::ASSERT_DISJOINT_ACC));
    assert!(is_invoke(&window[3], runtime::ASSERT_DISJOINT_ACC));

    match &window[2].kind {
        OpKind::Invoke { args, .. } => {
            assert_eq!(args[0], Expression::Var(STATIC_FIELDS.into()));
            assert_eq!(args[1], Expression::Var(DYNAMIC_FIELDS.into()));
        }
        _ => unreachable!(),
    }

    // A precise callee receives the counter and nothing else.
    let OpKind::Invoke { args, .. } = &body[call_at].kind else {
        panic!("expected the call");
    };
    assert_eq!(args.len(), 3);
    assert_eq!(args[2], Expression::Var(INSTANCE_COUNTER.into()));
    let callee = &program.methods[1];
    assert_eq!(callee.params.len(), 3);
    assert_eq!(callee.params[2].name, INSTANCE_COUNTER);
    assert_eq!(
        collected.method("use_two").unwrap().call_style,
        CallStyle::Precise
    );
}

/// Scenario: a precise caller invoking an imprecise callee builds and
/// transfers the permission objects around the call.
#[test]
fn imprecise_callee_from_precise_caller() {
    let mut program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![
            method(
                "main",
                Some(Type::Int),
                vec![],
                vec![
                    Op::new(OpKind::AllocStruct {
                        target: "x".into(),
                        struct_name: "node".into(),
                    }),
                    Op::new(OpKind::Invoke {
                        method: "imp".into(),
                        args: vec![Expression::Var("x".into())],
                        target: None,
                    }),
                    ret_zero(),
                ],
            ),
            {
                let mut m = method("imp", None, vec![node_param("x")], vec![]);
                m.precondition = Some(Expression::Imprecise(Some(Box::new(acc_value("x")))));
                m
            },
        ],
    };
    let verifier = vpr::Program {
        methods: vec![
            vmethod(
                "main",
                vec![],
                vec![],
                vec![
                    new_stmt(60, "x"),
                    st(
                        61,
                        vpr::StmtKind::MethodCall {
                            method: "imp".into(),
                            args: vec![lvar(62, "x")],
                            targets: vec![],
                        },
                    ),
                    result_assign(63, 64),
                ],
            ),
            vmethod("imp", vec![vacc([70, 71, 72], "x")], vec![], vec![]),
        ],
    };
    let checks = table(vec![(
        61,
        vec![acc_check(vacc([80, 81, 82], "x"), 70, Some(Refinement::InCall))],
    )]);

    let collected = weave(&mut program, &verifier, &checks).unwrap();
    assert_eq!(
        collected.method("imp").unwrap().call_style,
        CallStyle::Imprecise
    );

    let body = &program.methods[0].body;
    let call_at = invoke_position(body, "imp");

    // The accessibility check runs while the dynamic pool is intact,
    // then the prologue saves the static, builds a fresh one from the
    // callee's precondition, and transfers.
    assert!(is_invoke(&body[call_at - 7], runtime::ASSERT_ACC));
    assert!(matches!(
        &body[call_at - 6].kind,
        OpKind::Assign { target, value: Expression::Var(v) }
            if target == "_saved_static_0" && v == STATIC_FIELDS
    ));
    assert!(matches!(
        &body[call_at - 5].kind,
        OpKind::AllocStruct { target, struct_name }
            if target == STATIC_FIELDS && struct_name == runtime::OWNED_FIELDS_STRUCT
    ));
    assert!(is_invoke(&body[call_at - 4], runtime::INIT_FIELDS));
    match &body[call_at - 3].kind {
        OpKind::Invoke { method, args, .. } => {
            assert_eq!(method, runtime::ADD_FIELD_ACCESS);
            assert_eq!(args[0], Expression::Var(STATIC_FIELDS.into()));
        }
        other => panic!("expected static population, got {:?}", other),
    }
    assert!(is_invoke(&body[call_at - 2], runtime::JOIN));
    assert!(is_invoke(&body[call_at - 1], runtime::DISJOIN));

    // The call carries both permission objects and the counter.
    let OpKind::Invoke { args, .. } = &body[call_at].kind else {
        panic!("expected the call");
    };
    assert_eq!(args.len(), 4);
    assert_eq!(args[1], Expression::Var(DYNAMIC_FIELDS.into()));
    assert_eq!(args[2], Expression::Var(STATIC_FIELDS.into()));
    assert_eq!(args[3], Expression::Var(INSTANCE_COUNTER.into()));

    // Epilogue: rebuild, fold back, restore, re-carve.
    assert!(matches!(
        &body[call_at + 1].kind,
        OpKind::AllocStruct { target, .. } if target == STATIC_FIELDS
    ));
    assert!(is_invoke(&body[call_at + 2], runtime::INIT_FIELDS));
    assert!(is_invoke(&body[call_at + 3], runtime::JOIN));
    assert!(matches!(
        &body[call_at + 4].kind,
        OpKind::Assign { target, value: Expression::Var(v) }
            if target == STATIC_FIELDS && v == "_saved_static_0"
    ));
    assert!(is_invoke(&body[call_at + 5], runtime::DISJOIN));

    // The imprecise callee with a precise postcondition hands its
    // static grants back through the dynamic object before returning.
    let callee = &program.methods[1];
    assert_eq!(callee.params.len(), 4);
    assert_eq!(callee.params[1].name, DYNAMIC_FIELDS);
    assert_eq!(callee.params[2].name, STATIC_FIELDS);
    assert_eq!(callee.params[3].name, INSTANCE_COUNTER);
    let last = callee.body.last().expect("hand-back join");
    assert!(is_invoke(last, runtime::JOIN));
}

/// Loop-begin positions pointing outside the invariant tree are
/// verifier artefacts for the program point after the loop.
#[test]
fn loop_begin_outside_invariant_is_demoted() {
    let mut program = ir::Program {
        structs: vec![node_struct()],
        predicates: vec![],
        methods: vec![method(
            "main",
            Some(Type::Int),
            vec![],
            vec![
                Op::new(OpKind::AllocStruct {
                    target: "x".into(),
                    struct_name: "node".into(),
                }),
                Op::new(OpKind::While {
                    cond: Expression::Binary {
                        op: BinaryOp::Less,
                        left: Box::new(Expression::IntLit(0)),
                        right: Box::new(Expression::IntLit(1)),
                    },
                    invariant: Some(acc_value("x")),
                    body: vec![assign_value("x")],
                }),
                ret_zero(),
            ],
        )],
    };
    program.renumber();
    let while_id = program.methods[0].body[1].id;

    let verifier = vpr::Program {
        methods: vec![vmethod(
            "main",
            vec![],
            vec![],
            vec![
                new_stmt(90, "x"),
                st(
                    99,
                    vpr::StmtKind::While {
                        cond: e(
                            91,
                            vpr::ExpKind::Binary {
                                op: vpr::BinOp::Lt,
                                left: Box::new(e(92, vpr::ExpKind::IntLit(0))),
                                right: Box::new(e(93, vpr::ExpKind::IntLit(1))),
                            },
                        ),
                        invariants: vec![vacc([94, 95, 96], "x")],
                        body: vec![field_assign([100, 101, 102, 103], "x")],
                    },
                ),
                result_assign(104, 105),
            ],
        )],
    };

    let inside = ResidualCheck {
        check: vacc([110, 111, 112], "x"),
        context: 94,
        position: CheckPosition {
            kind: PositionKind::LoopBegin,
            within: None,
        },
        branches: vec![],
    };
    // Same position tag, but tied to the while statement itself.
    let outside = ResidualCheck {
        check: vacc([113, 114, 115], "x"),
        context: 94,
        position: CheckPosition {
            kind: PositionKind::LoopBegin,
            within: None,
        },
        branches: vec![],
    };
    let checks = table(vec![(94, vec![inside]), (99, vec![outside])]);

    let collected = collector::collect(&program, &verifier, &checks).unwrap();
    let main = collected.method("main").unwrap();
    let locations: Vec<Location> = main
        .checks
        .iter()
        .filter(|c| matches!(c.check, gvw::Check::FieldAccessibility(_)))
        .map(|c| c.location)
        .collect();
    assert!(locations.contains(&Location::LoopStart(while_id)));
    assert!(locations.contains(&Location::Post(while_id)));
}

/// Condition-term ids and check order are a deterministic function of
/// the input, with no hash-order dependency.
#[test]
fn collection_is_deterministic() {
    let (mut program, verifier, checks) = branch_scenario(lvar(31, "b"));
    program.renumber();
    let first = collector::collect(&program, &verifier, &checks).unwrap();
    let second = collector::collect(&program, &verifier, &checks).unwrap();
    assert_eq!(format!("{:?}", first), format!("{:?}", second));

    let main = first.method("main").unwrap();
    assert_eq!(main.conditions[0].id, 0);
}

/// A structural mismatch between the IR and the verifier body is
/// fatal.
#[test]
fn lockstep_walk_rejects_mismatched_bodies() {
    let mut program = ir::Program {
        structs: vec![],
        predicates: vec![],
        methods: vec![method(
            "main",
            Some(Type::Int),
            vec![],
            vec![
                Op::new(OpKind::Assign {
                    target: "a".into(),
                    value: Expression::IntLit(1),
                }),
                ret_zero(),
            ],
        )],
    };
    let verifier = vpr::Program {
        methods: vec![vmethod(
            "main",
            vec![],
            vec![],
            // The verifier offers a field assignment where the IR has
            // a local assignment.
            vec![field_assign([1, 2, 3, 4], "x"), result_assign(5, 6)],
        )],
    };

    let err = weave(&mut program, &verifier, &table(vec![])).unwrap_err();
    assert!(matches!(err, gvw::WeaverError::StructuralMismatch { .. }));
}

/// Specification asserts consume a verifier statement; imperative
/// asserts do not.
#[test]
fn imperative_asserts_consume_no_verifier_statement() {
    let mut program = ir::Program {
        structs: vec![],
        predicates: vec![],
        methods: vec![method(
            "main",
            Some(Type::Int),
            vec![],
            vec![
                Op::new(OpKind::Assert {
                    value: Expression::BoolLit(true),
                    kind: AssertKind::Imperative,
                }),
                Op::new(OpKind::Assert {
                    value: Expression::BoolLit(true),
                    kind: AssertKind::Specification,
                }),
                ret_zero(),
            ],
        )],
    };
    let verifier = vpr::Program {
        methods: vec![vmethod(
            "main",
            vec![],
            vec![],
            vec![
                st(
                    1,
                    vpr::StmtKind::Assert {
                        exp: e(2, vpr::ExpKind::BoolLit(true)),
                    },
                ),
                result_assign(3, 4),
            ],
        )],
    };

    weave(&mut program, &verifier, &table(vec![])).unwrap();
}
