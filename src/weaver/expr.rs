//! The check expression algebra and the residual check taxonomy.
//!
//! Check expressions are a pure sub-language mirroring the IR's value
//! expressions, extended with the method result, named result
//! temporaries and an explicit `Field` form carrying the owning struct.
//! They are total and referentially transparent: lowering one into the
//! IR never changes its meaning.

use std::collections::HashMap;

use crate::error::WeaverError;
use crate::ir::{self, BinaryOp, UnaryOp};
use crate::vpr;

/// A side-effect-free check expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CheckExpr {
    Binary {
        op: BinaryOp,
        left: Box<CheckExpr>,
        right: Box<CheckExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<CheckExpr>,
    },
    IntLit(i64),
    BoolLit(bool),
    CharLit(char),
    StringLit(String),
    NullLit,
    Var(String),
    /// A named result temporary introduced by the verifier.
    ResultVar(String),
    /// The method result.
    Result,
    /// Field access with the owning struct resolved.
    Field {
        root: Box<CheckExpr>,
        struct_name: String,
        field: String,
    },
    /// Pointer dereference.
    Deref(Box<CheckExpr>),
    Cond {
        cond: Box<CheckExpr>,
        then: Box<CheckExpr>,
        els: Box<CheckExpr>,
    },
}

impl CheckExpr {
    pub fn and(left: CheckExpr, right: CheckExpr) -> CheckExpr {
        CheckExpr::Binary {
            op: BinaryOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(operand: CheckExpr) -> CheckExpr {
        CheckExpr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    /// Split `!x` into `(x, false)`, anything else into `(self, true)`.
    pub fn into_polarized(self) -> (CheckExpr, bool) {
        match self {
            CheckExpr::Unary {
                op: UnaryOp::Not,
                operand,
            } => (*operand, false),
            other => (other, true),
        }
    }

    /// Translate a verifier formula into the algebra. Fails on node
    /// kinds the algebra does not model and on field names that break
    /// the `struct$field` convention. `method` provides scope context
    /// for result references.
    pub fn from_viper(exp: &vpr::Exp, method: &ir::Method) -> Result<CheckExpr, WeaverError> {
        match &exp.kind {
            vpr::ExpKind::Binary { op, left, right } => {
                let left = Self::from_viper(left, method)?;
                let right = Self::from_viper(right, method)?;
                Ok(match op {
                    vpr::BinOp::Add => Self::binary(BinaryOp::Add, left, right),
                    vpr::BinOp::Sub => Self::binary(BinaryOp::Sub, left, right),
                    vpr::BinOp::Mul => Self::binary(BinaryOp::Mul, left, right),
                    vpr::BinOp::Div => Self::binary(BinaryOp::Div, left, right),
                    vpr::BinOp::And => Self::binary(BinaryOp::And, left, right),
                    vpr::BinOp::Or => Self::binary(BinaryOp::Or, left, right),
                    vpr::BinOp::Eq => Self::binary(BinaryOp::Eq, left, right),
                    vpr::BinOp::Ne => Self::not(Self::binary(BinaryOp::Eq, left, right)),
                    vpr::BinOp::Lt => Self::binary(BinaryOp::Less, left, right),
                    vpr::BinOp::Le => Self::binary(BinaryOp::LessEq, left, right),
                    vpr::BinOp::Gt => Self::binary(BinaryOp::Greater, left, right),
                    vpr::BinOp::Ge => Self::binary(BinaryOp::GreaterEq, left, right),
                })
            }
            vpr::ExpKind::Unary { op, operand } => {
                let operand = Self::from_viper(operand, method)?;
                Ok(match op {
                    vpr::UnOp::Not => match operand {
                        // `!(!x)` collapses to `x`.
                        CheckExpr::Unary {
                            op: UnaryOp::Not,
                            operand: inner,
                        } => *inner,
                        other => Self::not(other),
                    },
                    vpr::UnOp::Neg => CheckExpr::Unary {
                        op: UnaryOp::Negate,
                        operand: Box::new(operand),
                    },
                })
            }
            vpr::ExpKind::IntLit(n) => Ok(CheckExpr::IntLit(*n)),
            vpr::ExpKind::BoolLit(b) => Ok(CheckExpr::BoolLit(*b)),
            vpr::ExpKind::NullLit => Ok(CheckExpr::NullLit),
            vpr::ExpKind::LocalVar(name) => {
                if name == vpr::RESULT_VARIABLE {
                    if method.returns.is_none() {
                        return Err(WeaverError::InvalidExpression {
                            node: exp.id,
                            detail: format!(
                                "result reference in void method '{}'",
                                method.name
                            ),
                        });
                    }
                    Ok(CheckExpr::Result)
                } else if name.starts_with(vpr::RESULT_TEMP_PREFIX) {
                    Ok(CheckExpr::ResultVar(name.clone()))
                } else {
                    Ok(CheckExpr::Var(name.clone()))
                }
            }
            vpr::ExpKind::FieldAccess { receiver, field } => {
                let root = Self::from_viper(receiver, method)?;
                if vpr::POINTER_VALUE_FIELDS.contains(&field.as_str()) {
                    return Ok(CheckExpr::Deref(Box::new(root)));
                }
                match field.split_once('$') {
                    Some((struct_name, field_name)) if !field_name.is_empty() => {
                        Ok(CheckExpr::Field {
                            root: Box::new(root),
                            struct_name: struct_name.to_string(),
                            field: field_name.to_string(),
                        })
                    }
                    _ => Err(WeaverError::InvalidExpression {
                        node: exp.id,
                        detail: format!("field name '{}' is not of the form struct$field", field),
                    }),
                }
            }
            vpr::ExpKind::Conditional { cond, then, els } => Ok(CheckExpr::Cond {
                cond: Box::new(Self::from_viper(cond, method)?),
                then: Box::new(Self::from_viper(then, method)?),
                els: Box::new(Self::from_viper(els, method)?),
            }),
            vpr::ExpKind::FieldAccessPredicate { .. }
            | vpr::ExpKind::PredicateAccess { .. }
            | vpr::ExpKind::PredicateAccessPredicate { .. } => {
                Err(WeaverError::InvalidExpression {
                    node: exp.id,
                    detail: "permission formula in value position".to_string(),
                })
            }
        }
    }

    fn binary(op: BinaryOp, left: CheckExpr, right: CheckExpr) -> CheckExpr {
        CheckExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Translate an IR value expression into the algebra. Specification
    /// forms are disallowed as values.
    pub fn from_ir(expr: &ir::Expression) -> Result<CheckExpr, WeaverError> {
        match expr {
            ir::Expression::Var(name) => Ok(CheckExpr::Var(name.clone())),
            ir::Expression::Field {
                root,
                struct_name,
                field,
            } => Ok(CheckExpr::Field {
                root: Box::new(Self::from_ir(root)?),
                struct_name: struct_name.clone(),
                field: field.clone(),
            }),
            ir::Expression::Deref(operand) => {
                Ok(CheckExpr::Deref(Box::new(Self::from_ir(operand)?)))
            }
            ir::Expression::Result => Ok(CheckExpr::Result),
            ir::Expression::Conditional { cond, then, els } => Ok(CheckExpr::Cond {
                cond: Box::new(Self::from_ir(cond)?),
                then: Box::new(Self::from_ir(then)?),
                els: Box::new(Self::from_ir(els)?),
            }),
            ir::Expression::Binary { op, left, right } => Ok(CheckExpr::Binary {
                op: *op,
                left: Box::new(Self::from_ir(left)?),
                right: Box::new(Self::from_ir(right)?),
            }),
            ir::Expression::Unary { op, operand } => Ok(CheckExpr::Unary {
                op: *op,
                operand: Box::new(Self::from_ir(operand)?),
            }),
            ir::Expression::IntLit(n) => Ok(CheckExpr::IntLit(*n)),
            ir::Expression::BoolLit(b) => Ok(CheckExpr::BoolLit(*b)),
            ir::Expression::CharLit(c) => Ok(CheckExpr::CharLit(*c)),
            ir::Expression::StringLit(s) => Ok(CheckExpr::StringLit(s.clone())),
            ir::Expression::NullLit => Ok(CheckExpr::NullLit),
            ir::Expression::Imprecise(_)
            | ir::Expression::Accessibility(_)
            | ir::Expression::PredicateInstance { .. } => Err(WeaverError::InvalidSpecification(
                format!("specification form '{}' used as a value", expr),
            )),
        }
    }

    /// Lower into an IR expression. `result_var` names the temporary
    /// that holds the method result at the insertion point; result
    /// references without one are a specification error.
    pub fn to_ir(&self, result_var: Option<&str>) -> Result<ir::Expression, WeaverError> {
        match self {
            CheckExpr::Binary { op, left, right } => Ok(ir::Expression::Binary {
                op: *op,
                left: Box::new(left.to_ir(result_var)?),
                right: Box::new(right.to_ir(result_var)?),
            }),
            CheckExpr::Unary { op, operand } => Ok(ir::Expression::Unary {
                op: *op,
                operand: Box::new(operand.to_ir(result_var)?),
            }),
            CheckExpr::IntLit(n) => Ok(ir::Expression::IntLit(*n)),
            CheckExpr::BoolLit(b) => Ok(ir::Expression::BoolLit(*b)),
            CheckExpr::CharLit(c) => Ok(ir::Expression::CharLit(*c)),
            CheckExpr::StringLit(s) => Ok(ir::Expression::StringLit(s.clone())),
            CheckExpr::NullLit => Ok(ir::Expression::NullLit),
            CheckExpr::Var(name) => Ok(ir::Expression::Var(name.clone())),
            CheckExpr::Result | CheckExpr::ResultVar(_) => match result_var {
                Some(name) => Ok(ir::Expression::Var(name.to_string())),
                None => Err(WeaverError::InvalidSpecification(
                    "result reference with no result value in scope".to_string(),
                )),
            },
            CheckExpr::Field {
                root,
                struct_name,
                field,
            } => Ok(ir::Expression::Field {
                root: Box::new(root.to_ir(result_var)?),
                struct_name: struct_name.clone(),
                field: field.clone(),
            }),
            CheckExpr::Deref(operand) => {
                Ok(ir::Expression::Deref(Box::new(operand.to_ir(result_var)?)))
            }
            CheckExpr::Cond { cond, then, els } => Ok(ir::Expression::Conditional {
                cond: Box::new(cond.to_ir(result_var)?),
                then: Box::new(then.to_ir(result_var)?),
                els: Box::new(els.to_ir(result_var)?),
            }),
        }
    }

    /// Whether this expression references the method result, directly
    /// or through a named result temporary.
    pub fn mentions_result(&self) -> bool {
        match self {
            CheckExpr::Result | CheckExpr::ResultVar(_) => true,
            CheckExpr::Binary { left, right, .. } => {
                left.mentions_result() || right.mentions_result()
            }
            CheckExpr::Unary { operand, .. } => operand.mentions_result(),
            CheckExpr::Field { root, .. } => root.mentions_result(),
            CheckExpr::Deref(operand) => operand.mentions_result(),
            CheckExpr::Cond { cond, then, els } => {
                cond.mentions_result() || then.mentions_result() || els.mentions_result()
            }
            _ => false,
        }
    }

    /// Replace result references (`Result` and named result
    /// temporaries) with a concrete expression.
    pub fn replace_result(&self, to: &CheckExpr) -> CheckExpr {
        match self {
            CheckExpr::Result | CheckExpr::ResultVar(_) => to.clone(),
            CheckExpr::Binary { op, left, right } => CheckExpr::Binary {
                op: *op,
                left: Box::new(left.replace_result(to)),
                right: Box::new(right.replace_result(to)),
            },
            CheckExpr::Unary { op, operand } => CheckExpr::Unary {
                op: *op,
                operand: Box::new(operand.replace_result(to)),
            },
            CheckExpr::Field {
                root,
                struct_name,
                field,
            } => CheckExpr::Field {
                root: Box::new(root.replace_result(to)),
                struct_name: struct_name.clone(),
                field: field.clone(),
            },
            CheckExpr::Deref(operand) => CheckExpr::Deref(Box::new(operand.replace_result(to))),
            CheckExpr::Cond { cond, then, els } => CheckExpr::Cond {
                cond: Box::new(cond.replace_result(to)),
                then: Box::new(then.replace_result(to)),
                els: Box::new(els.replace_result(to)),
            },
            _ => self.clone(),
        }
    }

    /// Substitute free variables. Names absent from the map are left
    /// untouched.
    pub fn substitute(&self, map: &HashMap<String, CheckExpr>) -> CheckExpr {
        match self {
            CheckExpr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            CheckExpr::Binary { op, left, right } => CheckExpr::Binary {
                op: *op,
                left: Box::new(left.substitute(map)),
                right: Box::new(right.substitute(map)),
            },
            CheckExpr::Unary { op, operand } => CheckExpr::Unary {
                op: *op,
                operand: Box::new(operand.substitute(map)),
            },
            CheckExpr::Field {
                root,
                struct_name,
                field,
            } => CheckExpr::Field {
                root: Box::new(root.substitute(map)),
                struct_name: struct_name.clone(),
                field: field.clone(),
            },
            CheckExpr::Deref(operand) => CheckExpr::Deref(Box::new(operand.substitute(map))),
            CheckExpr::Cond { cond, then, els } => CheckExpr::Cond {
                cond: Box::new(cond.substitute(map)),
                then: Box::new(then.substitute(map)),
                els: Box::new(els.substitute(map)),
            },
            CheckExpr::IntLit(_)
            | CheckExpr::BoolLit(_)
            | CheckExpr::CharLit(_)
            | CheckExpr::StringLit(_)
            | CheckExpr::NullLit
            | CheckExpr::ResultVar(_)
            | CheckExpr::Result => self.clone(),
        }
    }
}

impl std::fmt::Display for CheckExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckExpr::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            CheckExpr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Negate => write!(f, "-{}", operand),
            },
            CheckExpr::IntLit(n) => write!(f, "{}", n),
            CheckExpr::BoolLit(b) => write!(f, "{}", b),
            CheckExpr::CharLit(c) => write!(f, "'{}'", c),
            CheckExpr::StringLit(s) => write!(f, "\"{}\"", s),
            CheckExpr::NullLit => write!(f, "NULL"),
            CheckExpr::Var(name) => write!(f, "{}", name),
            CheckExpr::ResultVar(name) => write!(f, "{}", name),
            CheckExpr::Result => write!(f, "\\result"),
            CheckExpr::Field { root, field, .. } => write!(f, "{}.{}", root, field),
            CheckExpr::Deref(operand) => write!(f, "*{}", operand),
            CheckExpr::Cond { cond, then, els } => write!(f, "({} ? {} : {})", cond, then, els),
        }
    }
}

/// A tracked heap field: `root.field` with the owning struct resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub root: CheckExpr,
    pub struct_name: String,
    pub field: String,
}

impl FieldRef {
    pub fn substitute(&self, map: &HashMap<String, CheckExpr>) -> FieldRef {
        FieldRef {
            root: self.root.substitute(map),
            struct_name: self.struct_name.clone(),
            field: self.field.clone(),
        }
    }
}

/// A predicate instance with lowered arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PredicateRef {
    pub name: String,
    pub args: Vec<CheckExpr>,
}

impl PredicateRef {
    pub fn substitute(&self, map: &HashMap<String, CheckExpr>) -> PredicateRef {
        PredicateRef {
            name: self.name.clone(),
            args: self.args.iter().map(|a| a.substitute(map)).collect(),
        }
    }
}

/// The closed set of residual check kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Check {
    /// The expression must evaluate to true.
    Expr(CheckExpr),
    /// The field must be owned at this point.
    FieldAccessibility(FieldRef),
    /// The field permission must be disjoint from its co-located
    /// permissions.
    FieldSeparation(FieldRef),
    /// The predicate instance must be owned at this point.
    PredicateAccessibility(PredicateRef),
    /// The predicate's footprint must be disjoint from its co-located
    /// permissions.
    PredicateSeparation(PredicateRef),
}

impl Check {
    /// Translate a verifier residual formula into a check.
    pub fn from_viper(exp: &vpr::Exp, method: &ir::Method) -> Result<Check, WeaverError> {
        match &exp.kind {
            vpr::ExpKind::FieldAccessPredicate { access } => {
                Ok(Check::FieldAccessibility(lower_field_access(access, method)?))
            }
            vpr::ExpKind::PredicateAccess { predicate, args } => Ok(
                Check::PredicateAccessibility(lower_predicate(predicate, args, method)?),
            ),
            vpr::ExpKind::PredicateAccessPredicate { access } => match &access.kind {
                vpr::ExpKind::PredicateAccess { predicate, args } => Ok(
                    Check::PredicateAccessibility(lower_predicate(predicate, args, method)?),
                ),
                _ => Err(WeaverError::InvalidExpression {
                    node: access.id,
                    detail: "predicate access predicate without predicate access".to_string(),
                }),
            },
            _ => Ok(Check::Expr(CheckExpr::from_viper(exp, method)?)),
        }
    }

    /// Whether this check requires ownership tracking at run time.
    pub fn is_access_check(&self) -> bool {
        !matches!(self, Check::Expr(_))
    }

    /// Whether this check asserts accessibility (rather than
    /// separation or a plain expression).
    pub fn is_accessibility(&self) -> bool {
        matches!(
            self,
            Check::FieldAccessibility(_) | Check::PredicateAccessibility(_)
        )
    }
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Check::Expr(e) => write!(f, "{}", e),
            Check::FieldAccessibility(field) => write!(f, "acc({}.{})", field.root, field.field),
            Check::FieldSeparation(field) => write!(f, "sep({}.{})", field.root, field.field),
            Check::PredicateAccessibility(p) => write!(f, "acc({}(..))", p.name),
            Check::PredicateSeparation(p) => write!(f, "sep({}(..))", p.name),
        }
    }
}

fn lower_field_access(access: &vpr::Exp, method: &ir::Method) -> Result<FieldRef, WeaverError> {
    match CheckExpr::from_viper(access, method)? {
        CheckExpr::Field {
            root,
            struct_name,
            field,
        } => Ok(FieldRef {
            root: *root,
            struct_name,
            field,
        }),
        CheckExpr::Deref(_) => Err(WeaverError::InvalidExpression {
            node: access.id,
            detail: "accessibility of a bare pointer cell is not trackable".to_string(),
        }),
        _ => Err(WeaverError::InvalidExpression {
            node: access.id,
            detail: "field access predicate without field access".to_string(),
        }),
    }
}

fn lower_predicate(
    name: &str,
    args: &[vpr::Exp],
    method: &ir::Method,
) -> Result<PredicateRef, WeaverError> {
    let args = args
        .iter()
        .map(|a| CheckExpr::from_viper(a, method))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PredicateRef {
        name: name.to_string(),
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    fn method() -> ir::Method {
        ir::Method {
            name: "m".into(),
            returns: Some(Type::Int),
            params: vec![],
            precondition: None,
            postcondition: None,
            variables: vec![],
            body: vec![],
        }
    }

    fn vexp(id: u32, kind: vpr::ExpKind) -> vpr::Exp {
        vpr::Exp::new(id, kind)
    }

    #[test]
    fn not_equal_lowers_to_negated_equality() {
        let e = vexp(
            1,
            vpr::ExpKind::Binary {
                op: vpr::BinOp::Ne,
                left: Box::new(vexp(2, vpr::ExpKind::LocalVar("a".into()))),
                right: Box::new(vexp(3, vpr::ExpKind::IntLit(0))),
            },
        );
        let lowered = CheckExpr::from_viper(&e, &method()).unwrap();
        assert_eq!(
            lowered,
            CheckExpr::not(CheckExpr::Binary {
                op: BinaryOp::Eq,
                left: Box::new(CheckExpr::Var("a".into())),
                right: Box::new(CheckExpr::IntLit(0)),
            })
        );
    }

    #[test]
    fn double_negation_collapses() {
        let e = vexp(
            1,
            vpr::ExpKind::Unary {
                op: vpr::UnOp::Not,
                operand: Box::new(vexp(
                    2,
                    vpr::ExpKind::Unary {
                        op: vpr::UnOp::Not,
                        operand: Box::new(vexp(3, vpr::ExpKind::LocalVar("p".into()))),
                    },
                )),
            },
        );
        let lowered = CheckExpr::from_viper(&e, &method()).unwrap();
        assert_eq!(lowered, CheckExpr::Var("p".into()));
    }

    #[test]
    fn sentinel_field_becomes_deref() {
        let e = vexp(
            1,
            vpr::ExpKind::FieldAccess {
                receiver: Box::new(vexp(2, vpr::ExpKind::LocalVar("p".into()))),
                field: "$int_value".into(),
            },
        );
        let lowered = CheckExpr::from_viper(&e, &method()).unwrap();
        assert_eq!(lowered, CheckExpr::Deref(Box::new(CheckExpr::Var("p".into()))));
    }

    #[test]
    fn struct_field_splits_on_dollar() {
        let e = vexp(
            1,
            vpr::ExpKind::FieldAccess {
                receiver: Box::new(vexp(2, vpr::ExpKind::LocalVar("x".into()))),
                field: "node$next".into(),
            },
        );
        let lowered = CheckExpr::from_viper(&e, &method()).unwrap();
        assert_eq!(
            lowered,
            CheckExpr::Field {
                root: Box::new(CheckExpr::Var("x".into())),
                struct_name: "node".into(),
                field: "next".into(),
            }
        );
    }

    #[test]
    fn bare_field_name_is_rejected() {
        let e = vexp(
            1,
            vpr::ExpKind::FieldAccess {
                receiver: Box::new(vexp(2, vpr::ExpKind::LocalVar("x".into()))),
                field: "next".into(),
            },
        );
        assert!(matches!(
            CheckExpr::from_viper(&e, &method()),
            Err(WeaverError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn result_variables_are_distinguished() {
        let m = method();
        let r = vexp(1, vpr::ExpKind::LocalVar("$result".into()));
        let rt = vexp(2, vpr::ExpKind::LocalVar("$result_3".into()));
        let v = vexp(3, vpr::ExpKind::LocalVar("value".into()));
        assert_eq!(CheckExpr::from_viper(&r, &m).unwrap(), CheckExpr::Result);
        assert_eq!(
            CheckExpr::from_viper(&rt, &m).unwrap(),
            CheckExpr::ResultVar("$result_3".into())
        );
        assert_eq!(
            CheckExpr::from_viper(&v, &m).unwrap(),
            CheckExpr::Var("value".into())
        );
    }

    #[test]
    fn access_predicate_becomes_field_accessibility() {
        let m = method();
        let acc = vexp(
            1,
            vpr::ExpKind::FieldAccessPredicate {
                access: Box::new(vexp(
                    2,
                    vpr::ExpKind::FieldAccess {
                        receiver: Box::new(vexp(3, vpr::ExpKind::LocalVar("x".into()))),
                        field: "node$value".into(),
                    },
                )),
            },
        );
        match Check::from_viper(&acc, &m).unwrap() {
            Check::FieldAccessibility(field) => {
                assert_eq!(field.struct_name, "node");
                assert_eq!(field.field, "value");
            }
            other => panic!("expected field accessibility, got {:?}", other),
        }
    }

    #[test]
    fn substitution_replaces_formals() {
        let mut map = HashMap::new();
        map.insert("x".to_string(), CheckExpr::Var("y".into()));
        let e = CheckExpr::Field {
            root: Box::new(CheckExpr::Var("x".into())),
            struct_name: "node".into(),
            field: "value".into(),
        };
        let s = e.substitute(&map);
        assert_eq!(
            s,
            CheckExpr::Field {
                root: Box::new(CheckExpr::Var("y".into())),
                struct_name: "node".into(),
                field: "value".into(),
            }
        );
    }
}
