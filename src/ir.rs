//! Intermediate representation of the specified source language.
//!
//! The frontend (parser + resolver) produces this tree; the weaver
//! consumes it, mutates method bodies in place, and hands it to the
//! downstream compiler. Specifications are ordinary expression trees
//! extended with the imprecision marker, accessibility assertions and
//! predicate instances.

use serde::{Deserialize, Serialize};

/// Dense identifier of an operation inside a program.
///
/// Identity is structural: two references to the same operation carry
/// the same id. Ids are assigned by [`Program::renumber`] in pre-order
/// and are unique across the whole program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Types in the language.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Int,
    Bool,
    Char,
    String,
    Pointer(Box<Type>),
    Struct(String),
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::String => write!(f, "string"),
            Type::Pointer(inner) => write!(f, "{}*", inner),
            Type::Struct(name) => write!(f, "struct {}*", name),
        }
    }
}

/// A named struct field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

/// A struct definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructDef {
    /// Index of a field within this struct, in declaration order.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Append the synthetic `_id` field used by ownership tracking.
    /// Appending keeps the indices of declared fields stable; calling
    /// this twice is a no-op.
    pub fn add_id_field(&mut self) {
        if self.field_index(ID_FIELD).is_none() {
            self.fields.push(StructField {
                name: ID_FIELD.to_string(),
                ty: Type::Int,
            });
        }
    }
}

/// Name of the synthetic per-object identifier field.
pub const ID_FIELD: &str = "_id";

/// A formal parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
}

/// A local variable declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
}

/// An abstract predicate definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub name: String,
    pub params: Vec<Parameter>,
    pub body: Expression,
}

/// Binary operators over values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sym = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
        };
        write!(f, "{}", sym)
    }
}

/// Unary operators over values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Expressions, covering both imperative values and specifications.
///
/// `Imprecise`, `Accessibility` and `PredicateInstance` may appear only
/// in specification position; the weaver rejects them where a value is
/// required.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Var(String),
    /// Field access `root.field`, annotated with the owning struct.
    Field {
        root: Box<Expression>,
        struct_name: String,
        field: String,
    },
    /// Pointer dereference `*operand`.
    Deref(Box<Expression>),
    /// The method result, valid in postconditions.
    Result,
    /// The imprecision marker `? && inner`.
    Imprecise(Option<Box<Expression>>),
    /// Access permission `acc(member)`.
    Accessibility(Box<Expression>),
    /// Instance of an abstract predicate.
    PredicateInstance {
        name: String,
        args: Vec<Expression>,
    },
    Conditional {
        cond: Box<Expression>,
        then: Box<Expression>,
        els: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    IntLit(i64),
    BoolLit(bool),
    CharLit(char),
    StringLit(String),
    NullLit,
}

impl Expression {
    pub fn and(left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            op: BinaryOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(operand: Expression) -> Expression {
        Expression::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    /// Whether this specification is imprecise at its root.
    pub fn is_imprecise(&self) -> bool {
        matches!(self, Expression::Imprecise(_))
    }

    /// The precise part of a specification: the expression under the
    /// imprecision marker, or the expression itself when precise.
    pub fn precise_part(&self) -> Option<&Expression> {
        match self {
            Expression::Imprecise(inner) => inner.as_deref(),
            other => Some(other),
        }
    }
}

/// Whether an optional specification is imprecise. A missing clause
/// defaults to the precise `true`.
pub fn spec_is_imprecise(spec: Option<&Expression>) -> bool {
    spec.map(Expression::is_imprecise).unwrap_or(false)
}

/// Distinguishes `assert` used as a program statement from `assert`
/// used as an intermediate specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssertKind {
    Imperative,
    Specification,
}

/// An operation together with its structural identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    #[serde(skip)]
    pub id: OpId,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Op {
            id: OpId::default(),
            kind,
        }
    }
}

/// Operation kinds forming a method body tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OpKind {
    If {
        cond: Expression,
        then_branch: Vec<Op>,
        else_branch: Vec<Op>,
    },
    While {
        cond: Expression,
        invariant: Option<Expression>,
        body: Vec<Op>,
    },
    Invoke {
        method: String,
        args: Vec<Expression>,
        /// Optional l-value receiving the result (a `Var` or `Field`).
        target: Option<Expression>,
    },
    /// Allocate a bare value cell, binding a pointer to `target`.
    AllocValue {
        target: String,
        ty: Type,
    },
    /// Allocate a struct, binding a pointer to `target`.
    AllocStruct {
        target: String,
        struct_name: String,
    },
    Assign {
        target: String,
        value: Expression,
    },
    AssignMember {
        /// A `Field` or `Deref` l-value.
        member: Expression,
        value: Expression,
    },
    Fold {
        predicate: String,
        args: Vec<Expression>,
    },
    Unfold {
        predicate: String,
        args: Vec<Expression>,
    },
    Assert {
        value: Expression,
        kind: AssertKind,
    },
    Error {
        value: Expression,
    },
    Return {
        value: Option<Expression>,
    },
}

impl OpKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpKind::If { .. } => "if",
            OpKind::While { .. } => "while",
            OpKind::Invoke { .. } => "invoke",
            OpKind::AllocValue { .. } => "alloc-value",
            OpKind::AllocStruct { .. } => "alloc-struct",
            OpKind::Assign { .. } => "assign",
            OpKind::AssignMember { .. } => "assign-member",
            OpKind::Fold { .. } => "fold",
            OpKind::Unfold { .. } => "unfold",
            OpKind::Assert { .. } => "assert",
            OpKind::Error { .. } => "error",
            OpKind::Return { .. } => "return",
        }
    }
}

/// A method definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub returns: Option<Type>,
    pub params: Vec<Parameter>,
    pub precondition: Option<Expression>,
    pub postcondition: Option<Expression>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub body: Vec<Op>,
}

impl Method {
    /// Declare a fresh local, returning its name unchanged.
    pub fn declare(&mut self, name: impl Into<String>, ty: Type) -> String {
        let name = name.into();
        if !self.variables.iter().any(|v| v.name == name) {
            self.variables.push(Variable {
                name: name.clone(),
                ty,
            });
        }
        name
    }
}

/// A complete program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub structs: Vec<StructDef>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    pub methods: Vec<Method>,
}

impl Program {
    pub fn struct_named(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn method_named(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_named_mut(&mut self, name: &str) -> Option<&mut Method> {
        self.methods.iter_mut().find(|m| m.name == name)
    }

    pub fn predicate_named(&self, name: &str) -> Option<&Predicate> {
        self.predicates.iter().find(|p| p.name == name)
    }

    /// Assign dense pre-order [`OpId`]s to every operation. Must run
    /// before any pass that relies on structural identity; ids are not
    /// part of the serialized form.
    pub fn renumber(&mut self) {
        let mut next = 0u32;
        for method in &mut self.methods {
            renumber_block(&mut method.body, &mut next);
        }
    }
}

fn renumber_block(ops: &mut [Op], next: &mut u32) {
    for op in ops {
        op.id = OpId(*next);
        *next += 1;
        match &mut op.kind {
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                renumber_block(then_branch, next);
                renumber_block(else_branch, next);
            }
            OpKind::While { body, .. } => renumber_block(body, next),
            _ => {}
        }
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expression::Var(name) => write!(f, "{}", name),
            Expression::Field { root, field, .. } => write!(f, "{}.{}", root, field),
            Expression::Deref(operand) => write!(f, "*{}", operand),
            Expression::Result => write!(f, "\\result"),
            Expression::Imprecise(None) => write!(f, "?"),
            Expression::Imprecise(Some(inner)) => write!(f, "? && {}", inner),
            Expression::Accessibility(member) => write!(f, "acc({})", member),
            Expression::PredicateInstance { name, args } => {
                write!(f, "{}(", name)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Expression::Conditional { cond, then, els } => {
                write!(f, "({} ? {} : {})", cond, then, els)
            }
            Expression::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expression::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Negate => write!(f, "-{}", operand),
            },
            Expression::IntLit(n) => write!(f, "{}", n),
            Expression::BoolLit(b) => write!(f, "{}", b),
            Expression::CharLit(c) => write!(f, "'{}'", c),
            Expression::StringLit(s) => write!(f, "\"{}\"", s),
            Expression::NullLit => write!(f, "NULL"),
        }
    }
}

fn write_args(f: &mut std::fmt::Formatter<'_>, args: &[Expression]) -> std::fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for method in &self.methods {
            write!(f, "{}", method)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ret = self
            .returns
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "void".to_string());
        write!(f, "{} {}(", ret, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", param.ty, param.name)?;
        }
        writeln!(f, ")")?;
        if let Some(pre) = &self.precondition {
            writeln!(f, "  //@ requires {};", pre)?;
        }
        if let Some(post) = &self.postcondition {
            writeln!(f, "  //@ ensures {};", post)?;
        }
        writeln!(f, "{{")?;
        for var in &self.variables {
            writeln!(f, "  {} {};", var.ty, var.name)?;
        }
        write_block(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

fn write_block(f: &mut std::fmt::Formatter<'_>, ops: &[Op], depth: usize) -> std::fmt::Result {
    let pad = "  ".repeat(depth);
    for op in ops {
        match &op.kind {
            OpKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                writeln!(f, "{}if ({}) {{", pad, cond)?;
                write_block(f, then_branch, depth + 1)?;
                if else_branch.is_empty() {
                    writeln!(f, "{}}}", pad)?;
                } else {
                    writeln!(f, "{}}} else {{", pad)?;
                    write_block(f, else_branch, depth + 1)?;
                    writeln!(f, "{}}}", pad)?;
                }
            }
            OpKind::While {
                cond,
                invariant,
                body,
            } => {
                writeln!(f, "{}while ({})", pad, cond)?;
                if let Some(inv) = invariant {
                    writeln!(f, "{}  //@ loop_invariant {};", pad, inv)?;
                }
                writeln!(f, "{}{{", pad)?;
                write_block(f, body, depth + 1)?;
                writeln!(f, "{}}}", pad)?;
            }
            OpKind::Invoke {
                method,
                args,
                target,
            } => {
                write!(f, "{}", pad)?;
                if let Some(target) = target {
                    write!(f, "{} = ", target)?;
                }
                write!(f, "{}(", method)?;
                write_args(f, args)?;
                writeln!(f, ");")?;
            }
            OpKind::AllocValue { target, ty } => {
                writeln!(f, "{}{} = alloc({});", pad, target, ty)?;
            }
            OpKind::AllocStruct {
                target,
                struct_name,
            } => {
                writeln!(f, "{}{} = alloc(struct {});", pad, target, struct_name)?;
            }
            OpKind::Assign { target, value } => {
                writeln!(f, "{}{} = {};", pad, target, value)?;
            }
            OpKind::AssignMember { member, value } => {
                writeln!(f, "{}{} = {};", pad, member, value)?;
            }
            OpKind::Fold { predicate, args } => {
                write!(f, "{}//@ fold {}(", pad, predicate)?;
                write_args(f, args)?;
                writeln!(f, ");")?;
            }
            OpKind::Unfold { predicate, args } => {
                write!(f, "{}//@ unfold {}(", pad, predicate)?;
                write_args(f, args)?;
                writeln!(f, ");")?;
            }
            OpKind::Assert { value, kind } => match kind {
                AssertKind::Imperative => writeln!(f, "{}assert({});", pad, value)?,
                AssertKind::Specification => writeln!(f, "{}//@ assert {};", pad, value)?,
            },
            OpKind::Error { value } => {
                writeln!(f, "{}error({});", pad, value)?;
            }
            OpKind::Return { value } => match value {
                Some(value) => writeln!(f, "{}return {};", pad, value)?,
                None => writeln!(f, "{}return;", pad)?,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renumber_assigns_preorder_ids() {
        let mut program = Program {
            structs: vec![],
            predicates: vec![],
            methods: vec![Method {
                name: "main".into(),
                returns: Some(Type::Int),
                params: vec![],
                precondition: None,
                postcondition: None,
                variables: vec![],
                body: vec![
                    Op::new(OpKind::If {
                        cond: Expression::BoolLit(true),
                        then_branch: vec![Op::new(OpKind::Return {
                            value: Some(Expression::IntLit(1)),
                        })],
                        else_branch: vec![],
                    }),
                    Op::new(OpKind::Return {
                        value: Some(Expression::IntLit(0)),
                    }),
                ],
            }],
        };
        program.renumber();

        let body = &program.methods[0].body;
        assert_eq!(body[0].id, OpId(0));
        match &body[0].kind {
            OpKind::If { then_branch, .. } => assert_eq!(then_branch[0].id, OpId(1)),
            _ => panic!("expected If"),
        }
        assert_eq!(body[1].id, OpId(2));
    }

    #[test]
    fn id_field_append_is_idempotent() {
        let mut s = StructDef {
            name: "node".into(),
            fields: vec![
                StructField {
                    name: "value".into(),
                    ty: Type::Int,
                },
                StructField {
                    name: "next".into(),
                    ty: Type::Struct("node".into()),
                },
            ],
        };
        s.add_id_field();
        s.add_id_field();
        assert_eq!(s.fields.len(), 3);
        assert_eq!(s.field_index("value"), Some(0));
        assert_eq!(s.field_index("next"), Some(1));
        assert_eq!(s.field_index(ID_FIELD), Some(2));
    }

    #[test]
    fn precise_part_unwraps_imprecision() {
        let acc = Expression::Accessibility(Box::new(Expression::Field {
            root: Box::new(Expression::Var("x".into())),
            struct_name: "node".into(),
            field: "value".into(),
        }));
        let spec = Expression::Imprecise(Some(Box::new(acc.clone())));
        assert!(spec.is_imprecise());
        assert_eq!(spec.precise_part(), Some(&acc));
        assert!(Expression::Imprecise(None).precise_part().is_none());
        assert!(!acc.is_imprecise());
    }
}
