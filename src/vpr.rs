//! The verifier-facing half of the weaver's input: a lightweight mirror
//! of the verifier's AST for each method, and the residual-check table
//! the symbolic execution produced over it.
//!
//! Node identifiers are assigned by the verifier and are the join key
//! between the two inputs. The weaver never interprets this AST beyond
//! lowering formulas into the check algebra and walking statements in
//! lock-step with the IR.

use serde::{Deserialize, Serialize};

/// Identifier of a verifier AST node.
pub type NodeId = u32;

/// Field names the verifier uses for the value cell of a bare pointer.
/// A field access through one of these is a dereference, not a struct
/// field access.
pub const POINTER_VALUE_FIELDS: [&str; 3] = ["$int_value", "$bool_value", "$struct_value"];

/// The local variable denoting the method result.
pub const RESULT_VARIABLE: &str = "$result";

/// Prefix of named result temporaries introduced by the verifier.
pub const RESULT_TEMP_PREFIX: &str = "$result_";

/// Binary operators in verifier formulas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary operators in verifier formulas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

/// A verifier expression node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exp {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: ExpKind,
}

impl Exp {
    pub fn new(id: NodeId, kind: ExpKind) -> Self {
        Exp { id, kind }
    }

    /// Whether `node` occurs in this expression tree.
    pub fn contains(&self, node: NodeId) -> bool {
        if self.id == node {
            return true;
        }
        match &self.kind {
            ExpKind::Binary { left, right, .. } => left.contains(node) || right.contains(node),
            ExpKind::Unary { operand, .. } => operand.contains(node),
            ExpKind::FieldAccess { receiver, .. } => receiver.contains(node),
            ExpKind::FieldAccessPredicate { access } => access.contains(node),
            ExpKind::PredicateAccess { args, .. } => args.iter().any(|a| a.contains(node)),
            ExpKind::PredicateAccessPredicate { access } => access.contains(node),
            ExpKind::Conditional { cond, then, els } => {
                cond.contains(node) || then.contains(node) || els.contains(node)
            }
            ExpKind::IntLit(_)
            | ExpKind::BoolLit(_)
            | ExpKind::NullLit
            | ExpKind::LocalVar(_) => false,
        }
    }
}

/// Verifier expression kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExpKind {
    Binary {
        op: BinOp,
        left: Box<Exp>,
        right: Box<Exp>,
    },
    Unary {
        op: UnOp,
        operand: Box<Exp>,
    },
    IntLit(i64),
    BoolLit(bool),
    NullLit,
    LocalVar(String),
    /// `receiver.field` where `field` follows the `struct$field`
    /// convention, or one of [`POINTER_VALUE_FIELDS`].
    FieldAccess {
        receiver: Box<Exp>,
        field: String,
    },
    /// `acc(receiver.field)`.
    FieldAccessPredicate {
        access: Box<Exp>,
    },
    /// A predicate instance `p(args)`.
    PredicateAccess {
        predicate: String,
        args: Vec<Exp>,
    },
    /// `acc(p(args))`.
    PredicateAccessPredicate {
        access: Box<Exp>,
    },
    Conditional {
        cond: Box<Exp>,
        then: Box<Exp>,
        els: Box<Exp>,
    },
}

/// A verifier statement node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: StmtKind,
}

/// Verifier statement kinds, mirroring the method body shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stmt")]
pub enum StmtKind {
    If {
        cond: Exp,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Exp,
        invariants: Vec<Exp>,
        body: Vec<Stmt>,
    },
    MethodCall {
        method: String,
        args: Vec<Exp>,
        targets: Vec<String>,
    },
    New {
        target: String,
        fields: Vec<String>,
    },
    LocalAssign {
        target: String,
        value: Exp,
    },
    FieldAssign {
        access: Exp,
        value: Exp,
    },
    Fold {
        access: Exp,
    },
    Unfold {
        access: Exp,
    },
    Assert {
        exp: Exp,
    },
}

impl StmtKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StmtKind::If { .. } => "if",
            StmtKind::While { .. } => "while",
            StmtKind::MethodCall { .. } => "method call",
            StmtKind::New { .. } => "new",
            StmtKind::LocalAssign { .. } => "local assignment",
            StmtKind::FieldAssign { .. } => "field assignment",
            StmtKind::Fold { .. } => "fold",
            StmtKind::Unfold { .. } => "unfold",
            StmtKind::Assert { .. } => "assert",
        }
    }
}

/// A verifier method: specification clauses plus a statement body that
/// corresponds one-to-one (modulo documented exceptions) with the IR
/// method of the same name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub pres: Vec<Exp>,
    #[serde(default)]
    pub posts: Vec<Exp>,
    pub body: Vec<Stmt>,
}

impl Method {
    /// Whether `node` occurs in one of this method's postconditions.
    pub fn post_contains(&self, node: NodeId) -> bool {
        self.posts.iter().any(|p| p.contains(node))
    }
}

/// The verifier program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub methods: Vec<Method>,
}

impl Program {
    pub fn method_named(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Base position of a residual check relative to its statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionKind {
    /// At the statement itself.
    Value,
    /// Before the loop the statement belongs to.
    LoopBefore,
    /// After the loop.
    LoopAfter,
    /// At the head of each iteration.
    LoopBegin,
    /// At the end of each iteration.
    LoopEnd,
}

/// Optional refinement naming the formula the check originated in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refinement {
    InCall,
    InFold,
    InUnfold,
}

/// Full position tag carried by a residual check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPosition {
    pub kind: PositionKind,
    #[serde(default)]
    pub within: Option<Refinement>,
}

impl CheckPosition {
    pub fn value() -> Self {
        CheckPosition {
            kind: PositionKind::Value,
            within: None,
        }
    }

    pub fn describe(&self) -> String {
        match self.within {
            Some(Refinement::InCall) => format!("{:?} in call", self.kind),
            Some(Refinement::InFold) => format!("{:?} in fold", self.kind),
            Some(Refinement::InUnfold) => format!("{:?} in unfold", self.kind),
            None => format!("{:?}", self.kind),
        }
    }
}

/// One frame of a branch-condition stack. Frames are ordered
/// outermost-first; `origin` is set when the condition was encountered
/// inside a callee's specification and names the call-site node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchCond {
    pub cond: Exp,
    pub at: NodeId,
    #[serde(default)]
    pub origin: Option<NodeId>,
}

/// A single assertion the verifier could not discharge statically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResidualCheck {
    /// The failing formula, expressed in the scope of the checked
    /// method (callee specifications arrive already instantiated).
    pub check: Exp,
    /// The containing specification clause.
    pub context: NodeId,
    pub position: CheckPosition,
    #[serde(default)]
    pub branches: Vec<BranchCond>,
}

/// One entry of the residual-check table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub node: NodeId,
    pub checks: Vec<ResidualCheck>,
}

/// The residual-check table, ordered by the verifier's trace. The
/// order of entries (and of checks within an entry) is significant: it
/// drives condition-term id assignment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckTable {
    pub entries: Vec<CheckEntry>,
}

impl CheckTable {
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.checks.is_empty())
    }
}
