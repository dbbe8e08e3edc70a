//! The permission-tracking runtime interface.
//!
//! The weaver commits to this fixed set of operations; the concrete
//! tracking data structure lives in the runtime library linked by the
//! downstream compiler. Emitted code refers to the runtime only
//! through the names and arities below.

use crate::ir::{Expression, Op, OpKind, Type};

/// Struct type of a permission object.
pub const OWNED_FIELDS_STRUCT: &str = "OwnedFields";

/// `init_fields(f, counter)`: zero-size owned-fields init, tying the
/// object to the process-lifetime instance counter.
pub const INIT_FIELDS: &str = "init_fields";

/// `add_field_access(f, obj_id, n_fields, field_index)`: record one
/// field permission. Idempotent.
pub const ADD_FIELD_ACCESS: &str = "add_field_access";

/// `add_struct_access(f, n_fields) -> int`: mint a fresh object id
/// and register all of its fields.
pub const ADD_STRUCT_ACCESS: &str = "add_struct_access";

/// `assert_acc(f, obj_id, field_index)`: runtime accessibility.
pub const ASSERT_ACC: &str = "assert_acc";

/// `assert_disjoint_acc(f1, f2, obj_id, field_index)`: separation.
pub const ASSERT_DISJOINT_ACC: &str = "assert_disjoint_acc";

/// `join(dst, src)`: move every permission of `src` into `dst`,
/// emptying `src`.
pub const JOIN: &str = "join";

/// `disjoin(dst, src)`: move exactly the permissions of `src` out of
/// `dst`.
pub const DISJOIN: &str = "disjoin";

/// Runtime entry point asserting ownership of a predicate instance.
/// The runtime unfolds the predicate body itself.
pub fn predicate_assert(predicate: &str) -> String {
    format!("assert_{}", predicate)
}

/// Runtime entry point asserting a predicate's footprint disjoint.
pub fn predicate_assert_disjoint(predicate: &str) -> String {
    format!("assert_disjoint_{}", predicate)
}

/// Runtime entry point registering a predicate's footprint.
pub fn predicate_add(predicate: &str) -> String {
    format!("add_{}", predicate)
}

/// The IR type of a permission object reference.
pub fn owned_fields_type() -> Type {
    Type::Struct(OWNED_FIELDS_STRUCT.to_string())
}

/// The IR type of the instance counter cell.
pub fn counter_type() -> Type {
    Type::Pointer(Box::new(Type::Int))
}

/// Build a void runtime call.
pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Op {
    Op::new(OpKind::Invoke {
        method: name.into(),
        args,
        target: None,
    })
}

/// Build a runtime call whose result is assigned to `target`.
pub fn call_into(name: impl Into<String>, args: Vec<Expression>, target: Expression) -> Op {
    Op::new(OpKind::Invoke {
        method: name.into(),
        args,
        target: Some(target),
    })
}
