//! # Collection Operations
//!
//! Construction and access for sexps, lists and structs, plus the handful of
//! general value primitives (`void`, `error`, `make_parameter`, predicates).
//!
//! Sexps and lists share their accessors; `head` and `tail` of an empty
//! sequence are contract failures rather than null.

use std::sync::Arc;

use im::{OrdMap, Vector};

use crate::atoms::helpers::{contract_error, extract_field_name, extract_int, type_error};
use crate::atoms::{PrimitiveFn, PrimitiveTable};
use crate::diagnostics::TesseraError;
use crate::err_msg;
use crate::runtime::{Arity, DynamicParameter, Procedure, Value};

// ============================================================================
// HELPERS
// ============================================================================

fn sequence<'a>(args: &'a [Value], position: usize, name: &str) -> Result<&'a Vector<Value>, TesseraError> {
    match &args[position] {
        Value::Sexp(items) | Value::List(items) => Ok(items),
        other => Err(type_error(name, "sexp or list", position, other)),
    }
}

/// Rebuilds a sequence of the same kind as `like`.
fn same_kind(like: &Value, items: Vector<Value>) -> Value {
    match like {
        Value::List(_) => Value::List(items),
        _ => Value::Sexp(items),
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Usage: (list <a> ...) ; => [a, ...]
pub const PRIM_LIST: PrimitiveFn = |args| Ok(Value::List(args.iter().cloned().collect()));

/// Usage: (sexp <a> ...) ; => (a ...)
pub const PRIM_SEXP: PrimitiveFn = |args| Ok(Value::Sexp(args.iter().cloned().collect()));

/// Builds a struct from alternating field names and values. A repeated field
/// keeps its last value.
///
/// Usage: (struct "name" <value> ...)
pub const PRIM_STRUCT: PrimitiveFn = |args| {
    if args.len() % 2 != 0 {
        return Err(contract_error("struct", "expects field names and values in pairs"));
    }
    let mut fields: OrdMap<Arc<str>, Value> = OrdMap::new();
    for position in (0..args.len()).step_by(2) {
        let name = extract_field_name(args, position, "struct")?;
        fields.insert(name, args[position + 1].clone());
    }
    Ok(Value::Struct(fields))
};

// ============================================================================
// ACCESS
// ============================================================================

/// Number of elements of a sequence or struct, or characters of a string.
pub const PRIM_SIZE: PrimitiveFn = |args| {
    let size = match &args[0] {
        Value::Sexp(items) | Value::List(items) => items.len(),
        Value::Struct(fields) => fields.len(),
        Value::String(s) => s.chars().count(),
        other => return Err(type_error("size", "sequence, struct or string", 0, other)),
    };
    Ok(Value::Int(size as i64))
};

/// Element at a zero-based index of a sequence, or a field of a struct.
///
/// Usage: (elt <sequence> <index>) | (elt <struct> "field")
pub const PRIM_ELT: PrimitiveFn = |args| {
    if let Value::Struct(fields) = &args[0] {
        let name = extract_field_name(args, 1, "elt")?;
        return Ok(fields.get(&name).cloned().unwrap_or(Value::Null));
    }
    let items = sequence(args, 0, "elt")?;
    let index = extract_int(args, 1, "elt")?;
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or_else(|| contract_error("elt", format!("index {index} out of range for size {}", items.len())))
};

pub const PRIM_HEAD: PrimitiveFn = |args| {
    let items = sequence(args, 0, "head")?;
    items
        .front()
        .cloned()
        .ok_or_else(|| contract_error("head", "empty sequence"))
};

pub const PRIM_TAIL: PrimitiveFn = |args| {
    let items = sequence(args, 0, "tail")?;
    if items.is_empty() {
        return Err(contract_error("tail", "empty sequence"));
    }
    Ok(same_kind(&args[0], items.skip(1)))
};

pub const PRIM_IS_EMPTY: PrimitiveFn = |args| {
    let empty = match &args[0] {
        Value::Sexp(items) | Value::List(items) => items.is_empty(),
        Value::Struct(fields) => fields.is_empty(),
        Value::String(s) => s.is_empty(),
        other => return Err(type_error("is_empty", "sequence, struct or string", 0, other)),
    };
    Ok(Value::Bool(empty))
};

// ============================================================================
// GENERAL
// ============================================================================

pub const PRIM_IS_NULL: PrimitiveFn = |args| Ok(Value::Bool(matches!(args[0], Value::Null)));

pub const PRIM_IS_VOID: PrimitiveFn = |args| Ok(Value::Bool(matches!(args[0], Value::Void)));

/// Ignores its arguments and returns void.
pub const PRIM_VOID: PrimitiveFn = |_| Ok(Value::Void);

/// Raises an evaluation failure whose message is the arguments, displayed
/// and separated by spaces. Strings are shown without quotes.
///
/// Usage: (error "message" <irritant> ...)
pub const PRIM_ERROR: PrimitiveFn = |args| {
    let message = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.to_string(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    Err(err_msg!(Eval, "{message}"))
};

/// Creates a dynamic parameter with the given default value.
///
/// Usage: (make_parameter <default>)
pub const PRIM_MAKE_PARAMETER: PrimitiveFn = |args| {
    let parameter = DynamicParameter::new(args[0].clone());
    Ok(Value::Procedure(Procedure::Parameter(Arc::new(parameter))))
};

// ============================================================================
// REGISTRATION FUNCTION
// ============================================================================

pub fn register_collection_primitives(table: &mut PrimitiveTable) {
    table.register("list", Arity::at_least(0), PRIM_LIST);
    table.register("sexp", Arity::at_least(0), PRIM_SEXP);
    table.register("struct", Arity::at_least(0), PRIM_STRUCT);
    table.register("size", Arity::exact(1), PRIM_SIZE);
    table.register("elt", Arity::exact(2), PRIM_ELT);
    table.register("head", Arity::exact(1), PRIM_HEAD);
    table.register("tail", Arity::exact(1), PRIM_TAIL);
    table.register("is_empty", Arity::exact(1), PRIM_IS_EMPTY);

    table.register("is_null", Arity::exact(1), PRIM_IS_NULL);
    table.register("is_void", Arity::exact(1), PRIM_IS_VOID);
    table.register("void", Arity::at_least(0), PRIM_VOID);
    table.register("error", Arity::at_least(1), PRIM_ERROR);
    table.register("make_parameter", Arity::exact(1), PRIM_MAKE_PARAMETER);
}
