//! # Primitive Helpers
//!
//! Argument extraction and error construction shared by every primitive.
//! Arity is checked by the evaluator before a primitive runs, so helpers only
//! ever validate argument types.

use crate::diagnostics::TesseraError;
use crate::err_msg;
use crate::runtime::Value;
use crate::syntax::Syntax;

// ============================================================================
// ERROR CONSTRUCTION UTILITIES
// ============================================================================

/// Creates an argument type failure with consistent messaging.
pub fn type_error(name: &str, expected: &str, position: usize, found: &Value) -> TesseraError {
    TesseraError::arg_type(name, expected, position, found.to_string())
}

/// Creates a contract failure for a well-typed but unacceptable argument.
pub fn contract_error(name: &str, message: impl std::fmt::Display) -> TesseraError {
    err_msg!(Contract, "{name}: {message}")
}

// ============================================================================
// ARGUMENT EXTRACTION
// ============================================================================

/// A numeric argument, kept exact when it is an integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Number::Int(i) => Value::Int(i),
            Number::Float(x) => Value::Float(x),
        }
    }
}

pub fn extract_number(args: &[Value], position: usize, name: &str) -> Result<Number, TesseraError> {
    match &args[position] {
        Value::Int(i) => Ok(Number::Int(*i)),
        Value::Float(x) => Ok(Number::Float(*x)),
        other => Err(type_error(name, "number", position, other)),
    }
}

pub fn extract_numbers(args: &[Value], name: &str) -> Result<Vec<Number>, TesseraError> {
    (0..args.len())
        .map(|i| extract_number(args, i, name))
        .collect()
}

pub fn extract_int(args: &[Value], position: usize, name: &str) -> Result<i64, TesseraError> {
    match &args[position] {
        Value::Int(i) => Ok(*i),
        other => Err(type_error(name, "int", position, other)),
    }
}

pub fn extract_syntax<'a>(args: &'a [Value], position: usize, name: &str) -> Result<&'a Syntax, TesseraError> {
    args[position]
        .as_syntax()
        .ok_or_else(|| type_error(name, "syntax object", position, &args[position]))
}

pub fn extract_identifier<'a>(
    args: &'a [Value],
    position: usize,
    name: &str,
) -> Result<&'a Syntax, TesseraError> {
    match args[position].as_syntax() {
        Some(stx) if stx.is_identifier() => Ok(stx),
        _ => Err(type_error(name, "identifier", position, &args[position])),
    }
}

/// Field names may be written as strings or symbols.
pub fn extract_field_name(args: &[Value], position: usize, name: &str) -> Result<std::sync::Arc<str>, TesseraError> {
    match &args[position] {
        Value::String(s) => Ok(s.clone()),
        Value::Symbol(s) => Ok(s.as_str().into()),
        other => Err(type_error(name, "string or symbol", position, other)),
    }
}
