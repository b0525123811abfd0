//! # Mathematical Operations
//!
//! Arithmetic over integers and floats. Integer arithmetic stays exact and
//! fails on overflow; any float operand makes the result a float.
//!
//! ## Primitives Provided
//!
//! - **Arithmetic**: `+`, `-`, `*`, `/`
//! - **Comparison**: `=`, `<`, `>`, `<=`, `>=`
//! - **Logic**: `not`

use crate::atoms::helpers::{contract_error, extract_numbers, Number};
use crate::atoms::{PrimitiveFn, PrimitiveTable};
use crate::diagnostics::TesseraError;
use crate::runtime::{Arity, Value};

// ============================================================================
// ARITHMETIC OPERATIONS
// ============================================================================

fn fold_numbers(
    name: &str,
    numbers: &[Number],
    init: Number,
    exact: fn(i64, i64) -> Option<i64>,
    inexact: fn(f64, f64) -> f64,
) -> Result<Number, TesseraError> {
    numbers.iter().try_fold(init, |acc, n| match (acc, *n) {
        (Number::Int(a), Number::Int(b)) => exact(a, b)
            .map(Number::Int)
            .ok_or_else(|| contract_error(name, "integer overflow")),
        (a, b) => Ok(Number::Float(inexact(a.as_f64(), b.as_f64()))),
    })
}

/// Adds numbers.
///
/// Usage: (+ <a> <b> ...)
///
/// Example:
///   (+ 1 2 3) ; => 6
pub const PRIM_ADD: PrimitiveFn = |args| {
    let numbers = extract_numbers(args, "+")?;
    fold_numbers("+", &numbers, Number::Int(0), i64::checked_add, |a, b| a + b).map(Number::into_value)
};

/// Subtracts the remaining numbers from the first, or negates a single one.
///
/// Usage: (- <a> <b> ...)
pub const PRIM_SUB: PrimitiveFn = |args| {
    let numbers = extract_numbers(args, "-")?;
    let (first, rest) = match numbers.split_first() {
        Some((first, [])) => (Number::Int(0), std::slice::from_ref(first)),
        Some((first, rest)) => (*first, rest),
        None => return Ok(Value::Int(0)),
    };
    fold_numbers("-", rest, first, i64::checked_sub, |a, b| a - b).map(Number::into_value)
};

/// Multiplies numbers.
///
/// Usage: (* <a> <b> ...)
pub const PRIM_MUL: PrimitiveFn = |args| {
    let numbers = extract_numbers(args, "*")?;
    fold_numbers("*", &numbers, Number::Int(1), i64::checked_mul, |a, b| a * b).map(Number::into_value)
};

/// Divides the first number by the rest. Integers that do not divide evenly
/// yield a float.
///
/// Usage: (/ <a> <b> ...)
///
/// Example:
///   (/ 7 2) ; => 3.5
pub const PRIM_DIV: PrimitiveFn = |args| {
    let numbers = extract_numbers(args, "/")?;
    let Some((first, rest)) = numbers.split_first() else {
        return Ok(Value::Int(1));
    };
    let mut acc = *first;
    for divisor in rest {
        if divisor.as_f64() == 0.0 {
            return Err(contract_error("/", "division by zero"));
        }
        acc = match (acc, *divisor) {
            // checked_rem fails only for i64::MIN / -1.
            (Number::Int(a), Number::Int(b)) => match a.checked_rem(b) {
                Some(0) => a
                    .checked_div(b)
                    .map(Number::Int)
                    .ok_or_else(|| contract_error("/", "integer overflow"))?,
                Some(_) => Number::Float(a as f64 / b as f64),
                None => return Err(contract_error("/", "integer overflow")),
            },
            (a, b) => Number::Float(a.as_f64() / b.as_f64()),
        };
    }
    Ok(acc.into_value())
};

// ============================================================================
// COMPARISON OPERATIONS
// ============================================================================

/// Whether all arguments are equal. Numbers compare by value across int and
/// float; other values compare structurally.
///
/// Usage: (= <a> <b> ...)
pub const PRIM_EQ: PrimitiveFn = |args| {
    let equal = args.windows(2).all(|pair| match (&pair[0], &pair[1]) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (a, b) => a == b,
    });
    Ok(Value::Bool(equal))
};

fn compare_chain(name: &str, args: &[Value], holds: fn(f64, f64) -> bool) -> Result<Value, TesseraError> {
    let numbers = extract_numbers(args, name)?;
    let ordered = numbers.windows(2).all(|pair| match (pair[0], pair[1]) {
        (Number::Int(a), Number::Int(b)) => holds_exact(a, b, holds),
        (a, b) => holds(a.as_f64(), b.as_f64()),
    });
    Ok(Value::Bool(ordered))
}

// Integers above 2^53 lose precision as floats; compare them through the sign
// of their difference instead.
fn holds_exact(a: i64, b: i64, holds: fn(f64, f64) -> bool) -> bool {
    let ordering = a.cmp(&b) as i8;
    holds(f64::from(ordering), 0.0)
}

pub const PRIM_LT: PrimitiveFn = |args| compare_chain("<", args, |a, b| a < b);
pub const PRIM_GT: PrimitiveFn = |args| compare_chain(">", args, |a, b| a > b);
pub const PRIM_LE: PrimitiveFn = |args| compare_chain("<=", args, |a, b| a <= b);
pub const PRIM_GE: PrimitiveFn = |args| compare_chain(">=", args, |a, b| a >= b);

/// Logical negation of truthiness.
///
/// Usage: (not <value>)
pub const PRIM_NOT: PrimitiveFn = |args| Ok(Value::Bool(!args[0].is_truthy()));

// ============================================================================
// REGISTRATION FUNCTION
// ============================================================================

pub fn register_math_primitives(table: &mut PrimitiveTable) {
    // Arithmetic
    table.register("+", Arity::at_least(0), PRIM_ADD);
    table.register("-", Arity::at_least(1), PRIM_SUB);
    table.register("*", Arity::at_least(0), PRIM_MUL);
    table.register("/", Arity::at_least(1), PRIM_DIV);

    // Comparison
    table.register("=", Arity::at_least(1), PRIM_EQ);
    table.register("<", Arity::at_least(1), PRIM_LT);
    table.register(">", Arity::at_least(1), PRIM_GT);
    table.register("<=", Arity::at_least(1), PRIM_LE);
    table.register(">=", Arity::at_least(1), PRIM_GE);

    table.register("not", Arity::exact(1), PRIM_NOT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;

    #[test]
    fn integer_arithmetic_stays_exact() {
        assert_eq!(PRIM_ADD(&[Value::Int(1), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(PRIM_SUB(&[Value::Int(5)]).unwrap(), Value::Int(-5));
        assert_eq!(PRIM_DIV(&[Value::Int(6), Value::Int(3)]).unwrap(), Value::Int(2));
        assert_eq!(PRIM_DIV(&[Value::Int(7), Value::Int(2)]).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn mixed_arithmetic_is_inexact() {
        assert_eq!(PRIM_MUL(&[Value::Int(2), Value::Float(1.5)]).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn overflow_and_division_by_zero_fail() {
        let overflow = PRIM_ADD(&[Value::Int(i64::MAX), Value::Int(1)]).unwrap_err();
        assert_eq!(overflow.kind(), ErrorKind::Contract);
        let zero = PRIM_DIV(&[Value::Int(1), Value::Int(0)]).unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::Contract);
        let quotient = PRIM_DIV(&[Value::Int(i64::MIN), Value::Int(-1)]).unwrap_err();
        assert_eq!(quotient.kind(), ErrorKind::Contract);
        assert_eq!(PRIM_DIV(&[Value::Int(i64::MIN), Value::Int(1)]).unwrap(), Value::Int(i64::MIN));
    }

    #[test]
    fn comparisons_chain() {
        let args = [Value::Int(1), Value::Int(2), Value::Float(2.5)];
        assert_eq!(PRIM_LT(&args).unwrap(), Value::Bool(true));
        assert_eq!(PRIM_GE(&args).unwrap(), Value::Bool(false));
        assert_eq!(PRIM_EQ(&[Value::Int(2), Value::Float(2.0)]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn non_numbers_are_rejected_by_position() {
        let err = PRIM_ADD(&[Value::Int(1), Value::string("x")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgType);
        assert!(err.to_string().contains("+"));
    }
}
