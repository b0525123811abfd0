//! # Syntax Procedures
//!
//! Procedures over syntax objects, for use by macro transformers.

use crate::atoms::helpers::{extract_identifier, extract_syntax, type_error};
use crate::atoms::{PrimitiveFn, PrimitiveTable};
use crate::runtime::{Arity, Value};
use crate::syntax::Syntax;

/// The immediate children of a sexp or list syntax object, as a list of
/// syntax objects. Lexical context on the parent is pushed down to them.
///
/// Usage: (syntax_subforms <syntax>)
pub const PRIM_SYNTAX_SUBFORMS: PrimitiveFn = |args| {
    let stx = extract_syntax(args, 0, "syntax_subforms")?;
    let children = stx
        .subforms()
        .or_else(|| stx.list_elements())
        .ok_or_else(|| type_error("syntax_subforms", "sequence syntax", 0, &args[0]))?;
    Ok(Value::List(children.into_iter().map(Value::Syntax).collect()))
};

/// Usage: (syntax_to_datum <syntax>)
pub const PRIM_SYNTAX_TO_DATUM: PrimitiveFn = |args| {
    let stx = extract_syntax(args, 0, "syntax_to_datum")?;
    Ok(stx.to_datum())
};

/// Converts data to syntax. With a context identifier, new identifiers take
/// its lexical context; syntax objects inside the datum are kept as they are.
///
/// Usage: (datum_to_syntax <datum> [<context>])
pub const PRIM_DATUM_TO_SYNTAX: PrimitiveFn = |args| {
    let context = match args.get(1) {
        None => None,
        Some(Value::Syntax(stx)) => Some(stx),
        Some(other) => return Err(type_error("datum_to_syntax", "syntax object", 1, other)),
    };
    Ok(Value::Syntax(Syntax::from_datum_in_context(&args[0], context)?))
};

/// Usage: (is_identifier <value>)
pub const PRIM_IS_IDENTIFIER: PrimitiveFn = |args| {
    Ok(Value::Bool(args[0].as_syntax().is_some_and(Syntax::is_identifier)))
};

/// Whether a binding of one identifier would capture the other.
///
/// Usage: (bound_identifier_equal <id> <id>)
pub const PRIM_BOUND_IDENTIFIER_EQUAL: PrimitiveFn = |args| {
    let a = extract_identifier(args, 0, "bound_identifier_equal")?;
    let b = extract_identifier(args, 1, "bound_identifier_equal")?;
    Ok(Value::Bool(a.bound_identifier_eq(b)))
};

/// Whether two identifiers refer to the same binding.
///
/// Usage: (free_identifier_equal <id> <id>)
pub const PRIM_FREE_IDENTIFIER_EQUAL: PrimitiveFn = |args| {
    let a = extract_identifier(args, 0, "free_identifier_equal")?;
    let b = extract_identifier(args, 1, "free_identifier_equal")?;
    Ok(Value::Bool(a.free_identifier_eq(b)))
};

pub fn register_syntax_primitives(table: &mut PrimitiveTable) {
    table.register("syntax_subforms", Arity::exact(1), PRIM_SYNTAX_SUBFORMS);
    table.register("syntax_to_datum", Arity::exact(1), PRIM_SYNTAX_TO_DATUM);
    table.register("datum_to_syntax", Arity::range(1, 2), PRIM_DATUM_TO_SYNTAX);
    table.register("is_identifier", Arity::exact(1), PRIM_IS_IDENTIFIER);
    table.register("bound_identifier_equal", Arity::exact(2), PRIM_BOUND_IDENTIFIER_EQUAL);
    table.register("free_identifier_equal", Arity::exact(2), PRIM_FREE_IDENTIFIER_EQUAL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parser::read_one;
    use crate::syntax::{Mark, Wrap};

    #[test]
    fn subforms_of_a_sexp() {
        let stx = read_one("(a b c)").unwrap();
        let Value::List(children) = PRIM_SYNTAX_SUBFORMS(&[Value::Syntax(stx)]).unwrap() else {
            panic!("expected a list");
        };
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| matches!(c, Value::Syntax(_))));
    }

    #[test]
    fn datum_round_trip() {
        let stx = read_one("(1 \"two\" [three])").unwrap();
        let datum = PRIM_SYNTAX_TO_DATUM(&[Value::Syntax(stx)]).unwrap();
        let back = PRIM_DATUM_TO_SYNTAX(&[datum.clone()]).unwrap();
        assert_eq!(PRIM_SYNTAX_TO_DATUM(&[back]).unwrap(), datum);
    }

    #[test]
    fn marks_distinguish_bound_identifiers() {
        let x = Syntax::identifier("x");
        let marked = x.add_wrap(Wrap::Mark(Mark::fresh()));
        let same = PRIM_BOUND_IDENTIFIER_EQUAL(&[Value::Syntax(x.clone()), Value::Syntax(x.clone())]).unwrap();
        let differ = PRIM_BOUND_IDENTIFIER_EQUAL(&[Value::Syntax(x), Value::Syntax(marked)]).unwrap();
        assert_eq!(same, Value::Bool(true));
        assert_eq!(differ, Value::Bool(false));
    }

    #[test]
    fn identifier_predicate_rejects_non_syntax() {
        assert_eq!(PRIM_IS_IDENTIFIER(&[Value::symbol("x")]).unwrap(), Value::Bool(false));
        let id = Value::Syntax(Syntax::identifier("x"));
        assert_eq!(PRIM_IS_IDENTIFIER(&[id]).unwrap(), Value::Bool(true));
    }
}
