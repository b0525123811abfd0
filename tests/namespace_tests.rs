//! Definitions, redefinitions and lookups in top-level namespaces.

mod common;

use common::{eval_ok, top_level};
use pretty_assertions::assert_eq;
use tessera::{ErrorKind, Value};

#[test]
fn redefinition_allocates_a_fresh_address() {
    let top = top_level();
    eval_ok(&top, "(define x 1)");
    eval_ok(&top, "(define x 2)");
    assert_eq!(eval_ok(&top, "x"), Value::Int(2));
    assert_eq!(top.namespace().definition_count(), 2);

    let visible: Vec<_> = top
        .namespace()
        .unmarked_definitions()
        .into_iter()
        .filter(|d| d.name().as_str() == "x")
        .collect();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].address(), 1);
}

#[test]
fn failed_definition_leaves_its_address_reserved() {
    let top = top_level();
    let err = top.eval_str("(define x (error \"boom\"))").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Eval);
    assert_eq!(top.namespace().definition_count(), 1);

    let hole = top.eval_str("x").unwrap_err();
    assert_eq!(hole.kind(), ErrorKind::Eval);
    assert!(hole.to_string().contains("before its definition"), "{hole}");

    eval_ok(&top, "(define x 3)");
    assert_eq!(eval_ok(&top, "x"), Value::Int(3));
    assert_eq!(top.namespace().definition_count(), 2);
}

#[test]
fn defining_over_a_kernel_name_shadows_it() {
    let top = top_level();
    eval_ok(&top, "(define (size x) 'mine)");
    assert_eq!(eval_ok(&top, "(size [1, 2])"), Value::symbol("mine"));
    assert_eq!(top.namespace().definition_count(), 1);
}

#[test]
fn host_definitions_and_calls() {
    let top = top_level();
    top.define("base", Value::Int(40)).unwrap();
    eval_ok(&top, "(define (plus_base n) (+ base n))");
    assert_eq!(top.call("plus_base", vec![Value::Int(2)]).unwrap(), Value::Int(42));
    assert_eq!(top.lookup("base").unwrap(), Value::Int(40));
}

#[test]
fn calling_a_non_procedure_fails() {
    let top = top_level();
    top.define("five", Value::Int(5)).unwrap();
    let err = top.call("five", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Eval);
}

#[test]
fn unbound_lookup_and_reference() {
    let top = top_level();
    assert_eq!(top.lookup("ghost").unwrap_err().kind(), ErrorKind::UnboundIdentifier);
    assert_eq!(top.eval_str("ghost").unwrap_err().kind(), ErrorKind::UnboundIdentifier);
    assert_eq!(eval_ok(&top, "'ghost"), Value::symbol("ghost"));
    assert_eq!(eval_ok(&top, "(quote_syntax ghost)").type_name(), "syntax");
}

#[test]
fn definitions_name_their_procedures() {
    let top = top_level();
    eval_ok(&top, "(define square (lambda (x) (* x x)))");
    let err = top.eval_str("(square)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Arity);
    assert!(err.to_string().contains("procedure 'square'"), "{err}");

    let anonymous = top.eval_str("((lambda (x) x))").unwrap_err();
    assert!(anonymous.to_string().contains("anonymous procedure"), "{anonymous}");
}

#[test]
fn errors_point_at_their_source() {
    let top = top_level();
    let err = top.eval_str("(define y 1)\n(+ y \"one\")").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgType);
    let span = err.span().expect("argument errors carry the call's span");
    assert_eq!(span.start, 13);
}

#[test]
fn syntax_objects_evaluate_in_their_own_context() {
    let top = top_level();
    eval_ok(&top, "(define base 40)");
    let Value::Syntax(form) = eval_ok(&top, "(quote_syntax (+ base 2))") else {
        panic!("expected a syntax object");
    };
    assert_eq!(top.eval_in_context(&form).unwrap(), Value::Int(42));
    assert_eq!(top.eval(&form).unwrap(), Value::Int(42));

    let Value::Syntax(definition) = eval_ok(&top, "(quote_syntax (define later 7))") else {
        panic!("expected a syntax object");
    };
    top.eval_in_context(&definition).unwrap();
    assert_eq!(eval_ok(&top, "later"), Value::Int(7));
}
