//! Evaluation: tail calls, dynamic parameters and failure propagation.

mod common;

use common::{eval_ok, top_level};
use pretty_assertions::assert_eq;
use tessera::{ErrorKind, Value};

#[test]
fn letrec_loop_of_a_million_iterations() {
    let top = top_level();
    let value = eval_ok(
        &top,
        "(letrec ((loop (lambda (n) (if (= n 0) 'done (loop (- n 1)))))) (loop 1000000))",
    );
    assert_eq!(value, Value::symbol("done"));
}

#[test]
fn accumulating_tail_loop() {
    let top = top_level();
    eval_ok(&top, "(define (sum n acc) (if (= n 0) acc (sum (- n 1) (+ acc n))))");
    assert_eq!(eval_ok(&top, "(sum 100000 0)"), Value::Int(5_000_050_000));
}

#[test]
fn parameterize_restores_after_failure() {
    let top = top_level();
    eval_ok(&top, "(define p (make_parameter 1))");
    let err = top.eval_str("(parameterize ((p 2)) (error \"inside\" (p)))").unwrap_err();
    assert!(err.to_string().contains("inside 2"), "{err}");
    assert_eq!(eval_ok(&top, "(p)"), Value::Int(1));
}

#[test]
fn nested_parameterize_shadows_and_unwinds() {
    let top = top_level();
    eval_ok(&top, "(define p (make_parameter 'outer))");
    let value = eval_ok(
        &top,
        "(parameterize ((p 'a)) [(p), (parameterize ((p 'b)) (p)), (p)])",
    );
    assert_eq!(value, eval_ok(&top, "'[a, b, a]"));
}

#[test]
fn parameterize_requires_a_parameter() {
    let top = top_level();
    let err = top.eval_str("(parameterize ((car 1)) 2)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnboundIdentifier);
    let err = top.eval_str("(parameterize ((size 1)) 2)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);
}

#[test]
fn host_calls_reuse_the_session_evaluator() {
    let top = top_level();
    eval_ok(&top, "(define (countdown n) (if (= n 0) 'liftoff (countdown (- n 1))))");
    assert_eq!(
        top.call("countdown", vec![Value::Int(300_000)]).unwrap(),
        Value::symbol("liftoff")
    );
}

#[test]
fn struct_and_list_values() {
    let top = top_level();
    let value = eval_ok(&top, "(let ((s {name: \"x\", n: (+ 1 1)})) [(elt s 'n), (size s)])");
    assert_eq!(value, eval_ok(&top, "[2, 2]"));
}

#[test]
fn failure_trail_records_enclosing_forms() {
    let top = top_level();
    let err = top.eval_str("(define (f) (g 1))\n(define (g x) (+ x null))\n(f)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgType);
    assert!(err.span().is_some());
}
