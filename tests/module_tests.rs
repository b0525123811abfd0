#![recursion_limit = "256"]
//! Module loading, import conflicts and instantiation through a resolver.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{eval_ok, top_level_with_modules};
use pretty_assertions::assert_eq;
use tessera::{ErrorKind, ModuleId, ModuleResolver, Runtime, SourceRepository, TesseraError, Value};

const SHARED: &[(&str, &str)] = &[
    ("/a", "(define shared 1) (define only_a 10) (provide shared only_a)"),
    ("/b", "(define shared 2) (provide shared)"),
];

#[test]
fn requiring_either_module_alone_succeeds() {
    for (path, expected) in [("a", 1), ("b", 2)] {
        let top = top_level_with_modules(SHARED);
        top.require_module(path).unwrap();
        assert_eq!(eval_ok(&top, "shared"), Value::Int(expected));
    }
}

#[test]
fn same_name_from_two_modules_is_ambiguous() {
    let top = top_level_with_modules(SHARED);
    top.require_module("a").unwrap();
    let err = top.require_module("b").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AmbiguousBinding);
    assert!(err.to_string().contains("shared"), "{err}");
}

#[test]
fn renaming_one_import_avoids_the_conflict() {
    let top = top_level_with_modules(SHARED);
    eval_ok(&top, "(require \"a\")");
    eval_ok(&top, "(require (rename_in \"b\" (shared b_shared)))");
    assert_eq!(eval_ok(&top, "[shared, b_shared, only_a]"), eval_ok(&top, "[1, 2, 10]"));
}

#[test]
fn relative_paths_resolve_against_the_requiring_module() {
    let top = top_level_with_modules(&[
        ("/pkg/main", "(require \"util\") (define (run) (helper 4)) (provide run)"),
        ("/pkg/util", "(define (helper x) (* x 10)) (provide helper)"),
    ]);
    top.require_module("pkg/main").unwrap();
    assert_eq!(eval_ok(&top, "(run)"), Value::Int(40));
    assert_eq!(top.lookup("helper").unwrap_err().kind(), ErrorKind::UnboundIdentifier);
}

#[test]
fn dependency_cycles_are_contract_failures() {
    let top = top_level_with_modules(&[
        ("/cycle/a", "(require \"b\") (define x 1)"),
        ("/cycle/b", "(require \"a\") (define y 2)"),
    ]);
    let err = top.require_module("cycle/a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);
    assert!(err.to_string().contains("cycle"), "{err}");
}

#[test]
fn modules_are_instantiated_once_per_runtime() {
    let repository = SourceRepository::new()
        .with_module("/counter", "(define p (make_parameter 0)) (provide p)")
        .unwrap();
    let runtime = Runtime::builder().resolver(Arc::new(repository)).build().unwrap();

    let first = runtime.top_level();
    let second = runtime.top_level();
    first.require_module("counter").unwrap();
    second.require_module("counter").unwrap();

    let (Value::Procedure(a), Value::Procedure(b)) =
        (first.lookup("p").unwrap(), second.lookup("p").unwrap())
    else {
        panic!("expected parameters");
    };
    assert!(a.ptr_eq(&b));
}

/// Counts `load` calls and holds each one long enough for importers to race.
struct SlowCountingResolver {
    inner: SourceRepository,
    loads: AtomicUsize,
}

impl ModuleResolver for SlowCountingResolver {
    fn load(&self, id: &ModuleId) -> Result<Option<String>, TesseraError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        self.inner.load(id)
    }
}

#[test]
fn concurrent_first_requires_share_one_instance() {
    let resolver = Arc::new(SlowCountingResolver {
        inner: SourceRepository::new()
            .with_module(
                "/lib",
                "(define_syntax twice (lambda (stx) (quote_syntax 42))) \
                 (define (answer) (twice)) (provide answer)",
            )
            .unwrap(),
        loads: AtomicUsize::new(0),
    });
    let runtime = Runtime::builder().resolver(resolver.clone()).build().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            thread::spawn(move || {
                let top = runtime.top_level();
                top.require_module("lib").unwrap();
                match top.eval_str("(answer)").unwrap() {
                    Value::Int(n) => n,
                    other => panic!("unexpected {other}"),
                }
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 42);
    }
    assert_eq!(resolver.loads.load(Ordering::SeqCst), 1);
    let id = ModuleId::new("/lib");
    let declared = runtime.registry().declaration(&id).unwrap();
    let instance = runtime.registry().instance(&id).unwrap();
    assert!(Arc::ptr_eq(&declared.namespace, instance.namespace()));
}

#[test]
fn load_errors_name_the_module_source() {
    let top = top_level_with_modules(&[("/broken", "(define x")]);
    let err = top.require_module("broken").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[test]
fn the_kernel_is_requirable_by_name() {
    let top = top_level_with_modules(&[]);
    eval_ok(&top, "(require (only_in \"#%kernel\" list))");
    eval_ok(&top, "(define (list) 'shadowed)");
    assert_eq!(eval_ok(&top, "(list)"), Value::symbol("shadowed"));
}
