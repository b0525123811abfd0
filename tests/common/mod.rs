//! # Tessera Test Harness
//!
//! Loader for `(test ...)` cases written in `.tess` scripts, plus helpers
//! shared by the integration tests.
//!
//! A case is `(test "name" (expect VALUE) BODY...)` or
//! `(test "name" (expect (error KIND)) BODY...)`. `VALUE` is a literal datum
//! compared with the value of the last body form; `KIND` is an
//! [`ErrorKind`](tessera::ErrorKind) name.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tessera::syntax::parser::read;
use tessera::{err_msg, Runtime, SourceRepository, Syntax, TesseraError, TopLevel, Value};
use walkdir::WalkDir;

/// A single test case defined in a `.tess` file.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub file: PathBuf,
    pub name: String,
    pub body: Vec<Syntax>,
    pub expectation: TestExpectation,
}

/// The expected outcome of a test case.
#[derive(Debug, Clone, PartialEq)]
pub enum TestExpectation {
    Success(Value),
    Error(String),
}

/// Discovers and parses all test cases from `.tess` files under `dir`.
pub fn load_test_cases(dir: &Path) -> Result<Vec<TestCase>, TesseraError> {
    let mut test_cases = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path().extension().map_or(true, |e| e != "tess") {
            continue;
        }
        let path = entry.path();
        let source = std::fs::read_to_string(path)
            .map_err(|e| err_msg!(Contract, "failed to read test file '{}': {e}", path.display()))?;
        for form in read(&source, &path.display().to_string())? {
            test_cases.push(parse_test_case(path, &form)?);
        }
    }
    Ok(test_cases)
}

fn parse_test_case(file: &Path, form: &Syntax) -> Result<TestCase, TesseraError> {
    let items = form
        .subforms()
        .ok_or_else(|| err_msg!(Contract, "test form must be a sexp: {form}"))?;
    match items.as_slice() {
        [head, name, expect, body @ ..] if head.as_symbol().map(|s| s.as_str()) == Some("test") => {
            let Value::String(name) = name.to_datum() else {
                return Err(err_msg!(Contract, "test name must be a string literal: {form}"));
            };
            if body.is_empty() {
                return Err(err_msg!(Contract, "test '{name}' has no body"));
            }
            Ok(TestCase {
                file: file.to_path_buf(),
                name: name.to_string(),
                body: body.to_vec(),
                expectation: parse_expectation(expect)?,
            })
        }
        _ => Err(err_msg!(
            Contract,
            "expected (test \"name\" (expect ...) body...), found {form}"
        )),
    }
}

fn parse_expectation(expect: &Syntax) -> Result<TestExpectation, TesseraError> {
    let items = expect.subforms().unwrap_or_default();
    let [keyword, expected] = items.as_slice() else {
        return Err(err_msg!(Contract, "(expect ...) form must have exactly one operand: {expect}"));
    };
    if keyword.as_symbol().map(|s| s.as_str()) != Some("expect") {
        return Err(err_msg!(Contract, "expected (expect ...), found {expect}"));
    }
    if let Some([error, kind]) = expected.subforms().as_deref() {
        if error.as_symbol().map(|s| s.as_str()) == Some("error") {
            let kind = kind
                .as_symbol()
                .ok_or_else(|| err_msg!(Contract, "error kind must be a symbol: {expected}"))?;
            return Ok(TestExpectation::Error(kind.to_string()));
        }
    }
    Ok(TestExpectation::Success(expected.to_datum()))
}

/// Runs `case` in a fresh top level and reports whether it met its expectation.
pub fn run_test_case(case: &TestCase) -> Result<(), String> {
    let runtime = Runtime::new();
    let top = runtime.top_level();
    let mut outcome = Ok(Value::Void);
    for form in &case.body {
        outcome = top.eval(form);
        if outcome.is_err() {
            break;
        }
    }
    match (&case.expectation, outcome) {
        (TestExpectation::Success(expected), Ok(actual)) if *expected == actual => Ok(()),
        (TestExpectation::Success(expected), Ok(actual)) => {
            Err(format!("expected {expected}, got {actual}"))
        }
        (TestExpectation::Success(expected), Err(e)) => {
            Err(format!("expected {expected}, got error: {e}"))
        }
        (TestExpectation::Error(kind), Err(e)) if e.kind().as_str() == kind => Ok(()),
        (TestExpectation::Error(kind), Err(e)) => {
            Err(format!("expected {kind} error, got {} error: {e}", e.kind()))
        }
        (TestExpectation::Error(kind), Ok(actual)) => {
            Err(format!("expected {kind} error, got {actual}"))
        }
    }
}

/// A fresh top level on a fresh runtime.
pub fn top_level() -> TopLevel {
    Runtime::new().top_level()
}

/// A fresh top level whose runtime can load the given `(path, source)` modules.
pub fn top_level_with_modules(modules: &[(&str, &str)]) -> TopLevel {
    let repository = SourceRepository::new();
    for (path, source) in modules {
        repository.add(path, source).unwrap();
    }
    Runtime::builder()
        .resolver(Arc::new(repository))
        .build()
        .unwrap()
        .top_level()
}

/// Evaluates `source` and returns the last value, panicking with the rendered
/// diagnostic on failure.
pub fn eval_ok(top: &TopLevel, source: &str) -> Value {
    match top.eval_str(source) {
        Ok(value) => value,
        Err(e) => panic!("evaluation of {source:?} failed: {:?}", miette::Report::new(e)),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
