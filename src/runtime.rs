//! Runtime module for the Tessera language
//!
//! This module provides the run-time value domain. Plain data (scalars,
//! sexps, lists, structs) is immutable and structurally compared; procedures,
//! macros, and parameters are compared by identity.
//!
//! ## Submodules
//!
//! - [`binding`]: compile-time denotations of identifiers
//! - [`namespace`]: binding tables and addressed value stores
//! - [`registry`]: module identities, resolution, and memoized instances
//! - [`eval`]: the evaluator and its tail-call trampoline

pub mod binding;
pub mod eval;
pub mod namespace;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use im::{OrdMap, Vector};
use once_cell::sync::OnceCell;

use crate::compiler::LambdaTemplate;
use crate::diagnostics::Variability;
use crate::runtime::eval::Store;
use crate::syntax::{write_float, write_string_literal, Symbol, Syntax};
use crate::TesseraError;

/// Signature of procedures implemented in Rust.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, TesseraError> + Send + Sync>;

// ============================================================================
// PROCEDURES
// ============================================================================

/// Accepted argument counts of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exact(n: usize) -> Self {
        Arity {
            min: n,
            max: Some(n),
        }
    }

    pub const fn at_least(n: usize) -> Self {
        Arity { min: n, max: None }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Arity {
            min,
            max: Some(max),
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }

    /// Raises an arity failure on behalf of `who` unless `count` is accepted.
    pub fn check(&self, who: &str, count: usize) -> Result<(), TesseraError> {
        if self.accepts(count) {
            return Ok(());
        }
        let variability = match self.max {
            Some(max) if max == self.min => Variability::Exact,
            Some(max) => Variability::Range { max },
            None => Variability::AtLeast,
        };
        Err(TesseraError::arity(who, self.min, variability, count))
    }
}

/// A procedure implemented in Rust.
pub struct NativeProcedure {
    name: OnceCell<String>,
    arity: Arity,
    func: NativeFn,
}

impl NativeProcedure {
    pub fn new(name: &str, arity: Arity, func: NativeFn) -> Self {
        NativeProcedure {
            name: OnceCell::with_value(name.to_string()),
            arity,
            func,
        }
    }

    pub fn anonymous(arity: Arity, func: NativeFn) -> Self {
        NativeProcedure {
            name: OnceCell::new(),
            arity,
            func,
        }
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, TesseraError> {
        (self.func)(args)
    }
}

/// A `lambda` closed over the store it was evaluated in.
pub struct Closure {
    pub(crate) template: Arc<LambdaTemplate>,
    pub(crate) store: Store,
    name: OnceCell<String>,
}

impl Closure {
    pub(crate) fn new(template: Arc<LambdaTemplate>, store: Store) -> Self {
        let name = match &template.name {
            Some(name) => OnceCell::with_value(name.to_string()),
            None => OnceCell::new(),
        };
        Closure {
            template,
            store,
            name,
        }
    }

    pub fn arity(&self) -> Arity {
        self.template.arity()
    }
}

/// A dynamically-scoped value, rebindable with `parameterize`.
pub struct DynamicParameter {
    name: OnceCell<String>,
    default: Value,
}

impl DynamicParameter {
    pub fn new(default: Value) -> Self {
        DynamicParameter {
            name: OnceCell::new(),
            default,
        }
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }
}

/// Anything that may be applied to arguments.
#[derive(Clone)]
pub enum Procedure {
    Native(Arc<NativeProcedure>),
    Closure(Arc<Closure>),
    Parameter(Arc<DynamicParameter>),
}

impl Procedure {
    pub fn native(name: &str, arity: Arity, func: NativeFn) -> Self {
        Procedure::Native(Arc::new(NativeProcedure::new(name, arity, func)))
    }

    fn name_cell(&self) -> &OnceCell<String> {
        match self {
            Procedure::Native(p) => &p.name,
            Procedure::Closure(c) => &c.name,
            Procedure::Parameter(p) => &p.name,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name_cell().get().map(String::as_str)
    }

    /// How diagnostics refer to this procedure.
    pub fn identify(&self) -> String {
        match self.name() {
            Some(name) => format!("procedure '{name}'"),
            None => "anonymous procedure".to_string(),
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Procedure::Native(p) => p.arity,
            Procedure::Closure(c) => c.arity(),
            Procedure::Parameter(_) => Arity::exact(0),
        }
    }

    /// Names the procedure unless it already has a name.
    pub fn infer_name(&self, name: &str) {
        let _ = self.name_cell().set(name.to_string());
    }

    pub fn ptr_eq(&self, other: &Procedure) -> bool {
        match (self, other) {
            (Procedure::Native(a), Procedure::Native(b)) => Arc::ptr_eq(a, b),
            (Procedure::Closure(a), Procedure::Closure(b)) => Arc::ptr_eq(a, b),
            (Procedure::Parameter(a), Procedure::Parameter(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A procedure installed by `define_syntax` as a syntax transformer.
pub struct MacroTransformer {
    transformer: Procedure,
    name: OnceCell<String>,
}

impl MacroTransformer {
    pub fn new(transformer: Procedure) -> Self {
        let name = match transformer.name() {
            Some(name) => OnceCell::with_value(name.to_string()),
            None => OnceCell::new(),
        };
        MacroTransformer { transformer, name }
    }

    pub fn transformer(&self) -> &Procedure {
        &self.transformer
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn identify(&self) -> String {
        match self.name() {
            Some(name) => format!("macro '{name}'"),
            None => "anonymous macro".to_string(),
        }
    }
}

// ============================================================================
// SYNTACTIC FORMS
// ============================================================================

/// The core special forms exported by the kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreForm {
    Begin,
    Define,
    DefineSyntax,
    Lambda,
    Let,
    Letrec,
    If,
    Quote,
    QuoteSyntax,
    Set,
    Module,
    Require,
    Provide,
    Parameterize,
}

impl CoreForm {
    pub const ALL: [CoreForm; 14] = [
        CoreForm::Begin,
        CoreForm::Define,
        CoreForm::DefineSyntax,
        CoreForm::Lambda,
        CoreForm::Let,
        CoreForm::Letrec,
        CoreForm::If,
        CoreForm::Quote,
        CoreForm::QuoteSyntax,
        CoreForm::Set,
        CoreForm::Module,
        CoreForm::Require,
        CoreForm::Provide,
        CoreForm::Parameterize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CoreForm::Begin => "begin",
            CoreForm::Define => "define",
            CoreForm::DefineSyntax => "define_syntax",
            CoreForm::Lambda => "lambda",
            CoreForm::Let => "let",
            CoreForm::Letrec => "letrec",
            CoreForm::If => "if",
            CoreForm::Quote => "quote",
            CoreForm::QuoteSyntax => "quote_syntax",
            CoreForm::Set => "set!",
            CoreForm::Module => "module",
            CoreForm::Require => "require",
            CoreForm::Provide => "provide",
            CoreForm::Parameterize => "parameterize",
        }
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// Canonical run-time value.
#[derive(Clone, Default)]
pub enum Value {
    /// Result of forms evaluated for effect.
    #[default]
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Symbol(Symbol),
    /// Parenthesized sequence; the shape of code.
    Sexp(Vector<Value>),
    List(Vector<Value>),
    Struct(OrdMap<Arc<str>, Value>),
    Syntax(Syntax),
    Procedure(Procedure),
    Macro(Arc<MacroTransformer>),
    Form(CoreForm),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Symbol::new(s))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Sexp(_) => "sexp",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Syntax(_) => "syntax",
            Value::Procedure(_) => "procedure",
            Value::Macro(_) => "macro",
            Value::Form(_) => "syntactic form",
        }
    }

    /// `false`, `null` and void are untruthy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Void | Value::Null | Value::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_syntax(&self) -> Option<&Syntax> {
        match self {
            Value::Syntax(stx) => Some(stx),
            _ => None,
        }
    }

    /// Tags nameable values with `name` for diagnostics, if they have none yet.
    pub fn infer_name(&self, name: &str) {
        match self {
            Value::Procedure(p) => p.infer_name(name),
            Value::Macro(m) => {
                let _ = m.name.set(name.to_string());
                m.transformer.infer_name(name);
            }
            _ => {}
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Sexp(a), Value::Sexp(b)) | (Value::List(a), Value::List(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Syntax(a), Value::Syntax(b)) => a.ptr_eq(b),
            (Value::Procedure(a), Value::Procedure(b)) => a.ptr_eq(b),
            (Value::Macro(a), Value::Macro(b)) => Arc::ptr_eq(a, b),
            (Value::Form(a), Value::Form(b)) => a == b,
            _ => false,
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &Vector<Value>, sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("#<void>"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write_float(f, *x),
            Value::String(s) => write_string_literal(f, s),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Sexp(items) => {
                f.write_str("(")?;
                write_items(f, items, " ")?;
                f.write_str(")")
            }
            Value::List(items) => {
                f.write_str("[")?;
                write_items(f, items, ", ")?;
                f.write_str("]")
            }
            Value::Struct(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Syntax(stx) => write!(f, "#<syntax {stx}>"),
            Value::Procedure(p) => match p.name() {
                Some(name) => write!(f, "#<procedure {name}>"),
                None => f.write_str("#<procedure>"),
            },
            Value::Macro(m) => match m.name() {
                Some(name) => write!(f, "#<macro {name}>"),
                None => f.write_str("#<macro>"),
            },
            Value::Form(form) => write!(f, "#<syntactic form {}>", form.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_excludes_false_null_and_void() {
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Void.is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn name_inference_keeps_first_name() {
        let proc = Procedure::native("add", Arity::exact(2), Arc::new(|_| Ok(Value::Void)));
        proc.infer_name("plus");
        assert_eq!(proc.identify(), "procedure 'add'");

        let anon = Procedure::Native(Arc::new(NativeProcedure::anonymous(
            Arity::exact(0),
            Arc::new(|_| Ok(Value::Void)),
        )));
        assert_eq!(anon.identify(), "anonymous procedure");
        Value::Procedure(anon.clone()).infer_name("thunk");
        assert_eq!(anon.name(), Some("thunk"));
    }

    #[test]
    fn arity_check_reports_variability() {
        let err = Arity::at_least(1).check("procedure 'list_of'", 0).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Arity {
                variability: Variability::AtLeast,
                ..
            }
        ));
        assert!(Arity::range(1, 2).accepts(2));
        assert!(!Arity::exact(1).accepts(2));
    }

    #[test]
    fn procedures_compare_by_identity() {
        let f: NativeFn = Arc::new(|_| Ok(Value::Null));
        let a = Procedure::native("f", Arity::exact(0), f.clone());
        let b = Procedure::native("f", Arity::exact(0), f);
        assert_eq!(Value::Procedure(a.clone()), Value::Procedure(a.clone()));
        assert_ne!(Value::Procedure(a), Value::Procedure(b));
    }
}
