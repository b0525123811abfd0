//! # Diagnostics
//!
//! The unified, `miette`-based error system for the Tessera core. Every failure
//! raised by the reader, expander, compiler, evaluator, or module system is a
//! [`TesseraError`].
//!
//! ## Error Families
//!
//! - **Syntax**: a form does not match the grammar of a special form or macro.
//! - **UnboundIdentifier**: a reference (or an import name) has no binding.
//! - **AmbiguousBinding**: a `define` or `require` would create a conflicting binding.
//! - **Arity / ArgType**: raised by applied procedures.
//! - **Contract**: an illegal operation against the core's own invariants.
//! - **Eval**: run-time failures such as reading a reserved but unset variable.
//!
//! ## Context Trail
//!
//! Expansion failures unwind through nested expansion frames. Each frame calls
//! [`TesseraError::add_context`] with its own form, so the rendered diagnostic
//! shows where the failure happened from the outermost form inward.
//!
//! ## Construction Macros
//!
//! - `err_msg!(Contract, "cannot mutate {}", name)` for message-only errors.
//! - `err_stx!(Syntax, &stx, "bad form {}", x)` for errors located at a syntax object.
//! - `err_src!(Parse, msg, &source, span)` for errors with a pre-built `NamedSource`.

use std::fmt;
use std::sync::Arc;

use miette::{Diagnostic, LabeledSpan, NamedSource, SourceCode};
use thiserror::Error;

use crate::syntax::{Span, Syntax};

pub type SourceArc = Arc<NamedSource<String>>;

type BoxedSource = Option<Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Longest rendering of a form kept in a context frame.
const MAX_FORM_TEXT: usize = 120;

/// Type-safe classification of [`TesseraError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Syntax,
    UnboundIdentifier,
    AmbiguousBinding,
    Arity,
    ArgType,
    Contract,
    Eval,
    ModuleNotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "Parse",
            ErrorKind::Syntax => "Syntax",
            ErrorKind::UnboundIdentifier => "UnboundIdentifier",
            ErrorKind::AmbiguousBinding => "AmbiguousBinding",
            ErrorKind::Arity => "Arity",
            ErrorKind::ArgType => "ArgType",
            ErrorKind::Contract => "Contract",
            ErrorKind::Eval => "Eval",
            ErrorKind::ModuleNotFound => "ModuleNotFound",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the expected argument count of an arity failure is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variability {
    Exact,
    AtLeast,
    /// Between the expected count and `max`, inclusive.
    Range { max: usize },
}

fn describe_arity(expected: &usize, variability: &Variability) -> String {
    let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
    match variability {
        Variability::Exact => format!("{expected} {}", plural(*expected)),
        Variability::AtLeast => format!("at least {expected} {}", plural(*expected)),
        Variability::Range { max } => format!("{expected} to {max} {}", plural(*max)),
    }
}

/// One step of the location trail recorded while an error unwinds.
#[derive(Debug, Clone)]
pub struct ContextFrame {
    pub form: String,
    pub span: Option<Span>,
}

/// Minimal, composable error context for diagnostics.
#[derive(Debug, Default)]
pub struct ErrorContext {
    /// The primary source for this error (if any).
    pub source: Option<SourceArc>,
    /// The primary span for this error (if any).
    pub span: Option<Span>,
    /// The offending form, rendered as text.
    pub form: Option<String>,
    /// An optional help message.
    pub help: Option<String>,
    /// Enclosing forms, innermost first, in the order they were added.
    pub trail: Vec<ContextFrame>,
}

impl ErrorContext {
    /// Returns an empty error context.
    pub fn none() -> Self {
        Self::default()
    }

    /// A context located at `stx`, recording its text as the offending form.
    pub fn for_syntax(stx: &Syntax) -> Self {
        Self {
            span: stx.span(),
            form: Some(truncate_form(stx.to_string())),
            ..Self::default()
        }
    }

    pub fn with_source_and_span(source: SourceArc, span: Span) -> Self {
        Self {
            source: Some(source),
            span: Some(span),
            ..Self::default()
        }
    }
}

fn truncate_form(mut text: String) -> String {
    if text.len() > MAX_FORM_TEXT {
        let mut cut = MAX_FORM_TEXT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(" ...");
    }
    text
}

/// Unified error type for all Tessera failure modes.
#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    #[error("Bad syntax: {message}")]
    Syntax {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    #[error("Unbound identifier: {name}")]
    UnboundIdentifier { name: String, ctx: ErrorContext },
    #[error("Ambiguous binding for `{name}`: {message}")]
    AmbiguousBinding {
        name: String,
        message: String,
        ctx: ErrorContext,
    },
    #[error("{procedure} expects {}, received {actual}", describe_arity(.expected, .variability))]
    Arity {
        procedure: String,
        expected: usize,
        variability: Variability,
        actual: usize,
        ctx: ErrorContext,
    },
    #[error("{procedure} expects {expected} as argument {position}, received {actual}")]
    ArgType {
        procedure: String,
        expected: String,
        /// Zero-based position of the offending argument.
        position: usize,
        actual: String,
        ctx: ErrorContext,
    },
    #[error("Contract violation: {message}")]
    Contract {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    #[error("Evaluation error: {message}")]
    Eval {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    #[error("Module not found: {path}")]
    ModuleNotFound { path: String, ctx: ErrorContext },
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

// ============================================================================
// CONSTRUCTORS
// ============================================================================

impl TesseraError {
    pub fn unbound(name: impl Into<String>, ctx: ErrorContext) -> Self {
        TesseraError::UnboundIdentifier {
            name: name.into(),
            ctx,
        }
    }

    pub fn ambiguous(name: impl Into<String>, message: impl Into<String>) -> Self {
        TesseraError::AmbiguousBinding {
            name: name.into(),
            message: message.into(),
            ctx: ErrorContext::none(),
        }
    }

    pub fn arity(
        procedure: impl Into<String>,
        expected: usize,
        variability: Variability,
        actual: usize,
    ) -> Self {
        TesseraError::Arity {
            procedure: procedure.into(),
            expected,
            variability,
            actual,
            ctx: ErrorContext::none(),
        }
    }

    pub fn arg_type(
        procedure: impl Into<String>,
        expected: impl Into<String>,
        position: usize,
        actual: impl Into<String>,
    ) -> Self {
        TesseraError::ArgType {
            procedure: procedure.into(),
            expected: expected.into(),
            position,
            actual: actual.into(),
            ctx: ErrorContext::none(),
        }
    }

    pub fn module_not_found(path: impl Into<String>) -> Self {
        TesseraError::ModuleNotFound {
            path: path.into(),
            ctx: ErrorContext::none(),
        }
    }

    /// Wraps `cause` as a syntax failure with the given message.
    pub fn syntax_caused_by(message: impl Into<String>, stx: &Syntax, cause: TesseraError) -> Self {
        TesseraError::Syntax {
            message: message.into(),
            ctx: ErrorContext::for_syntax(stx),
            source: Some(Box::new(cause)),
        }
    }
}

// ============================================================================
// ACCESSORS AND CONTEXT
// ============================================================================

impl TesseraError {
    fn ctx(&self) -> &ErrorContext {
        match self {
            TesseraError::Parse { ctx, .. }
            | TesseraError::Syntax { ctx, .. }
            | TesseraError::UnboundIdentifier { ctx, .. }
            | TesseraError::AmbiguousBinding { ctx, .. }
            | TesseraError::Arity { ctx, .. }
            | TesseraError::ArgType { ctx, .. }
            | TesseraError::Contract { ctx, .. }
            | TesseraError::Eval { ctx, .. }
            | TesseraError::ModuleNotFound { ctx, .. }
            | TesseraError::Internal { ctx, .. } => ctx,
        }
    }

    fn ctx_mut(&mut self) -> &mut ErrorContext {
        match self {
            TesseraError::Parse { ctx, .. }
            | TesseraError::Syntax { ctx, .. }
            | TesseraError::UnboundIdentifier { ctx, .. }
            | TesseraError::AmbiguousBinding { ctx, .. }
            | TesseraError::Arity { ctx, .. }
            | TesseraError::ArgType { ctx, .. }
            | TesseraError::Contract { ctx, .. }
            | TesseraError::Eval { ctx, .. }
            | TesseraError::ModuleNotFound { ctx, .. }
            | TesseraError::Internal { ctx, .. } => ctx,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::Parse { .. } => ErrorKind::Parse,
            TesseraError::Syntax { .. } => ErrorKind::Syntax,
            TesseraError::UnboundIdentifier { .. } => ErrorKind::UnboundIdentifier,
            TesseraError::AmbiguousBinding { .. } => ErrorKind::AmbiguousBinding,
            TesseraError::Arity { .. } => ErrorKind::Arity,
            TesseraError::ArgType { .. } => ErrorKind::ArgType,
            TesseraError::Contract { .. } => ErrorKind::Contract,
            TesseraError::Eval { .. } => ErrorKind::Eval,
            TesseraError::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            TesseraError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn span(&self) -> Option<Span> {
        self.ctx().span
    }

    /// The offending form recorded when the error was raised, if any.
    pub fn form(&self) -> Option<&str> {
        self.ctx().form.as_deref()
    }

    /// The location trail, outermost form first.
    pub fn trail(&self) -> impl Iterator<Item = &ContextFrame> {
        self.ctx().trail.iter().rev()
    }

    /// Records `stx` as an enclosing form of this failure.
    pub fn add_context(&mut self, stx: &Syntax) {
        let ctx = self.ctx_mut();
        if ctx.span.is_none() {
            ctx.span = stx.span();
        }
        ctx.trail.push(ContextFrame {
            form: truncate_form(stx.to_string()),
            span: stx.span(),
        });
    }

    /// Consuming form of [`add_context`](Self::add_context), convenient in `map_err`.
    pub fn with_context(mut self, stx: &Syntax) -> Self {
        self.add_context(stx);
        self
    }

    /// Attaches the source text the spans refer to, unless one is already present.
    pub fn with_source(mut self, source: &SourceArc) -> Self {
        let ctx = self.ctx_mut();
        if ctx.source.is_none() {
            ctx.source = Some(Arc::clone(source));
        }
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.ctx_mut().help = Some(help.into());
        self
    }

    fn label_text(&self) -> String {
        match self {
            TesseraError::Parse { message, .. }
            | TesseraError::Syntax { message, .. }
            | TesseraError::AmbiguousBinding { message, .. }
            | TesseraError::Contract { message, .. }
            | TesseraError::Eval { message, .. }
            | TesseraError::Internal { message, .. } => message.clone(),
            TesseraError::UnboundIdentifier { name, .. } => format!("`{name}` is not bound"),
            TesseraError::ModuleNotFound { path, .. } => format!("no module at {path}"),
            other => other.to_string(),
        }
    }
}

fn labeled(text: String, span: Span) -> LabeledSpan {
    let len = if span.end > span.start {
        span.end - span.start
    } else {
        1
    };
    LabeledSpan::new(Some(text), span.start, len)
}

impl Diagnostic for TesseraError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(format!("tessera::{}", self.kind())))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.ctx()
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display + 'a>)
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        self.ctx()
            .source
            .as_ref()
            .map(|s| s.as_ref() as &dyn SourceCode)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let ctx = self.ctx();
        // Spans are only meaningful against the text they were read from.
        ctx.source.as_ref()?;
        let mut labels = Vec::new();
        if let Some(span) = ctx.span {
            labels.push(labeled(self.label_text(), span));
        }
        for frame in self.trail() {
            if let Some(span) = frame.span {
                if Some(span) != ctx.span {
                    labels.push(labeled("while expanding this form".to_string(), span));
                }
            }
        }
        if labels.is_empty() {
            None
        } else {
            Some(Box::new(labels.into_iter()))
        }
    }
}

/// Converts a source string into a named source for error contexts.
pub fn to_error_source(name: &str, source: &str) -> SourceArc {
    Arc::new(NamedSource::new(name, source.to_string()))
}

/// Constructs a message-bearing [`TesseraError`] variant with no context.
#[macro_export]
macro_rules! err_msg {
    ($variant:ident, $($arg:tt)+) => {
        $crate::TesseraError::$variant {
            message: format!($($arg)+),
            ctx: $crate::ErrorContext::none(),
            source: None,
        }
    };
}

/// Constructs a message-bearing [`TesseraError`] variant located at a syntax object.
#[macro_export]
macro_rules! err_stx {
    ($variant:ident, $stx:expr, $($arg:tt)+) => {
        $crate::TesseraError::$variant {
            message: format!($($arg)+),
            ctx: $crate::ErrorContext::for_syntax($stx),
            source: None,
        }
    };
}

/// Constructs a message-bearing [`TesseraError`] variant with a pre-built `NamedSource`.
#[macro_export]
macro_rules! err_src {
    ($variant:ident, $msg:expr, $source:expr, $span:expr) => {
        $crate::TesseraError::$variant {
            message: $msg.to_string(),
            ctx: $crate::ErrorContext::with_source_and_span(std::sync::Arc::clone($source), $span),
            source: None,
        }
    };
}
