pub use crate::diagnostics::{to_error_source, ErrorContext, ErrorKind, SourceArc, TesseraError, Variability};
pub use crate::engine::{Runtime, RuntimeBuilder, RuntimeConfig, TopLevel};
pub use crate::runtime::registry::{ModuleId, ModuleResolver, SourceRepository};
pub use crate::runtime::{Arity, Procedure, Value};
pub use crate::syntax::{Span, Symbol, Syntax};

pub mod atoms;
pub mod compiler;
pub mod diagnostics;
pub mod engine;
pub mod macros;
pub mod runtime;
pub mod syntax;
