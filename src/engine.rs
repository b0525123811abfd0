//! # Runtime and Host Surface
//!
//! A [`Runtime`] owns the module registry, the module resolver and the kernel
//! instance. Hosts open [`TopLevel`] sessions on it; each session has its own
//! namespace and evaluator and sees the kernel as its language.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atoms::build_kernel;
use crate::diagnostics::{to_error_source, TesseraError};
use crate::err_msg;
use crate::macros::{declare_module, Expander};
use crate::runtime::eval::{Evaluator, Store};
use crate::runtime::namespace::{Namespace, NamespaceKind};
use crate::runtime::registry::{
    ModuleDeclaration, ModuleId, ModuleInstance, ModuleRegistry, ModuleResolver, SourceRepository,
};
use crate::runtime::Value;
use crate::syntax::parser::{read, read_one};
use crate::syntax::{Symbol, Syntax};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Runtime settings. Every field has a default, so partial YAML documents load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Id under which the kernel module is registered and required.
    pub kernel_module: String,
    /// Prefix of the module ids given to top-level namespaces.
    pub top_level_name: String,
    /// Deepest permitted nesting of macro invocations; `None` is unbounded.
    pub max_expansion_depth: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kernel_module: "#%kernel".to_string(),
            top_level_name: "top".to_string(),
            max_expansion_depth: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(text: &str) -> Result<Self, TesseraError> {
        serde_yaml::from_str(text).map_err(|e| err_msg!(Contract, "invalid runtime config: {e}"))
    }

    pub fn to_yaml(&self) -> Result<String, TesseraError> {
        serde_yaml::to_string(self).map_err(|e| err_msg!(Internal, "cannot serialize runtime config: {e}"))
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    resolver: Option<Arc<dyn ModuleResolver>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<Arc<Runtime>, TesseraError> {
        let registry = ModuleRegistry::new();
        let kernel = registry.install(build_kernel(ModuleId::new(&self.config.kernel_module))?)?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SourceRepository::new()));
        Ok(Arc::new(Runtime {
            config: self.config,
            registry,
            resolver,
            kernel,
            sessions: AtomicU64::new(0),
        }))
    }
}

/// Registry, resolver and kernel shared by every session and module.
pub struct Runtime {
    config: RuntimeConfig,
    registry: ModuleRegistry,
    resolver: Arc<dyn ModuleResolver>,
    kernel: Arc<ModuleInstance>,
    sessions: AtomicU64,
}

impl Runtime {
    /// A runtime with the default configuration and an empty source repository.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Runtime> {
        match Runtime::builder().build() {
            Ok(runtime) => runtime,
            // The kernel only binds fixed, distinct names.
            Err(e) => unreachable!("default kernel failed to build: {e}"),
        }
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn kernel(&self) -> &Arc<ModuleInstance> {
        &self.kernel
    }

    /// Opens a fresh top-level session.
    pub fn top_level(self: &Arc<Self>) -> TopLevel {
        let n = self.sessions.fetch_add(1, Ordering::Relaxed);
        let id = ModuleId::new(&format!("/{}-{n}", self.config.top_level_name));
        let namespace = Namespace::new(id, NamespaceKind::TopLevel);
        for provided in self.kernel.provided_bindings() {
            let identifier = namespace.introduce(&Syntax::identifier(provided.name().as_str()));
            // Language imports are shadowable; top-level definitions replace them.
            if let Err(e) = namespace.require(&identifier, provided, true) {
                unreachable!("fresh namespace rejected a kernel import: {e}");
            }
        }
        debug!(namespace = %namespace.module_id(), "opened top level");
        TopLevel {
            runtime: self.clone(),
            namespace,
            evaluator: Evaluator::new(),
        }
    }

    /// Maps a module path written by `requester` to a module id.
    pub fn resolve_module(&self, path: &str, requester: Option<&ModuleId>) -> Result<ModuleId, TesseraError> {
        if path == self.config.kernel_module {
            return Ok(self.kernel.id().clone());
        }
        self.resolver.resolve(path, requester)
    }

    /// Returns the instance of `id`, loading, declaring and running it first
    /// if needed.
    pub fn instantiate(&self, id: &ModuleId) -> Result<Arc<ModuleInstance>, TesseraError> {
        self.registry.instantiate_with(
            id,
            || self.load_declaration(id),
            |declaration| {
                let evaluator = Evaluator::new();
                let store = Store::top(declaration.namespace.clone());
                for form in &declaration.body {
                    evaluator.eval(form, &store)?;
                }
                Ok(())
            },
        )
    }

    /// Reads the source of `id` from the resolver and expands it.
    fn load_declaration(&self, id: &ModuleId) -> Result<Arc<ModuleDeclaration>, TesseraError> {
        let Some(source) = self.resolver.load(id)? else {
            return Err(TesseraError::module_not_found(id.as_str()));
        };
        debug!(module = %id, bytes = source.len(), "loaded module source");
        let named = to_error_source(id.as_str(), &source);
        let body = read(&source, id.as_str()).map_err(|e| e.with_source(&named))?;
        declare_module(self, id.clone(), body).map_err(|e| e.with_source(&named))
    }

    /// Makes every kernel binding visible in a module namespace, shadowable by
    /// the module's own definitions.
    pub(crate) fn require_language(&self, namespace: &Namespace) -> Result<(), TesseraError> {
        for provided in self.kernel.provided_bindings() {
            let identifier = namespace.introduce(&Syntax::identifier(provided.name().as_str()));
            namespace.require(&identifier, provided, true)?;
        }
        Ok(())
    }
}

// ============================================================================
// TOP-LEVEL SESSIONS
// ============================================================================

/// One interactive top level: a namespace plus the evaluator that runs in it.
pub struct TopLevel {
    runtime: Arc<Runtime>,
    namespace: Arc<Namespace>,
    evaluator: Evaluator,
}

impl TopLevel {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    fn expander(&self) -> Expander<'_> {
        Expander::new(&self.runtime, self.namespace.clone(), &self.evaluator)
    }

    /// Reads and evaluates every form in `source`, returning the last value.
    pub fn eval_str(&self, source: &str) -> Result<Value, TesseraError> {
        let named = to_error_source("<top-level>", source);
        let forms = read(source, "<top-level>").map_err(|e| e.with_source(&named))?;
        let mut result = Value::Void;
        for form in &forms {
            result = self.eval(form).map_err(|e| e.with_source(&named))?;
        }
        Ok(result)
    }

    pub fn eval(&self, form: &Syntax) -> Result<Value, TesseraError> {
        evaluate_top_level_form(self, form, true)
    }

    /// Evaluates syntax that already carries this namespace's context, such as
    /// a syntax object returned by a transformer, without introducing it again.
    pub fn eval_in_context(&self, form: &Syntax) -> Result<Value, TesseraError> {
        evaluate_top_level_form(self, form, false)
    }

    /// Fully expands `form` without compiling or running it.
    pub fn expand(&self, form: &Syntax) -> Result<Syntax, TesseraError> {
        self.expander().expand_top_level(form)
    }

    pub fn expand_str(&self, source: &str) -> Result<Syntax, TesseraError> {
        self.expand(&read_one(source)?)
    }

    pub fn define(&self, name: &str, value: Value) -> Result<(), TesseraError> {
        define_in_namespace(self, name, value)
    }

    pub fn require_module(&self, path: &str) -> Result<(), TesseraError> {
        require_module(self, path)
    }

    pub fn lookup(&self, name: &str) -> Result<Value, TesseraError> {
        self.namespace.lookup_name(&Symbol::new(name))
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, TesseraError> {
        lookup_and_call(self, name, args)
    }
}

// ============================================================================
// HOST SURFACE
// ============================================================================

/// Expands, compiles and evaluates one top-level form in `top`. Unless
/// `introduce` is false the form first receives the namespace's context.
pub fn evaluate_top_level_form(top: &TopLevel, form: &Syntax, introduce: bool) -> Result<Value, TesseraError> {
    top.expander().eval_top_level(form, introduce)
}

/// Defines `name` in the namespace of `top`, as a top-level `define` would.
pub fn define_in_namespace(top: &TopLevel, name: &str, value: Value) -> Result<(), TesseraError> {
    top.namespace.define_value(name, value)
}

/// Imports every binding the module at `path` provides into `top`.
pub fn require_module(top: &TopLevel, path: &str) -> Result<(), TesseraError> {
    let runtime = &top.runtime;
    let id = runtime.resolve_module(path, Some(top.namespace.module_id()))?;
    let instance = runtime.instantiate(&id)?;
    for provided in instance.provided_bindings() {
        let identifier = top
            .namespace
            .introduce(&Syntax::identifier(provided.name().as_str()));
        top.namespace.require(&identifier, provided, false)?;
    }
    Ok(())
}

/// Applies the procedure bound to `name` in `top` to `args`.
pub fn lookup_and_call(top: &TopLevel, name: &str, args: Vec<Value>) -> Result<Value, TesseraError> {
    let procedure = top.lookup(name)?;
    top.evaluator.apply(&procedure, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;

    #[test]
    fn config_defaults_fill_partial_yaml() {
        let config = RuntimeConfig::from_yaml("max_expansion_depth: 50\n").unwrap();
        assert_eq!(config.max_expansion_depth, Some(50));
        assert_eq!(config.kernel_module, "#%kernel");
        let back = RuntimeConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn bad_config_is_a_contract_failure() {
        let err = RuntimeConfig::from_yaml("max_expansion_depth: lots").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Contract);
    }

    #[test]
    fn sessions_get_distinct_namespaces() {
        let runtime = Runtime::new();
        let a = runtime.top_level();
        let b = runtime.top_level();
        assert_ne!(a.namespace().module_id(), b.namespace().module_id());
        a.eval_str("(define x 1)").unwrap();
        assert_eq!(b.lookup("x").unwrap_err().kind(), ErrorKind::UnboundIdentifier);
    }

    #[test]
    fn host_definitions_are_callable() {
        let runtime = Runtime::new();
        let top = runtime.top_level();
        top.eval_str("(define (twice x) (* 2 x))").unwrap();
        assert_eq!(top.call("twice", vec![Value::Int(21)]).unwrap(), Value::Int(42));
        top.define("seven", Value::Int(7)).unwrap();
        assert_eq!(top.eval_str("(twice seven)").unwrap(), Value::Int(14));
    }

    #[test]
    fn modules_load_through_the_resolver() {
        let repository = SourceRepository::new()
            .with_module("/lib/util", "(define (inc x) (+ x 1)) (provide inc)")
            .unwrap();
        let runtime = Runtime::builder().resolver(Arc::new(repository)).build().unwrap();
        let top = runtime.top_level();
        top.require_module("lib/util").unwrap();
        assert_eq!(top.eval_str("(inc 41)").unwrap(), Value::Int(42));
        assert!(runtime.registry().instance(&ModuleId::new("/lib/util")).is_some());
    }

    #[test]
    fn unknown_module_is_not_found() {
        let runtime = Runtime::new();
        let top = runtime.top_level();
        let err = top.require_module("nowhere").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    }

    #[test]
    fn expansion_depth_limit_stops_runaway_macros() {
        let config = RuntimeConfig {
            max_expansion_depth: Some(64),
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::builder().config(config).build().unwrap();
        let top = runtime.top_level();
        top.eval_str("(define_syntax forever (lambda (stx) stx))").unwrap();
        let err = top.eval_str("(forever)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }
}
