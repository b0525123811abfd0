//! # Macro Expansion
//!
//! The [`Expander`] drives syntax to core forms. It operates in three
//! [`ExpandContext`]s and in two depths:
//!
//! - **Partial expansion** rewrites only the head of a form, invoking macros
//!   until the form is a core form or an application. Top-level and module
//!   bodies use it to splice `begin` and to recognize definitions early.
//! - **Full expansion** repeats the same dispatch at every level until only
//!   core forms remain.
//!
//! ## Hygiene
//!
//! Each transformer invocation draws a fresh mark, wraps the input with it,
//! and wraps the transformer's output with it again. Identifiers that came
//! from the input carry the mark twice and it cancels; identifiers the
//! transformer introduced carry it once and stay distinct from anything the
//! caller wrote.
//!
//! ## Depth
//!
//! Expansion is unbounded by default. When
//! [`RuntimeConfig::max_expansion_depth`](crate::engine::RuntimeConfig) is
//! set, nesting past it is a syntax failure.

pub mod forms;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::compiler::compile;
use crate::engine::Runtime;
use crate::runtime::binding::ProvidedBinding;
use crate::runtime::eval::{Evaluator, Store};
use crate::runtime::namespace::{Namespace, NamespaceKind};
use crate::runtime::registry::{ModuleDeclaration, ModuleId};
use crate::runtime::{CoreForm, MacroTransformer, Value};
use crate::syntax::{Mark, Syntax, SyntaxDatum, Wrap};
use crate::{err_stx, TesseraError};

use self::forms::head_value;

/// Where a form is being expanded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpandContext {
    TopLevel,
    ModuleBody,
    Expression,
}

impl ExpandContext {
    pub fn allows_definitions(self) -> bool {
        self != ExpandContext::Expression
    }
}

/// Result of partially expanding one body form.
pub(crate) enum Partial {
    /// A core `begin`; its subforms replace it in the body.
    Splice(Vec<Syntax>),
    /// Anything else, with the core form it denotes if it is one.
    Form(Syntax, Option<CoreForm>),
}

/// Expansion state for one namespace.
pub struct Expander<'r> {
    runtime: &'r Runtime,
    namespace: Arc<Namespace>,
    evaluator: &'r Evaluator,
    depth: Cell<usize>,
    provides: RefCell<Vec<Arc<ProvidedBinding>>>,
}

struct DepthGuard<'a> {
    depth: &'a Cell<usize>,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

impl<'r> Expander<'r> {
    pub fn new(runtime: &'r Runtime, namespace: Arc<Namespace>, evaluator: &'r Evaluator) -> Self {
        Expander {
            runtime,
            namespace,
            evaluator,
            depth: Cell::new(0),
            provides: RefCell::new(Vec::new()),
        }
    }

    pub fn runtime(&self) -> &'r Runtime {
        self.runtime
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn evaluator(&self) -> &'r Evaluator {
        self.evaluator
    }

    /// An identifier naming `name` in the kernel, whatever the surrounding context.
    pub fn kernel_identifier(&self, name: &str, site: &Syntax) -> Syntax {
        Syntax::new(SyntaxDatum::Symbol(name.into()), site.span())
            .add_wrap(self.runtime.kernel().namespace().module_rename_wrap())
    }

    fn descend(&self, form: &Syntax) -> Result<DepthGuard<'_>, TesseraError> {
        let depth = self.depth.get() + 1;
        if let Some(limit) = self.runtime.config().max_expansion_depth {
            if depth > limit {
                return Err(err_stx!(
                    Syntax,
                    form,
                    "expansion exceeded the configured depth limit of {limit}"
                ));
            }
        }
        self.depth.set(depth);
        Ok(DepthGuard { depth: &self.depth })
    }

    pub(crate) fn record_provide(&self, provided: Arc<ProvidedBinding>) {
        self.provides.borrow_mut().push(provided);
    }

    fn take_provides(&self) -> Vec<Arc<ProvidedBinding>> {
        std::mem::take(&mut *self.provides.borrow_mut())
    }
}

// ============================================================================
// TRANSFORMER INVOCATION
// ============================================================================

impl Expander<'_> {
    /// Runs `transformer` on `form` with a fresh hygiene mark.
    pub fn invoke(&self, transformer: &MacroTransformer, form: &Syntax) -> Result<Syntax, TesseraError> {
        let mark = Mark::fresh();
        debug!(transformer = %transformer.identify(), ?mark, "invoking macro");
        let input = form.add_wrap(Wrap::Mark(mark));
        let procedure = Value::Procedure(transformer.transformer().clone());
        match self.evaluator.apply(&procedure, vec![Value::Syntax(input)]) {
            Ok(Value::Syntax(output)) => Ok(output.add_wrap(Wrap::Mark(mark))),
            Ok(other) => Err(err_stx!(
                Syntax,
                form,
                "{} returned {} instead of a syntax object",
                transformer.identify(),
                other.type_name()
            )),
            Err(e @ TesseraError::Syntax { .. }) => Err(e.with_context(form)),
            Err(cause) => Err(TesseraError::syntax_caused_by(
                format!("Error expanding macro {}: {cause}", transformer.identify()),
                form,
                cause,
            )),
        }
    }

    /// Expands the head of `form` until it is a core form or an application.
    pub(crate) fn partial_expand(&self, form: Syntax) -> Result<Partial, TesseraError> {
        let mut form = form;
        let mut _chain = Vec::new();
        loop {
            let head = match form.subforms() {
                Some(parts) if !parts.is_empty() => parts[0].clone(),
                _ => return Ok(Partial::Form(form, None)),
            };
            match head_value(&self.namespace, &head) {
                Some(Value::Macro(transformer)) => {
                    _chain.push(self.descend(&form)?);
                    form = self.invoke(&transformer, &form)?;
                }
                Some(Value::Form(CoreForm::Begin)) => {
                    let parts = form.subforms().unwrap_or_default();
                    return Ok(Partial::Splice(parts[1..].to_vec()));
                }
                Some(Value::Form(core)) => return Ok(Partial::Form(form, Some(core))),
                _ => return Ok(Partial::Form(form, None)),
            }
        }
    }
}

// ============================================================================
// FULL EXPANSION
// ============================================================================

impl Expander<'_> {
    /// Fully expands `form`; the result contains only core forms and applications.
    pub fn expand(&self, form: &Syntax, ctx: ExpandContext) -> Result<Syntax, TesseraError> {
        let _depth = self.descend(form)?;
        self.expand_form(form, ctx).map_err(|e| e.with_context(form))
    }

    fn expand_form(&self, form: &Syntax, ctx: ExpandContext) -> Result<Syntax, TesseraError> {
        match form.datum() {
            SyntaxDatum::Symbol(name) => match head_value(&self.namespace, form) {
                Some(Value::Form(core)) => Err(err_stx!(
                    Syntax,
                    form,
                    "`{name}` is the syntactic form {} and cannot be used as an expression",
                    core.name()
                )),
                Some(Value::Macro(m)) => Err(err_stx!(
                    Syntax,
                    form,
                    "{} cannot be used as an expression",
                    m.identify()
                )),
                _ => Ok(form.clone()),
            },
            SyntaxDatum::Sexp(_) => self.expand_sexp(form.clone(), ctx),
            SyntaxDatum::List(_) => {
                let elements = form.list_elements().unwrap_or_default();
                Ok(form.rebuild_list(self.expand_all(&elements)?))
            }
            SyntaxDatum::Struct(_) => {
                let mut fields = Vec::new();
                for (key, value) in form.struct_fields().unwrap_or_default() {
                    fields.push((key, self.expand(&value, ExpandContext::Expression)?));
                }
                Ok(form.rebuild_struct(fields))
            }
            _ => Ok(form.clone()),
        }
    }

    fn expand_sexp(&self, form: Syntax, ctx: ExpandContext) -> Result<Syntax, TesseraError> {
        let mut form = form;
        let mut _chain = Vec::new();
        loop {
            let parts = form.subforms().unwrap_or_default();
            let Some(head) = parts.first() else {
                return Err(err_stx!(Syntax, &form, "empty form is not an expression"));
            };
            match head_value(&self.namespace, head) {
                Some(Value::Macro(transformer)) => {
                    _chain.push(self.descend(&form)?);
                    form = self.invoke(&transformer, &form)?;
                    if !form.is_sexp() {
                        return self.expand_form(&form, ctx);
                    }
                }
                Some(Value::Form(core)) => return forms::expand_core(self, core, &form, &parts, ctx),
                _ => return Ok(form.rebuild_sexp(self.expand_all(&parts)?)),
            }
        }
    }

    /// Expands each form in expression context.
    pub fn expand_all(&self, forms: &[Syntax]) -> Result<Vec<Syntax>, TesseraError> {
        forms
            .iter()
            .map(|f| self.expand(f, ExpandContext::Expression))
            .collect()
    }
}

// ============================================================================
// TOP LEVEL AND MODULE BODIES
// ============================================================================

impl Expander<'_> {
    /// Expands, compiles and evaluates one top-level form, splicing `begin`s so
    /// that each spliced form runs before the next is expanded.
    ///
    /// With `introduce` unset the form keeps exactly the context it carries,
    /// as for syntax a macro already produced in this namespace.
    pub fn eval_top_level(&self, form: &Syntax, introduce: bool) -> Result<Value, TesseraError> {
        let store = Store::top(self.namespace.clone());
        let form = if introduce {
            self.namespace.introduce(form)
        } else {
            form.clone()
        };
        let mut queue = VecDeque::from([form]);
        let mut result = Value::Void;
        while let Some(form) = queue.pop_front() {
            match self.partial_expand(form)? {
                Partial::Splice(children) => {
                    for child in children.into_iter().rev() {
                        queue.push_front(child);
                    }
                }
                Partial::Form(form, _) => {
                    let expanded = self.expand(&form, ExpandContext::TopLevel)?;
                    let compiled = compile(&self.namespace, &expanded)?;
                    result = self.evaluator.eval(&compiled, &store)?;
                }
            }
        }
        Ok(result)
    }

    /// Expands a top-level form without compiling or evaluating it.
    pub fn expand_top_level(&self, form: &Syntax) -> Result<Syntax, TesseraError> {
        self.expand(&self.namespace.introduce(form), ExpandContext::TopLevel)
    }
}

/// Expands and compiles `body` as the module `id`, whose language is the kernel.
///
/// Pass one partially expands every form: `begin`s are spliced, `define`d
/// names are reserved, and `require` and `define_syntax` take effect at once.
/// Pass two fully expands and compiles what remains, so forward references
/// between module-level definitions resolve.
///
/// The caller holds the [`LoadingGuard`](crate::runtime::registry::LoadingGuard) for `id`.
pub fn declare_module(
    runtime: &Runtime,
    id: ModuleId,
    body: Vec<Syntax>,
) -> Result<Arc<ModuleDeclaration>, TesseraError> {
    let namespace = Namespace::new(id.clone(), NamespaceKind::Module);
    runtime.require_language(&namespace)?;
    let evaluator = Evaluator::new();
    let expander = Expander::new(runtime, namespace.clone(), &evaluator);
    let store = Store::top(namespace.clone());

    let mut queue: VecDeque<Syntax> = body.iter().map(|f| namespace.introduce(f)).collect();
    let mut pending = Vec::new();
    while let Some(form) = queue.pop_front() {
        match expander.partial_expand(form)? {
            Partial::Splice(children) => {
                for child in children.into_iter().rev() {
                    queue.push_front(child);
                }
            }
            Partial::Form(form, Some(CoreForm::Define)) => {
                pending.push(forms::predefine_definition(&expander, &form)?);
            }
            Partial::Form(form, Some(CoreForm::DefineSyntax)) => {
                let expanded = expander.expand(&form, ExpandContext::ModuleBody)?;
                let compiled = compile(&namespace, &expanded)?;
                evaluator.eval(&compiled, &store)?;
            }
            Partial::Form(form, Some(CoreForm::Require)) => {
                expander.expand(&form, ExpandContext::ModuleBody)?;
            }
            Partial::Form(form, _) => pending.push(form),
        }
    }

    let mut compiled = Vec::with_capacity(pending.len());
    for form in &pending {
        let expanded = expander.expand(form, ExpandContext::ModuleBody)?;
        compiled.push(compile(&namespace, &expanded)?);
    }
    debug!(module = %id, definitions = namespace.definition_count(), "module expanded");
    Ok(Arc::new(ModuleDeclaration {
        id,
        namespace,
        body: compiled,
        provides: expander.take_provides(),
    }))
}
