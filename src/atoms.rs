//! # Kernel Module
//!
//! The kernel is the language every namespace starts from. It binds the core
//! syntactic forms as ordinary values, so user code can shadow or rename them
//! like any other binding, alongside a small library of primitive procedures.
//!
//! ## Module Structure
//!
//! - **`helpers`**: argument extraction and error construction shared by all primitives
//! - **`math`**: arithmetic and numeric comparison
//! - **`collections`**: sequence and struct construction and access
//! - **`syntax`**: syntax-object procedures used by macro transformers
//!
//! Every primitive has the same [`PrimitiveFn`] signature and is registered with
//! a fixed [`Arity`], which the evaluator checks before the call.

use std::sync::Arc;

use tracing::debug;

use crate::diagnostics::TesseraError;
use crate::runtime::binding::ProvidedBinding;
use crate::runtime::namespace::{Namespace, NamespaceKind};
use crate::runtime::registry::{ModuleDeclaration, ModuleId};
use crate::runtime::{Arity, CoreForm, Procedure, Value};

pub mod collections;
pub mod helpers;
pub mod math;
pub mod syntax;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Primitive procedures operate on already-evaluated arguments only.
pub type PrimitiveFn = fn(args: &[Value]) -> Result<Value, TesseraError>;

/// Primitives collected for installation into the kernel namespace.
#[derive(Default)]
pub struct PrimitiveTable {
    entries: Vec<(&'static str, Arity, PrimitiveFn)>,
}

impl PrimitiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, arity: Arity, func: PrimitiveFn) {
        self.entries.push((name, arity, func));
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _, _)| *n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds every registered primitive in `namespace`.
    pub fn install(&self, namespace: &Namespace) -> Result<(), TesseraError> {
        for (name, arity, func) in &self.entries {
            let procedure = Procedure::native(name, *arity, Arc::new(*func));
            namespace.define_value(name, Value::Procedure(procedure))?;
        }
        Ok(())
    }
}

// ============================================================================
// REGISTRATION
// ============================================================================

pub fn register_all_primitives(table: &mut PrimitiveTable) {
    math::register_math_primitives(table);
    collections::register_collection_primitives(table);
    syntax::register_syntax_primitives(table);
}

/// Declares the kernel module under `id`. It provides every core form and
/// every primitive; its body is empty.
pub fn build_kernel(id: ModuleId) -> Result<Arc<ModuleDeclaration>, TesseraError> {
    let namespace = Namespace::new(id.clone(), NamespaceKind::Module);
    for form in CoreForm::ALL {
        namespace.define_value(form.name(), Value::Form(form))?;
    }
    let mut table = PrimitiveTable::new();
    register_all_primitives(&mut table);
    table.install(&namespace)?;

    let provides: Vec<_> = namespace
        .unmarked_definitions()
        .into_iter()
        .map(|target| {
            Arc::new(ProvidedBinding {
                name: target.name().clone(),
                target,
            })
        })
        .collect();
    debug!(module = %id, provided = provides.len(), "kernel declared");
    Ok(Arc::new(ModuleDeclaration {
        id,
        namespace,
        body: Vec::new(),
        provides,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_provides_forms_and_primitives() {
        let kernel = build_kernel(ModuleId::new("#%kernel")).unwrap();
        let names: Vec<&str> = kernel.provides.iter().map(|p| p.name().as_str()).collect();
        for form in CoreForm::ALL {
            assert!(names.contains(&form.name()), "missing {}", form.name());
        }
        for primitive in ["+", "list", "syntax_subforms", "make_parameter"] {
            assert!(names.contains(&primitive), "missing {primitive}");
        }
    }

    #[test]
    fn primitive_names_are_unique() {
        let mut table = PrimitiveTable::new();
        register_all_primitives(&mut table);
        let mut names: Vec<_> = table.entries.iter().map(|(n, _, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), table.len());
    }

    #[test]
    fn every_primitive_family_is_registered() {
        let mut table = PrimitiveTable::new();
        register_all_primitives(&mut table);
        for name in ["/", "<=", "not", "struct", "elt", "error", "datum_to_syntax", "free_identifier_equal"] {
            assert!(table.has(name), "missing {name}");
        }
        assert!(!table.has("lambda"));
    }
}
