//! Compile-time denotations of identifiers.
//!
//! A resolved identifier yields a [`Binding`]. Namespace-level bindings go
//! through an [`NsBinding`] cell whose contents swing between
//! [`EffectiveBinding::Defined`] and [`EffectiveBinding::Required`] as the
//! namespace processes definitions and imports; the cell's name never
//! changes. All equality here is identity-based.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::runtime::namespace::{Namespace, NamespaceId};
use crate::runtime::registry::ModuleId;
use crate::syntax::{MarkSet, Symbol, Syntax};
use crate::{err_stx, TesseraError};

/// A definition owned by exactly one namespace, at a stable address.
#[derive(Debug)]
pub struct DefinedBinding {
    name: Symbol,
    address: usize,
    namespace: NamespaceId,
    module: ModuleId,
    owner: Weak<Namespace>,
}

impl DefinedBinding {
    pub(crate) fn new(
        name: Symbol,
        address: usize,
        namespace: NamespaceId,
        module: ModuleId,
        owner: Weak<Namespace>,
    ) -> Self {
        DefinedBinding {
            name,
            address,
            namespace,
            module,
            owner,
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace
    }

    /// Identity of the module (or top-level session) that owns the definition.
    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn owner(&self) -> Option<Arc<Namespace>> {
        self.owner.upgrade()
    }
}

/// A binding a module exports, under its exported name.
#[derive(Debug)]
pub struct ProvidedBinding {
    pub(crate) name: Symbol,
    pub(crate) target: Arc<DefinedBinding>,
}

impl ProvidedBinding {
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn target(&self) -> &Arc<DefinedBinding> {
        &self.target
    }
}

/// An import of another namespace's provided binding.
#[derive(Debug)]
pub struct RequiredBinding {
    pub(crate) name: Symbol,
    pub(crate) provided: Arc<ProvidedBinding>,
    /// Imports from a module's language may be shadowed by its definitions.
    pub(crate) shadowable: bool,
}

impl RequiredBinding {
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn target(&self) -> &Arc<DefinedBinding> {
        &self.provided.target
    }

    pub fn is_shadowable(&self) -> bool {
        self.shadowable
    }
}

/// The current contents of a namespace binding cell.
#[derive(Debug, Clone)]
pub enum EffectiveBinding {
    Defined(Arc<DefinedBinding>),
    Required(Arc<RequiredBinding>),
}

impl EffectiveBinding {
    pub fn target(&self) -> &Arc<DefinedBinding> {
        match self {
            EffectiveBinding::Defined(d) => d,
            EffectiveBinding::Required(r) => r.target(),
        }
    }
}

/// Stable-identity cell for one (origin binding, mark set) key of a namespace.
#[derive(Debug)]
pub struct NsBinding {
    name: Symbol,
    content: RwLock<EffectiveBinding>,
}

impl NsBinding {
    pub(crate) fn new(name: Symbol, content: EffectiveBinding) -> Self {
        NsBinding {
            name,
            content: RwLock::new(content),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn current(&self) -> EffectiveBinding {
        match self.content.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn swing(&self, content: EffectiveBinding) {
        match self.content.write() {
            Ok(mut guard) => *guard = content,
            Err(poisoned) => *poisoned.into_inner() = content,
        }
    }
}

static NEXT_RIB: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RibId(u64);

/// A variable bound by `lambda`, `let`, or `letrec`: slot `slot` of the frame
/// created for rib `rib`.
#[derive(Debug)]
pub struct LocalBinding {
    pub name: Symbol,
    pub rib: RibId,
    pub slot: usize,
}

/// What an identifier resolves to.
#[derive(Debug, Clone)]
pub enum Binding {
    Free(Symbol),
    Local(Arc<LocalBinding>),
    Namespace(Arc<NsBinding>),
}

impl Binding {
    pub fn name(&self) -> &Symbol {
        match self {
            Binding::Free(name) => name,
            Binding::Local(local) => &local.name,
            Binding::Namespace(cell) => cell.name(),
        }
    }

    /// Identity comparison; free bindings are equal when their names are.
    pub fn same_origin(&self, other: &Binding) -> bool {
        match (self, other) {
            (Binding::Free(a), Binding::Free(b)) => a == b,
            (Binding::Local(a), Binding::Local(b)) => Arc::ptr_eq(a, b),
            (Binding::Namespace(a), Binding::Namespace(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Looks through namespace cells to the binding currently in effect.
    pub fn denotation(&self) -> Denotation {
        match self {
            Binding::Free(name) => Denotation::Free(name.clone()),
            Binding::Local(local) => Denotation::Local(local.clone()),
            Binding::Namespace(cell) => match cell.current() {
                EffectiveBinding::Defined(d) => Denotation::Defined(d),
                EffectiveBinding::Required(r) => Denotation::Required(r),
            },
        }
    }
}

/// The binding kinds the compiler dispatches on.
#[derive(Debug, Clone)]
pub enum Denotation {
    Free(Symbol),
    Local(Arc<LocalBinding>),
    Defined(Arc<DefinedBinding>),
    Required(Arc<RequiredBinding>),
}

impl Denotation {
    /// The definition ultimately denoted, for namespace-level bindings.
    pub fn defined_target(&self) -> Option<&Arc<DefinedBinding>> {
        match self {
            Denotation::Defined(d) => Some(d),
            Denotation::Required(r) => Some(r.target()),
            Denotation::Free(_) | Denotation::Local(_) => None,
        }
    }

    pub fn same_target(&self, other: &Denotation) -> bool {
        match (self, other) {
            (Denotation::Free(a), Denotation::Free(b)) => a == b,
            (Denotation::Local(a), Denotation::Local(b)) => Arc::ptr_eq(a, b),
            _ => match (self.defined_target(), other.defined_target()) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
        }
    }
}

// ============================================================================
// LEXICAL RIBS
// ============================================================================

#[derive(Debug)]
struct RibEntry {
    origin: Binding,
    marks: MarkSet,
    local: Arc<LocalBinding>,
}

/// The rename table of one binding form; one frame at run time.
#[derive(Debug)]
pub struct Rib {
    id: RibId,
    entries: Vec<RibEntry>,
}

impl Rib {
    /// Builds a rib binding each identifier in `binders` to consecutive slots.
    pub fn new(binders: &[Syntax]) -> Result<(Arc<Rib>, Vec<Arc<LocalBinding>>), TesseraError> {
        let id = RibId(NEXT_RIB.fetch_add(1, Ordering::Relaxed));
        let mut entries: Vec<RibEntry> = Vec::with_capacity(binders.len());
        let mut locals = Vec::with_capacity(binders.len());
        for (slot, binder) in binders.iter().enumerate() {
            let Some(name) = binder.as_symbol() else {
                return Err(err_stx!(Syntax, binder, "expected an identifier to bind"));
            };
            let (origin, marks) = binder.resolve_with_marks();
            let origin = origin.unwrap_or_else(|| Binding::Free(name.clone()));
            let duplicate = entries
                .iter()
                .any(|e| e.local.name == *name && e.marks == marks && e.origin.same_origin(&origin));
            if duplicate {
                return Err(err_stx!(Syntax, binder, "duplicate binding of `{name}`"));
            }
            let local = Arc::new(LocalBinding {
                name: name.clone(),
                rib: id,
                slot,
            });
            locals.push(local.clone());
            entries.push(RibEntry {
                origin,
                marks,
                local,
            });
        }
        Ok((Arc::new(Rib { id, entries }), locals))
    }

    pub fn id(&self) -> RibId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The local binding for `name` when its (origin, marks) key matches.
    pub fn substitute(
        &self,
        name: &Symbol,
        origin: Option<&Binding>,
        marks: &MarkSet,
    ) -> Option<Binding> {
        self.entries
            .iter()
            .find(|e| {
                e.local.name == *name
                    && e.marks == *marks
                    && match origin {
                        Some(origin) => e.origin.same_origin(origin),
                        None => matches!(&e.origin, Binding::Free(n) if n == name),
                    }
            })
            .map(|e| Binding::Local(e.local.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Mark, Wrap};

    #[test]
    fn rib_binds_unmarked_references() {
        let x = Syntax::identifier("x");
        let (rib, locals) = Rib::new(&[x.clone()]).unwrap();
        let reference = x.add_wrap(Wrap::Rename(rib));
        match reference.resolve() {
            Some(Binding::Local(local)) => assert!(Arc::ptr_eq(&local, &locals[0])),
            other => panic!("expected a local binding, got {other:?}"),
        }
    }

    #[test]
    fn rib_ignores_differently_marked_references() {
        let m = Mark::fresh();
        let binder = Syntax::identifier("t").add_wrap(Wrap::Mark(m));
        let (rib, _) = Rib::new(&[binder]).unwrap();
        let caller_t = Syntax::identifier("t").add_wrap(Wrap::Rename(rib));
        assert!(caller_t.resolve().is_none());
    }

    #[test]
    fn duplicate_binders_are_rejected() {
        let err = Rib::new(&[Syntax::identifier("a"), Syntax::identifier("a")]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Syntax);
    }

    #[test]
    fn same_name_with_distinct_marks_is_not_a_duplicate() {
        let m = Mark::fresh();
        let binders = [
            Syntax::identifier("a"),
            Syntax::identifier("a").add_wrap(Wrap::Mark(m)),
        ];
        let (rib, locals) = Rib::new(&binders).unwrap();
        assert_eq!(rib.len(), 2);
        assert_eq!(locals[1].slot, 1);
    }
}
