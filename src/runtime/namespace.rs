//! # Namespaces
//!
//! A [`Namespace`] is the compile- and run-time environment of one top-level
//! session or one module. It owns:
//!
//! - an append-only address space; every `define` takes the next address,
//!   redefinitions included, and addresses are never reused;
//! - a value store indexed by address, grown on demand;
//! - a binding table from (origin binding, mark set) to [`NsBinding`] cells;
//! - an import table giving compact ids to the namespaces it references.
//!
//! ## Policies
//!
//! | | top level | module |
//! |---|---|---|
//! | free reference | dynamic lookup by name at run time | `UnboundIdentifier` at compile time |
//! | `define` over a definition | new address | `AmbiguousBinding` |
//! | `define` over a language import | new address | new address |
//! | `define` over an explicit import | new address | `AmbiguousBinding` |
//!
//! In both kinds, an import over a definition, or over a different import,
//! is an `AmbiguousBinding` failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, trace};

use crate::diagnostics::ErrorContext;
use crate::runtime::binding::{
    Binding, DefinedBinding, EffectiveBinding, NsBinding, ProvidedBinding, RequiredBinding,
};
use crate::runtime::registry::ModuleId;
use crate::runtime::Value;
use crate::syntax::{MarkSet, Symbol, Syntax, Wrap};
use crate::{err_msg, err_stx, TesseraError};

static NEXT_NAMESPACE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceId(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NamespaceKind {
    TopLevel,
    Module,
}

struct NsEntry {
    origin: Binding,
    marks: MarkSet,
    cell: Arc<NsBinding>,
}

#[derive(Default)]
struct BindingTable {
    entries: HashMap<Symbol, Vec<NsEntry>>,
    definition_count: usize,
}

impl BindingTable {
    fn find(&self, name: &Symbol, origin: &Binding, marks: &MarkSet) -> Option<Arc<NsBinding>> {
        self.entries.get(name).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.marks == *marks && e.origin.same_origin(origin))
                .map(|e| e.cell.clone())
        })
    }

    fn insert(&mut self, name: &Symbol, origin: Binding, marks: MarkSet, cell: Arc<NsBinding>) {
        self.entries
            .entry(name.clone())
            .or_default()
            .push(NsEntry {
                origin,
                marks,
                cell,
            });
    }
}

#[derive(Default)]
struct ImportTable {
    ids: HashMap<ModuleId, usize>,
    namespaces: Vec<Arc<Namespace>>,
}

/// One top-level session's or module's bindings and values.
pub struct Namespace {
    id: NamespaceId,
    module: ModuleId,
    kind: NamespaceKind,
    self_ref: Weak<Namespace>,
    table: RwLock<BindingTable>,
    values: RwLock<Vec<Option<Value>>>,
    imports: Mutex<ImportTable>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .finish()
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

impl Namespace {
    pub fn new(module: ModuleId, kind: NamespaceKind) -> Arc<Namespace> {
        let id = NamespaceId(NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed));
        debug!(?id, %module, ?kind, "creating namespace");
        Arc::new_cyclic(|self_ref| Namespace {
            id,
            module,
            kind,
            self_ref: self_ref.clone(),
            table: RwLock::new(BindingTable::default()),
            values: RwLock::new(Vec::new()),
            imports: Mutex::new(ImportTable::default()),
        })
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn module_id(&self) -> &ModuleId {
        &self.module
    }

    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    /// Whether free references compile to run-time name lookups.
    pub fn allows_free_references(&self) -> bool {
        self.kind == NamespaceKind::TopLevel
    }

    /// The wrap giving syntax visibility of this namespace's bindings.
    pub fn wrap(&self) -> Wrap {
        Wrap::Namespace {
            id: self.id,
            ns: self.self_ref.clone(),
        }
    }

    /// The wrap renaming free identifiers into this namespace's bindings,
    /// whatever other context the syntax carries.
    pub fn module_rename_wrap(&self) -> Wrap {
        Wrap::ModuleRename {
            id: self.id,
            ns: self.self_ref.clone(),
        }
    }

    pub fn introduce(&self, stx: &Syntax) -> Syntax {
        stx.add_wrap(self.wrap())
    }

    /// Number of addresses allocated so far.
    pub fn definition_count(&self) -> usize {
        self.read_table().definition_count
    }

    fn read_table(&self) -> RwLockReadGuard<'_, BindingTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, BindingTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// BINDING RESOLUTION AND MUTATION
// ============================================================================

impl Namespace {
    /// Wrap-level substitution: the cell for `name` whose key matches the
    /// identifier's complete marks, or failing that the marks accumulated at
    /// the wrap's position.
    pub fn substitute(
        &self,
        name: &Symbol,
        origin: Option<&Binding>,
        total: &MarkSet,
        here: &MarkSet,
    ) -> Option<Binding> {
        let origin = origin
            .cloned()
            .unwrap_or_else(|| Binding::Free(name.clone()));
        let table = self.read_table();
        table
            .find(name, &origin, total)
            .or_else(|| {
                if total == here {
                    None
                } else {
                    table.find(name, &origin, here)
                }
            })
            .map(Binding::Namespace)
    }

    /// The binding a plain, unmarked identifier `name` has in this namespace.
    pub fn resolve_name(&self, name: &str) -> Option<Binding> {
        let empty = MarkSet::new();
        self.substitute(&Symbol::new(name), None, &empty, &empty)
    }

    /// Reserves a fresh address for `identifier` and returns a copy of it
    /// carrying the resulting binding.
    pub fn predefine(&self, identifier: &Syntax) -> Result<Syntax, TesseraError> {
        let Some(name) = identifier.as_symbol().cloned() else {
            return Err(err_stx!(Syntax, identifier, "expected an identifier to define"));
        };
        let (origin, marks) = identifier.resolve_outside(self.id);
        let mut table = self.write_table();
        let existing = table.find(&name, &origin, &marks);
        if let Some(cell) = &existing {
            self.check_redefine(&cell.current(), &name, identifier)?;
        }

        let address = table.definition_count;
        table.definition_count += 1;
        let defined = Arc::new(DefinedBinding::new(
            name.clone(),
            address,
            self.id,
            self.module.clone(),
            self.self_ref.clone(),
        ));
        let cell = match existing {
            Some(cell) => {
                debug!(%name, address, module = %self.module, "redefining");
                cell.swing(EffectiveBinding::Defined(defined));
                cell
            }
            None => {
                trace!(%name, address, module = %self.module, "predefining");
                let cell = Arc::new(NsBinding::new(
                    name.clone(),
                    EffectiveBinding::Defined(defined),
                ));
                table.insert(&name, origin, marks, cell.clone());
                cell
            }
        };
        Ok(identifier.with_binding(Binding::Namespace(cell)))
    }

    fn check_redefine(
        &self,
        current: &EffectiveBinding,
        name: &Symbol,
        identifier: &Syntax,
    ) -> Result<(), TesseraError> {
        if self.kind == NamespaceKind::TopLevel {
            return Ok(());
        }
        let message = match current {
            EffectiveBinding::Defined(_) => "duplicate definition in module".to_string(),
            EffectiveBinding::Required(r) if r.is_shadowable() => return Ok(()),
            EffectiveBinding::Required(r) => format!(
                "definition conflicts with the import from {}",
                r.target().module()
            ),
        };
        Err(TesseraError::AmbiguousBinding {
            name: name.to_string(),
            message,
            ctx: ErrorContext::for_syntax(identifier),
        })
    }

    /// Installs an import of `provided` under `identifier`.
    pub fn require(
        &self,
        identifier: &Syntax,
        provided: &Arc<ProvidedBinding>,
        shadowable: bool,
    ) -> Result<(), TesseraError> {
        let Some(name) = identifier.as_symbol().cloned() else {
            return Err(err_stx!(Syntax, identifier, "expected an identifier to import"));
        };
        let (origin, marks) = identifier.resolve_outside(self.id);
        let required = || {
            EffectiveBinding::Required(Arc::new(RequiredBinding {
                name: name.clone(),
                provided: provided.clone(),
                shadowable,
            }))
        };

        let mut table = self.write_table();
        let Some(cell) = table.find(&name, &origin, &marks) else {
            trace!(%name, from = %provided.target().module(), "importing");
            let cell = Arc::new(NsBinding::new(name.clone(), required()));
            table.insert(&name, origin, marks, cell);
            return Ok(());
        };

        let conflict = match cell.current() {
            EffectiveBinding::Defined(d) => format!(
                "import from {} would shadow the definition in {}",
                provided.target().module(),
                d.module()
            ),
            EffectiveBinding::Required(r) if Arc::ptr_eq(r.target(), provided.target()) => {
                if r.is_shadowable() && !shadowable {
                    cell.swing(required());
                }
                return Ok(());
            }
            EffectiveBinding::Required(r) if r.is_shadowable() => {
                debug!(%name, from = %provided.target().module(), "import replaces language binding");
                cell.swing(required());
                return Ok(());
            }
            EffectiveBinding::Required(r) => format!(
                "imported from both {} and {}",
                r.target().module(),
                provided.target().module()
            ),
        };
        Err(TesseraError::AmbiguousBinding {
            name: name.to_string(),
            message: conflict,
            ctx: ErrorContext::for_syntax(identifier),
        })
    }

    /// Every definition visible under an unmarked name, for `all_defined_out`.
    pub fn unmarked_definitions(&self) -> Vec<Arc<DefinedBinding>> {
        let table = self.read_table();
        let mut found: Vec<Arc<DefinedBinding>> = table
            .entries
            .values()
            .flatten()
            .filter(|e| e.marks.is_empty() && matches!(e.origin, Binding::Free(_)))
            .filter_map(|e| match e.cell.current() {
                EffectiveBinding::Defined(d) => Some(d),
                EffectiveBinding::Required(_) => None,
            })
            .collect();
        found.sort_by_key(|d| d.address());
        found
    }
}

// ============================================================================
// VALUE STORE
// ============================================================================

impl Namespace {
    /// Stores `value` for `defined`, naming it after the binding if it is nameless.
    pub fn bind(&self, defined: &DefinedBinding, value: Value) -> Result<(), TesseraError> {
        if defined.namespace_id() != self.id {
            return Err(err_msg!(
                Contract,
                "cannot bind `{}`: it belongs to {}",
                defined.name(),
                defined.module()
            ));
        }
        value.infer_name(defined.name().as_str());
        self.set(defined.address(), value);
        Ok(())
    }

    /// Writes the slot at `address`, growing the store as needed.
    pub fn set(&self, address: usize, value: Value) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.len() <= address {
            values.resize(address + 1, None);
        }
        values[address] = Some(value);
    }

    /// Soft lookup: `None` while the address has no value.
    pub fn lookup_definition(&self, address: usize) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(address).cloned().flatten()
    }

    /// Hard lookup used by compiled references.
    pub fn lookup_address(&self, address: usize, name: &Symbol) -> Result<Value, TesseraError> {
        self.lookup_definition(address).ok_or_else(|| {
            err_msg!(
                Eval,
                "`{}` in {} was referenced before its definition was evaluated",
                name,
                self.module
            )
        })
    }

    /// Soft lookup of whatever value `binding` currently denotes.
    pub fn lookup(&self, binding: &Binding) -> Option<Value> {
        let target = binding.denotation().defined_target()?.clone();
        if target.namespace_id() == self.id {
            return self.lookup_definition(target.address());
        }
        target.owner()?.lookup_definition(target.address())
    }

    /// Run-time lookup of an unmarked top-level name.
    pub fn lookup_name(&self, name: &Symbol) -> Result<Value, TesseraError> {
        let empty = MarkSet::new();
        let binding = self
            .substitute(name, None, &empty, &empty)
            .ok_or_else(|| TesseraError::unbound(name.as_str(), ErrorContext::none()))?;
        let target = binding
            .denotation()
            .defined_target()
            .cloned()
            .ok_or_else(|| TesseraError::unbound(name.as_str(), ErrorContext::none()))?;
        match target.owner() {
            Some(owner) => owner.lookup_address(target.address(), name),
            None => Err(err_msg!(Eval, "the namespace defining `{}` is gone", name)),
        }
    }

    /// Host-level definition of `name`, as if by `(define name value)`.
    pub fn define_value(&self, name: &str, value: Value) -> Result<(), TesseraError> {
        let identifier = self.introduce(&Syntax::identifier(name));
        let identifier = self.predefine(&identifier)?;
        match identifier.resolve().map(|b| b.denotation()) {
            Some(crate::runtime::binding::Denotation::Defined(defined)) => {
                self.bind(&defined, value)
            }
            _ => Err(err_msg!(Internal, "predefine of `{}` did not yield a definition", name)),
        }
    }
}

// ============================================================================
// IMPORTED NAMESPACES
// ============================================================================

impl Namespace {
    /// The compact id under which this namespace reaches the owner of `target`.
    pub fn required_module_address(&self, target: &DefinedBinding) -> Result<usize, TesseraError> {
        let mut imports = self.imports.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = imports.ids.get(target.module()) {
            return Ok(*id);
        }
        let Some(owner) = target.owner() else {
            return Err(err_msg!(
                Contract,
                "module {} is no longer available",
                target.module()
            ));
        };
        let id = imports.namespaces.len();
        imports.namespaces.push(owner);
        imports.ids.insert(target.module().clone(), id);
        debug!(importer = %self.module, module = %target.module(), id, "assigned import id");
        Ok(id)
    }

    pub fn lookup_import(
        &self,
        module_address: usize,
        address: usize,
        name: &Symbol,
    ) -> Result<Value, TesseraError> {
        let owner = {
            let imports = self.imports.lock().unwrap_or_else(|e| e.into_inner());
            imports.namespaces.get(module_address).cloned()
        };
        match owner {
            Some(owner) => owner.lookup_address(address, name),
            None => Err(err_msg!(
                Internal,
                "no imported namespace at id {} in {}",
                module_address,
                self.module
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::binding::Denotation;
    use crate::syntax::{Mark, Wrap};

    fn top() -> Arc<Namespace> {
        Namespace::new(ModuleId::new("/top-test"), NamespaceKind::TopLevel)
    }

    fn module(name: &str) -> Arc<Namespace> {
        Namespace::new(ModuleId::new(name), NamespaceKind::Module)
    }

    fn defined_of(id: &Syntax) -> Arc<DefinedBinding> {
        match id.resolve().map(|b| b.denotation()) {
            Some(Denotation::Defined(d)) => d,
            other => panic!("expected a definition, got {other:?}"),
        }
    }

    fn provide(ns: &Arc<Namespace>, name: &str, value: Value) -> Arc<ProvidedBinding> {
        ns.define_value(name, value).unwrap();
        let Some(Denotation::Defined(target)) = ns.resolve_name(name).map(|b| b.denotation()) else {
            panic!("no definition for {name}");
        };
        Arc::new(ProvidedBinding {
            name: Symbol::new(name),
            target,
        })
    }

    #[test]
    fn redefinition_allocates_a_new_address() {
        let ns = top();
        let x = ns.introduce(&Syntax::identifier("x"));
        let first = defined_of(&ns.predefine(&x).unwrap());
        let second = defined_of(&ns.predefine(&x).unwrap());
        assert_eq!((first.address(), second.address()), (0, 1));
        assert_eq!(ns.definition_count(), 2);
        // The cell swung: a fresh resolution sees the newest definition.
        assert_eq!(defined_of(&x).address(), 1);
    }

    #[test]
    fn marked_definitions_get_their_own_cell() {
        let ns = top();
        let plain = ns.introduce(&Syntax::identifier("t"));
        let marked = plain.add_wrap(Wrap::Mark(Mark::fresh()));
        ns.predefine(&plain).unwrap();
        ns.predefine(&marked).unwrap();
        assert_eq!(defined_of(&plain).address(), 0);
        assert_eq!(defined_of(&marked).address(), 1);
    }

    #[test]
    fn soft_and_hard_lookups() {
        let ns = top();
        let x = ns.predefine(&ns.introduce(&Syntax::identifier("x"))).unwrap();
        let d = defined_of(&x);
        assert!(ns.lookup_definition(d.address()).is_none());
        let err = ns.lookup_address(d.address(), d.name()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Eval);
        ns.bind(&d, Value::Int(5)).unwrap();
        assert_eq!(ns.lookup_address(d.address(), d.name()).unwrap(), Value::Int(5));
    }

    #[test]
    fn distinct_imports_of_one_name_are_ambiguous() {
        let a = module("/a");
        let b = module("/b");
        let from_a = provide(&a, "shared", Value::Int(1));
        let from_b = provide(&b, "shared", Value::Int(2));
        let ns = top();
        let shared = ns.introduce(&Syntax::identifier("shared"));
        ns.require(&shared, &from_a, false).unwrap();
        ns.require(&shared, &from_a, false).unwrap();
        let err = ns.require(&shared, &from_b, false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AmbiguousBinding);
    }

    #[test]
    fn language_imports_yield_to_explicit_imports_and_definitions() {
        let lang = module("/lang");
        let other = module("/other");
        let from_lang = provide(&lang, "size", Value::Int(1));
        let from_other = provide(&other, "size", Value::Int(2));
        let m = module("/m");
        let size = m.introduce(&Syntax::identifier("size"));
        m.require(&size, &from_lang, true).unwrap();
        m.require(&size, &from_other, false).unwrap();
        let err = m.predefine(&size).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AmbiguousBinding);

        let n = module("/n");
        let size = n.introduce(&Syntax::identifier("size"));
        n.require(&size, &from_lang, true).unwrap();
        assert!(n.predefine(&size).is_ok());
        assert!(n.predefine(&size).is_err());
    }

    #[test]
    fn import_over_definition_is_ambiguous() {
        let lib = module("/lib");
        let provided = provide(&lib, "x", Value::Int(1));
        let ns = top();
        ns.define_value("x", Value::Int(0)).unwrap();
        let x = ns.introduce(&Syntax::identifier("x"));
        assert!(ns.require(&x, &provided, false).is_err());
    }

    #[test]
    fn import_ids_are_memoized() {
        let lib = module("/lib");
        let provided = provide(&lib, "x", Value::Int(7));
        let ns = top();
        let first = ns.required_module_address(provided.target()).unwrap();
        let again = ns.required_module_address(provided.target()).unwrap();
        assert_eq!(first, again);
        assert_eq!(
            ns.lookup_import(first, provided.target().address(), &Symbol::new("x"))
                .unwrap(),
            Value::Int(7)
        );
    }
}
