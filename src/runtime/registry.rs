//! # Module Registry
//!
//! Names, locates and memoizes modules. The registry is an explicit object
//! owned by a [`Runtime`](crate::engine::Runtime) and passed by reference;
//! there is no process-wide module table.
//!
//! ## Usage Workflow
//!
//! 1. A `require` names a module path; the [`ModuleResolver`] turns it into a
//!    [`ModuleId`] relative to the requesting module.
//! 2. [`ModuleRegistry::instantiate_with`] takes the module's per-module cell.
//!    If no [`ModuleDeclaration`] exists yet, the resolver supplies source text
//!    and the expander declares it while the cell is held.
//! 3. The body runs exactly once; later requests return the memoized
//!    [`ModuleInstance`].
//!
//! ## Registry Invariant
//!
//! Loading, declaration and first instantiation of a module are serialized by
//! a per-module cell, so concurrent importers of the same module never expand
//! or run its body twice. A module
//! that requires itself while loading on the same thread is a contract
//! failure rather than a deadlock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::compiler::CompiledForm;
use crate::runtime::binding::ProvidedBinding;
use crate::runtime::namespace::Namespace;
use crate::syntax::Symbol;
use crate::{err_msg, TesseraError};

// ============================================================================
// MODULE IDENTITY AND RESOLUTION
// ============================================================================

/// Absolute, normalized module path such as `/geometry/tiles`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    pub fn new(path: &str) -> Self {
        ModuleId(Arc::from(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory relative paths are resolved against.
    pub fn directory(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &self.0[..i],
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

/// Normalizes `path` into an absolute module id. Relative paths are taken
/// against the directory of `requester`, or the root when there is none.
pub fn normalize_path(path: &str, requester: Option<&ModuleId>) -> Result<ModuleId, TesseraError> {
    if path.is_empty() {
        return Err(err_msg!(Contract, "module path must not be empty"));
    }
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        let base = requester.map_or("/", ModuleId::directory);
        format!("{}/{}", base.trim_end_matches('/'), path)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(err_msg!(Contract, "module path `{path}` escapes the root"));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(err_msg!(Contract, "module path `{path}` names no module"));
    }
    Ok(ModuleId::new(&format!("/{}", segments.join("/"))))
}

/// Locates module sources. Implementations own all storage concerns.
pub trait ModuleResolver: Send + Sync {
    /// Maps a path written in a `require` to a module identity.
    fn resolve(&self, path: &str, requester: Option<&ModuleId>) -> Result<ModuleId, TesseraError> {
        normalize_path(path, requester)
    }

    /// Source text of `id`, or `None` when this resolver does not know it.
    fn load(&self, id: &ModuleId) -> Result<Option<String>, TesseraError>;
}

/// In-memory module sources keyed by absolute path.
#[derive(Default)]
pub struct SourceRepository {
    sources: RwLock<HashMap<ModuleId, String>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under `path`, replacing any previous text.
    pub fn add(&self, path: &str, source: &str) -> Result<ModuleId, TesseraError> {
        let id = normalize_path(path, None)?;
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), source.to_string());
        Ok(id)
    }

    pub fn with_module(self, path: &str, source: &str) -> Result<Self, TesseraError> {
        self.add(path, source)?;
        Ok(self)
    }
}

impl ModuleResolver for SourceRepository {
    fn load(&self, id: &ModuleId) -> Result<Option<String>, TesseraError> {
        Ok(self
            .sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }
}

// ============================================================================
// DECLARATIONS AND INSTANCES
// ============================================================================

/// An expanded and compiled module body, not yet run.
pub struct ModuleDeclaration {
    pub id: ModuleId,
    pub namespace: Arc<Namespace>,
    pub body: Vec<Arc<CompiledForm>>,
    pub provides: Vec<Arc<ProvidedBinding>>,
}

/// A module whose body has run; exposes its provided bindings.
#[derive(Debug)]
pub struct ModuleInstance {
    id: ModuleId,
    namespace: Arc<Namespace>,
    provided: HashMap<Symbol, Arc<ProvidedBinding>>,
    order: Vec<Symbol>,
}

impl ModuleInstance {
    pub fn new(declaration: &ModuleDeclaration) -> Self {
        let mut provided = HashMap::new();
        let mut order = Vec::new();
        for binding in &declaration.provides {
            if provided
                .insert(binding.name().clone(), binding.clone())
                .is_none()
            {
                order.push(binding.name().clone());
            }
        }
        ModuleInstance {
            id: declaration.id.clone(),
            namespace: declaration.namespace.clone(),
            provided,
            order,
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn provided(&self, name: &str) -> Option<&Arc<ProvidedBinding>> {
        self.provided.get(&Symbol::new(name))
    }

    /// Provided bindings in declaration order.
    pub fn provided_bindings(&self) -> impl Iterator<Item = &Arc<ProvidedBinding>> {
        self.order.iter().filter_map(|name| self.provided.get(name))
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

type InstanceCell = Arc<OnceCell<Arc<ModuleInstance>>>;

/// Declarations and memoized instances of every module a runtime has seen.
#[derive(Default)]
pub struct ModuleRegistry {
    declarations: RwLock<HashMap<ModuleId, Arc<ModuleDeclaration>>>,
    instances: Mutex<HashMap<ModuleId, InstanceCell>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a declaration. An already instantiated module cannot be redeclared.
    pub fn declare(&self, declaration: Arc<ModuleDeclaration>) -> Result<(), TesseraError> {
        let id = declaration.id.clone();
        if self.instance(&id).is_some() {
            return Err(err_msg!(
                Contract,
                "module {id} is already instantiated and cannot be redeclared"
            ));
        }
        debug!(module = %id, forms = declaration.body.len(), "declaring module");
        self.declarations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, declaration);
        Ok(())
    }

    pub fn declaration(&self, id: &ModuleId) -> Option<Arc<ModuleDeclaration>> {
        self.declarations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn is_declared(&self, id: &ModuleId) -> bool {
        self.declaration(id).is_some()
    }

    /// The instance of `id` if its body has already run.
    pub fn instance(&self, id: &ModuleId) -> Option<Arc<ModuleInstance>> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.get(id).and_then(|cell| cell.get().cloned())
    }

    /// Registers an instance built outside the loader, such as the kernel.
    pub fn install(&self, declaration: Arc<ModuleDeclaration>) -> Result<Arc<ModuleInstance>, TesseraError> {
        let instance = Arc::new(ModuleInstance::new(&declaration));
        self.declare(declaration)?;
        let cell = self.cell(instance.id());
        cell.set(instance.clone()).map_err(|_| {
            err_msg!(Internal, "module {} was instantiated concurrently", instance.id())
        })?;
        Ok(instance)
    }

    fn cell(&self, id: &ModuleId) -> InstanceCell {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.entry(id.clone()).or_default().clone()
    }

    /// Returns the memoized instance of `id`, running `run` on its declaration
    /// the first time. A module with no recorded declaration gets one from
    /// `declare`, inside the same per-module cell, so concurrent first
    /// requests wait for the single thread that loads, declares and runs it.
    pub fn instantiate_with<D, F>(
        &self,
        id: &ModuleId,
        declare: D,
        run: F,
    ) -> Result<Arc<ModuleInstance>, TesseraError>
    where
        D: FnOnce() -> Result<Arc<ModuleDeclaration>, TesseraError>,
        F: FnOnce(&ModuleDeclaration) -> Result<(), TesseraError>,
    {
        if let Some(instance) = self.instance(id) {
            trace!(module = %id, "instance memo hit");
            return Ok(instance);
        }
        // Entered before blocking on the cell: a same-thread cycle would
        // otherwise wait on itself.
        let _loading = LoadingGuard::enter(id)?;
        let cell = self.cell(id);
        let instance = cell.get_or_try_init(|| {
            let declaration = match self.declaration(id) {
                Some(declaration) => declaration,
                None => {
                    let declaration = declare()?;
                    self.declare(declaration.clone())?;
                    declaration
                }
            };
            debug!(module = %id, "instantiating module");
            run(&declaration)?;
            Ok::<_, TesseraError>(Arc::new(ModuleInstance::new(&declaration)))
        })?;
        Ok(instance.clone())
    }
}

// ============================================================================
// CYCLE DETECTION
// ============================================================================

thread_local! {
    static LOADING: RefCell<Vec<ModuleId>> = const { RefCell::new(Vec::new()) };
}

/// Marks `id` as loading on this thread until dropped.
pub struct LoadingGuard {
    id: ModuleId,
}

impl LoadingGuard {
    pub fn enter(id: &ModuleId) -> Result<Self, TesseraError> {
        LOADING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(start) = stack.iter().position(|m| m == id) {
                let cycle: Vec<String> = stack[start..]
                    .iter()
                    .chain(std::iter::once(id))
                    .map(ModuleId::to_string)
                    .collect();
                return Err(err_msg!(
                    Contract,
                    "module dependency cycle: {}",
                    cycle.join(" -> ")
                ));
            }
            stack.push(id.clone());
            Ok(LoadingGuard { id: id.clone() })
        })
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        LOADING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|m| *m == self.id) {
                stack.truncate(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::namespace::NamespaceKind;

    #[test]
    fn paths_normalize_against_the_requester() {
        let requester = ModuleId::new("/shapes/tiles");
        assert_eq!(
            normalize_path("grid", Some(&requester)).unwrap().as_str(),
            "/shapes/grid"
        );
        assert_eq!(
            normalize_path("../util/./colors", Some(&requester))
                .unwrap()
                .as_str(),
            "/util/colors"
        );
        assert_eq!(normalize_path("/abs", Some(&requester)).unwrap().as_str(), "/abs");
        assert!(normalize_path("../../x", Some(&requester)).is_err());
    }

    #[test]
    fn repository_loads_registered_sources() {
        let repo = SourceRepository::new().with_module("lib/a", "(provide)").unwrap();
        let id = repo.resolve("/lib/a", None).unwrap();
        assert_eq!(repo.load(&id).unwrap().as_deref(), Some("(provide)"));
        assert!(repo.load(&ModuleId::new("/missing")).unwrap().is_none());
    }

    fn no_loader() -> Result<Arc<ModuleDeclaration>, TesseraError> {
        Err(err_msg!(Internal, "declaration was expected to exist"))
    }

    fn empty_declaration(path: &str) -> Arc<ModuleDeclaration> {
        let id = ModuleId::new(path);
        Arc::new(ModuleDeclaration {
            namespace: Namespace::new(id.clone(), NamespaceKind::Module),
            id,
            body: vec![],
            provides: vec![],
        })
    }

    #[test]
    fn instantiation_runs_once() {
        let registry = ModuleRegistry::new();
        registry.declare(empty_declaration("/once")).unwrap();
        let id = ModuleId::new("/once");
        let mut runs = 0;
        registry
            .instantiate_with(&id, no_loader, |_| {
                runs += 1;
                Ok(())
            })
            .unwrap();
        registry
            .instantiate_with(&id, no_loader, |_| {
                runs += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn failed_instantiation_may_be_retried() {
        let registry = ModuleRegistry::new();
        registry.declare(empty_declaration("/flaky")).unwrap();
        let id = ModuleId::new("/flaky");
        assert!(registry
            .instantiate_with(&id, no_loader, |_| Err(err_msg!(Eval, "boom")))
            .is_err());
        assert!(registry.instantiate_with(&id, no_loader, |_| Ok(())).is_ok());
    }

    #[test]
    fn self_requiring_module_is_a_contract_failure() {
        let registry = ModuleRegistry::new();
        registry.declare(empty_declaration("/loop")).unwrap();
        let id = ModuleId::new("/loop");
        let err = registry
            .instantiate_with(&id, no_loader, |_| {
                LoadingGuard::enter(&ModuleId::new("/loop")).map(|_| ())
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Contract);
    }

    #[test]
    fn missing_declaration_comes_from_the_loader() {
        let registry = ModuleRegistry::new();
        let id = ModuleId::new("/lazy");
        let mut loads = 0;
        for _ in 0..2 {
            registry
                .instantiate_with(
                    &id,
                    || {
                        loads += 1;
                        Ok(empty_declaration("/lazy"))
                    },
                    |_| Ok(()),
                )
                .unwrap();
        }
        assert_eq!(loads, 1);
        assert!(registry.is_declared(&id));
    }

    #[test]
    fn loader_failure_leaves_module_undeclared() {
        let registry = ModuleRegistry::new();
        let id = ModuleId::new("/nowhere");
        let err = registry
            .instantiate_with(
                &id,
                || Err(TesseraError::module_not_found("/nowhere")),
                |_| Ok(()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ModuleNotFound);
        assert!(!registry.is_declared(&id));
        assert!(registry.instance(&id).is_none());
    }
}
