//! Name-keyed registry of backend constructors.

use crate::config::SessionConfig;
use crate::session::Session;
use dbsession_core::{BackendError, BackendErrorKind, Capability, ConnectionOptions, Error};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};

/// Builds a fresh, unconnected capability.
pub type Constructor = Arc<dyn Fn() -> Box<dyn Capability> + Send + Sync>;

/// Populates an empty factory.
pub type Initializer = fn(&SessionFactory);

/// Creates [`Session`]s by backend name.
///
/// `SessionFactory::default()` knows the built-in backends; they are
/// registered lazily the first time the factory is consulted with an empty
/// registry. Use [`SessionFactory::new`] for a factory without built-ins.
pub struct SessionFactory {
    constructors: RwLock<BTreeMap<String, Constructor>>,
    initializer: Option<Initializer>,
    init: Once,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("session_types", &self.constructors.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for SessionFactory {
    fn default() -> Self {
        Self::with_initializer(register_builtin)
    }
}

impl SessionFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(BTreeMap::new()),
            initializer: None,
            init: Once::new(),
        }
    }

    /// A factory populated by `initializer` on first use.
    pub fn with_initializer(initializer: Initializer) -> Self {
        Self {
            initializer: Some(initializer),
            ..Self::new()
        }
    }

    /// Register a backend. A later registration under the same name wins.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Capability> + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self
            .constructors
            .write()
            .insert(name.clone(), Arc::new(constructor));
        if previous.is_some() {
            tracing::debug!(backend = %name, "session backend re-registered");
        } else {
            tracing::debug!(backend = %name, "session backend registered");
        }
    }

    fn ensure_initialized(&self) {
        let Some(initializer) = self.initializer else {
            return;
        };
        if !self.constructors.read().is_empty() {
            return;
        }
        self.init.call_once(|| initializer(self));
    }

    /// Names of every registered backend, sorted.
    pub fn session_types(&self) -> Vec<String> {
        self.ensure_initialized();
        self.constructors.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ensure_initialized();
        self.constructors.read().contains_key(name)
    }

    /// Instantiate an unopened session for backend `name`.
    pub fn create(
        &self,
        name: &str,
        id: impl Into<String>,
        options: ConnectionOptions,
        config: SessionConfig,
    ) -> Result<Session, Error> {
        self.ensure_initialized();
        let constructor = self
            .constructors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::Backend(BackendError {
                    kind: BackendErrorKind::NotRegistered,
                    name: name.to_string(),
                })
            })?;
        let id = id.into();
        tracing::debug!(backend = name, session_id = %id, "creating session");
        Ok(Session::new(id, constructor(), options, config))
    }
}

/// Registers the backends compiled into this crate.
pub fn register_builtin(factory: &SessionFactory) {
    #[cfg(feature = "sqlite")]
    factory.register(dbsession_sqlite::BACKEND_NAME, || {
        Box::new(dbsession_sqlite::SqliteCapability::new())
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = factory;
}
