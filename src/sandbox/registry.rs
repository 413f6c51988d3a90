//! Name → backend factory registry.
//!
//! Built-in backends are registered by [`BackendRegistry::with_builtins`];
//! third-party backends call [`BackendRegistry::register`] before any task
//! is resolved. Each backend is instantiated once and shared by every
//! task that names it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{DockerBackend, LocalBackend, SandboxBackend, SandboxError, SandboxResult};
use crate::config::Config;

/// What a factory gets to build a backend from.
#[derive(Debug, Clone)]
pub(crate) struct BackendContext {
    /// Root for durable state (ledger, local workspaces).
    pub state_dir: PathBuf,
    /// Run-level configuration.
    pub config: Config,
}

type BackendFactory = Arc<dyn Fn(&BackendContext) -> Arc<dyn SandboxBackend> + Send + Sync>;

/// Registry of available backends.
pub(crate) struct BackendRegistry {
    context: BackendContext,
    factories: BTreeMap<String, BackendFactory>,
    instances: Mutex<HashMap<String, Arc<dyn SandboxBackend>>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new(context: BackendContext) -> Self {
        Self {
            context,
            factories: BTreeMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// A registry with `local` and `docker` (alias `containerized`).
    pub fn with_builtins(context: BackendContext) -> Self {
        let mut registry = Self::new(context);
        registry.register("local", |ctx: &BackendContext| {
            Arc::new(LocalBackend::new(
                ctx.state_dir.join("local"),
                ctx.config.exec.clone(),
            )) as Arc<dyn SandboxBackend>
        });
        let docker = |ctx: &BackendContext| {
            Arc::new(DockerBackend::new(
                ctx.config.docker.clone(),
                ctx.config.exec.clone(),
            )) as Arc<dyn SandboxBackend>
        };
        registry.register("docker", docker);
        registry.register("containerized", docker);
        registry
    }

    /// Adds or replaces a backend factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BackendContext) -> Arc<dyn SandboxBackend> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Registers an already-built backend.
    #[cfg(test)]
    pub fn register_instance(&mut self, name: &str, backend: Arc<dyn SandboxBackend>) {
        self.register(name, move |_| Arc::clone(&backend));
    }

    /// Returns the shared instance for `name`.
    pub fn resolve(&self, name: &str) -> SandboxResult<Arc<dyn SandboxBackend>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            SandboxError::configuration(format!(
                "unknown sandbox backend '{name}' (available: {})",
                self.names().join(", ")
            ))
        })?;
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| SandboxError::configuration("backend registry lock poisoned"))?;
        Ok(Arc::clone(
            instances
                .entry(name.to_string())
                .or_insert_with(|| factory(&self.context)),
        ))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
