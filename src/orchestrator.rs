//! Bundle orchestration: one backend build per submission.
//!
//! The orchestrator owns the resolver and the namespace loaders and hands
//! them to the backend as a per-build [`ModuleHooks`] session. Loads are
//! memoized for the lifetime of that session only.

use crate::backend::{BackendConfig, BuildRequest, BundleOutput, CompilerBackend, ModuleHooks};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::loader::{EntryLoader, InternalLoader, LoadedContent, NamespaceLoader, RemoteLoader};
use crate::registry::DependencyRegistry;
use crate::resolver::{Namespace, NamespaceResolver, ResolvedModule};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Outcome of one bundle attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Success(BundleOutput),
    /// Backend or loader diagnostic, unmodified.
    Failure { message: String },
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildResult::Success(_))
    }
}

pub struct BundleOrchestrator {
    resolver: NamespaceResolver,
    internal: Arc<dyn NamespaceLoader>,
    remote: Arc<dyn NamespaceLoader>,
    registry: Arc<DependencyRegistry>,
    entry_specifier: String,
    global_name: String,
    auto_export: bool,
    define: BTreeMap<String, String>,
}

impl BundleOrchestrator {
    pub fn new(config: &SandboxConfig, registry: Arc<DependencyRegistry>) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            resolver: NamespaceResolver::new(config, registry.clone()),
            internal: Arc::new(InternalLoader::new(&config.internal_root)),
            remote: Arc::new(RemoteLoader::from_config(config)?),
            registry,
            entry_specifier: config.entry_specifier.clone(),
            global_name: config.global_name.clone(),
            auto_export: config.auto_export,
            define: config.define.clone(),
        })
    }

    /// Replace the loader for the namespace `loader` serves. The entry loader
    /// is always built from the submission and cannot be replaced.
    pub fn with_loader(mut self, loader: Arc<dyn NamespaceLoader>) -> Self {
        match loader.namespace() {
            Namespace::Internal => self.internal = loader,
            Namespace::Remote => self.remote = loader,
            Namespace::Entry => tracing::warn!("ignoring replacement loader for the entry namespace"),
        }
        self
    }

    /// Options the backend must be initialized with before its first build.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            define: self.define.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.registry
    }

    pub async fn bundle(&self, backend: &dyn CompilerBackend, source: &str) -> BuildResult {
        let request = BuildRequest {
            entry: self.entry_specifier.clone(),
            externals: self.registry.specifiers(),
            global_name: self.global_name.clone(),
        };
        let session = BuildSession {
            resolver: &self.resolver,
            entry: EntryLoader::new(source, self.auto_export),
            internal: self.internal.clone(),
            remote: self.remote.clone(),
            loaded: Mutex::new(HashMap::new()),
        };

        match backend.build(&request, &session).await {
            Ok(output) => {
                tracing::debug!(bytes = output.program.len(), modules = session.loaded_count(), "build succeeded");
                BuildResult::Success(output)
            }
            Err(e) => {
                tracing::debug!(kind = e.kind(), "build failed: {}", e);
                BuildResult::Failure { message: e.to_string() }
            }
        }
    }
}

/// Hooks handed to the backend for a single build.
struct BuildSession<'o> {
    resolver: &'o NamespaceResolver,
    entry: EntryLoader,
    internal: Arc<dyn NamespaceLoader>,
    remote: Arc<dyn NamespaceLoader>,
    loaded: Mutex<HashMap<(Namespace, String), LoadedContent>>,
}

impl<'o> BuildSession<'o> {
    fn loaded_count(&self) -> usize {
        self.loaded.lock().map(|loaded| loaded.len()).unwrap_or(0)
    }

    fn cached(&self, key: &(Namespace, String)) -> Option<LoadedContent> {
        self.loaded.lock().ok().and_then(|loaded| loaded.get(key).cloned())
    }
}

#[async_trait]
impl<'o> ModuleHooks for BuildSession<'o> {
    fn resolve(&self, specifier: &str, importer: Option<&ResolvedModule>) -> Result<ResolvedModule, SandboxError> {
        self.resolver.resolve(specifier, importer)
    }

    async fn load(&self, module: &ResolvedModule) -> Result<LoadedContent, SandboxError> {
        if module.external {
            return Err(SandboxError::Compile(format!(
                "externalized module \"{}\" must not be loaded",
                module.id
            )));
        }

        let key = (module.namespace, module.id.clone());
        if let Some(content) = self.cached(&key) {
            return Ok(content);
        }

        let content = match module.namespace {
            Namespace::Entry => self.entry.load(&module.id).await?,
            Namespace::Internal => self.internal.load(&module.id).await?,
            Namespace::Remote => self.remote.load(&module.id).await?,
        };
        tracing::debug!(module = %module, bytes = content.text.len(), "loaded module");

        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.insert(key, content.clone());
        }
        Ok(content)
    }
}
