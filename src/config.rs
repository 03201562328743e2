//! Sandbox configuration.

use crate::error::SandboxError;
use crate::registry::{default_externals, ExternalDependency};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Configuration shared by the pipeline and the execution host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Reserved specifier of the in-memory entry module
    pub entry_specifier: String,
    /// Prefix routing imports to the local static-asset root
    pub internal_prefix: String,
    /// Directory serving `internal` modules (only this dir is readable)
    pub internal_root: PathBuf,
    /// Public package CDN used for bare specifiers: `<cdn_base>/<specifier>`
    pub cdn_base: String,
    /// Origins remote modules may be fetched from (empty = any origin)
    pub allowed_origins: Vec<String>,
    /// Global binding the bundled closure result is assigned to
    pub global_name: String,
    /// Id of the mount target element created inside the container
    pub mount_id: String,
    /// Append `export default App;` to entries that define but don't export `App`
    pub auto_export: bool,
    /// Literal replacements applied to every script module
    pub define: BTreeMap<String, String>,
    /// External dependency registry, in calling-convention order
    pub externals: Vec<ExternalDependency>,
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single program invocation in milliseconds (default: 30000ms)
    pub timeout_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut define = BTreeMap::new();
        define.insert("process.env.NODE_ENV".to_string(), "\"production\"".to_string());

        Self {
            entry_specifier: String::from("index.js"),
            internal_prefix: String::from("@local/"),
            internal_root: PathBuf::from("./public"),
            cdn_base: String::from("https://unpkg.com"),
            allowed_origins: Vec::new(),
            global_name: String::from("__bundle__"),
            mount_id: String::from("root"),
            auto_export: true,
            define,
            externals: default_externals(),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout_ms: Some(30_000),
        }
    }
}

impl SandboxConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, SandboxError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Config(format!("failed to read '{}': {}", path.display(), e)))?;
        let config: SandboxConfig = serde_json::from_str(&text)
            .map_err(|e| SandboxError::Config(format!("invalid config '{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Point the CDN at `base`. A restricted allowlist also gets its origin.
    pub fn with_cdn_base(mut self, base: &str) -> Result<Self, SandboxError> {
        let url = parse_http_url(base)?;
        let origin = url.origin().ascii_serialization();
        self.cdn_base = base.trim_end_matches('/').to_string();
        if !self.allowed_origins.is_empty() && !self.allowed_origins.contains(&origin) {
            self.allowed_origins.push(origin);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.entry_specifier.trim().is_empty() {
            return Err(SandboxError::Config("entry_specifier must not be empty".into()));
        }
        if self.internal_prefix.trim_matches('/').is_empty() {
            return Err(SandboxError::Config("internal_prefix must not be empty".into()));
        }
        if !crate::registry::is_binding_identifier(&self.global_name) {
            return Err(SandboxError::Config(format!(
                "global_name '{}' is not a valid identifier",
                self.global_name
            )));
        }
        if self.mount_id.trim().is_empty() {
            return Err(SandboxError::Config("mount_id must not be empty".into()));
        }
        parse_http_url(&self.cdn_base)?;
        crate::registry::DependencyRegistry::new(self.externals.clone())?;
        Ok(())
    }
}

fn parse_http_url(raw: &str) -> Result<Url, SandboxError> {
    let url = Url::parse(raw).map_err(|e| SandboxError::Config(format!("invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SandboxError::Config(format!(
            "'{}' must be an http(s) URL, got scheme '{}'",
            raw, other
        ))),
    }
}
