//! Namespace loaders: produce source text and a content kind for a resolved module.
//!
//! - `entry` serves the current submission from memory
//! - `internal` reads from a single static-asset directory (no escape)
//! - `remote` fetches over HTTP(S), optionally limited to allowlisted origins

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::fetch::{fetch_text, module_client, FetchConfig};
use crate::resolver::Namespace;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Script,
    Stylesheet,
}

impl ContentKind {
    /// `.css` (ignoring query and fragment) is a stylesheet; everything else is script.
    pub fn from_id(id: &str) -> Self {
        let path = id.split(['?', '#']).next().unwrap_or(id);
        if path.to_ascii_lowercase().ends_with(".css") {
            ContentKind::Stylesheet
        } else {
            ContentKind::Script
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedContent {
    pub text: String,
    pub kind: ContentKind,
    /// Final location after redirects, when it differs from the id.
    pub location: Option<String>,
}

impl LoadedContent {
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ContentKind::Script,
            location: None,
        }
    }
}

/// One loader per namespace.
#[async_trait]
pub trait NamespaceLoader: Send + Sync {
    fn namespace(&self) -> Namespace;

    async fn load(&self, id: &str) -> Result<LoadedContent, SandboxError>;
}

static DEFAULT_EXPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+default\b|\bexport\s*\{[^}]*\bas\s+default\b").expect("valid regex"));

static APP_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:export\s+)?(?:(?:async\s+)?function\s*\*?\s*App\b|class\s+App\b|(?:const|let|var)\s+App\b)")
        .expect("valid regex")
});

/// Serves the submission text for the `entry` namespace.
pub struct EntryLoader {
    source: String,
    auto_export: bool,
}

impl EntryLoader {
    pub fn new(source: impl Into<String>, auto_export: bool) -> Self {
        Self {
            source: source.into(),
            auto_export,
        }
    }

    /// Submission text, plus `export default App;` when the user defined an
    /// `App` component but exported nothing as default.
    pub fn contents(&self) -> String {
        if self.auto_export && !DEFAULT_EXPORT.is_match(&self.source) && APP_DECLARATION.is_match(&self.source) {
            return format!("{}\n\nexport default App;\n", self.source);
        }
        self.source.clone()
    }
}

#[async_trait]
impl NamespaceLoader for EntryLoader {
    fn namespace(&self) -> Namespace {
        Namespace::Entry
    }

    async fn load(&self, _id: &str) -> Result<LoadedContent, SandboxError> {
        Ok(LoadedContent::script(self.contents()))
    }
}

/// Reads internal-library modules from the static-asset root.
///
/// The root is canonicalized on every load, so a root created after startup
/// still works, and every target is checked to stay inside it.
pub struct InternalLoader {
    root: PathBuf,
}

impl InternalLoader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn locate(&self, id: &str) -> Result<PathBuf, SandboxError> {
        let root = self.root.canonicalize().map_err(|e| {
            SandboxError::resolution(id, format!("asset root '{}' is unavailable: {}", self.root.display(), e))
        })?;
        let path = root
            .join(id)
            .canonicalize()
            .map_err(|e| SandboxError::resolution(id, format!("no such internal asset: {}", e)))?;

        // Security check: path must be within the asset root
        if !path.starts_with(&root) {
            return Err(SandboxError::resolution(
                id,
                format!("access denied: '{}' is outside the asset root", path.display()),
            ));
        }
        if !path.is_file() {
            return Err(SandboxError::resolution(id, "internal asset is not a file"));
        }
        Ok(path)
    }
}

#[async_trait]
impl NamespaceLoader for InternalLoader {
    fn namespace(&self) -> Namespace {
        Namespace::Internal
    }

    async fn load(&self, id: &str) -> Result<LoadedContent, SandboxError> {
        let path = self.locate(id)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SandboxError::resolution(id, format!("failed to read '{}': {}", path.display(), e)))?;

        Ok(LoadedContent {
            text,
            kind: ContentKind::from_id(id),
            location: None,
        })
    }
}

/// Fetches `remote` modules; the id is the URL.
pub struct RemoteLoader {
    client: Client,
    fetch: FetchConfig,
}

impl RemoteLoader {
    pub fn new(fetch: FetchConfig) -> Result<Self, SandboxError> {
        let client = module_client().map_err(|e| SandboxError::Config(e.to_string()))?;
        Ok(Self { client, fetch })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Self::new(FetchConfig {
            allowed_origins: config.allowed_origins.clone(),
        })
    }
}

#[async_trait]
impl NamespaceLoader for RemoteLoader {
    fn namespace(&self) -> Namespace {
        Namespace::Remote
    }

    async fn load(&self, id: &str) -> Result<LoadedContent, SandboxError> {
        let fetched = fetch_text(&self.client, id, &self.fetch)
            .await
            .map_err(|e| SandboxError::resolution(id, e))?;

        let final_url = fetched.url.to_string();
        let kind = ContentKind::from_id(&final_url);
        let location = (final_url != id).then_some(final_url);
        Ok(LoadedContent {
            text: fetched.body,
            kind,
            location,
        })
    }
}
