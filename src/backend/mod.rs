//! Compiler backend contract.
//!
//! The bundler is a black box driven through two callbacks: `resolve` decides
//! where a specifier lives, `load` produces its text. A backend turns the
//! entry plus those callbacks into one self-contained program.

mod linker;

pub use linker::ModuleLinker;

use crate::error::SandboxError;
use crate::imports::ImportClause;
use crate::loader::LoadedContent;
use crate::resolver::ResolvedModule;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Range;

/// Options handed to the backend once, before its first build.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Literal replacements applied to script sources (`process.env.NODE_ENV` etc.)
    pub define: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Specifier of the entry module
    pub entry: String,
    /// Specifiers that must stay unresolved in the output
    pub externals: Vec<String>,
    /// Binding the self-invoking closure result is assigned to
    pub global_name: String,
}

/// An externalized import statement the backend left in its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalImport {
    pub specifier: String,
    pub clause: ImportClause,
    /// Byte range of the statement inside `BundleOutput::program`
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutput {
    pub program: String,
    /// Structured record of the external imports in `program`, when the
    /// backend can provide one. `None` means callers must scan the text.
    pub external_imports: Option<Vec<ExternalImport>>,
}

impl BundleOutput {
    pub fn text(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            external_imports: None,
        }
    }
}

/// Resolution and load callbacks a backend drives during one build.
#[async_trait]
pub trait ModuleHooks: Send + Sync {
    fn resolve(&self, specifier: &str, importer: Option<&ResolvedModule>) -> Result<ResolvedModule, SandboxError>;

    async fn load(&self, module: &ResolvedModule) -> Result<LoadedContent, SandboxError>;
}

#[async_trait]
pub trait CompilerBackend: Send + Sync {
    async fn initialize(&mut self, config: &BackendConfig) -> Result<(), SandboxError>;

    /// Bundle `request.entry` into a single program, or fail with a diagnostic.
    async fn build(&self, request: &BuildRequest, hooks: &dyn ModuleHooks) -> Result<BundleOutput, SandboxError>;
}
