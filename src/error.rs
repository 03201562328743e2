//! Error taxonomy for the bundle pipeline and the execution host.
//!
//! Build-time failures (`Resolution`, `Compile`, `RewriteIntegrity`) short-circuit
//! before anything runs and travel back to the UI as the `error` field of a
//! pipeline response. `Execution` failures are caught inside the host's
//! invocation boundary and surface as a structured [`ExecutionError`].

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A specifier matched no resolution rule, or a loader failed to fetch it.
    #[error("Could not resolve \"{specifier}\": {reason}")]
    Resolution { specifier: String, reason: String },

    /// Diagnostic reported by the compiler backend, passed through verbatim.
    #[error("{0}")]
    Compile(String),

    /// An externalized import survived the injection rewrite.
    #[error("Injection rewrite left an import of externalized module \"{specifier}\" in the program")]
    RewriteIntegrity { specifier: String },

    /// Uncaught exception while invoking the finished program.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Config(String),

    /// The background pipeline is gone or refused a message.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl SandboxError {
    pub fn resolution(specifier: impl Into<String>, reason: impl ToString) -> Self {
        SandboxError::Resolution {
            specifier: specifier.into(),
            reason: reason.to_string(),
        }
    }

    /// Taxonomy name used in logs and error panels.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Resolution { .. } => "ResolutionError",
            SandboxError::Compile(_) => "CompileError",
            SandboxError::RewriteIntegrity { .. } => "RewriteIntegrityError",
            SandboxError::Execution(_) => "ExecutionError",
            SandboxError::Config(_) => "ConfigError",
            SandboxError::Pipeline(_) => "PipelineError",
        }
    }
}

/// Exception captured from a sandboxed program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}
