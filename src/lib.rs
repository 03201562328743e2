//! # Preview Sandbox
//!
//! Live component preview: an in-memory submission is bundled against a
//! virtual module graph (entry, local static assets, a public package CDN),
//! its externalized dependencies are rewritten into explicit parameters, and
//! the finished program runs inside an isolated deno_core host that mounts
//! the exported component.
//!
//! ## Pieces
//!
//! - [`NamespaceResolver`] and the [`NamespaceLoader`]s route and load modules
//! - [`BundleOrchestrator`] drives a [`CompilerBackend`] ([`ModuleLinker`] ships with the crate)
//! - [`InjectionRewriter`] applies the `(container, ...bindings)` calling convention
//! - [`ExecutionHost`] runs programs in a sandboxed V8 isolate
//! - [`PipelineHandle`] runs bundling off-thread; [`PreviewSession`] ties it to a host
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{ModuleLinker, PreviewSession, SandboxConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = PreviewSession::new(&SandboxConfig::default(), Box::new(ModuleLinker::new()))?;
//!     session.submit("export default function App() { return null }")?;
//!     session.settle().await?;
//!     println!("{}", session.host_mut().container_html()?);
//!     Ok(())
//! }
//! ```

pub mod backend;
mod config;
mod error;
mod fetch;
pub mod imports;
mod host;
mod loader;
mod ops;
mod orchestrator;
mod pipeline;
mod registry;
mod resolver;
mod rewriter;
mod session;

pub use backend::{BackendConfig, BuildRequest, BundleOutput, CompilerBackend, ExternalImport, ModuleHooks, ModuleLinker};
pub use config::SandboxConfig;
pub use error::{ExecutionError, SandboxError};
pub use fetch::FetchConfig;
pub use host::{ExecutionHost, ExecutionOutcome, HostState, MountOutcome};
pub use loader::{ContentKind, EntryLoader, InternalLoader, LoadedContent, NamespaceLoader, RemoteLoader};
pub use ops::ConsoleOutput;
pub use orchestrator::{BuildResult, BundleOrchestrator};
pub use pipeline::{source_digest, PipelineHandle, PipelineRequest, PipelineResponse};
pub use registry::{default_externals, DependencyRegistry, ExternalDependency, RuntimeValue, CONTAINER_PARAM};
pub use resolver::{Namespace, NamespaceResolver, ResolvedModule};
pub use rewriter::InjectionRewriter;
pub use session::{Applied, ErrorReport, PreviewSession, SubmitOutcome};
