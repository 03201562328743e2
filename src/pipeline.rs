//! Async pipeline boundary.
//!
//! Submissions are bundled and rewritten off the caller's thread, on one
//! long-lived background worker with its own current-thread tokio runtime.
//! The worker handles requests strictly in arrival order and answers each
//! with exactly one response, in the same order.

use crate::backend::{BackendConfig, CompilerBackend};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::orchestrator::{BuildResult, BundleOrchestrator};
use crate::registry::DependencyRegistry;
use crate::rewriter::InjectionRewriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub seq: u64,
    pub code: String,
}

/// Exactly one of `code` (finished program) and `error` is non-empty, or
/// both are empty for a blank submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub seq: u64,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub error: String,
}

impl PipelineResponse {
    fn empty(seq: u64) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    fn program(seq: u64, code: String) -> Self {
        Self {
            seq,
            code,
            error: String::new(),
        }
    }

    fn failure(seq: u64, error: String) -> Self {
        Self {
            seq,
            code: String::new(),
            error,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.error.is_empty()
    }
}

/// Short content digest used to correlate log lines of one submission.
pub fn source_digest(code: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(code.as_bytes()));
    digest[..12].to_string()
}

/// Caller-side end of the pipeline.
pub struct PipelineHandle {
    requests: Option<mpsc::UnboundedSender<PipelineRequest>>,
    responses: mpsc::UnboundedReceiver<PipelineResponse>,
    shutdown: Option<oneshot::Sender<()>>,
    terminated: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Start the background worker.
    pub fn spawn(
        orchestrator: BundleOrchestrator,
        rewriter: InjectionRewriter,
        backend: Box<dyn CompilerBackend>,
    ) -> Result<Self, SandboxError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SandboxError::Pipeline(format!("failed to build worker runtime: {}", e)))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            backend_config: orchestrator.backend_config(),
            orchestrator,
            rewriter,
            backend,
            initialized: false,
            terminated: terminated.clone(),
        };

        std::thread::Builder::new()
            .name("preview-pipeline".to_string())
            .spawn(move || runtime.block_on(worker.run(request_rx, response_tx, shutdown_rx)))
            .map_err(|e| SandboxError::Pipeline(format!("failed to spawn worker thread: {}", e)))?;

        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            shutdown: Some(shutdown_tx),
            terminated,
        })
    }

    /// Worker over the default components for `config`.
    pub fn from_config(config: &SandboxConfig, backend: Box<dyn CompilerBackend>) -> Result<Self, SandboxError> {
        let registry = Arc::new(DependencyRegistry::new(config.externals.clone())?);
        let orchestrator = BundleOrchestrator::new(config, registry.clone())?;
        let rewriter = InjectionRewriter::new(config, registry);
        Self::spawn(orchestrator, rewriter, backend)
    }

    pub fn submit(&self, request: PipelineRequest) -> Result<(), SandboxError> {
        let requests = self
            .requests
            .as_ref()
            .filter(|_| !self.is_terminated())
            .ok_or_else(|| SandboxError::Pipeline("pipeline has been terminated".into()))?;
        requests
            .send(request)
            .map_err(|_| SandboxError::Pipeline("pipeline worker has stopped".into()))
    }

    /// Next response in submission order. `None` once terminated.
    pub async fn next_response(&mut self) -> Option<PipelineResponse> {
        if self.is_terminated() {
            return None;
        }
        let response = self.responses.recv().await;
        if self.is_terminated() {
            return None;
        }
        response
    }

    pub fn try_next_response(&mut self) -> Option<PipelineResponse> {
        if self.is_terminated() {
            return None;
        }
        self.responses.try_recv().ok()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stop the worker. No response is delivered afterwards, including ones
    /// already produced.
    pub fn terminate(&mut self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.requests = None;
        self.responses.close();
        while self.responses.try_recv().is_ok() {}
        tracing::debug!("pipeline terminated");
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct Worker {
    orchestrator: BundleOrchestrator,
    rewriter: InjectionRewriter,
    backend: Box<dyn CompilerBackend>,
    backend_config: BackendConfig,
    /// Set once, by the first submission that initializes the backend.
    initialized: bool,
    terminated: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<PipelineRequest>,
        responses: mpsc::UnboundedSender<PipelineResponse>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tracing::debug!("pipeline worker started");
        loop {
            let request = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let response = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                response = self.process(request) => response,
            };

            if self.terminated.load(Ordering::SeqCst) || responses.send(response).is_err() {
                break;
            }
        }
        tracing::debug!("pipeline worker stopped");
    }

    async fn process(&mut self, request: PipelineRequest) -> PipelineResponse {
        let PipelineRequest { seq, code } = request;
        if code.trim().is_empty() {
            return PipelineResponse::empty(seq);
        }

        let span = tracing::info_span!("submission", seq, digest = %source_digest(&code));
        async {
            if !self.initialized {
                if let Err(e) = self.backend.initialize(&self.backend_config).await {
                    tracing::error!("compiler backend failed to initialize: {}", e);
                    return PipelineResponse::failure(seq, e.to_string());
                }
                self.initialized = true;
                tracing::debug!("compiler backend initialized");
            }

            match self.orchestrator.bundle(self.backend.as_ref(), &code).await {
                BuildResult::Failure { message } => {
                    tracing::info!("build failed");
                    PipelineResponse::failure(seq, message)
                }
                BuildResult::Success(output) => match self.rewriter.rewrite(&output) {
                    Ok(program) => {
                        tracing::info!(bytes = program.len(), "build succeeded");
                        PipelineResponse::program(seq, program)
                    }
                    Err(e) => {
                        tracing::error!(kind = e.kind(), "rewrite failed: {}", e);
                        PipelineResponse::failure(seq, e.to_string())
                    }
                },
            }
        }
        .instrument(span)
        .await
    }
}
