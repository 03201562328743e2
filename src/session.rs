//! UI-side preview session.
//!
//! Owns the pipeline handle and the execution host: numbers submissions,
//! applies responses to the host, and keeps the current bundle plus the one
//! error report the error panel shows. Responses older than the latest
//! submission are discarded.

use crate::backend::CompilerBackend;
use crate::config::SandboxConfig;
use crate::error::ExecutionError;
use crate::host::{ExecutionHost, ExecutionOutcome, HostState};
use crate::pipeline::{PipelineHandle, PipelineRequest, PipelineResponse};
use crate::registry::DependencyRegistry;
use anyhow::{anyhow, Error};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank source: nothing was sent and no busy indicator is shown.
    Empty,
    Queued { seq: u64 },
}

/// Content of the persistent error panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReport {
    /// Resolution, compile or rewrite failure, as reported by the pipeline.
    Build { message: String },
    Execution(ExecutionError),
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReport::Build { message } => f.write_str(message),
            ErrorReport::Execution(error) => write!(f, "{}", error),
        }
    }
}

/// What applying one response did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Superseded by a later submission; ignored.
    Stale { seq: u64 },
    NoCode,
    BuildFailed { message: String },
    Executed(ExecutionOutcome),
}

pub struct PreviewSession {
    pipeline: PipelineHandle,
    host: ExecutionHost,
    latest_seq: u64,
    in_flight: usize,
    bundle: Option<String>,
    error: Option<ErrorReport>,
}

impl PreviewSession {
    pub fn new(config: &SandboxConfig, backend: Box<dyn CompilerBackend>) -> Result<Self, Error> {
        let registry = Arc::new(DependencyRegistry::new(config.externals.clone())?);
        let pipeline = PipelineHandle::from_config(config, backend)?;
        let host = ExecutionHost::new(config, registry)?;
        Ok(Self::from_parts(pipeline, host))
    }

    pub fn from_parts(pipeline: PipelineHandle, host: ExecutionHost) -> Self {
        Self {
            pipeline,
            host,
            latest_seq: 0,
            in_flight: 0,
            bundle: None,
            error: None,
        }
    }

    pub fn submit(&mut self, code: &str) -> Result<SubmitOutcome, Error> {
        self.latest_seq += 1;
        let seq = self.latest_seq;

        if code.trim().is_empty() {
            tracing::debug!(seq, "blank submission");
            self.host.finish_loading()?;
            self.bundle = None;
            self.error = None;
            return Ok(SubmitOutcome::Empty);
        }

        self.host.begin_loading()?;
        let queued = self.pipeline.submit(PipelineRequest {
            seq,
            code: code.to_string(),
        });
        if let Err(e) = queued {
            // Nothing will answer this submission.
            self.host.finish_loading()?;
            return Err(e.into());
        }
        self.in_flight += 1;
        tracing::debug!(seq, "submission queued");
        Ok(SubmitOutcome::Queued { seq })
    }

    /// Apply one pipeline response to the host and the session state.
    pub async fn apply(&mut self, response: PipelineResponse) -> Result<Applied, Error> {
        self.in_flight = self.in_flight.saturating_sub(1);

        if response.seq < self.latest_seq {
            tracing::debug!(seq = response.seq, latest = self.latest_seq, "discarding stale response");
            return Ok(Applied::Stale { seq: response.seq });
        }

        if response.is_empty() {
            self.host.finish_loading()?;
            self.bundle = None;
            return Ok(Applied::NoCode);
        }

        if !response.error.is_empty() {
            // The container keeps showing the last successful render.
            self.host.finish_loading()?;
            self.error = Some(ErrorReport::Build {
                message: response.error.clone(),
            });
            return Ok(Applied::BuildFailed { message: response.error });
        }

        let outcome = self.host.run(&response.code).await?;
        self.bundle = Some(response.code);
        self.error = outcome.error.clone().map(ErrorReport::Execution);
        Ok(Applied::Executed(outcome))
    }

    /// Wait for the next response and apply it.
    pub async fn next_applied(&mut self) -> Result<Applied, Error> {
        let response = self
            .pipeline
            .next_response()
            .await
            .ok_or_else(|| anyhow!("Preview pipeline is terminated"))?;
        self.apply(response).await
    }

    /// Apply responses until every submission has been answered.
    pub async fn settle(&mut self) -> Result<Vec<Applied>, Error> {
        let mut applied = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            applied.push(self.next_applied().await?);
        }
        Ok(applied)
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    pub fn is_loading(&self) -> bool {
        self.host.state() == HostState::Loading
    }

    /// Finished program of the last applied successful build.
    pub fn bundle(&self) -> Option<&str> {
        self.bundle.as_deref()
    }

    pub fn error(&self) -> Option<&ErrorReport> {
        self.error.as_ref()
    }

    pub fn host(&self) -> &ExecutionHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut ExecutionHost {
        &mut self.host
    }

    /// Stop the pipeline (nothing is delivered afterwards) and destroy the region.
    pub fn teardown(&mut self) -> Result<(), Error> {
        self.pipeline.terminate();
        self.in_flight = 0;
        self.host.teardown()
    }
}
