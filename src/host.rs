//! Execution host - runs finished programs in a sandboxed V8 isolate.
//!
//! The isolate only sees what `bootstrap.js` provides: console capture, the
//! detached preview region (busy indicator, fullscreen toggle, container) and
//! the host libraries named by the dependency registry. There is no module
//! loader, no fs, net or env access.
//!
//! State machine:
//!
//! ```text
//! Idle --begin_loading--> Loading --run ok--> Ready
//!                           |   \--run throws--> Error
//!                           \--finish_loading--> (previous settled state)
//! Ready|Error --begin_loading--> Loading
//! ```

use crate::config::SandboxConfig;
use crate::error::ExecutionError;
use crate::imports::js_string;
use crate::ops::{sandbox_host, ConsoleOutput};
use crate::registry::DependencyRegistry;
use anyhow::{anyhow, Error};
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostState {
    Idle,
    Loading,
    Ready,
    Error,
}

/// Result of the component lookup done by the trailing mount block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MountOutcome {
    Found { component: String },
    NotFound { detail: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `None` when nothing ran, or the program did not end in a mount block.
    pub mount: Option<MountOutcome>,
    pub error: Option<ExecutionError>,
}

impl ExecutionOutcome {
    pub fn mounted_component(&self) -> Option<&str> {
        match &self.mount {
            Some(MountOutcome::Found { component }) => Some(component),
            _ => None,
        }
    }

    pub fn no_component_found(&self) -> bool {
        matches!(self.mount, Some(MountOutcome::NotFound { .. }))
    }
}

/// What `__sandbox_host__.run` reports back.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum RunReport {
    Ok { mount: Option<MountOutcome> },
    Error { error: ExecutionError },
}

pub struct ExecutionHost {
    runtime: JsRuntime,
    state: HostState,
    /// State to return to when a load ends without running anything.
    settled: HostState,
    attached: bool,
    mount_id: String,
    timeout_ms: Option<u64>,
    parameter_names: String,
    runtime_values: String,
}

impl ExecutionHost {
    pub fn new(config: &SandboxConfig, registry: Arc<DependencyRegistry>) -> Result<Self, Error> {
        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![sandbox_host::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        if config.max_heap_size.is_some() {
            runtime.add_near_heap_limit_callback(|current, initial| {
                // Keep the limit; V8 reports OOM instead of growing the heap.
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "sandbox isolate near heap limit"
                );
                current
            });
        }

        runtime.op_state().borrow_mut().put(ConsoleOutput::default());

        let mut host = Self {
            runtime,
            state: HostState::Idle,
            settled: HostState::Idle,
            attached: false,
            mount_id: config.mount_id.clone(),
            timeout_ms: config.timeout_ms,
            parameter_names: serde_json::to_string(&registry.parameter_names())?,
            runtime_values: serde_json::to_string(&registry.runtime_values())?,
        };
        host.attach()?;
        Ok(host)
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Build the preview region. A no-op while attached.
    pub fn attach(&mut self) -> Result<(), Error> {
        if self.attached {
            return Ok(());
        }
        let options = serde_json::json!({ "mountId": self.mount_id });
        self.call(format!("globalThis.__sandbox_host__.attach({})", options))?;
        self.attached = true;
        self.state = HostState::Idle;
        self.settled = HostState::Idle;
        tracing::debug!("preview region attached");
        Ok(())
    }

    /// Unmount everything, remove the toggle listener and destroy the region.
    pub fn teardown(&mut self) -> Result<(), Error> {
        if !self.attached {
            return Ok(());
        }
        self.call("globalThis.__sandbox_host__.detach()".to_string())?;
        self.attached = false;
        self.state = HostState::Idle;
        self.settled = HostState::Idle;
        tracing::debug!("preview region torn down");
        Ok(())
    }

    /// Show the busy indicator. The container is left as it is.
    pub fn begin_loading(&mut self) -> Result<(), Error> {
        self.require_attached()?;
        if self.state != HostState::Loading {
            self.settled = self.state;
            self.state = HostState::Loading;
        }
        self.call("globalThis.__sandbox_host__.showBusy()".to_string())?;
        Ok(())
    }

    /// Hide the busy indicator without running anything.
    pub fn finish_loading(&mut self) -> Result<(), Error> {
        self.require_attached()?;
        if self.state == HostState::Loading {
            self.state = self.settled;
        }
        self.call("globalThis.__sandbox_host__.hideBusy()".to_string())?;
        Ok(())
    }

    /// Run a finished program against a fresh mount target.
    ///
    /// Exceptions thrown by the program, including ones raised by promise
    /// jobs it queued, are returned as `ExecutionOutcome::error`; `Err` is
    /// reserved for host failures. An empty program only ends the current load.
    pub async fn run(&mut self, program: &str) -> Result<ExecutionOutcome, Error> {
        if program.trim().is_empty() {
            self.finish_loading()?;
            return Ok(ExecutionOutcome::default());
        }
        self.require_attached()?;
        if self.state != HostState::Loading {
            self.begin_loading()?;
        }
        self.call("globalThis.__sandbox_host__.hideBusy()".to_string())?;

        let script = format!(
            "globalThis.__sandbox_host__.run({}, {}, {})",
            js_string(program),
            self.parameter_names,
            self.runtime_values
        );

        // One deadline covers the invocation and the promise jobs it queues.
        let watchdog = self
            .timeout_ms
            .map(|ms| Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), ms));
        let called = self.call(script);
        let settled = match &called {
            Ok(_) => self.runtime.run_event_loop(PollEventLoopOptions::default()).await,
            Err(_) => Ok(()),
        };
        let timed_out = watchdog.is_some_and(Watchdog::disarm);

        let outcome = if timed_out {
            self.runtime.v8_isolate().cancel_terminate_execution();
            tracing::warn!(timeout_ms = self.timeout_ms, "program terminated by execution timeout");
            ExecutionOutcome {
                mount: None,
                error: Some(ExecutionError::new(
                    "TimeoutError",
                    format!("Execution timed out after {}ms", self.timeout_ms.unwrap_or_default()),
                )),
            }
        } else {
            let raw = called?;
            let report = serde_json::from_str::<RunReport>(&raw)
                .map_err(|e| anyhow!("Malformed run report from sandbox host: {}", e))?;
            match (report, settled) {
                (RunReport::Error { error }, _) => ExecutionOutcome {
                    mount: None,
                    error: Some(error),
                },
                (RunReport::Ok { mount }, Err(e)) => {
                    tracing::debug!("promise job failed after run: {}", e);
                    ExecutionOutcome {
                        mount,
                        error: Some(event_loop_error(&e)),
                    }
                }
                (RunReport::Ok { mount }, Ok(())) => ExecutionOutcome { mount, error: None },
            }
        };

        self.state = match &outcome.error {
            Some(error) => {
                tracing::debug!(name = %error.name, "program threw: {}", error.message);
                HostState::Error
            }
            None => HostState::Ready,
        };
        self.settled = self.state;
        Ok(outcome)
    }

    pub fn container_html(&mut self) -> Result<String, Error> {
        self.call("globalThis.__sandbox_host__.containerHtml()".to_string())
    }

    /// The whole region: busy indicator, toggle control and container.
    pub fn region_html(&mut self) -> Result<String, Error> {
        self.call("globalThis.__sandbox_host__.regionHtml()".to_string())
    }

    pub fn busy_visible(&mut self) -> Result<bool, Error> {
        Ok(self.call("globalThis.__sandbox_host__.isBusy()".to_string())? == "true")
    }

    /// Click the fullscreen toggle; returns its new label.
    pub fn toggle_fullscreen(&mut self) -> Result<String, Error> {
        self.require_attached()?;
        self.call("globalThis.__sandbox_host__.toggleFullscreen()".to_string())
    }

    /// Listeners installed anywhere in the region.
    pub fn listener_count(&mut self) -> Result<usize, Error> {
        let raw = self.call("globalThis.__sandbox_host__.listenerCount()".to_string())?;
        raw.parse()
            .map_err(|e| anyhow!("Invalid listener count '{}': {}", raw, e))
    }

    /// Console output captured since the last call.
    pub fn take_console(&mut self) -> ConsoleOutput {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        state
            .try_borrow_mut::<ConsoleOutput>()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn require_attached(&self) -> Result<(), Error> {
        if self.attached {
            Ok(())
        } else {
            Err(anyhow!("Execution host is torn down; attach() it first"))
        }
    }

    /// Evaluate `script` and read its completion value as a string.
    fn call(&mut self, script: String) -> Result<String, Error> {
        let value = self.runtime.execute_script("<sandbox-host>", script)?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value);
        Ok(local.to_rust_string_lossy(scope))
    }
}

/// Terminates the isolate unless disarmed before the deadline.
struct Watchdog {
    done: mpsc::Sender<()>,
    thread: std::thread::JoinHandle<bool>,
}

impl Watchdog {
    fn arm(isolate: v8::IsolateHandle, ms: u64) -> Self {
        let (done, done_rx) = mpsc::channel::<()>();
        // The program runs synchronously on the host thread, so the watchdog needs its own.
        let thread = std::thread::spawn(move || match done_rx.recv_timeout(Duration::from_millis(ms)) {
            Err(RecvTimeoutError::Timeout) => isolate.terminate_execution(),
            _ => false,
        });
        Self { done, thread }
    }

    /// `true` when the deadline passed and execution was terminated.
    fn disarm(self) -> bool {
        let _ = self.done.send(());
        self.thread.join().unwrap_or(false)
    }
}

/// Failure reported by the event loop after the synchronous run, such as an
/// unhandled rejection from an effect.
fn event_loop_error(error: &Error) -> ExecutionError {
    match error.downcast_ref::<JsError>() {
        Some(js) => ExecutionError {
            name: js.name.clone().unwrap_or_else(|| "Error".to_string()),
            message: js.message.clone().unwrap_or_else(|| js.exception_message.clone()),
            stack: js.stack.clone(),
        },
        None => ExecutionError::new("Error", error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_externals;

    fn host() -> ExecutionHost {
        let registry = Arc::new(DependencyRegistry::new(default_externals()).unwrap());
        ExecutionHost::new(&SandboxConfig::default(), registry).unwrap()
    }

    #[test]
    fn test_mount_outcome_wire_format() {
        let found: MountOutcome = serde_json::from_str(r#"{"kind":"Found","component":"App"}"#).unwrap();
        assert_eq!(found, MountOutcome::Found { component: "App".into() });

        let report: RunReport = serde_json::from_str(r#"{"status":"ok","mount":null}"#).unwrap();
        assert!(matches!(report, RunReport::Ok { mount: None }));

        let report: RunReport =
            serde_json::from_str(r#"{"status":"error","error":{"name":"TypeError","message":"boom","stack":null}}"#)
                .unwrap();
        assert!(matches!(report, RunReport::Error { error } if error.name == "TypeError"));
    }

    #[tokio::test]
    async fn test_states_follow_runs() {
        let mut host = host();
        assert_eq!(host.state(), HostState::Idle);

        host.begin_loading().unwrap();
        assert_eq!(host.state(), HostState::Loading);
        assert!(host.busy_visible().unwrap());

        let outcome = host.run("return { kind: 'Found', component: 'X' };").await.unwrap();
        assert_eq!(outcome.mounted_component(), Some("X"));
        assert_eq!(host.state(), HostState::Ready);
        assert!(!host.busy_visible().unwrap());

        host.begin_loading().unwrap();
        let outcome = host.run("throw new TypeError('boom');").await.unwrap();
        assert_eq!(host.state(), HostState::Error);
        assert_eq!(outcome.error.unwrap().name, "TypeError");
    }

    #[tokio::test]
    async fn test_finish_loading_returns_to_settled_state() {
        let mut host = host();
        host.begin_loading().unwrap();
        host.finish_loading().unwrap();
        assert_eq!(host.state(), HostState::Idle);
        assert!(!host.busy_visible().unwrap());
    }

    #[tokio::test]
    async fn test_empty_program_does_not_execute() {
        let mut host = host();
        let outcome = host.run("   ").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::default());
        assert_eq!(host.state(), HostState::Idle);
    }

    #[test]
    fn test_torn_down_host_refuses_work() {
        let mut host = host();
        host.teardown().unwrap();
        assert!(host.begin_loading().is_err());
        host.attach().unwrap();
        assert!(host.begin_loading().is_ok());
    }
}
