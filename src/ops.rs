//! deno_core extension backing the execution host.
//!
//! The ops only capture console output; everything the sandboxed program can
//! touch (element tree, renderer libraries, host entry points) lives in
//! `bootstrap.js`.

use deno_core::{op2, OpState};

/// Captured console output from the sandboxed runtime
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }

    fn stream(&mut self, level: Level) -> &mut Vec<String> {
        match level {
            Level::Log => &mut self.logs,
            Level::Warn => &mut self.warns,
            Level::Error => &mut self.errors,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Log,
    Warn,
    Error,
}

/// No-op when the host has not installed a `ConsoleOutput`.
fn capture(state: &mut OpState, level: Level, msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.stream(level).push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    capture(state, Level::Log, msg);
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    capture(state, Level::Warn, msg);
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    capture(state, Level::Error, msg);
}

deno_core::extension!(
    sandbox_host,
    ops = [op_console_log, op_console_warn, op_console_error],
    esm_entry_point = "ext:sandbox_host/bootstrap.js",
    esm = ["ext:sandbox_host/bootstrap.js" = "src/bootstrap.js"],
);
