//! Preview Sandbox CLI
//!
//! Single-shot mode:
//!   preview-sandbox <file>
//!
//! Server mode (persistent process, reads from stdin):
//!   preview-sandbox --server
//!
//! Protocol (server mode):
//!   Request (stdin, one JSON object per line):
//!     {"code":"export default function App() { return null }"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Mount:Found
//!     Length:1234
//!
//!     <div id="root">...</div>
//!
//!   Error response:
//!     Status:Error
//!     Mount:None
//!     Length:42
//!
//!     Could not resolve "left-pad-xyz-nonexistent": ...

use anyhow::{anyhow, Result};
use clap::Parser;
use preview_sandbox::{
    Applied, ConsoleOutput, ExecutionOutcome, ModuleLinker, MountOutcome, PreviewSession, SandboxConfig,
};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "preview-sandbox", version, about = "Bundle and run component previews in an isolated host")]
struct Cli {
    /// Source file to bundle and run once
    #[arg(required_unless_present = "server")]
    file: Option<PathBuf>,

    /// Serve JSON requests from stdin
    #[arg(long, conflicts_with = "file")]
    server: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Package CDN base URL (added to the fetch allowlist when one is configured)
    #[arg(long)]
    cdn_base: Option<String>,

    /// Directory served to `@local/` imports
    #[arg(long)]
    internal_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerRequest {
    code: String,
}

fn load_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    if let Some(base) = &cli.cdn_base {
        config = config.with_cdn_base(base)?;
    }
    if let Some(root) = &cli.internal_root {
        config.internal_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_console(console: &ConsoleOutput) {
    for log in &console.logs {
        eprintln!("[LOG] {}", log);
    }
    for warn in &console.warns {
        eprintln!("[WARN] {}", warn);
    }
    for err in &console.errors {
        eprintln!("[ERROR] {}", err);
    }
}

fn mount_label(outcome: Option<&ExecutionOutcome>) -> &'static str {
    match outcome.and_then(|outcome| outcome.mount.as_ref()) {
        Some(MountOutcome::Found { .. }) => "Found",
        Some(MountOutcome::NotFound { .. }) => "NotFound",
        None => "None",
    }
}

/// Submit `code` and wait for its own response.
async fn preview(session: &mut PreviewSession, code: &str) -> Result<Option<Applied>> {
    session.submit(code)?;
    let applied = session.settle().await?;
    print_console(&session.host_mut().take_console());
    Ok(applied.into_iter().last())
}

/// Run in single-shot mode
async fn run_single_shot(config: &SandboxConfig, file: &Path) -> Result<()> {
    let code = std::fs::read_to_string(file).map_err(|e| anyhow!("Failed to read '{}': {}", file.display(), e))?;
    let mut session = PreviewSession::new(config, Box::new(ModuleLinker::new()))?;

    let result = match preview(&mut session, &code).await? {
        None | Some(Applied::NoCode) => Err(anyhow!("Nothing to run: '{}' is empty", file.display())),
        Some(Applied::BuildFailed { message }) => Err(anyhow!(message)),
        Some(Applied::Executed(outcome)) => match outcome.error {
            Some(error) => Err(anyhow!("{}", error)),
            None => {
                if let Some(MountOutcome::NotFound { detail }) = &outcome.mount {
                    tracing::warn!("{}", detail);
                }
                println!("{}", session.host_mut().container_html()?);
                Ok(())
            }
        },
        Some(Applied::Stale { seq }) => Err(anyhow!("Response {} was superseded", seq)),
    };

    session.teardown()?;
    result
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(config: &SandboxConfig) -> Result<()> {
    // Create the session ONCE at startup (V8 cold start happens here)
    let mut session = PreviewSession::new(config, Box::new(ModuleLinker::new()))?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: ServerRequest = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                write_response(&mut stdout, false, None, &format!("Invalid request JSON: {}", e))?;
                continue;
            }
        };

        match preview(&mut session, &request.code).await {
            Ok(Some(Applied::Executed(outcome))) => match &outcome.error {
                Some(error) => write_response(&mut stdout, false, Some(&outcome), &error.to_string())?,
                None => {
                    let html = session.host_mut().container_html()?;
                    write_response(&mut stdout, true, Some(&outcome), &html)?;
                }
            },
            Ok(Some(Applied::BuildFailed { message })) => write_response(&mut stdout, false, None, &message)?,
            Ok(_) => write_response(&mut stdout, true, None, "")?,
            Err(e) => write_response(&mut stdout, false, None, &e.to_string())?,
        }
    }

    session.teardown()?;
    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(
    stdout: &mut std::io::Stdout,
    ok: bool,
    outcome: Option<&ExecutionOutcome>,
    body: &str,
) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Mount:{}", mount_label(outcome))?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "preview_sandbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.server {
        return run_server(&config).await;
    }

    match &cli.file {
        Some(file) => run_single_shot(&config, file).await,
        None => Err(anyhow!("Missing source file (or --server)")),
    }
}
