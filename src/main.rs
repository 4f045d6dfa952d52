//! ra-bridge entry point: wire the collaborators together, start the
//! child, run the north loop, tear everything down in reverse.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::time::timeout;

use ra_bridge::documents::DocumentTracker;
use ra_bridge::lsp::LspClient;
use ra_bridge::policy::Policy;
use ra_bridge::server::Server;
use ra_bridge::supervisor::Supervisor;
use ra_bridge::tools;
use ra_bridge::workspace::Workspace;

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

/// Explicit env override first, then PATH lookup.
fn discover(var: &str, binary: &str) -> Option<PathBuf> {
    env_path(var).or_else(|| which::which(binary).ok())
}

fn env_flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|v| {
        let v = v.trim();
        !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging goes to stderr; stdout is the protocol stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let root = env_path("WORKSPACE_ROOT")
        .or_else(|| std::env::current_dir().ok())
        .context("cannot determine the workspace root")?;
    let workspace = Workspace::new(&root)
        .with_context(|| format!("invalid workspace root {}", root.display()))?;

    let rust_analyzer = discover("RUST_ANALYZER_PATH", "rust-analyzer")
        .context("rust-analyzer not found; set RUST_ANALYZER_PATH")?;
    let cargo = discover("CARGO_PATH", "cargo");
    let rustfmt = discover("RUSTFMT_PATH", "rustfmt");

    let mut policy = Policy::new(env_flag("BRIDGE_ENABLE_COMMANDS"));
    if let Some(dirs) = std::env::var_os("BRIDGE_TRUSTED_BIN_DIRS") {
        policy = policy.with_trusted_prefixes(std::env::split_paths(&dirs));
    }

    tracing::info!("workspace root: {}", workspace.root().display());
    tracing::info!("language server: {}", rust_analyzer.display());

    let mut supervisor = Supervisor::new(&rust_analyzer).with_workdir(workspace.root());
    supervisor
        .spawn()
        .await
        .context("failed to start the language server")?;
    let (stdin, stdout, stderr) = supervisor
        .detach_pipes()
        .context("language server spawned without pipes")?;
    let supervisor = Mutex::new(supervisor);

    let lsp = LspClient::new();
    lsp.connect(stdin, stdout, Some(Box::new(stderr))).await;
    lsp.initialize(workspace.root_uri())
        .await
        .context("language server handshake failed")?;

    let documents = DocumentTracker::new();
    let registry = tools::builtin();

    let mut server = Server::new(&registry, &lsp, &documents, &workspace, &policy)
        .with_supervisor(&supervisor)
        .with_binaries(cargo, rustfmt, Some(rust_analyzer));

    let served = server
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    // Best-effort LSP goodbye before the child goes away.
    if lsp.is_running() {
        match timeout(
            Duration::from_secs(5),
            lsp.send_request("shutdown", Value::Null),
        )
        .await
        {
            Ok(Ok(_)) => {
                if let Err(e) = lsp.send_notification("exit", Value::Null).await {
                    tracing::debug!("language server exit notification failed: {e}");
                }
            }
            Ok(Err(e)) => tracing::debug!("language server shutdown request failed: {e}"),
            Err(_) => tracing::debug!("language server shutdown request timed out"),
        }
    }
    lsp.disconnect().await;
    supervisor.lock().await.kill().await;

    served
}
