//! Build and formatting tools that shell out to trusted binaries.
//!
//! Every handler here is double-gated: the command-tool flag must be
//! on, and the binary must live under a trusted prefix. Workspace files
//! still resolve through the containment check.

use std::path::Path;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use super::{
    input_schema, parse_args, ToolContext, ToolError, ToolFuture, ToolRegistry, ToolResult,
    ToolSpec,
};

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(ToolSpec {
        name: "cargo_check",
        description: "Type-check the workspace with cargo check and report compiler messages.",
        input_schema: input_schema::<NoArgs>(),
        handler: cargo_check_tool,
    });
    registry.register(ToolSpec {
        name: "cargo_test",
        description: "Run the workspace test suite, optionally filtered to matching test names.",
        input_schema: input_schema::<TestArgs>(),
        handler: cargo_test_tool,
    });
    registry.register(ToolSpec {
        name: "format_file",
        description: "Rewrite one source file in place with rustfmt.",
        input_schema: input_schema::<FormatArgs>(),
        handler: format_file_tool,
    });
    registry.register(ToolSpec {
        name: "workspace_diagnostics",
        description: "Run rust-analyzer's batch diagnostics over the whole workspace.",
        input_schema: input_schema::<NoArgs>(),
        handler: workspace_diagnostics_tool,
    });
}

fn cargo_check_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(cargo_check(ctx, args))
}

fn cargo_test_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(cargo_test(ctx, args))
}

fn format_file_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(format_file(ctx, args))
}

fn workspace_diagnostics_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(workspace_diagnostics(ctx, args))
}

#[derive(Deserialize, JsonSchema)]
struct NoArgs {}

#[derive(Deserialize, JsonSchema)]
struct TestArgs {
    /// Substring filter passed to the test harness.
    #[serde(default)]
    filter: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct FormatArgs {
    /// Path to the source file, absolute or relative to the workspace root.
    file_path: String,
}

async fn cargo_check(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let NoArgs {} = parse_args(args)?;
    let cargo = require_binary(ctx.cargo_bin, "cargo")?;
    ctx.policy.check_command(cargo)?;
    run_captured(
        cargo,
        &["check", "--quiet", "--message-format", "short"],
        ctx.workspace.root(),
    )
    .await
}

async fn cargo_test(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let params: TestArgs = parse_args(args)?;
    let cargo = require_binary(ctx.cargo_bin, "cargo")?;
    ctx.policy.check_command(cargo)?;
    let mut argv = vec!["test", "--quiet"];
    if let Some(filter) = params.filter.as_deref() {
        argv.push(filter);
    }
    run_captured(cargo, &argv, ctx.workspace.root()).await
}

async fn format_file(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let params: FormatArgs = parse_args(args)?;
    let rustfmt = require_binary(ctx.rustfmt_bin, "rustfmt")?;
    ctx.policy.check_command(rustfmt)?;
    let path = ctx.workspace.resolve(&params.file_path)?;
    let path_arg = path.display().to_string();
    let output = run_captured(
        rustfmt,
        &["--edition", "2021", &path_arg],
        ctx.workspace.root(),
    )
    .await?;
    if output == NO_OUTPUT {
        Ok(format!("Formatted {path_arg}."))
    } else {
        Ok(output)
    }
}

async fn workspace_diagnostics(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let NoArgs {} = parse_args(args)?;
    let analyzer = require_binary(ctx.rust_analyzer_bin, "rust-analyzer")?;
    ctx.policy.check_command(analyzer)?;
    let root = ctx.workspace.root().display().to_string();
    run_captured(analyzer, &["diagnostics", &root], ctx.workspace.root()).await
}

const NO_OUTPUT: &str = "(no output)";

fn require_binary<'a>(bin: Option<&'a Path>, name: &'static str) -> Result<&'a Path, ToolError> {
    bin.ok_or(ToolError::MissingBinary(name))
}

/// Run one gated binary to completion, capturing both streams. A
/// non-zero exit is still a tool result — the output is the point —
/// while a spawn failure is an error.
async fn run_captured(binary: &Path, argv: &[&str], workdir: &Path) -> ToolResult {
    tracing::debug!("running {} {argv:?}", binary.display());
    let output = Command::new(binary)
        .args(argv)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| ToolError::CommandFailed(format!("{}: {e}", binary.display())))?;

    let mut text = String::new();
    text.push_str(String::from_utf8_lossy(&output.stdout).trim_end());
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim_end());
    }

    if output.status.success() {
        if text.trim().is_empty() {
            return Ok(NO_OUTPUT.to_string());
        }
        Ok(text)
    } else {
        Ok(format!("exit status: {}\n{text}", output.status))
    }
}
