//! Code-intelligence tools backed by the child language server.
//!
//! Each handler resolves its file inside the workspace, makes sure the
//! document is open south-side, issues one LSP request, and renders the
//! reply as plain text with 1-indexed positions.

use lsp_types::{
    DiagnosticSeverity, DocumentDiagnosticParams, DocumentDiagnosticReport,
    DocumentDiagnosticReportResult, DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverContents, HoverParams, Location,
    MarkedString, PartialResultParams, Position, ReferenceContext, ReferenceParams, SymbolKind,
    TextDocumentIdentifier, TextDocumentPositionParams, WorkDoneProgressParams,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{
    encode, input_schema, parse_args, ToolContext, ToolError, ToolFuture, ToolRegistry,
    ToolResult, ToolSpec,
};
use crate::workspace;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(ToolSpec {
        name: "hover",
        description: "Get the type signature and documentation for the symbol at a position.",
        input_schema: input_schema::<PositionArgs>(),
        handler: hover_tool,
    });
    registry.register(ToolSpec {
        name: "goto_definition",
        description: "Find where the symbol at a position is defined. Returns file:line:column locations.",
        input_schema: input_schema::<PositionArgs>(),
        handler: goto_definition_tool,
    });
    registry.register(ToolSpec {
        name: "find_references",
        description: "List every reference to the symbol at a position.",
        input_schema: input_schema::<ReferencesArgs>(),
        handler: find_references_tool,
    });
    registry.register(ToolSpec {
        name: "document_symbols",
        description: "Outline the symbols defined in a file.",
        input_schema: input_schema::<FileArgs>(),
        handler: document_symbols_tool,
    });
    registry.register(ToolSpec {
        name: "diagnostics",
        description: "Get compiler errors and warnings for a file, with line numbers and severity.",
        input_schema: input_schema::<FileArgs>(),
        handler: diagnostics_tool,
    });
}

fn hover_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(hover(ctx, args))
}

fn goto_definition_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(goto_definition(ctx, args))
}

fn find_references_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(find_references(ctx, args))
}

fn document_symbols_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(document_symbols(ctx, args))
}

fn diagnostics_tool<'a>(ctx: &'a ToolContext<'a>, args: Value) -> ToolFuture<'a> {
    Box::pin(diagnostics(ctx, args))
}

#[derive(Deserialize, JsonSchema)]
struct FileArgs {
    /// Path to the source file, absolute or relative to the workspace root.
    file_path: String,
}

#[derive(Deserialize, JsonSchema)]
struct PositionArgs {
    /// Path to the source file, absolute or relative to the workspace root.
    file_path: String,
    /// Zero-based line number.
    line: u32,
    /// Zero-based character offset.
    character: u32,
}

#[derive(Deserialize, JsonSchema)]
struct ReferencesArgs {
    /// Path to the source file, absolute or relative to the workspace root.
    file_path: String,
    /// Zero-based line number.
    line: u32,
    /// Zero-based character offset.
    character: u32,
    /// Include the declaration itself in the results.
    #[serde(default = "default_true")]
    include_declaration: bool,
}

const fn default_true() -> bool {
    true
}

/// Resolve, open, and address one position in a workspace file.
async fn open_position(
    ctx: &ToolContext<'_>,
    file_path: &str,
    line: u32,
    character: u32,
) -> Result<TextDocumentPositionParams, ToolError> {
    let path = ctx.workspace.resolve(file_path)?;
    ctx.documents.ensure_open(ctx.lsp, &path).await?;
    Ok(TextDocumentPositionParams {
        text_document: TextDocumentIdentifier {
            uri: workspace::file_uri(&path)?,
        },
        position: Position::new(line, character),
    })
}

async fn open_document(
    ctx: &ToolContext<'_>,
    file_path: &str,
) -> Result<TextDocumentIdentifier, ToolError> {
    let path = ctx.workspace.resolve(file_path)?;
    ctx.documents.ensure_open(ctx.lsp, &path).await?;
    Ok(TextDocumentIdentifier {
        uri: workspace::file_uri(&path)?,
    })
}

fn decode<T: serde::de::DeserializeOwned>(result: Value) -> Result<T, ToolError> {
    serde_json::from_value(result).map_err(|e| ToolError::Lsp(crate::lsp::ClientError::Json(e)))
}

async fn hover(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let args: PositionArgs = parse_args(args)?;
    let params = HoverParams {
        text_document_position_params: open_position(ctx, &args.file_path, args.line, args.character)
            .await?,
        work_done_progress_params: WorkDoneProgressParams::default(),
    };
    let result = ctx
        .lsp
        .send_request("textDocument/hover", encode(&params)?)
        .await?;
    let hover: Option<Hover> = decode(result)?;
    Ok(hover.map_or_else(
        || "No hover information available at this position.".to_string(),
        |h| flatten_hover(h.contents),
    ))
}

fn flatten_hover(contents: HoverContents) -> String {
    match contents {
        HoverContents::Markup(markup) => markup.value,
        HoverContents::Scalar(marked) => flatten_marked(marked),
        HoverContents::Array(items) => items
            .into_iter()
            .map(flatten_marked)
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn flatten_marked(marked: MarkedString) -> String {
    match marked {
        MarkedString::String(s) => s,
        MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
    }
}

async fn goto_definition(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let args: PositionArgs = parse_args(args)?;
    let params = GotoDefinitionParams {
        text_document_position_params: open_position(ctx, &args.file_path, args.line, args.character)
            .await?,
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let result = ctx
        .lsp
        .send_request("textDocument/definition", encode(&params)?)
        .await?;
    let response: Option<GotoDefinitionResponse> = decode(result)?;

    let locations = match response {
        Some(GotoDefinitionResponse::Scalar(loc)) => vec![loc],
        Some(GotoDefinitionResponse::Array(locs)) => locs,
        Some(GotoDefinitionResponse::Link(links)) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
        None => Vec::new(),
    };

    if locations.is_empty() {
        return Ok("No definition found at this position.".to_string());
    }
    Ok(locations
        .iter()
        .map(format_location)
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn find_references(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let args: ReferencesArgs = parse_args(args)?;
    let params = ReferenceParams {
        text_document_position: open_position(ctx, &args.file_path, args.line, args.character)
            .await?,
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
        context: ReferenceContext {
            include_declaration: args.include_declaration,
        },
    };
    let result = ctx
        .lsp
        .send_request("textDocument/references", encode(&params)?)
        .await?;
    let locations: Option<Vec<Location>> = decode(result)?;

    match locations {
        Some(locations) if !locations.is_empty() => {
            let listing = locations
                .iter()
                .map(format_location)
                .collect::<Vec<_>>()
                .join("\n");
            Ok(format!("Found {} reference(s):\n{listing}", locations.len()))
        }
        _ => Ok("No references found at this position.".to_string()),
    }
}

async fn document_symbols(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let args: FileArgs = parse_args(args)?;
    let params = DocumentSymbolParams {
        text_document: open_document(ctx, &args.file_path).await?,
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let result = ctx
        .lsp
        .send_request("textDocument/documentSymbol", encode(&params)?)
        .await?;
    let response: Option<DocumentSymbolResponse> = decode(result)?;

    let mut lines = Vec::new();
    match response {
        Some(DocumentSymbolResponse::Nested(symbols)) => {
            for symbol in &symbols {
                push_symbol(&mut lines, symbol, 0);
            }
        }
        Some(DocumentSymbolResponse::Flat(symbols)) => {
            for symbol in &symbols {
                lines.push(format!(
                    "{} {} ({})",
                    symbol_kind_name(symbol.kind),
                    symbol.name,
                    format_location(&symbol.location),
                ));
            }
        }
        None => {}
    }

    if lines.is_empty() {
        return Ok("No symbols found in this file.".to_string());
    }
    Ok(lines.join("\n"))
}

fn push_symbol(lines: &mut Vec<String>, symbol: &DocumentSymbol, depth: usize) {
    lines.push(format!(
        "{}{} {} ({}:{})",
        "  ".repeat(depth),
        symbol_kind_name(symbol.kind),
        symbol.name,
        symbol.selection_range.start.line + 1,
        symbol.selection_range.start.character + 1,
    ));
    if let Some(children) = &symbol.children {
        for child in children {
            push_symbol(lines, child, depth + 1);
        }
    }
}

fn symbol_kind_name(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::MODULE | SymbolKind::NAMESPACE | SymbolKind::PACKAGE => "mod",
        SymbolKind::CLASS | SymbolKind::STRUCT => "struct",
        SymbolKind::ENUM => "enum",
        SymbolKind::ENUM_MEMBER => "variant",
        SymbolKind::INTERFACE => "trait",
        SymbolKind::FUNCTION => "fn",
        SymbolKind::METHOD | SymbolKind::CONSTRUCTOR => "method",
        SymbolKind::FIELD | SymbolKind::PROPERTY => "field",
        SymbolKind::CONSTANT => "const",
        SymbolKind::VARIABLE => "let",
        SymbolKind::TYPE_PARAMETER => "type",
        _ => "symbol",
    }
}

async fn diagnostics(ctx: &ToolContext<'_>, args: Value) -> ToolResult {
    let args: FileArgs = parse_args(args)?;
    let params = DocumentDiagnosticParams {
        text_document: open_document(ctx, &args.file_path).await?,
        identifier: None,
        previous_result_id: None,
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let result = ctx
        .lsp
        .send_request("textDocument/diagnostic", encode(&params)?)
        .await?;
    let report: DocumentDiagnosticReportResult = decode(result)?;

    let items = match report {
        DocumentDiagnosticReportResult::Report(DocumentDiagnosticReport::Full(full)) => {
            full.full_document_diagnostic_report.items
        }
        DocumentDiagnosticReportResult::Report(DocumentDiagnosticReport::Unchanged(_))
        | DocumentDiagnosticReportResult::Partial(_) => vec![],
    };

    if items.is_empty() {
        return Ok("No diagnostics found.".to_string());
    }
    Ok(items
        .iter()
        .map(|d| {
            format!(
                "{}:{}: [{}] {}",
                d.range.start.line + 1,
                d.range.start.character + 1,
                severity_name(d.severity),
                d.message,
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn severity_name(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "ERROR",
        Some(DiagnosticSeverity::WARNING) => "WARNING",
        Some(DiagnosticSeverity::INFORMATION) => "INFO",
        Some(DiagnosticSeverity::HINT) => "HINT",
        _ => "UNKNOWN",
    }
}

/// `file:line:col`, 1-indexed.
fn format_location(loc: &Location) -> String {
    let path = workspace::uri_to_path(loc.uri.as_str())
        .map_or_else(|_| loc.uri.as_str().to_string(), |p| p.display().to_string());
    format!(
        "{}:{}:{}",
        path,
        loc.range.start.line + 1,
        loc.range.start.character + 1,
    )
}
