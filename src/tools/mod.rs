//! The tool catalog: registry, dispatch context, and error taxonomy.

mod analysis;
mod command;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::documents::{DocumentError, DocumentTracker};
use crate::lsp::client::{ClientError, LspClient};
use crate::policy::{Policy, PolicyError};
use crate::workspace::{UriError, Workspace, WorkspaceError};

/// Everything a handler may touch, borrowed for the duration of one
/// call.
pub struct ToolContext<'a> {
    pub lsp: &'a LspClient,
    pub documents: &'a DocumentTracker,
    pub workspace: &'a Workspace,
    pub policy: &'a Policy,
    pub cargo_bin: Option<&'a Path>,
    pub rustfmt_bin: Option<&'a Path>,
    pub rust_analyzer_bin: Option<&'a Path>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("the {0} binary is not configured")]
    MissingBinary(&'static str),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Lsp(#[from] ClientError),
}

impl ToolError {
    /// True when a fresh child session could plausibly change the
    /// outcome; this is what the dispatcher's one-shot reconnect keys
    /// on.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Lsp(e) | Self::Document(DocumentError::Client(e)) => e.is_transient(),
            _ => false,
        }
    }
}

pub type ToolResult = Result<String, ToolError>;

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>>;

/// Handlers are plain functions over a borrowed context; the registry
/// stores them as pointers so the catalog stays a value.
pub type ToolHandler = for<'a> fn(&'a ToolContext<'a>, Value) -> ToolFuture<'a>;

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

/// Name → handler + advertised schema. Iteration order is registration
/// order; nothing relies on it.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `spec`, replacing any previous registration of the name.
    pub fn register(&mut self, spec: ToolSpec) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == spec.name) {
            *existing = spec;
        } else {
            self.tools.push(spec);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// The `tools/list` catalog snapshot.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The full built-in catalog.
pub fn builtin() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    analysis::register(&mut registry);
    command::register(&mut registry);
    registry
}

/// Decode a handler's arguments into its typed form.
fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Encode typed LSP params for the wire.
fn encode<T: Serialize>(params: &T) -> Result<Value, ToolError> {
    serde_json::to_value(params).map_err(|e| ToolError::Lsp(ClientError::Json(e)))
}

/// Object schema for a tool's argument struct, trimmed to the members
/// the protocol advertises.
fn input_schema<T: JsonSchema>() -> Value {
    let mut schema =
        serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Args {
        file_path: String,
        #[serde(default)]
        line: u32,
    }

    #[test]
    fn builtin_catalog_registers_every_tool() {
        let registry = builtin();
        for name in [
            "hover",
            "goto_definition",
            "find_references",
            "document_symbols",
            "diagnostics",
            "cargo_check",
            "cargo_test",
            "format_file",
            "workspace_diagnostics",
        ] {
            assert!(registry.get(name).is_some(), "missing tool {name}");
        }
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn schemas_advertise_object_inputs() {
        let registry = builtin();
        for schema in registry.schemas() {
            assert!(schema["name"].is_string());
            assert!(schema["description"].is_string());
            assert_eq!(schema["inputSchema"]["type"], json!("object"));
        }
    }

    #[test]
    fn input_schema_lists_required_members() {
        let schema = input_schema::<Args>();
        assert_eq!(schema["type"], json!("object"));
        assert!(schema["properties"]["file_path"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("file_path")));
        assert!(!required.contains(&json!("line")));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn parse_args_reports_missing_fields() {
        let err = parse_args::<Args>(json!({})).unwrap_err();
        match err {
            ToolError::InvalidArguments(msg) => assert!(msg.contains("file_path")),
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[test]
    fn register_replaces_by_name() {
        fn noop<'a>(_: &'a ToolContext<'a>, _: Value) -> super::ToolFuture<'a> {
            Box::pin(async { Ok(String::new()) })
        }
        let mut registry = ToolRegistry::new();
        let spec = |description| ToolSpec {
            name: "t",
            description,
            input_schema: json!({"type": "object"}),
            handler: noop,
        };
        registry.register(spec("one"));
        registry.register(spec("two"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("t").unwrap().description, "two");
    }
}
