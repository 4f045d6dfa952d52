//! The north-side server: one message at a time off stdio, gated by the
//! initialization state machine, dispatched to built-in handlers and the
//! tool catalog.
//!
//! Tool calls that die with a transient south error get exactly one
//! reconnect-and-retry cycle: tear down the LSP client, have the
//! supervisor respawn the child, redo the handshake, replay the open
//! documents, run the handler again.

use std::path::PathBuf;

use anyhow::Context as _;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::documents::DocumentTracker;
use crate::lsp::client::LspClient;
use crate::policy::Policy;
use crate::rpc::{self, code, Incoming, RequestId};
use crate::supervisor::Supervisor;
use crate::tools::{ToolContext, ToolHandler, ToolRegistry, ToolResult};
use crate::transport::{NorthReader, NorthWriter, TransportError};
use crate::workspace::Workspace;

/// Protocol revisions this server can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2024-11-05"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Uninitialized,
    Initializing,
    Running,
    Shutdown,
}

/// Borrowed collaborators; the composition root owns all of them and
/// outlives the serve loop.
pub struct Server<'a> {
    registry: &'a ToolRegistry,
    lsp: &'a LspClient,
    documents: &'a DocumentTracker,
    workspace: &'a Workspace,
    policy: &'a Policy,
    supervisor: Option<&'a Mutex<Supervisor>>,
    cargo_bin: Option<PathBuf>,
    rustfmt_bin: Option<PathBuf>,
    rust_analyzer_bin: Option<PathBuf>,
    state: ServerState,
}

impl<'a> Server<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        lsp: &'a LspClient,
        documents: &'a DocumentTracker,
        workspace: &'a Workspace,
        policy: &'a Policy,
    ) -> Self {
        Self {
            registry,
            lsp,
            documents,
            workspace,
            policy,
            supervisor: None,
            cargo_bin: None,
            rustfmt_bin: None,
            rust_analyzer_bin: None,
            state: ServerState::Uninitialized,
        }
    }

    /// Without a supervisor the reconnect cycle cannot run and transient
    /// south failures surface directly.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: &'a Mutex<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    #[must_use]
    pub fn with_binaries(
        mut self,
        cargo: Option<PathBuf>,
        rustfmt: Option<PathBuf>,
        rust_analyzer: Option<PathBuf>,
    ) -> Self {
        self.cargo_bin = cargo;
        self.rustfmt_bin = rustfmt;
        self.rust_analyzer_bin = rust_analyzer;
        self
    }

    /// Drive the loop until EOF on `reader` or a `shutdown` request.
    pub async fn run<R, W>(&mut self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut north = NorthReader::new(reader);
        let writer = NorthWriter::new(writer);
        loop {
            let line = match north.read_message().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!("client closed its stream");
                    break;
                }
                Err(TransportError::LineTooLong(len)) => {
                    tracing::warn!("dropping oversized message of {len} bytes");
                    let reply = rpc::error_response(
                        None,
                        code::PARSE_ERROR,
                        "message exceeds the 1 MiB line limit",
                    );
                    writer.write_message(&serde_json::to_vec(&reply)?).await?;
                    continue;
                }
                Err(e) => return Err(e).context("reading client stream"),
            };

            if let Some(reply) = self.handle_message(&line).await {
                writer.write_message(&serde_json::to_vec(&reply)?).await?;
            }
            if self.state == ServerState::Shutdown {
                tracing::info!("shutdown requested");
                break;
            }
        }
        Ok(())
    }

    /// Process one raw message; `Some` is the reply to write back.
    /// Everything allocated for the message dies with this call.
    async fn handle_message(&mut self, raw: &[u8]) -> Option<Value> {
        let msg: Value = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                return Some(rpc::error_response(
                    None,
                    code::PARSE_ERROR,
                    format!("invalid JSON: {e}"),
                ))
            }
        };
        let Some(Incoming { id, method, params }) = Incoming::from_value(&msg) else {
            return Some(rpc::error_response(
                None,
                code::INVALID_REQUEST,
                "message must be a JSON object",
            ));
        };
        let Some(method) = method else {
            // A method-less notification is noise; a method-less request
            // still deserves an answer.
            return id.as_ref().map(|id| {
                rpc::error_response(Some(id), code::INVALID_REQUEST, "missing method")
            });
        };

        if !self.method_allowed(&method) {
            return match id {
                Some(id) => Some(rpc::error_response(
                    Some(&id),
                    code::SERVER_NOT_INITIALIZED,
                    format!("server is not initialized; {method} is not available yet"),
                )),
                None => {
                    tracing::debug!("dropping {method} notification while not initialized");
                    None
                }
            };
        }

        if id.is_none() && !matches!(method.as_str(), "initialized" | "notifications/initialized") {
            tracing::debug!("dropping unexpected {method} notification");
            return None;
        }

        self.dispatch(&method, id, params).await
    }

    fn method_allowed(&self, method: &str) -> bool {
        match self.state {
            // `initialize` passes the gate everywhere so that a repeat
            // gets the dedicated already-initialized error.
            ServerState::Uninitialized => {
                matches!(method, "initialize" | "ping" | "shutdown")
            }
            ServerState::Initializing => matches!(
                method,
                "initialize" | "initialized" | "notifications/initialized" | "ping" | "shutdown"
            ),
            ServerState::Running | ServerState::Shutdown => true,
        }
    }

    async fn dispatch(
        &mut self,
        method: &str,
        id: Option<RequestId>,
        params: Value,
    ) -> Option<Value> {
        match method {
            "initialize" => Some(self.handle_initialize(id.as_ref(), &params)),
            "initialized" | "notifications/initialized" => {
                self.state = ServerState::Running;
                tracing::debug!("client session is up");
                None
            }
            "shutdown" => {
                self.state = ServerState::Shutdown;
                Some(rpc::response(id.as_ref(), Value::Null))
            }
            "ping" => Some(rpc::response(id.as_ref(), json!({}))),
            "tools/list" => Some(rpc::response(
                id.as_ref(),
                json!({ "tools": self.registry.schemas() }),
            )),
            "tools/call" => Some(self.handle_tool_call(id.as_ref(), &params).await),
            "resources/list" => Some(rpc::response(id.as_ref(), json!({ "resources": [] }))),
            _ => id.as_ref().map(|id| {
                rpc::error_response(
                    Some(id),
                    code::METHOD_NOT_FOUND,
                    format!("unknown method: {method}"),
                )
            }),
        }
    }

    fn handle_initialize(&mut self, id: Option<&RequestId>, params: &Value) -> Value {
        if self.state != ServerState::Uninitialized {
            return rpc::error_response(
                id,
                code::INVALID_REQUEST,
                "initialize may only be sent once",
            );
        }
        let Some(requested) = params.get("protocolVersion").and_then(Value::as_str) else {
            return rpc::error_response(
                id,
                code::INVALID_PARAMS,
                "initialize requires a string protocolVersion",
            );
        };
        let Some(version) = SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|v| **v == requested)
        else {
            return rpc::error_response(
                id,
                code::INVALID_PARAMS,
                format!(
                    "unsupported protocol version {requested}; supported: {}",
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            );
        };
        self.state = ServerState::Initializing;
        tracing::info!("negotiated protocol version {version}");
        rpc::response(
            id,
            json!({
                "protocolVersion": version,
                "capabilities": {
                    "tools": {},
                    "resources": {},
                },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    async fn handle_tool_call(&self, id: Option<&RequestId>, params: &Value) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return rpc::error_response(id, code::INVALID_PARAMS, "tools/call requires a tool name");
        };
        let Some(spec) = self.registry.get(name) else {
            return rpc::error_response(id, code::INVALID_PARAMS, format!("unknown tool: {name}"));
        };
        let handler = spec.handler;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.run_tool(handler, arguments).await {
            Ok(text) => rpc::response(
                id,
                json!({ "content": [{ "type": "text", "text": text }] }),
            ),
            Err(e) => rpc::response(
                id,
                json!({
                    "content": [{ "type": "text", "text": e.to_string() }],
                    "isError": true,
                }),
            ),
        }
    }

    /// Run a handler, allowing one reconnect-and-retry cycle on a
    /// transient south failure. If the cycle itself fails, the original
    /// error is what surfaces.
    async fn run_tool(&self, handler: ToolHandler, arguments: Value) -> ToolResult {
        let first = {
            let ctx = self.tool_context();
            handler(&ctx, arguments.clone()).await
        };
        match first {
            Err(e) if e.is_transient() => {
                tracing::warn!("tool hit a transient language-server failure, recycling the child: {e}");
                match self.reconnect().await {
                    Ok(()) => {
                        let ctx = self.tool_context();
                        handler(&ctx, arguments).await
                    }
                    Err(reconnect_err) => {
                        tracing::error!("reconnect failed: {reconnect_err:#}");
                        Err(e)
                    }
                }
            }
            other => other,
        }
    }

    fn tool_context(&self) -> ToolContext<'_> {
        ToolContext {
            lsp: self.lsp,
            documents: self.documents,
            workspace: self.workspace,
            policy: self.policy,
            cargo_bin: self.cargo_bin.as_deref(),
            rustfmt_bin: self.rustfmt_bin.as_deref(),
            rust_analyzer_bin: self.rust_analyzer_bin.as_deref(),
        }
    }

    /// One recycle of the south session: new child, fresh handshake,
    /// replayed documents.
    async fn reconnect(&self) -> anyhow::Result<()> {
        let supervisor = self
            .supervisor
            .context("no supervisor to restart the language server with")?;
        self.lsp.disconnect().await;
        let mut supervisor = supervisor.lock().await;
        supervisor.restart().await?;
        let (stdin, stdout, stderr) = supervisor
            .detach_pipes()
            .context("freshly spawned child has no pipes")?;
        drop(supervisor);
        self.lsp.connect(stdin, stdout, Some(Box::new(stderr))).await;
        self.lsp.initialize(self.workspace.root_uri()).await?;
        self.documents.reopen_all(self.lsp).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: ToolRegistry,
        lsp: LspClient,
        documents: DocumentTracker,
        workspace: Workspace,
        policy: Policy,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let workspace = Workspace::new(dir.path()).unwrap();
            Self {
                _dir: dir,
                registry: tools::builtin(),
                lsp: LspClient::new(),
                documents: DocumentTracker::new(),
                workspace,
                policy: Policy::new(false),
            }
        }

        fn server(&self) -> Server<'_> {
            Server::new(
                &self.registry,
                &self.lsp,
                &self.documents,
                &self.workspace,
                &self.policy,
            )
        }
    }

    async fn send(server: &mut Server<'_>, msg: &str) -> Option<Value> {
        server.handle_message(msg.as_bytes()).await
    }

    async fn initialize(server: &mut Server<'_>) {
        let reply = send(
            server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();
        assert!(reply.get("error").is_none());
        assert!(send(server, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn initialize_negotiates_the_requested_version() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"]["protocolVersion"], json!("2024-11-05"));
        assert_eq!(reply["result"]["serverInfo"]["name"], json!("ra-bridge"));
        assert!(reply["result"]["capabilities"]["tools"].is_object());
        assert_eq!(server.state, ServerState::Initializing);
    }

    #[tokio::test]
    async fn unsupported_version_is_invalid_params() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2020-01-01"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_PARAMS));
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unsupported"));
        assert_eq!(server.state, ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn missing_version_is_invalid_params() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn initialized_notification_moves_to_running() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        assert_eq!(server.state, ServerState::Running);
    }

    #[tokio::test]
    async fn reinitialize_is_rejected_without_state_change() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":5,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_REQUEST));
        assert_eq!(server.state, ServerState::Running);
    }

    #[tokio::test]
    async fn gated_request_gets_not_initialized() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::SERVER_NOT_INITIALIZED));
        assert_eq!(reply["id"], json!(9));
    }

    #[tokio::test]
    async fn gated_notification_is_dropped() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        assert!(send(&mut server, r#"{"jsonrpc":"2.0","method":"tools/list"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn early_initialized_does_not_skip_ahead() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        assert!(send(
            &mut server,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        )
        .await
        .is_none());
        assert_eq!(server.state, ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn ping_works_in_every_state() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(reply["result"], json!({}));
        initialize(&mut server).await;
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn parse_error_answers_with_null_id() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, "{not json").await.unwrap();
        assert_eq!(reply["error"]["code"], json!(code::PARSE_ERROR));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn non_object_is_invalid_request() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, "[1,2,3]").await.unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn request_without_method_is_invalid() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":4}"#).await.unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_REQUEST));
        assert_eq!(reply["id"], json!(4));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found_when_running() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":7,"method":"frobnicate"}"#)
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn shutdown_replies_null_and_halts() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":8,"method":"shutdown"}"#)
            .await
            .unwrap();
        assert_eq!(reply["result"], Value::Null);
        assert_eq!(server.state, ServerState::Shutdown);
    }

    #[tokio::test]
    async fn tools_list_has_names_descriptions_and_schemas() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(&mut server, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let listed = reply["result"]["tools"].as_array().unwrap();
        assert!(!listed.is_empty());
        for tool in listed {
            assert!(tool["name"].is_string());
            assert!(tool["description"].is_string());
            assert_eq!(tool["inputSchema"]["type"], json!("object"));
        }
    }

    #[tokio::test]
    async fn resources_list_is_empty() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["resources"], json!([]));
    }

    #[tokio::test]
    async fn tool_call_with_missing_argument_is_error_content() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"hover","arguments":{}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], json!(true));
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("file_path"), "unhelpful error: {text}");
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"no_such_tool"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(code::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn transient_failure_without_supervisor_surfaces_original_error() {
        // The LSP client was never connected, so hover dies with
        // NotConnected; with no supervisor wired in, the one-shot
        // reconnect fails and the original error becomes tool output.
        let fixture = Fixture::new();
        let file = fixture.workspace.root().join("lib.rs");
        std::fs::write(&file, "fn a() {}").unwrap();
        let mut server = fixture.server();
        initialize(&mut server).await;
        let request = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"hover","arguments":{"file_path":"lib.rs","line":0,"character":0}}}"#;
        let reply = send(&mut server, request).await.unwrap();
        assert_eq!(reply["result"]["isError"], json!(true));
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("not connected"), "unexpected text: {text}");
    }

    #[tokio::test]
    async fn string_ids_round_trip() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = send(
            &mut server,
            r#"{"jsonrpc":"2.0","id":"init-1","method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["id"], json!("init-1"));
        assert_eq!(reply["result"]["protocolVersion"], json!("2025-06-18"));
    }
}
