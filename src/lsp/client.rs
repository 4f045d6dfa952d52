//! LSP JSON-RPC client for the supervised child process.
//!
//! Handles request/response correlation over the Content-Length framed
//! pipes and the `initialize`/`initialized` handshake. Many callers can
//! issue requests concurrently against the single child pipe: each call
//! parks on a one-shot waiter published in the pending table, and a
//! background reader task demultiplexes replies by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::rpc;
use crate::transport::south::{FrameReader, FrameWriter, READ_BUFFER_BYTES};

/// Rust-analyzer can be slow on large workspaces; 30 seconds is
/// generous for any single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;
type BoxWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("language server is not connected")]
    NotConnected,
    #[error("language server request timed out")]
    RequestTimeout,
    #[error("language server closed the stream without responding")]
    NoResponse,
    #[error("language server error {code}: {message}")]
    Lsp { code: i64, message: String },
    #[error("malformed language-server payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pipe failure: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors worth one reconnect-and-retry cycle: the child is gone or
    /// refused us, as opposed to merely being slow.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::NoResponse | Self::Lsp { .. }
        )
    }
}

pub struct LspClient {
    writer: Mutex<Option<BoxWriter>>,
    pending: PendingMap,
    next_id: AtomicI64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl Default for LspClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LspClient {
    pub fn new() -> Self {
        Self::with_request_timeout(REQUEST_TIMEOUT)
    }

    /// A client with a custom per-request deadline. Production code
    /// uses [`REQUEST_TIMEOUT`]; tests shorten it.
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            request_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Attach to a fresh child session: spawn the reader task on the
    /// child's stdout and, when given, a drain task for its stderr. Any
    /// previous session is torn down first.
    pub async fn connect(
        &self,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    ) {
        self.disconnect().await;
        *self.writer.lock().await = Some(FrameWriter::new(Box::new(writer)));
        self.running.store(true, Ordering::Release);
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(reader_loop(
            Box::new(reader),
            Arc::clone(&self.pending),
            Arc::clone(&self.running),
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_drain(stderr)));
        }
    }

    /// Send `method` and park until the matching reply or the deadline.
    /// Returns the reply's `result` payload.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if !self.is_running() {
            return Err(ClientError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&json!({
            "jsonrpc": rpc::JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_frame(&body).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let reply = match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // The sender was dropped: the reader drained the table on
            // its way out, or disconnect() cleared it.
            Ok(Err(_)) => return Err(ClientError::NoResponse),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ClientError::RequestTimeout);
            }
        };

        if let Some(error) = reply.get("error") {
            return Err(ClientError::Lsp {
                code: error
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(rpc::code::INTERNAL_ERROR),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fire-and-forget message with no id.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), ClientError> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": rpc::JSONRPC_VERSION,
            "method": method,
            "params": params,
        }))?;
        self.write_frame(&body).await
    }

    /// The fixed handshake: `initialize` carrying the bridge's client
    /// capabilities, then `initialized` with explicit `{}` params — an
    /// object, not an array, which some servers reject.
    pub async fn initialize(&self, root_uri: &str) -> Result<Value, ClientError> {
        let result = self
            .send_request(
                "initialize",
                json!({
                    "processId": null,
                    "rootUri": root_uri,
                    "capabilities": client_capabilities(),
                }),
            )
            .await?;
        self.send_notification("initialized", json!({})).await?;
        tracing::info!("language server handshake complete");
        Ok(result)
    }

    /// Tear the session down: the writer (and with it the child's
    /// stdin) closes, every parked waiter fails, and both background
    /// tasks are joined.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::Release);
        *self.writer.lock().await = None;
        self.pending.lock().await.clear();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!("background task failed during disconnect: {e}"),
            }
        }
    }

    async fn write_frame(&self, body: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        writer.write_frame(body).await.map_err(|e| {
            // A write into a dead child's pipe means "no session", not
            // a caller problem.
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                ClientError::NotConnected
            } else {
                ClientError::Io(e)
            }
        })
    }
}

/// The capability document sent on every handshake. Kept minimal and
/// fixed: the bridge consumes markdown hover, location links, symbol
/// hierarchies, and pull diagnostics, nothing else.
fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "definition": { "linkSupport": true },
            "references": {},
            "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
            "diagnostic": { "relatedDocumentSupport": false },
            "synchronization": { "didSave": false }
        },
        "workspace": {
            "workspaceFolders": false
        }
    })
}

/// Read framed messages from the child's stdout and hand replies to
/// their waiters. Exits on EOF or a read failure, draining the pending
/// table so parked callers fail promptly instead of timing out.
async fn reader_loop(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    pending: PendingMap,
    running: Arc<AtomicBool>,
) {
    let mut reader = FrameReader::new(BufReader::with_capacity(READ_BUFFER_BYTES, stdout));
    loop {
        match reader.read_frame().await {
            Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                Ok(msg) => dispatch_reply(&pending, msg).await,
                Err(e) => tracing::warn!("discarding undecodable language-server message: {e}"),
            },
            Ok(None) => {
                tracing::info!("language server stream closed");
                break;
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    tracing::error!("language server read failed: {e}");
                }
                break;
            }
        }
    }
    running.store(false, Ordering::Release);
    let mut map = pending.lock().await;
    let orphaned = map.len();
    map.clear();
    drop(map);
    if orphaned > 0 {
        tracing::warn!("reader exited with {orphaned} request(s) still pending");
    }
}

async fn dispatch_reply(pending: &Mutex<HashMap<i64, oneshot::Sender<Value>>>, msg: Value) {
    // A reply has an id and no method. Only integer ids are generated
    // on this side, so only integer ids correlate; everything else —
    // server-initiated requests, notifications, string ids — is dropped.
    let id = msg.get("id").and_then(Value::as_i64);
    if let (Some(id), None) = (id, msg.get("method")) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(msg);
        } else {
            tracing::debug!("reply for unknown or expired request id {id}");
        }
    } else {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("?");
        tracing::debug!("ignoring server-initiated message: {method}");
    }
}

async fn stderr_drain(stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    tracing::debug!("language server stderr: {trimmed}");
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// A scripted child: reads framed requests, replies via `respond`.
    fn fake_server<F>(io: DuplexStream, respond: F) -> JoinHandle<()>
    where
        F: Fn(Value) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(io);
            let mut reader = FrameReader::new(BufReader::new(read));
            let mut writer = FrameWriter::new(write);
            while let Ok(Some(body)) = reader.read_frame().await {
                let msg: Value = serde_json::from_slice(&body).unwrap();
                if let Some(reply) = respond(msg) {
                    let body = serde_json::to_vec(&reply).unwrap();
                    writer.write_frame(&body).await.unwrap();
                }
            }
        })
    }

    async fn connected_pair<F>(respond: F) -> (LspClient, JoinHandle<()>)
    where
        F: Fn(Value) -> Option<Value> + Send + 'static,
    {
        let (ours, theirs) = duplex(64 * 1024);
        let server = fake_server(theirs, respond);
        let client = LspClient::new();
        let (read, write) = tokio::io::split(ours);
        client.connect(write, read, None).await;
        (client, server)
    }

    fn echo_reply(msg: Value) -> Option<Value> {
        let id = msg.get("id")?.as_i64()?;
        Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "echo": id, "method": msg["method"] },
        }))
    }

    #[tokio::test]
    async fn request_gets_its_own_reply() {
        let (client, _server) = connected_pair(echo_reply).await;
        let result = client
            .send_request("textDocument/hover", json!({}))
            .await
            .unwrap();
        assert_eq!(result["method"], json!("textDocument/hover"));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_by_id() {
        let (client, _server) = connected_pair(echo_reply).await;
        let client = Arc::new(client);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.send_request("m", json!({})).await.unwrap()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(seen.insert(result["echo"].as_i64().unwrap()));
        }
        assert_eq!(seen.len(), 16);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_the_right_callers() {
        // Batch ids pairwise and answer each pair in reverse order.
        let held = Arc::new(std::sync::Mutex::new(Vec::<i64>::new()));
        let held_in = Arc::clone(&held);
        let (ours, theirs) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let (read, write) = tokio::io::split(theirs);
            let mut reader = FrameReader::new(BufReader::new(read));
            let mut writer = FrameWriter::new(write);
            while let Ok(Some(body)) = reader.read_frame().await {
                let msg: Value = serde_json::from_slice(&body).unwrap();
                let id = msg["id"].as_i64().unwrap();
                let ready: Vec<i64> = {
                    let mut held = held_in.lock().unwrap();
                    held.push(id);
                    if held.len() < 2 {
                        continue;
                    }
                    held.drain(..).rev().collect()
                };
                for id in ready {
                    let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"echo": id}});
                    writer
                        .write_frame(&serde_json::to_vec(&reply).unwrap())
                        .await
                        .unwrap();
                }
            }
        });
        let client = Arc::new(LspClient::new());
        let (read, write) = tokio::io::split(ours);
        client.connect(write, read, None).await;

        let a = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_request("a", json!({})).await.unwrap() })
        };
        let b = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_request("b", json!({})).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_ne!(a["echo"], b["echo"]);
        client.disconnect().await;
        server.abort();
    }

    #[tokio::test]
    async fn timeout_cleans_the_pending_entry() {
        let (ours, _theirs) = duplex(64 * 1024);
        let client = LspClient::with_request_timeout(Duration::from_millis(50));
        let (read, write) = tokio::io::split(ours);
        client.connect(write, read, None).await;

        let err = client.send_request("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout));
        assert!(client.pending.lock().await.is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn stream_close_fails_pending_requests() {
        let (ours, theirs) = duplex(64 * 1024);
        let client = Arc::new(LspClient::new());
        let (read, write) = tokio::io::split(ours);
        client.connect(write, read, None).await;

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_request("m", json!({})).await })
        };
        // Let the request land, then hang up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(theirs);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::NoResponse));
        assert!(client.pending.lock().await.is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn error_replies_surface_code_and_message() {
        let (client, _server) = connected_pair(|msg| {
            let id = msg.get("id")?.as_i64()?;
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "nope" },
            }))
        })
        .await;
        match client.send_request("m", json!({})).await.unwrap_err() {
            ClientError::Lsp { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "nope");
            }
            other => panic!("expected Lsp error, got {other:?}"),
        }
        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_joins_tasks_and_rejects_new_requests() {
        let (client, _server) = connected_pair(echo_reply).await;
        client.disconnect().await;
        assert!(client.tasks.lock().await.is_empty());
        assert!(client.pending.lock().await.is_empty());
        assert!(matches!(
            client.send_request("m", json!({})).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unconnected_client_is_not_running() {
        let client = LspClient::new();
        assert!(!client.is_running());
        assert!(matches!(
            client.send_request("m", json!({})).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn initialize_sends_handshake_pair() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
        let seen_in = Arc::clone(&seen);
        let (client, _server) = connected_pair(move |msg| {
            seen_in.lock().unwrap().push(msg.clone());
            echo_reply(msg)
        })
        .await;

        client.initialize("file:///tmp/ws").await.unwrap();
        // Give the notification a beat to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["method"], json!("initialize"));
        assert_eq!(seen[0]["params"]["processId"], Value::Null);
        assert_eq!(seen[0]["params"]["rootUri"], json!("file:///tmp/ws"));
        assert_eq!(seen[1]["method"], json!("initialized"));
        assert_eq!(seen[1]["params"], json!({}));
        drop(seen);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let (ours, theirs) = duplex(64 * 1024);
        let client = LspClient::with_request_timeout(Duration::from_millis(50));
        let (read, write) = tokio::io::split(ours);
        client.connect(write, read, None).await;

        let err = client.send_request("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout));

        // Now answer the expired id; the reader must swallow it.
        let (read, write) = tokio::io::split(theirs);
        let mut writer = FrameWriter::new(write);
        let reply = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        writer
            .write_frame(&serde_json::to_vec(&reply).unwrap())
            .await
            .unwrap();
        drop(read);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.pending.lock().await.is_empty());
        client.disconnect().await;
    }
}
