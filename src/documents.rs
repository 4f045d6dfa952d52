//! Tracks which documents the current child session has open.
//!
//! The language server only answers position queries for documents it
//! has seen a `didOpen` for, so every tool path funnels through
//! [`DocumentTracker::ensure_open`] first. After a supervisor restart
//! the set is replayed into the fresh session with
//! [`DocumentTracker::reopen_all`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use lsp_types::{
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, TextDocumentIdentifier,
    TextDocumentItem, Uri,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::lsp::client::{ClientError, LspClient};
use crate::workspace;

/// Upper bound on a document shipped in a `didOpen` payload.
pub const MAX_DOCUMENT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is {size} bytes, over the {MAX_DOCUMENT_BYTES} byte limit")]
    TooLarge { path: String, size: u64 },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Uri(#[from] workspace::UriError),
}

struct OpenDocument {
    version: i32,
}

#[derive(Default)]
pub struct DocumentTracker {
    open: Mutex<HashMap<String, OpenDocument>>,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the child has `path` open, sending `didOpen` at most
    /// once per URI per session. Returns the document's URI.
    ///
    /// The file read happens outside the lock; the send and the insert
    /// happen together under it, so a failed notification never leaves
    /// a phantom entry behind and a concurrent caller never observes
    /// "already open" before the notification went out.
    pub async fn ensure_open(&self, lsp: &LspClient, path: &Path) -> Result<String, DocumentError> {
        let uri = workspace::path_to_uri(path);
        if self.open.lock().await.contains_key(&uri) {
            return Ok(uri);
        }

        let text = read_document(path).await?;

        let mut open = self.open.lock().await;
        if open.contains_key(&uri) {
            // Another caller opened it while we were reading.
            return Ok(uri);
        }
        let params = did_open_params(path, 1, text)?;
        lsp.send_notification("textDocument/didOpen", params).await?;
        open.insert(uri.clone(), OpenDocument { version: 1 });
        Ok(uri)
    }

    /// Forget `uri` and tell the child. The entry is gone either way;
    /// a failed notification is only logged.
    pub async fn close(&self, lsp: &LspClient, uri: &str) {
        if self.open.lock().await.remove(uri).is_none() {
            return;
        }
        let params = uri
            .parse::<Uri>()
            .map_err(|e| format!("{e:?}"))
            .and_then(|parsed| {
                serde_json::to_value(DidCloseTextDocumentParams {
                    text_document: TextDocumentIdentifier { uri: parsed },
                })
                .map_err(|e| e.to_string())
            });
        match params {
            Ok(params) => {
                if let Err(e) = lsp.send_notification("textDocument/didClose", params).await {
                    tracing::warn!("didClose for {uri} failed: {e}");
                }
            }
            Err(e) => tracing::warn!("didClose for {uri} not sent: {e}"),
        }
    }

    /// Session replay after a child restart: every tracked document is
    /// re-read from disk and re-announced at its stored version.
    /// Individual failures are logged and the sweep continues.
    pub async fn reopen_all(&self, lsp: &LspClient) {
        let open = self.open.lock().await;
        tracing::info!("replaying {} open document(s) into the new session", open.len());
        for (uri, doc) in open.iter() {
            let path = match workspace::uri_to_path(uri) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("skipping replay of {uri}: {e}");
                    continue;
                }
            };
            let text = match read_document(&path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("skipping replay of {uri}: {e}");
                    continue;
                }
            };
            match did_open_params(&path, doc.version, text) {
                Ok(params) => {
                    if let Err(e) = lsp.send_notification("textDocument/didOpen", params).await {
                        tracing::warn!("replay of {uri} failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("replay of {uri} not sent: {e}"),
            }
        }
    }

    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }
}

fn did_open_params(path: &Path, version: i32, text: String) -> Result<Value, DocumentError> {
    let params = DidOpenTextDocumentParams {
        text_document: TextDocumentItem {
            uri: workspace::file_uri(path)?,
            language_id: language_id_for(path).to_string(),
            version,
            text,
        },
    };
    serde_json::to_value(params).map_err(|e| DocumentError::Client(ClientError::Json(e)))
}

async fn read_document(path: &Path) -> Result<String, DocumentError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| classify_io(path, e))?;
    if metadata.len() > MAX_DOCUMENT_BYTES {
        return Err(DocumentError::TooLarge {
            path: path.display().to_string(),
            size: metadata.len(),
        });
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| classify_io(path, e))
}

fn classify_io(path: &Path, source: std::io::Error) -> DocumentError {
    if source.kind() == ErrorKind::NotFound {
        DocumentError::FileNotFound(path.display().to_string())
    } else {
        DocumentError::FileRead {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The LSP `languageId` for a file, from its extension. Falls back to
/// `"plaintext"`.
fn language_id_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "toml" => "toml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "md" | "markdown" => "markdown",
        "sh" | "bash" => "shellscript",
        "html" | "htm" => "html",
        "js" => "javascript",
        "ts" => "typescript",
        "py" => "python",
        _ => "plaintext",
    }
}
