//! Filesystem paths, `file://` URIs, and the canonical workspace root.

use std::path::{Path, PathBuf};

use lsp_types::Uri;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

/// Bytes escaped when rendering a path into a `file://` URI: everything
/// outside `[A-Za-z0-9]` and `-._~/:`. Hex digits come out uppercase.
const PATH_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b':');

#[derive(Debug, Error)]
pub enum UriError {
    #[error("not a file:// URI: {0}")]
    Scheme(String),
    #[error("ill-formed percent encoding in {0}")]
    Encoding(String),
    #[error("URI does not decode to UTF-8: {0}")]
    NotUtf8(String),
    #[error("unparsable file URI for {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path escapes the workspace root: {0}")]
    OutsideRoot(String),
    #[error("cannot resolve {path}: {source}")]
    Resolve {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    /// True when resolution failed because the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Resolve { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Render a path as a `file://` URI.
pub fn path_to_uri(path: &Path) -> String {
    format!(
        "file://{}",
        utf8_percent_encode(&path.to_string_lossy(), PATH_ESCAPES)
    )
}

/// A path's URI as the typed form LSP payloads use.
pub fn file_uri(path: &Path) -> Result<Uri, UriError> {
    let rendered = path_to_uri(path);
    rendered.parse().map_err(|e| UriError::Parse {
        path: path.display().to_string(),
        message: format!("{e:?}"),
    })
}

/// Extract the path from a `file://` URI, rejecting other schemes and
/// ill-formed percent triplets.
pub fn uri_to_path(uri: &str) -> Result<PathBuf, UriError> {
    let Some(encoded) = uri.strip_prefix("file://") else {
        return Err(UriError::Scheme(uri.to_string()));
    };
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) else {
                return Err(UriError::Encoding(uri.to_string()));
            };
            decoded.push((hi << 4) | lo);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    let path = String::from_utf8(decoded).map_err(|_| UriError::NotUtf8(uri.to_string()))?;
    Ok(PathBuf::from(path))
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// The canonical project root. Immutable once constructed; every file a
/// tool touches resolves through [`Workspace::resolve`].
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    root_uri: String,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|source| WorkspaceError::Resolve {
                path: root.as_ref().display().to_string(),
                source,
            })?;
        let root_uri = path_to_uri(&root);
        Ok(Self { root, root_uri })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_uri(&self) -> &str {
        &self.root_uri
    }

    /// Resolve `candidate` (absolute, or relative to the root) and
    /// require the canonical result to stay inside the root.
    pub fn resolve(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, WorkspaceError> {
        let joined = self.root.join(candidate.as_ref());
        let canonical = joined
            .canonicalize()
            .map_err(|source| WorkspaceError::Resolve {
                path: joined.display().to_string(),
                source,
            })?;
        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(WorkspaceError::OutsideRoot(
                canonical.display().to_string(),
            ))
        }
    }
}
