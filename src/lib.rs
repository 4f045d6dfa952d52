//! ra-bridge: MCP server bridging an AI assistant to rust-analyzer.
//!
//! Architecture:
//! ```text
//! assistant <-MCP (newline-delimited JSON-RPC, stdio)-> ra-bridge <-LSP (Content-Length framing, child pipes)-> rust-analyzer
//! ```
//!
//! The north side (assistant-facing) is a small JSON-RPC state machine
//! over stdio. The south side is a correlated LSP client over the pipes
//! of a supervised child process. Tool handlers sit between the two.

pub mod documents;
pub mod lsp;
pub mod policy;
pub mod rpc;
pub mod server;
pub mod supervisor;
pub mod tools;
pub mod transport;
pub mod workspace;
