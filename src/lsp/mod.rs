//! The south side: a correlated JSON-RPC client over the child's pipes.

pub mod client;

pub use client::{ClientError, LspClient};
