//! JSON-RPC 2.0 wire protocol for MCP stdio streams.
//!
//! MCP servers speak newline-delimited JSON-RPC 2.0 over stdio: one JSON
//! object per `\n`-terminated line. This module owns both halves of that
//! contract:
//!
//! - `framing`: byte-stream → frame extraction with split-invariant
//!   buffering of partial lines.
//! - `jsonrpc`: frame → typed [`Message`](jsonrpc::Message) classification
//!   and the canonical text encoding.
//!
//! Everything above (transport, client, proxy) consumes these two layers and
//! never touches raw bytes or `serde_json::Value` probing directly.

pub mod framing;
pub mod jsonrpc;
