//! # Volley
//!
//! A concurrent HTTP transfer engine: schedule, dispatch, and observe large
//! numbers of in-flight transfers under a fixed concurrency budget, with
//! first-class support for deferred submissions, streaming responses with
//! early abort, Server-Sent Event framing, and the Model Context Protocol
//! (MCP) "Streamable HTTP" binding.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a FIFO backlog feeds the in-flight set up to a
//!   fixed cap, with a low-watermark refill hook for crawler-style workloads
//! - **Deferred submissions**: a time-ordered delay queue holds transfers
//!   until they fall due
//! - **Streaming with early abort**: per-chunk observer hooks can stop an
//!   in-flight transfer; whatever was buffered is still delivered
//! - **SSE framing**: incremental event parsing with the full field rules
//!   (`event`, `data`, `id`, `retry`)
//! - **MCP transport**: JSON-RPC 2.0 over buffered JSON or SSE streaming,
//!   with automatic session initialization and invalid-session recovery
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use volley::{Engine, Transfer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(3);
//!
//!     for id in 1..=5 {
//!         let mut transfer = Transfer::new(&format!("http://localhost:8080/get?id={}", id))?;
//!         transfer.on_ready(|info, body, _engine| {
//!             println!("{} -> {} ({} bytes)", info.url, info.status, body.len());
//!         });
//!         engine.submit(transfer);
//!     }
//!
//!     engine.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## MCP transfers
//!
//! ```rust,no_run
//! use serde_json::Value;
//! use volley::{Engine, RpcMessage, Transfer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transfer = Transfer::mcp(
//!         "http://localhost:8080/mcp",
//!         RpcMessage::request("tools/list", Value::Null),
//!     )?;
//!     transfer.enable_auto_initialize(None, None);
//!     transfer.on_mcp_message(|message, _engine| {
//!         println!("server says: {:?}", message);
//!         true
//!     });
//!
//!     let mut engine = Engine::new(1);
//!     engine.submit(transfer);
//!     engine.run().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod engine;
pub mod error;
pub mod prelude;
pub mod rpc;
pub mod transfer;

// Re-export main types
pub use buffer::StreamBuf;
pub use engine::{Engine, EngineHandle, SubmitOptions, DEFAULT_MAX_CONCURRENCY};
pub use error::{VolleyError, VolleyResult};
pub use rpc::{RequestId, RpcError, RpcMessage};
pub use transfer::http::{Method, TransferBuilder};
pub use transfer::mcp::{ClientInfo, McpState, MCP_PROTOCOL_VERSION};
pub use transfer::sse::{SseEvent, SseState};
pub use transfer::{
    FailureKind, ProxyConfig, RequestOptions, TimeoutKind, Transfer, TransferFailure, TransferInfo,
};
