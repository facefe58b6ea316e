//! Convenience re-exports for common usage
//!
//! ```rust
//! use volley::prelude::*;
//! ```

pub use crate::buffer::StreamBuf;
pub use crate::engine::{Engine, EngineHandle, SubmitOptions};
pub use crate::error::{VolleyError, VolleyResult};
pub use crate::rpc::{RequestId, RpcError, RpcMessage};
pub use crate::transfer::http::{Method, TransferBuilder};
pub use crate::transfer::mcp::{ClientInfo, MCP_PROTOCOL_VERSION};
pub use crate::transfer::sse::SseEvent;
pub use crate::transfer::{
    FailureKind, TimeoutKind, Transfer, TransferFailure, TransferInfo,
};
