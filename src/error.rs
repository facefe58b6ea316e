//! Error types for transfer configuration and engine operations

use serde_json::Value;
use thiserror::Error;

/// Result type used throughout the crate
pub type VolleyResult<T> = Result<T, VolleyError>;

/// Error type for transfer configuration and engine operations
///
/// Configuration problems are raised synchronously when a transfer is built;
/// transport-level outcomes are delivered through the observer hooks instead
/// (see [`crate::transfer::TransferFailure`]).
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Invalid or unsupported HTTP method
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    /// A mapping body was supplied with a content type we cannot encode
    #[error("unsupported content type for mapping body: {0}")]
    UnsupportedContentType(String),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Invalid header name or value
    #[error("invalid header {name}: {reason}")]
    Header { name: String, reason: String },

    /// JSON encoding or decoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON-RPC payload that does not form a valid message
    #[error("invalid JSON-RPC message: {0}")]
    InvalidRpcMessage(String),

    /// A well-formed JSON-RPC error object received from the server
    #[error("RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Failure while establishing the automatic MCP initialization chain
    #[error("MCP initialization error: {0}")]
    Initialize(String),

    /// HTTP client construction failed (proxy, TLS, or pool settings)
    #[error("client setup error: {0}")]
    ClientSetup(#[from] reqwest::Error),

    /// Generic configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl VolleyError {
    /// Create a generic configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an RPC error from a JSON-RPC error object's parts
    pub fn rpc(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data,
        }
    }
}

/// Join an error with its source chain into a single diagnostic string
///
/// `reqwest::Error`'s `Display` omits the underlying cause (DNS failure,
/// connection refusal), so hook-facing messages are built from the full chain.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
