//! Pool error types.
//!
//! Defines error variants for connection building, request routing, and store
//! access. Filter denials are not errors; they surface as ordinary
//! `CallToolResult` values with `is_error` set.

use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Spawning the subprocess or opening the HTTP stream failed.
    #[error("transport open failed for '{server}': {message}")]
    TransportOpen { server: String, message: String },

    /// The MCP initialize handshake was rejected or incompatible.
    #[error("handshake failed for '{server}': {message}")]
    Handshake { server: String, message: String },

    /// All connect attempts were exhausted.
    #[error("connection to '{server}' failed after {attempts} attempt(s): {message}")]
    ConnectFailed {
        server: String,
        attempts: u32,
        message: String,
    },

    /// The config cannot describe a working connection (e.g. empty command).
    #[error("invalid config for '{server}': {message}")]
    InvalidConfig { server: String, message: String },

    /// A `tools/call` prefix matched no participating server.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A forwarded request failed on the back-end server.
    #[error("downstream request to '{server}' failed: {message}")]
    Downstream { server: String, message: String },

    /// A store query failed.
    #[error("store error: {0}")]
    Store(String),

    /// The operation was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Server name attached to the error, when one is known.
    pub fn server(&self) -> Option<&str> {
        match self {
            PoolError::TransportOpen { server, .. }
            | PoolError::Handshake { server, .. }
            | PoolError::ConnectFailed { server, .. }
            | PoolError::InvalidConfig { server, .. }
            | PoolError::Downstream { server, .. } => Some(server),
            _ => None,
        }
    }
}
