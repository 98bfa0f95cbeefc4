//! Error types for the Electrum client.

use thiserror::Error;

/// Errors surfaced by clients and clusters.
///
/// Server-reported errors are deliberately *not* represented here: a peer
/// answering a request with `{"error": …}` is a successful round-trip whose
/// outcome is [`Response::Error`](crate::Response::Error). Only transport,
/// configuration, and coordination failures become `Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol version string rejected at construction
    #[error("invalid protocol version {0:?}: expected digits separated by dots")]
    InvalidVersion(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Initial connect did not complete within the configured budget
    #[error("connection timed out")]
    Timeout,

    /// Server rejected the version negotiation request
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Server negotiated a protocol version other than the one requested
    #[error("incompatible protocol version: requested {requested}, server negotiated {negotiated}")]
    IncompatibleVersion {
        /// Version the client asked for
        requested: String,
        /// Version the server answered with
        negotiated: String,
    },

    /// Request issued against a client that is not connected
    #[error("not connected")]
    NotConnected,

    /// Connection lost while the operation was outstanding
    #[error("connection lost")]
    Disconnected,

    /// Connection was closed locally while the operation was outstanding
    #[error("manual disconnection")]
    ManuallyDisconnected,

    /// Cluster strategy rejected at construction
    #[error("invalid cluster strategy: {0}")]
    InvalidStrategy(String),

    /// Server already present in the cluster registry
    #[error("server {0} already registered")]
    DuplicateServer(String),

    /// Cluster request issued while the cluster is degraded
    #[error("cluster is not ready")]
    NotReady,

    /// Fewer than `confidence` peers agreed on a canonical result
    #[error("insufficient integrity: no result reached confidence {confidence} across {queried} peers")]
    InsufficientIntegrity {
        /// Matching results required
        confidence: usize,
        /// Peers the request was sent to
        queried: usize,
    },
}

/// Convenient Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
