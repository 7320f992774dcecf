//! Error types for the proxy.

use std::io;
use thiserror::Error;

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Route text or listener configuration failed to parse or validate.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A single route command line failed to parse.
    #[error("line {line}: {reason}")]
    RouteParse { line: usize, reason: String },

    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// Registry stream or registration failure.
    #[error("registry error: {0}")]
    Registry(String),

    /// Failed to connect to an upstream backend.
    #[error("failed to connect to upstream {addr}: {source}")]
    UpstreamConnect { addr: String, source: io::Error },

    /// Upstream did not produce response headers within the deadline.
    #[error("upstream timed out after {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// HTTP message construction error.
    #[error("http build error: {0}")]
    HttpBuild(#[from] hyper::http::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No route matched the request.
    #[error("no route for {host}{path}")]
    NoRoute { host: String, path: String },

    /// TLS configuration error.
    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },

    /// TLS handshake error.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Graceful drain did not finish within `shutdown_wait`.
    #[error("shutdown timed out after {wait_ms}ms")]
    ShutdownTimeout { wait_ms: u64 },
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
