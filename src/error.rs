//! Error types for emptyendpoints-dns.

use thiserror::Error;

/// Errors that can stop the proxy from starting or serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error (socket bind, accept).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// Errors from an endpoint cache lookup.
///
/// These never reach DNS clients: the lookup oracle treats every one of them
/// as "not empty".
#[derive(Debug, Error)]
pub enum LookupError {
    /// No Endpoints object exists for the service.
    #[error("endpoints {namespace}/{service} not found")]
    NotFound {
        /// Namespace that was looked up.
        namespace: String,
        /// Service that was looked up.
        service: String,
    },

    /// The lookup did not finish within the configured timeout.
    #[error("endpoint lookup timed out")]
    Timeout,

    /// Kubernetes API error while reading through the cache.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Errors while relaying a query to the upstream resolver.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Socket error talking to the upstream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream did not answer in time.
    #[error("upstream timed out")]
    Timeout,

    /// Upstream answer could not be encoded or decoded.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Upstream answered with a different message id.
    #[error("response id {got} does not match query id {expected}")]
    IdMismatch {
        /// Id of the relayed query.
        expected: u16,
        /// Id found in the answer.
        got: u16,
    },
}
