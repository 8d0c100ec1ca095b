//! The wire-visible error taxonomy, separate from any crate's internal `thiserror` types.
//!
//! A small, stable, serializable enum a client can pattern-match on, kept deliberately flatter
//! than the internal error types each crate uses for `Result`/`?` propagation.

use serde::{Deserialize, Serialize};

/// Errors that may be observed by a connected client, carried inside `rpc/response` or logged
/// alongside a `doc/auth-message`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A session's immutable `encrypted` flag disagreed with an incoming message or open
    /// request.
    EncryptionMismatch,
    /// A read or write was rejected by the configured permission callback.
    PermissionDenied,
    /// No RPC handler is registered for the requested method.
    UnknownRpcMethod,
    /// An RPC handler raised an error while processing a request.
    RpcHandlerFailure { detail: String },
    /// The message bytes could not be decoded.
    DecodeError { detail: String },
    /// The storage backend failed to service the request.
    StorageError { detail: String },
}

/// Failure decoding a message envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to decode message: {0}")]
    Postcard(#[from] postcard::Error),
}

impl From<&DecodeError> for ErrorKind {
    fn from(err: &DecodeError) -> Self {
        ErrorKind::DecodeError {
            detail: err.to_string(),
        }
    }
}
