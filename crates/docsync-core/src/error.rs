//! Internal error type used for `Result`/`?` propagation inside this crate.
//!
//! Kept deliberately separate from [`docsync_proto::ErrorKind`], the small serializable enum a
//! client can observe. `ClientNotFound`/`SessionNotFound`/`ServerGone` are purely internal:
//! there is no `From` impl turning them into an `ErrorKind`, since sending one to a client would
//! be a logic error, not a reportable condition.

use docsync_proto::ErrorKind;
use docsync_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("session's encryption flag does not match the message")]
    EncryptionMismatch,
    #[error("permission denied")]
    PermissionDenied,
    #[error("no rpc handler registered for method {0:?}")]
    UnknownRpcMethod(String),
    #[error("rpc handler failed: {0}")]
    RpcHandlerFailure(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("client is no longer connected")]
    ClientGone,
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("session for document {0} not found")]
    SessionNotFound(String),
    #[error("session has been disposed")]
    SessionDisposed,
    #[error("server has been shut down")]
    ServerGone,
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// The subset of this taxonomy that is meaningful to surface to a client.
    pub fn to_wire(&self) -> Option<ErrorKind> {
        match self {
            CoreError::EncryptionMismatch => Some(ErrorKind::EncryptionMismatch),
            CoreError::PermissionDenied => Some(ErrorKind::PermissionDenied),
            CoreError::UnknownRpcMethod(_) => Some(ErrorKind::UnknownRpcMethod),
            CoreError::RpcHandlerFailure(detail) => Some(ErrorKind::RpcHandlerFailure {
                detail: detail.clone(),
            }),
            CoreError::Storage(e) => Some(ErrorKind::StorageError {
                detail: e.to_string(),
            }),
            CoreError::Transport(detail) => Some(ErrorKind::DecodeError {
                detail: detail.clone(),
            }),
            CoreError::ClientGone
            | CoreError::ClientNotFound(_)
            | CoreError::SessionNotFound(_)
            | CoreError::SessionDisposed
            | CoreError::ServerGone => None,
        }
    }
}
