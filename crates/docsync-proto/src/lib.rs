//! Wire message schema for the document sync broker.
//!
//! This crate has no runtime of its own: it is the leaf dependency everything else in the
//! workspace builds on (`docsync-pubsub`, `docsync-storage`, `docsync-core`, `docsync-server`
//! all depend on it, it depends on nothing in this workspace).

pub mod codec;
pub mod error;
pub mod ids;
pub mod message;

pub use codec::{decode, encode, PermissiveResolver, RpcResolver};
pub use error::{DecodeError, ErrorKind};
pub use ids::{ClientId, DocumentName, MessageId, NamespacedDocId, SessionId, UserId};
pub use message::{DocPayload, Message, MessageContext, MessagePayload, Permission, RpcPayload, RpcRequestType};
