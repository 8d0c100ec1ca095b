//! The message schema: a tagged envelope over `{doc, awareness, rpc, ack, ping/pong}`.
//!
//! A small outer tag carries a richer inner payload enum per kind, with newtype ids threaded
//! through every variant that needs correlation (acks, rpc request/response pairing).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, MessageId, NamespacedDocId, UserId};

/// Context carried by every message: who sent it and which room it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    pub client_id: ClientId,
    pub user_id: Option<UserId>,
    pub room: Option<String>,
}

impl MessageContext {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            user_id: None,
            room: None,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Outcome of a permission check, as surfaced to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Granted,
    Denied,
}

/// The CRDT sync handshake payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocPayload {
    /// Announces what the sender already has.
    SyncStep1 { state_vector: Bytes },
    /// Delivers the diff the other side is missing.
    SyncStep2 { update: Bytes },
    /// An incremental update produced by a client's local replica.
    Update { update: Bytes },
    /// Marks the handshake complete for the recipient.
    SyncDone,
    /// Server-only: informs a client whether a write/read was permitted.
    AuthMessage {
        permission: Permission,
        reason: Option<String>,
    },
}

/// Whether an RPC payload is the initiating call, a streamed chunk, or the final response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequestType {
    Request,
    Stream,
    Response,
}

/// An RPC call/response riding the same channel as document sync traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcPayload {
    pub method: String,
    pub request_type: RpcRequestType,
    pub original_request_id: Option<MessageId>,
    pub body: Bytes,
    /// Populated by `decode` from the supplied resolver; not carried on the wire, since it is
    /// purely a function of `method` and whatever handlers the receiving node has registered.
    #[serde(skip, default)]
    pub method_known: bool,
}

/// The top-level tagged message envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Doc(DocPayload),
    Awareness(Bytes),
    Rpc(RpcPayload),
    Ack { message_id: MessageId },
    Ping,
    Pong,
}

impl MessagePayload {
    /// Awareness and ack payloads are never tracked as in-flight nor deduped.
    pub fn is_trackable(&self) -> bool {
        !matches!(self, MessagePayload::Awareness(_) | MessagePayload::Ack { .. })
    }
}

/// A single message exchanged between a client and the broker, or between broker nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub document: crate::ids::DocumentName,
    pub context: MessageContext,
    pub encrypted: bool,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(
        document: crate::ids::DocumentName,
        context: MessageContext,
        encrypted: bool,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            document,
            context,
            encrypted,
            payload,
        }
    }

    pub fn namespaced_document_id(&self) -> NamespacedDocId {
        NamespacedDocId::compute(&self.document, self.context.room.as_deref())
    }

    pub fn ack_for(&self) -> Message {
        Message {
            id: MessageId::generate(),
            document: self.document.clone(),
            context: self.context.clone(),
            encrypted: self.encrypted,
            payload: MessagePayload::Ack {
                message_id: self.id.clone(),
            },
        }
    }
}
