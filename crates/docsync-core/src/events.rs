//! The observable lifecycle bus external collaborators (metrics, audit logging) subscribe to.
//!
//! A typed enum over a `tokio::sync::broadcast` channel: listeners subscribe by cloning a
//! receiver and are woken with a "channel closed" terminal signal when the bus is dropped or
//! explicitly closed at shutdown, so no listener needs an explicit unregister call.

use docsync_proto::{ClientId, DocPayload, DocumentName, Message, MessageId, MessagePayload, NamespacedDocId, SessionId};
use tokio::sync::broadcast;

/// The outer tag of a [`MessagePayload`], surfaced on [`Event::DocumentMessage`] so a listener
/// can tell doc traffic apart from awareness/rpc/ack/ping-pong without matching on the payload
/// itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Doc,
    Awareness,
    Rpc,
    Ack,
    Ping,
    Pong,
}

/// The inner tag of a [`DocPayload`], populated on [`Event::DocumentMessage`] only when
/// `message_type` is [`MessageKind::Doc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocPayloadKind {
    SyncStep1,
    SyncStep2,
    Update,
    SyncDone,
    AuthMessage,
}

impl From<&MessagePayload> for MessageKind {
    fn from(payload: &MessagePayload) -> Self {
        match payload {
            MessagePayload::Doc(_) => MessageKind::Doc,
            MessagePayload::Awareness(_) => MessageKind::Awareness,
            MessagePayload::Rpc(_) => MessageKind::Rpc,
            MessagePayload::Ack { .. } => MessageKind::Ack,
            MessagePayload::Ping => MessageKind::Ping,
            MessagePayload::Pong => MessageKind::Pong,
        }
    }
}

impl From<&DocPayload> for DocPayloadKind {
    fn from(payload: &DocPayload) -> Self {
        match payload {
            DocPayload::SyncStep1 { .. } => DocPayloadKind::SyncStep1,
            DocPayload::SyncStep2 { .. } => DocPayloadKind::SyncStep2,
            DocPayload::Update { .. } => DocPayloadKind::Update,
            DocPayload::SyncDone => DocPayloadKind::SyncDone,
            DocPayload::AuthMessage { .. } => DocPayloadKind::AuthMessage,
        }
    }
}

/// Derives `(message_type, payload_type)` for [`Event::DocumentMessage`] from the message it was
/// emitted for.
pub(crate) fn message_kinds(message: &Message) -> (MessageKind, Option<DocPayloadKind>) {
    let message_type = MessageKind::from(&message.payload);
    let payload_type = match &message.payload {
        MessagePayload::Doc(doc) => Some(DocPayloadKind::from(doc)),
        _ => None,
    };
    (message_type, payload_type)
}

#[derive(Clone, Debug)]
pub enum DisconnectReason {
    Abort,
    StreamEnded,
    Manual,
    Dispose,
}

#[derive(Clone, Debug)]
pub enum UnloadReason {
    Idle,
    Dispose,
}

#[derive(Clone, Debug)]
pub enum MessageDirection {
    In,
    Out,
}

#[derive(Clone, Debug)]
pub enum MessageSource {
    Client,
    Replication { source_node_id: String },
}

#[derive(Clone, Debug)]
pub enum Event {
    ClientConnect {
        client_id: ClientId,
    },
    ClientDisconnect {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    DocumentLoad {
        document_id: DocumentName,
        session_id: SessionId,
        encrypted: bool,
    },
    DocumentUnload {
        document_id: DocumentName,
        session_id: SessionId,
        reason: UnloadReason,
    },
    DocumentClientConnect {
        client_id: ClientId,
        document_id: DocumentName,
        session_id: SessionId,
    },
    DocumentClientDisconnect {
        client_id: ClientId,
        document_id: DocumentName,
        session_id: SessionId,
    },
    ClientMessage {
        client_id: ClientId,
        direction: MessageDirection,
        document_id: Option<DocumentName>,
    },
    DocumentMessage {
        message_id: MessageId,
        source: MessageSource,
        message_type: MessageKind,
        payload_type: Option<DocPayloadKind>,
        deduped: bool,
    },
    DocumentWrite {
        document_id: DocumentName,
        namespaced_document_id: NamespacedDocId,
        encrypted: bool,
    },
    DocumentSizeWarning {
        namespaced_document_id: NamespacedDocId,
        size_bytes: u64,
        threshold: u64,
    },
    DocumentSizeLimitExceeded {
        namespaced_document_id: NamespacedDocId,
        size_bytes: u64,
        limit: u64,
    },
    DocumentDelete {
        document_id: DocumentName,
        encrypted: bool,
    },
    BeforeServerShutdown {
        active_sessions: usize,
        pending_sessions: usize,
    },
    AfterServerShutdown {
        node_id: String,
    },
}

/// A cloneable handle onto the event bus. Cloning shares the same underlying channel; each
/// clone's subscribers still each see every event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        // Bounded so a stalled listener can't grow memory unboundedly; lagging subscribers
        // simply miss the oldest events rather than blocking emission.
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        log_event(&event);
        // No subscribers is the common case (no external collaborator attached); that is not
        // an error condition worth reporting.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event(event: &Event) {
    use tracing::{debug, info, warn};
    match event {
        Event::ClientConnect { client_id } => info!(%client_id, "client connected"),
        Event::ClientDisconnect { client_id, reason } => {
            info!(%client_id, ?reason, "client disconnected")
        }
        Event::DocumentLoad {
            document_id,
            session_id,
            encrypted,
        } => info!(%document_id, %session_id, encrypted, "document loaded"),
        Event::DocumentUnload {
            document_id,
            session_id,
            reason,
        } => info!(%document_id, %session_id, ?reason, "document unloaded"),
        Event::DocumentClientConnect {
            client_id,
            document_id,
            ..
        } => debug!(%client_id, %document_id, "client attached to document"),
        Event::DocumentClientDisconnect {
            client_id,
            document_id,
            ..
        } => debug!(%client_id, %document_id, "client detached from document"),
        Event::ClientMessage { client_id, .. } => debug!(%client_id, "client message"),
        Event::DocumentMessage {
            message_id,
            message_type,
            payload_type,
            deduped,
            ..
        } => debug!(%message_id, ?message_type, ?payload_type, deduped, "document message"),
        Event::DocumentWrite { document_id, .. } => debug!(%document_id, "document write"),
        Event::DocumentSizeWarning {
            namespaced_document_id,
            size_bytes,
            threshold,
        } => warn!(%namespaced_document_id, size_bytes, threshold, "document size warning"),
        Event::DocumentSizeLimitExceeded {
            namespaced_document_id,
            size_bytes,
            limit,
        } => warn!(%namespaced_document_id, size_bytes, limit, "document size limit exceeded"),
        Event::DocumentDelete { document_id, .. } => info!(%document_id, "document deleted"),
        Event::BeforeServerShutdown {
            active_sessions,
            pending_sessions,
        } => {
            info!(active_sessions, pending_sessions, "server shutting down")
        }
        Event::AfterServerShutdown { node_id } => info!(%node_id, "server shutdown complete"),
    }
}
