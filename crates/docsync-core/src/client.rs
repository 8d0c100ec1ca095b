//! Per-connection outbound sink with serialized sends and in-flight ack tracking.
//!
//! Grounded on `crates/broker/lib/src/services/sessions.rs`'s `SessionCmd`/`SessionHandle`/
//! `SessionService` triad: a command enum driven through an `mpsc::Sender`-wrapping handle, with
//! a background task owning the real sink. The `SendChecked { frame, reply: oneshot::Sender<bool> }`
//! variant there is the direct model for `ClientCmd::Send`'s `reply` channel: routing every send
//! through the single actor task gets serialization for free, while the caller still observes
//! the real transport result.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use docsync_proto::{ClientId, Message, MessageId};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::CoreError;

/// The write half of a connected peer. Implementations live in transport adapters
/// (`docsync-server`'s TCP adapter, or an in-memory channel pair for tests).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), CoreError>;
}

#[derive(Debug)]
enum ClientCmd {
    Send {
        message: Message,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    HandleAck {
        message_id: MessageId,
    },
    InFlightCount {
        reply: oneshot::Sender<usize>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable reference to a connected client's actor.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ClientCmd>,
}

impl ClientHandle {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Sends `message` to this client, recording it as in-flight first unless it is an
    /// awareness or ack payload. Serialized with every other call to `send` on this handle.
    pub async fn send(&self, message: Message) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientCmd::Send {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::ClientGone)?;
        reply_rx.await.map_err(|_| CoreError::ClientGone)?
    }

    /// Clears the in-flight entry for `message_id`, in response to an inbound ack.
    pub async fn handle_ack(&self, message_id: MessageId) {
        let _ = self.tx.send(ClientCmd::HandleAck { message_id }).await;
    }

    pub async fn in_flight_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ClientCmd::InFlightCount { reply: reply_tx }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn has_in_flight(&self) -> bool {
        self.in_flight_count().await > 0
    }

    /// Aborts the outbound sink and clears all in-flight bookkeeping. Idempotent.
    pub async fn destroy(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ClientCmd::Destroy { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

struct ClientService {
    id: ClientId,
    rx: mpsc::Receiver<ClientCmd>,
    transport: std::sync::Arc<dyn Transport>,
    in_flight: HashMap<MessageId, Instant>,
}

impl ClientService {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ClientCmd::Send { message, reply } => {
                    if message.payload.is_trackable() {
                        self.in_flight.insert(message.id.clone(), Instant::now());
                    }
                    let result = self.transport.send(message).await;
                    if let Err(err) = &result {
                        warn!(client_id = %self.id, error = %err, "send failed, destroying client");
                        let _ = reply.send(result);
                        break;
                    }
                    let _ = reply.send(result);
                }
                ClientCmd::HandleAck { message_id } => {
                    self.in_flight.remove(&message_id);
                }
                ClientCmd::InFlightCount { reply } => {
                    let _ = reply.send(self.in_flight.len());
                }
                ClientCmd::Destroy { reply } => {
                    self.in_flight.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }
}

/// Spawns a client actor over `transport` and returns a handle to it.
pub fn start(id: ClientId, transport: std::sync::Arc<dyn Transport>) -> ClientHandle {
    let (tx, rx) = mpsc::channel(256);
    let service = ClientService {
        id: id.clone(),
        rx,
        transport,
        in_flight: HashMap::new(),
    };
    tokio::spawn(service.run());
    ClientHandle { id, tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_proto::{DocumentName, MessageContext, MessagePayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _message: Message) -> Result<(), CoreError> {
            if self.fail {
                return Err(CoreError::Transport("closed".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn awareness_message() -> Message {
        Message::new(
            DocumentName::from("d1"),
            MessageContext::new(ClientId::generate()),
            false,
            MessagePayload::Awareness(bytes::Bytes::from_static(b"x")),
        )
    }

    #[tokio::test]
    async fn send_delivers_and_does_not_track_awareness() {
        let sent = Arc::new(AtomicUsize::new(0));
        let handle = start(
            ClientId::generate(),
            Arc::new(CountingTransport { sent: sent.clone(), fail: false }),
        );
        handle.send(awareness_message()).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(handle.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn doc_updates_are_tracked_until_acked() {
        let sent = Arc::new(AtomicUsize::new(0));
        let handle = start(
            ClientId::generate(),
            Arc::new(CountingTransport { sent, fail: false }),
        );
        let msg = Message::new(
            DocumentName::from("d1"),
            MessageContext::new(ClientId::generate()),
            false,
            MessagePayload::Doc(docsync_proto::DocPayload::Update {
                update: bytes::Bytes::from_static(b"x"),
            }),
        );
        let id = msg.id.clone();
        handle.send(msg).await.unwrap();
        assert_eq!(handle.in_flight_count().await, 1);
        handle.handle_ack(id).await;
        assert_eq!(handle.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn send_failure_is_reported_and_ends_the_client() {
        let sent = Arc::new(AtomicUsize::new(0));
        let handle = start(ClientId::generate(), Arc::new(CountingTransport { sent, fail: true }));
        let err = handle.send(awareness_message()).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
        // the actor has exited; further sends report the client as gone
        tokio::task::yield_now().await;
        let err2 = handle.send(awareness_message()).await;
        assert!(err2.is_err());
    }

    #[tokio::test]
    async fn destroy_clears_in_flight() {
        let sent = Arc::new(AtomicUsize::new(0));
        let handle = start(ClientId::generate(), Arc::new(CountingTransport { sent, fail: false }));
        let msg = Message::new(
            DocumentName::from("d1"),
            MessageContext::new(ClientId::generate()),
            false,
            MessagePayload::Doc(docsync_proto::DocPayload::Update {
                update: bytes::Bytes::from_static(b"x"),
            }),
        );
        handle.send(msg).await.unwrap();
        handle.destroy().await;
        assert_eq!(handle.in_flight_count().await, 0);
    }
}
