//! The per-document hub: runs the sync handshake, fans updates out to local clients, replicates
//! them across nodes, and manages its own idle-cleanup lifecycle.
//!
//! A single actor owns per-document state, driven by a `tokio::select! { cmd = rx.recv() => ..,
//! delivery = repl_rx.recv() => .., _ = ticker.tick() => .. }` loop. Each document gets its own
//! actor and its own cleanup timer, since sessions attach and detach independently rather than
//! sharing one idle-owner timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use docsync_proto::{
    ClientId, DocPayload, DocumentName, Message, MessageId, MessagePayload, NamespacedDocId,
    RpcPayload, RpcRequestType,
};
use docsync_pubsub::{document_topic, Delivery, DeliveryHandler, NodeId, PubSub, SubscriptionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::client::ClientHandle;
use crate::error::CoreError;
use crate::events::{message_kinds, Event, EventBus, MessageSource};
use crate::rpc::{RpcContext, RpcHandler, RpcRegistry};
use crate::storage_handle::StorageHandle;
use crate::Server;

#[derive(Debug)]
enum SessionCmd {
    AddClient {
        client: ClientHandle,
        reply: oneshot::Sender<()>,
    },
    RemoveClient {
        client_id: ClientId,
        reply: oneshot::Sender<()>,
    },
    Apply {
        message: Message,
        client: Option<ClientHandle>,
        replication: bool,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable reference to a loaded session's actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub document: DocumentName,
    pub namespaced_document_id: NamespacedDocId,
    pub encrypted: bool,
    tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    pub async fn add_client(&self, client: ClientHandle) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCmd::AddClient { client, reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub async fn remove_client(&self, client_id: ClientId) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCmd::RemoveClient { client_id, reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub async fn apply(
        &self,
        message: Message,
        client: Option<ClientHandle>,
        replication: bool,
    ) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCmd::Apply {
                message,
                client,
                replication,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::SessionDisposed)?;
        reply_rx.await.map_err(|_| CoreError::SessionDisposed)?
    }

    pub async fn client_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SessionCmd::ClientCount { reply: reply_tx }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn dispose(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SessionCmd::Dispose { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Forwards pub/sub deliveries for this document back into the session's own command queue so
/// replicated messages are serialized against local mutations exactly like client-originated
/// ones.
struct ReplicationHandler {
    tx: mpsc::Sender<ReplicatedDelivery>,
}

struct ReplicatedDelivery {
    payload: Bytes,
    origin: NodeId,
}

#[async_trait]
impl DeliveryHandler for ReplicationHandler {
    async fn handle(&self, delivery: Delivery) {
        let _ = self
            .tx
            .send(ReplicatedDelivery {
                payload: delivery.payload,
                origin: delivery.origin,
            })
            .await;
    }
}

pub(crate) struct SessionStartArgs {
    pub document: DocumentName,
    pub namespaced_document_id: NamespacedDocId,
    pub encrypted: bool,
    pub storage: StorageHandle,
    pub pubsub: Arc<dyn PubSub>,
    pub dedupe: Arc<docsync_pubsub::Dedupe>,
    pub node_id: NodeId,
    pub rpc_handlers: Arc<RpcRegistry>,
    pub events: EventBus,
    pub cleanup_delay: Duration,
    pub size_warning_threshold: Option<u64>,
    pub size_limit: Option<u64>,
    pub on_cleanup: mpsc::Sender<NamespacedDocId>,
    pub server: std::sync::Weak<Server>,
}

/// Starts a session's actor, subscribing it to cross-node replication for its document before
/// returning. Construction and "load" are one step here: nothing in this workspace ever
/// constructs a session without immediately subscribing it.
pub(crate) async fn start(args: SessionStartArgs) -> SessionHandle {
    let (tx, rx) = mpsc::channel(256);
    let (repl_tx, repl_rx) = mpsc::channel(256);

    let topic = document_topic(&args.namespaced_document_id);
    let subscription = args
        .pubsub
        .subscribe(topic.clone(), Arc::new(ReplicationHandler { tx: repl_tx }))
        .await;

    args.events.emit(Event::DocumentLoad {
        document_id: args.document.clone(),
        session_id: docsync_proto::SessionId::generate(),
        encrypted: args.encrypted,
    });

    let service = SessionService {
        rx,
        repl_rx,
        document: args.document.clone(),
        namespaced_document_id: args.namespaced_document_id.clone(),
        encrypted: args.encrypted,
        storage: args.storage,
        pubsub: args.pubsub,
        topic,
        subscription: Some(subscription),
        dedupe: args.dedupe,
        node_id: args.node_id,
        rpc_handlers: args.rpc_handlers,
        events: args.events,
        clients: HashMap::new(),
        cleanup_delay: args.cleanup_delay,
        cleanup_deadline: None,
        size_warning_threshold: args.size_warning_threshold,
        size_limit: args.size_limit,
        size_warned: false,
        size_limited: false,
        on_cleanup: args.on_cleanup,
        server: args.server,
        handle_for_rpc: None,
    };

    let handle = SessionHandle {
        document: args.document,
        namespaced_document_id: args.namespaced_document_id,
        encrypted: args.encrypted,
        tx,
    };

    let mut service = service;
    service.handle_for_rpc = Some(handle.clone());
    tokio::spawn(service.run());

    handle
}

struct SessionService {
    rx: mpsc::Receiver<SessionCmd>,
    repl_rx: mpsc::Receiver<ReplicatedDelivery>,
    document: DocumentName,
    namespaced_document_id: NamespacedDocId,
    encrypted: bool,
    storage: StorageHandle,
    pubsub: Arc<dyn PubSub>,
    topic: String,
    subscription: Option<SubscriptionId>,
    dedupe: Arc<docsync_pubsub::Dedupe>,
    node_id: NodeId,
    rpc_handlers: Arc<RpcRegistry>,
    events: EventBus,
    clients: HashMap<ClientId, ClientHandle>,
    cleanup_delay: Duration,
    cleanup_deadline: Option<Instant>,
    size_warning_threshold: Option<u64>,
    size_limit: Option<u64>,
    size_warned: bool,
    size_limited: bool,
    on_cleanup: mpsc::Sender<NamespacedDocId>,
    server: std::sync::Weak<Server>,
    handle_for_rpc: Option<SessionHandle>,
}

const CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl SessionService {
    async fn run(mut self) {
        let mut ticker = interval(CLEANUP_POLL_INTERVAL);
        let mut disposed = false;
        while !disposed {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => disposed = self.handle_cmd(cmd).await,
                        None => break,
                    }
                }
                delivery = self.repl_rx.recv() => {
                    if let Some(delivery) = delivery {
                        self.handle_replication(delivery).await;
                    }
                }
                _ = ticker.tick() => {
                    self.handle_cleanup_tick().await;
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: SessionCmd) -> bool {
        match cmd {
            SessionCmd::AddClient { client, reply } => {
                let is_new = !self.clients.contains_key(client.id());
                let client_id = client.id().clone();
                self.clients.insert(client_id.clone(), client);
                self.cleanup_deadline = None;
                if is_new {
                    self.events.emit(Event::DocumentClientConnect {
                        client_id,
                        document_id: self.document.clone(),
                        session_id: docsync_proto::SessionId::generate(),
                    });
                }
                let _ = reply.send(());
                false
            }
            SessionCmd::RemoveClient { client_id, reply } => {
                let removed = self.clients.remove(&client_id);
                if self.clients.is_empty() {
                    self.cleanup_deadline = Some(Instant::now() + self.cleanup_delay);
                }
                if removed.is_some() {
                    self.events.emit(Event::DocumentClientDisconnect {
                        client_id,
                        document_id: self.document.clone(),
                        session_id: docsync_proto::SessionId::generate(),
                    });
                }
                let _ = reply.send(());
                false
            }
            SessionCmd::Apply {
                message,
                client,
                replication,
                reply,
            } => {
                let result = self.apply_inner(message, client, replication).await;
                let _ = reply.send(result);
                false
            }
            SessionCmd::ClientCount { reply } => {
                let _ = reply.send(self.clients.len());
                false
            }
            SessionCmd::Dispose { reply } => {
                self.dispose_inner().await;
                let _ = reply.send(());
                true
            }
        }
    }

    async fn dispose_inner(&mut self) {
        if let Some(sub) = self.subscription.take() {
            self.pubsub.unsubscribe(&self.topic, sub).await;
        }
        self.events.emit(Event::DocumentUnload {
            document_id: self.document.clone(),
            session_id: docsync_proto::SessionId::generate(),
            reason: crate::events::UnloadReason::Dispose,
        });
    }

    async fn handle_cleanup_tick(&mut self) {
        if let Some(deadline) = self.cleanup_deadline {
            if Instant::now() >= deadline && self.clients.is_empty() {
                self.cleanup_deadline = None;
                let _ = self.on_cleanup.send(self.namespaced_document_id.clone()).await;
            }
        }
    }

    async fn handle_replication(&mut self, delivery: ReplicatedDelivery) {
        if delivery.origin == self.node_id {
            // P4: never apply our own publications back to ourselves.
            return;
        }
        let decoded = match docsync_proto::decode(&delivery.payload, &docsync_proto::PermissiveResolver) {
            Ok(m) => m,
            Err(err) => {
                debug!(error = %err, "dropping undecodable replicated message");
                return;
            }
        };
        let (message_type, payload_type) = message_kinds(&decoded);
        if !self.dedupe.should_accept(&self.namespaced_document_id, &decoded.id) {
            self.events.emit(Event::DocumentMessage {
                message_id: decoded.id.clone(),
                source: MessageSource::Replication {
                    source_node_id: delivery.origin.to_string(),
                },
                message_type,
                payload_type,
                deduped: true,
            });
            return;
        }
        self.events.emit(Event::DocumentMessage {
            message_id: decoded.id.clone(),
            source: MessageSource::Replication {
                source_node_id: delivery.origin.to_string(),
            },
            message_type,
            payload_type,
            deduped: false,
        });
        if let Err(err) = self.apply_inner(decoded, None, true).await {
            warn!(error = %err, "failed to apply replicated message");
        }
    }

    async fn apply_inner(
        &mut self,
        message: Message,
        client: Option<ClientHandle>,
        replication: bool,
    ) -> Result<(), CoreError> {
        if message.encrypted != self.encrypted {
            return Err(CoreError::EncryptionMismatch);
        }

        if !replication {
            let (message_type, payload_type) = message_kinds(&message);
            self.events.emit(Event::DocumentMessage {
                message_id: message.id.clone(),
                source: MessageSource::Client,
                message_type,
                payload_type,
                deduped: false,
            });
        }

        match &message.payload {
            MessagePayload::Doc(doc) => self.apply_doc(doc.clone(), &message, client, replication).await,
            MessagePayload::Awareness(_) => {
                self.broadcast(&message, client.as_ref().map(|c| c.id())).await;
                if !replication {
                    self.publish(&message).await;
                }
                Ok(())
            }
            MessagePayload::Rpc(rpc) => self.apply_rpc(rpc.clone(), &message, client, replication).await,
            MessagePayload::Ack { .. } | MessagePayload::Ping | MessagePayload::Pong => {
                debug!("session received a payload routed only by the server; ignoring");
                Ok(())
            }
        }
    }

    async fn apply_doc(
        &mut self,
        doc: DocPayload,
        message: &Message,
        client: Option<ClientHandle>,
        replication: bool,
    ) -> Result<(), CoreError> {
        match doc {
            DocPayload::SyncStep1 { state_vector } => {
                if replication {
                    return Ok(());
                }
                let Some(client) = client else { return Ok(()) };
                let doc = self
                    .storage
                    .plain()
                    .handle_sync_step1(&self.namespaced_document_id, state_vector)
                    .await?;
                client
                    .send(self.reply_message(message, DocPayload::SyncStep2 { update: doc.content.update }))
                    .await?;
                client
                    .send(self.reply_message(
                        message,
                        DocPayload::SyncStep1 { state_vector: doc.content.state_vector },
                    ))
                    .await?;
                Ok(())
            }
            DocPayload::Update { update } => {
                match self.storage.clone() {
                    StorageHandle::Encrypted(_, enc) => {
                        if let Some(payload) =
                            enc.handle_encrypted_update(&self.namespaced_document_id, update).await?
                        {
                            let out = self.reply_message(message, DocPayload::Update { update: payload });
                            self.broadcast(&out, client.as_ref().map(|c| c.id())).await;
                            if !replication {
                                self.publish(&out).await;
                            }
                        }
                    }
                    StorageHandle::Plain(storage) => {
                        storage.handle_update(&self.namespaced_document_id, update).await?;
                        self.broadcast(message, client.as_ref().map(|c| c.id())).await;
                        if !replication {
                            self.publish(message).await;
                        }
                    }
                }
                self.events.emit(Event::DocumentWrite {
                    document_id: self.document.clone(),
                    namespaced_document_id: self.namespaced_document_id.clone(),
                    encrypted: self.encrypted,
                });
                self.check_size().await;
                Ok(())
            }
            DocPayload::SyncStep2 { update } => {
                match self.storage.clone() {
                    StorageHandle::Encrypted(_, enc) => {
                        let payloads = enc
                            .handle_encrypted_sync_step2(&self.namespaced_document_id, update)
                            .await?;
                        for payload in payloads {
                            let out = self.reply_message(message, DocPayload::Update { update: payload });
                            self.broadcast(&out, client.as_ref().map(|c| c.id())).await;
                            if !replication {
                                self.publish(&out).await;
                            }
                        }
                    }
                    StorageHandle::Plain(storage) => {
                        let namespaced = self.namespaced_document_id.clone();
                        storage.handle_sync_step2(&namespaced, update.clone()).await?;
                        let out = self.reply_message(message, DocPayload::Update { update });
                        self.broadcast(&out, client.as_ref().map(|c| c.id())).await;
                        if !replication {
                            self.publish(&out).await;
                        }
                    }
                }
                self.events.emit(Event::DocumentWrite {
                    document_id: self.document.clone(),
                    namespaced_document_id: self.namespaced_document_id.clone(),
                    encrypted: self.encrypted,
                });
                self.check_size().await;
                if let Some(client) = client {
                    client.send(self.reply_message(message, DocPayload::SyncDone)).await?;
                }
                Ok(())
            }
            DocPayload::SyncDone | DocPayload::AuthMessage { .. } => {
                debug!("ignoring server/reply-only doc payload received by session");
                Ok(())
            }
        }
    }

    async fn apply_rpc(
        &mut self,
        rpc: RpcPayload,
        message: &Message,
        client: Option<ClientHandle>,
        replication: bool,
    ) -> Result<(), CoreError> {
        // RPC is node-local only: a replicated rpc/* is logged and dropped rather than
        // re-invoking handlers a second time on every node.
        if replication {
            debug!(method = %rpc.method, "ignoring replicated rpc message");
            return Ok(());
        }
        let Some(client) = client else { return Ok(()) };

        if !matches!(rpc.request_type, RpcRequestType::Request | RpcRequestType::Stream) {
            debug!(method = %rpc.method, "session received an rpc response; nothing to route");
            return Ok(());
        }

        let handler = self.rpc_handlers.get(&rpc.method);
        let Some(handler) = handler else {
            client
                .send(self.rpc_error_response(message, &rpc, CoreError::UnknownRpcMethod(rpc.method.clone())))
                .await?;
            return Ok(());
        };

        let ctx = RpcContext {
            server: self.server.clone(),
            session: self
                .handle_for_rpc
                .clone()
                .expect("session handle installed before run() starts"),
            document: self.document.clone(),
            user_id: message.context.user_id.clone(),
            client_id: message.context.client_id.clone(),
        };

        match rpc.request_type {
            RpcRequestType::Stream => match handler.stream(rpc.body.clone(), ctx).await {
                Ok(chunks) => {
                    for chunk in chunks {
                        client.send(self.rpc_chunk(message, &rpc, chunk)).await?;
                    }
                    client.send(self.rpc_response(message, &rpc, Bytes::new())).await?;
                    Ok(())
                }
                Err(detail) => {
                    client
                        .send(self.rpc_error_response(message, &rpc, CoreError::RpcHandlerFailure(detail)))
                        .await?;
                    Ok(())
                }
            },
            _ => match handler.call(rpc.body.clone(), ctx).await {
                Ok(body) => {
                    client.send(self.rpc_response(message, &rpc, body)).await?;
                    Ok(())
                }
                Err(detail) => {
                    client
                        .send(self.rpc_error_response(message, &rpc, CoreError::RpcHandlerFailure(detail)))
                        .await?;
                    Ok(())
                }
            },
        }
    }

    async fn broadcast(&self, message: &Message, exclude: Option<&ClientId>) {
        for (id, client) in &self.clients {
            if Some(id) == exclude {
                continue;
            }
            let mut copy = message.clone();
            copy.id = MessageId::generate();
            if let Err(err) = client.send(copy).await {
                warn!(client_id = %id, error = %err, "broadcast to client failed");
            }
        }
    }

    async fn publish(&self, message: &Message) {
        match docsync_proto::encode(message) {
            Ok(bytes) => {
                self.pubsub.publish(self.topic.clone(), bytes, self.node_id.clone()).await;
            }
            Err(err) => warn!(error = %err, "failed to encode message for replication"),
        }
    }

    async fn check_size(&mut self) {
        let metadata = match self.storage.plain().get_document_metadata(&self.namespaced_document_id).await {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "failed to read document metadata for size accounting");
                return;
            }
        };
        let warning_threshold = self.size_warning_threshold.or(metadata.size_warning_threshold);
        let limit = self.size_limit.or(metadata.size_limit);

        if let Some(limit) = limit {
            let (latched, fired) = edge_trigger(self.size_limited, metadata.size_bytes >= limit);
            if fired {
                self.events.emit(Event::DocumentSizeLimitExceeded {
                    namespaced_document_id: self.namespaced_document_id.clone(),
                    size_bytes: metadata.size_bytes,
                    limit,
                });
            }
            self.size_limited = latched;
        }

        if let Some(threshold) = warning_threshold {
            let (latched, fired) = edge_trigger(self.size_warned, metadata.size_bytes >= threshold);
            if fired {
                self.events.emit(Event::DocumentSizeWarning {
                    namespaced_document_id: self.namespaced_document_id.clone(),
                    size_bytes: metadata.size_bytes,
                    threshold,
                });
            }
            self.size_warned = latched;
        }
    }

    fn reply_message(&self, origin: &Message, payload: DocPayload) -> Message {
        Message {
            id: MessageId::generate(),
            document: origin.document.clone(),
            context: origin.context.clone(),
            encrypted: self.encrypted,
            payload: MessagePayload::Doc(payload),
        }
    }

    fn rpc_response(&self, origin: &Message, rpc: &RpcPayload, body: Bytes) -> Message {
        Message {
            id: MessageId::generate(),
            document: origin.document.clone(),
            context: origin.context.clone(),
            encrypted: self.encrypted,
            payload: MessagePayload::Rpc(RpcPayload {
                method: rpc.method.clone(),
                request_type: RpcRequestType::Response,
                original_request_id: Some(origin.id.clone()),
                body,
                method_known: true,
            }),
        }
    }

    fn rpc_chunk(&self, origin: &Message, rpc: &RpcPayload, body: Bytes) -> Message {
        Message {
            id: MessageId::generate(),
            document: origin.document.clone(),
            context: origin.context.clone(),
            encrypted: self.encrypted,
            payload: MessagePayload::Rpc(RpcPayload {
                method: rpc.method.clone(),
                request_type: RpcRequestType::Stream,
                original_request_id: Some(origin.id.clone()),
                body,
                method_known: true,
            }),
        }
    }

    fn rpc_error_response(&self, origin: &Message, rpc: &RpcPayload, error: CoreError) -> Message {
        let detail = error.to_wire().map(|k| format!("{k:?}")).unwrap_or_default();
        self.rpc_response(origin, rpc, Bytes::from(detail.into_bytes()))
    }
}

/// A latch that only fires on the rising edge: `currently_at_or_above` going from `false` to
/// `true`. Returns `(new_latch_state, should_fire)`. Used for both `document-size-warning` and
/// `document-size-limit-exceeded`, so a document sitting above its threshold emits the event
/// once, not on every mutation.
fn edge_trigger(latched: bool, currently_at_or_above: bool) -> (bool, bool) {
    (currently_at_or_above, currently_at_or_above && !latched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn edge_trigger_fires_only_on_the_rising_edge(inputs in prop::collection::vec(any::<bool>(), 0..64)) {
            let mut latched = false;
            for at_or_above in inputs {
                let expected_fire = at_or_above && !latched;
                let (new_latched, fired) = edge_trigger(latched, at_or_above);
                prop_assert_eq!(new_latched, at_or_above);
                prop_assert_eq!(fired, expected_fire);
                latched = new_latched;
            }
        }
    }

    #[test]
    fn edge_trigger_does_not_refire_while_still_above() {
        let (latched, fired) = edge_trigger(false, true);
        assert!(latched);
        assert!(fired);
        let (latched, fired) = edge_trigger(latched, true);
        assert!(latched);
        assert!(!fired);
    }
}
