//! The process-level supervisor: session/client registries, the inbound message pipeline,
//! permission enforcement, and graceful shutdown.
//!
//! Built with `Arc::new_cyclic` so the cleanup-listener background task and every session can
//! hold a `Weak<Server>` back-reference before construction completes. The session registry's
//! pending-promise coalescing (`SessionSlot::Pending(Arc<Notify>)`) is the standard tokio
//! notify-on-complete idiom for "await a computation someone else already started."

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use docsync_proto::{
    ClientId, DocPayload, DocumentName, Message, MessageContext, MessageId, MessagePayload,
    NamespacedDocId, Permission,
};
use docsync_pubsub::{Dedupe, NodeId, PubSub};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::client::{self, ClientHandle, Transport};
use crate::config::BrokerConfig;
use crate::error::CoreError;
use crate::events::{DisconnectReason, Event, EventBus, UnloadReason};
use crate::factory::StorageFactory;
use crate::permission::{AllowAll, PermissionChecker, PermissionContext, PermissionKind};
use crate::rpc::RpcRegistry;
use crate::session::{self, SessionHandle, SessionStartArgs};

enum SessionSlot {
    Pending(Arc<Notify>),
    Ready(SessionHandle),
}

/// Everything an embedder supplies at construction time.
pub struct ServerOptions {
    pub config: BrokerConfig,
    pub storage_factory: Arc<dyn StorageFactory>,
    pub pubsub: Arc<dyn PubSub>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub rpc_handlers: RpcRegistry,
}

impl ServerOptions {
    pub fn new(storage_factory: Arc<dyn StorageFactory>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            config: BrokerConfig::default(),
            storage_factory,
            pubsub,
            permissions: Arc::new(AllowAll),
            rpc_handlers: RpcRegistry::new(),
        }
    }
}

pub struct Server {
    config: BrokerConfig,
    storage_factory: Arc<dyn StorageFactory>,
    pubsub: Arc<dyn PubSub>,
    permissions: Arc<dyn PermissionChecker>,
    rpc_handlers: Arc<RpcRegistry>,
    events: EventBus,
    dedupe: Arc<Dedupe>,
    sessions: Mutex<HashMap<NamespacedDocId, SessionSlot>>,
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    cleanup_tx: mpsc::Sender<NamespacedDocId>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let (cleanup_tx, cleanup_rx) = mpsc::channel(256);
        let dedupe = Arc::new(Dedupe::new(options.config.dedupe_ttl));

        let server = Arc::new_cyclic(|weak: &Weak<Server>| {
            let weak_for_task = weak.clone();
            tokio::spawn(run_cleanup_listener(weak_for_task, cleanup_rx));
            Server {
                config: options.config,
                storage_factory: options.storage_factory,
                pubsub: options.pubsub,
                permissions: options.permissions,
                rpc_handlers: Arc::new(options.rpc_handlers),
                events: EventBus::new(),
                dedupe,
                sessions: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                cleanup_tx,
            }
        });
        server
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Registers a new client and returns a handle to it. The caller is responsible for
    /// feeding inbound transport messages to [`Server::handle_inbound`] in a per-client loop and
    /// calling [`Server::disconnect_client`] when that loop ends.
    pub fn create_client(&self, id: Option<ClientId>, transport: Arc<dyn Transport>) -> ClientHandle {
        let id = id.unwrap_or_else(ClientId::generate);
        let handle = client::start(id.clone(), transport);
        self.clients.lock().insert(id.clone(), handle.clone());
        self.events.emit(Event::ClientConnect { client_id: id });
        handle
    }

    /// Finds or lazily opens the session for `document`, coalescing concurrent callers onto the
    /// same instance (P1).
    pub async fn get_or_open_session(
        self: &Arc<Self>,
        document: DocumentName,
        encrypted: bool,
        context: &MessageContext,
    ) -> Result<SessionHandle, CoreError> {
        let namespaced = NamespacedDocId::compute(&document, context.room.as_deref());

        loop {
            let notify = {
                let mut sessions = self.sessions.lock();
                match sessions.get(&namespaced) {
                    Some(SessionSlot::Ready(handle)) => {
                        if handle.encrypted != encrypted {
                            return Err(CoreError::EncryptionMismatch);
                        }
                        return Ok(handle.clone());
                    }
                    Some(SessionSlot::Pending(notify)) => Some(notify.clone()),
                    None => {
                        sessions.insert(namespaced.clone(), SessionSlot::Pending(Arc::new(Notify::new())));
                        None
                    }
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue;
            }

            let storage = match self
                .storage_factory
                .get_storage(&document, &namespaced, context)
                .await
            {
                Ok(storage) => storage,
                Err(err) => {
                    if let Some(SessionSlot::Pending(notify)) = self.sessions.lock().remove(&namespaced) {
                        notify.notify_waiters();
                    }
                    return Err(err);
                }
            };

            let handle = session::start(SessionStartArgs {
                document: document.clone(),
                namespaced_document_id: namespaced.clone(),
                encrypted,
                storage,
                pubsub: self.pubsub.clone(),
                dedupe: self.dedupe.clone(),
                node_id: self.config.node_id.clone(),
                rpc_handlers: self.rpc_handlers.clone(),
                events: self.events.clone(),
                cleanup_delay: self.config.cleanup_delay,
                size_warning_threshold: self.config.size_warning_threshold,
                size_limit: self.config.size_limit,
                on_cleanup: self.cleanup_tx.clone(),
                server: Arc::downgrade(self),
            })
            .await;

            let notify = {
                let mut sessions = self.sessions.lock();
                let previous = sessions.insert(namespaced.clone(), SessionSlot::Ready(handle.clone()));
                match previous {
                    Some(SessionSlot::Pending(notify)) => Some(notify),
                    _ => None,
                }
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }

            return Ok(handle);
        }
    }

    /// Routes one inbound message from `client` through the permission gate and into its
    /// session. Once a message is routed, the ack is sent regardless of whether `apply` itself
    /// succeeded — an apply failure is logged, not propagated, so a transient storage error
    /// doesn't leave the client endlessly waiting on its own ack.
    pub async fn handle_inbound(
        self: &Arc<Self>,
        client_id: &ClientId,
        client: &ClientHandle,
        message: Message,
    ) -> Result<(), CoreError> {
        self.events.emit(Event::ClientMessage {
            client_id: client_id.clone(),
            direction: crate::events::MessageDirection::In,
            document_id: Some(message.document.clone()),
        });

        if let MessagePayload::Ack { message_id } = &message.payload {
            client.handle_ack(message_id.clone()).await;
            return Ok(());
        }

        let encrypted = message.encrypted;
        let session = self
            .get_or_open_session(message.document.clone(), encrypted, &message.context)
            .await?;

        let routed = match &message.payload {
            MessagePayload::Doc(doc) => {
                self.route_doc(&session, doc, &message, client).await?
            }
            _ => true,
        };

        if routed {
            // Only a client whose message actually cleared the permission gate joins the
            // session's broadcast membership — a read-denied client must never receive
            // another client's subsequent updates.
            session.add_client(client.clone()).await;
            if let Err(err) = session.apply(message.clone(), Some(client.clone()), false).await {
                warn!(%client_id, error = %err, "failed to apply message; acking anyway");
            }
            client.send(message.ack_for()).await?;
        }
        Ok(())
    }

    /// Returns `true` if the message should still be routed to the session, `false` if this
    /// function has already fully handled it (e.g. sent a denial).
    async fn route_doc(
        &self,
        session: &SessionHandle,
        doc: &DocPayload,
        message: &Message,
        client: &ClientHandle,
    ) -> Result<bool, CoreError> {
        let namespaced = message.namespaced_document_id();
        let kind = match doc {
            DocPayload::SyncStep1 { .. } | DocPayload::SyncDone => PermissionKind::Read,
            DocPayload::Update { .. } | DocPayload::SyncStep2 { .. } => PermissionKind::Write,
            DocPayload::AuthMessage { .. } => {
                // auth-message is server-only; a client sending one is always denied.
                self.deny(client, message, "auth-message is server-only").await?;
                return Ok(false);
            }
        };

        let ctx = PermissionContext {
            client_id: message.context.client_id.clone(),
            user_id: message.context.user_id.clone(),
            document: message.document.clone(),
            namespaced_document_id: namespaced,
            kind,
        };

        if self.permissions.check(&ctx).await {
            return Ok(true);
        }

        if matches!(doc, DocPayload::SyncStep2 { .. }) {
            // Special case: a denied write still completes the handshake from the client's
            // point of view, surfaced as sync-done rather than an auth-message.
            let reply = Message {
                id: MessageId::generate(),
                document: message.document.clone(),
                context: message.context.clone(),
                encrypted: message.encrypted,
                payload: MessagePayload::Doc(DocPayload::SyncDone),
            };
            client.send(reply).await?;
        } else {
            self.deny(client, message, "permission denied").await?;
        }
        Ok(false)
    }

    async fn deny(&self, client: &ClientHandle, message: &Message, reason: &str) -> Result<(), CoreError> {
        let reply = Message {
            id: MessageId::generate(),
            document: message.document.clone(),
            context: message.context.clone(),
            encrypted: message.encrypted,
            payload: MessagePayload::Doc(DocPayload::AuthMessage {
                permission: Permission::Denied,
                reason: Some(reason.to_string()),
            }),
        };
        client.send(reply).await
    }

    pub async fn disconnect_client(&self, client_id: &ClientId, reason: DisconnectReason) {
        let handle = self.clients.lock().remove(client_id);
        if let Some(handle) = handle {
            // Independent task per session so a stuck session can't block client teardown.
            let sessions: Vec<SessionHandle> = self
                .sessions
                .lock()
                .values()
                .filter_map(|slot| match slot {
                    SessionSlot::Ready(h) => Some(h.clone()),
                    SessionSlot::Pending(_) => None,
                })
                .collect();
            for session in sessions {
                let client_id = client_id.clone();
                tokio::spawn(async move { session.remove_client(client_id).await });
            }
            handle.destroy().await;
        }
        self.events.emit(Event::ClientDisconnect {
            client_id: client_id.clone(),
            reason,
        });
    }

    pub async fn delete_document(
        self: &Arc<Self>,
        document: DocumentName,
        context: &MessageContext,
        encrypted: bool,
    ) -> Result<(), CoreError> {
        let namespaced = NamespacedDocId::compute(&document, context.room.as_deref());
        let session = self.get_or_open_session(document.clone(), encrypted, context).await?;
        session.dispose().await;
        self.sessions.lock().remove(&namespaced);
        self.storage_factory
            .get_storage(&document, &namespaced, context)
            .await?
            .plain()
            .delete_document(&namespaced)
            .await?;
        self.events.emit(Event::DocumentDelete {
            document_id: document,
            encrypted,
        });
        Ok(())
    }

    /// Drains every client and session, then disposes the pub/sub fabric. Idempotent.
    pub async fn shutdown(&self) {
        let (active, pending) = {
            let sessions = self.sessions.lock();
            let active = sessions.values().filter(|s| matches!(s, SessionSlot::Ready(_))).count();
            let pending = sessions.values().filter(|s| matches!(s, SessionSlot::Pending(_))).count();
            (active, pending)
        };
        self.events.emit(Event::BeforeServerShutdown {
            active_sessions: active,
            pending_sessions: pending,
        });

        let clients: Vec<ClientHandle> = self.clients.lock().drain().map(|(_, v)| v).collect();
        for client in clients {
            client.destroy().await;
            self.events.emit(Event::ClientDisconnect {
                client_id: client.id().clone(),
                reason: DisconnectReason::Dispose,
            });
        }

        let sessions: Vec<SessionHandle> = self
            .sessions
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                SessionSlot::Ready(h) => Some(h),
                SessionSlot::Pending(_) => None,
            })
            .collect();
        for session in sessions {
            session.dispose().await;
        }

        self.pubsub.dispose().await;
        self.events.emit(Event::AfterServerShutdown {
            node_id: self.config.node_id.to_string(),
        });
    }
}

async fn run_cleanup_listener(server: Weak<Server>, mut rx: mpsc::Receiver<NamespacedDocId>) {
    while let Some(namespaced) = rx.recv().await {
        let Some(server) = server.upgrade() else { break };
        let handle = {
            let sessions = server.sessions.lock();
            match sessions.get(&namespaced) {
                Some(SessionSlot::Ready(h)) => Some(h.clone()),
                _ => None,
            }
        };
        let Some(handle) = handle else { continue };
        if handle.client_count().await != 0 {
            continue;
        }
        handle.dispose().await;
        server.sessions.lock().remove(&namespaced);
        info!(%namespaced, "session disposed after idle grace period");
        server.events.emit(Event::DocumentUnload {
            document_id: handle.document.clone(),
            session_id: docsync_proto::SessionId::generate(),
            reason: UnloadReason::Idle,
        });
    }
}
