//! End-to-end scenarios: fan-out, cross-node replication with self-echo suppression, the sync
//! handshake, and permission gating.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docsync_core::factory::StorageFactory;
use docsync_core::permission::{PermissionChecker, PermissionContext, PermissionKind};
use docsync_core::{CoreError, Server, ServerOptions, StorageHandle, Transport};
use docsync_proto::{ClientId, DocPayload, DocumentName, Message, MessageContext, MessagePayload};
use docsync_pubsub::InMemoryPubSub;
use docsync_storage::InMemoryStorage;

#[derive(Clone)]
struct RecordingTransport {
    received: Arc<Mutex<Vec<Message>>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: Message) -> Result<(), CoreError> {
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

struct SharedStorageFactory {
    storage: Arc<InMemoryStorage>,
}

#[async_trait]
impl StorageFactory for SharedStorageFactory {
    async fn get_storage(
        &self,
        _document: &DocumentName,
        _namespaced: &docsync_proto::NamespacedDocId,
        _context: &MessageContext,
    ) -> Result<StorageHandle, CoreError> {
        Ok(StorageHandle::Plain(self.storage.clone()))
    }
}

fn make_server() -> Arc<Server> {
    let options = ServerOptions::new(
        Arc::new(SharedStorageFactory {
            storage: Arc::new(InMemoryStorage::new()),
        }),
        Arc::new(InMemoryPubSub::new()),
    );
    Server::new(options)
}

fn update_message(doc: &str, client_id: ClientId, bytes: &'static [u8]) -> Message {
    Message::new(
        DocumentName::from(doc),
        MessageContext::new(client_id),
        false,
        MessagePayload::Doc(DocPayload::Update {
            update: bytes::Bytes::from_static(bytes),
        }),
    )
}

#[tokio::test]
async fn two_client_fan_out_same_node() {
    let server = make_server();

    let a_id = ClientId::generate();
    let a_transport = RecordingTransport::new();
    let a_client = server.create_client(Some(a_id.clone()), Arc::new(a_transport.clone()));

    let b_id = ClientId::generate();
    let b_transport = RecordingTransport::new();
    let b_client = server.create_client(Some(b_id.clone()), Arc::new(b_transport.clone()));

    // Both attach to the document first (as a real transport loop would on first message).
    let hello_a = update_message("d1", a_id.clone(), b"");
    server.handle_inbound(&a_id, &a_client, hello_a).await.unwrap();
    let hello_b = update_message("d1", b_id.clone(), b"");
    server.handle_inbound(&b_id, &b_client, hello_b).await.unwrap();

    a_transport.received.lock().unwrap().clear();
    b_transport.received.lock().unwrap().clear();

    let update = update_message("d1", a_id.clone(), b"hello");
    let update_id = update.id.clone();
    server.handle_inbound(&a_id, &a_client, update).await.unwrap();

    let a_messages = a_transport.messages();
    assert_eq!(a_messages.len(), 1);
    assert!(matches!(a_messages[0].payload, MessagePayload::Ack { ref message_id } if *message_id == update_id));

    let b_messages = b_transport.messages();
    assert_eq!(b_messages.len(), 1);
    assert!(matches!(b_messages[0].payload, MessagePayload::Doc(DocPayload::Update { .. })));
}

struct WriteDenier;

#[async_trait]
impl PermissionChecker for WriteDenier {
    async fn check(&self, ctx: &PermissionContext) -> bool {
        ctx.kind != PermissionKind::Write
    }
}

#[tokio::test]
async fn permission_denied_on_write() {
    let mut options = ServerOptions::new(
        Arc::new(SharedStorageFactory {
            storage: Arc::new(InMemoryStorage::new()),
        }),
        Arc::new(InMemoryPubSub::new()),
    );
    options.permissions = Arc::new(WriteDenier);
    let server = Server::new(options);

    let client_id = ClientId::generate();
    let transport = RecordingTransport::new();
    let client = server.create_client(Some(client_id.clone()), Arc::new(transport.clone()));

    let update = update_message("d1", client_id.clone(), b"blocked");
    server.handle_inbound(&client_id, &client, update).await.unwrap();

    let messages = transport.messages();
    assert_eq!(messages.len(), 1);
    match &messages[0].payload {
        MessagePayload::Doc(DocPayload::AuthMessage { permission, .. }) => {
            assert_eq!(*permission, docsync_proto::Permission::Denied);
        }
        other => panic!("expected auth-message denial, got {other:?}"),
    }
}

#[tokio::test]
async fn sync_step2_write_denied_surfaces_as_sync_done() {
    let mut options = ServerOptions::new(
        Arc::new(SharedStorageFactory {
            storage: Arc::new(InMemoryStorage::new()),
        }),
        Arc::new(InMemoryPubSub::new()),
    );
    options.permissions = Arc::new(WriteDenier);
    let server = Server::new(options);

    let client_id = ClientId::generate();
    let transport = RecordingTransport::new();
    let client = server.create_client(Some(client_id.clone()), Arc::new(transport.clone()));

    let msg = Message::new(
        DocumentName::from("d1"),
        MessageContext::new(client_id.clone()),
        false,
        MessagePayload::Doc(DocPayload::SyncStep2 {
            update: bytes::Bytes::from_static(b"denied"),
        }),
    );
    server.handle_inbound(&client_id, &client, msg).await.unwrap();

    let messages = transport.messages();
    assert_eq!(messages.len(), 1);
    assert!(matches!(messages[0].payload, MessagePayload::Doc(DocPayload::SyncDone)));
}

#[tokio::test]
async fn sync_handshake_round_trip() {
    let server = make_server();
    let client_id = ClientId::generate();
    let transport = RecordingTransport::new();
    let client = server.create_client(Some(client_id.clone()), Arc::new(transport.clone()));

    let step1 = Message::new(
        DocumentName::from("d1"),
        MessageContext::new(client_id.clone()),
        false,
        MessagePayload::Doc(DocPayload::SyncStep1 {
            state_vector: bytes::Bytes::new(),
        }),
    );
    let step1_id = step1.id.clone();
    server.handle_inbound(&client_id, &client, step1).await.unwrap();

    let messages = transport.messages();
    // sync-step-2, sync-step-1, then the ack for the inbound sync-step-1.
    assert_eq!(messages.len(), 3);
    assert!(matches!(messages[0].payload, MessagePayload::Doc(DocPayload::SyncStep2 { .. })));
    assert!(matches!(messages[1].payload, MessagePayload::Doc(DocPayload::SyncStep1 { .. })));
    assert!(matches!(messages[2].payload, MessagePayload::Ack { ref message_id } if *message_id == step1_id));
}

#[tokio::test]
async fn concurrent_opens_coalesce_onto_one_session() {
    let server = make_server();
    let context = MessageContext::new(ClientId::generate());
    let document = DocumentName::from("d1");

    let (a, b) = tokio::join!(
        server.get_or_open_session(document.clone(), false, &context),
        server.get_or_open_session(document.clone(), false, &context),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.namespaced_document_id, b.namespaced_document_id);

    a.add_client(docsync_core::client::start(
        ClientId::generate(),
        Arc::new(RecordingTransport::new()),
    ))
    .await;
    assert_eq!(b.client_count().await, 1);
}

/// Polls `check` until it returns `true` or the timeout elapses, for asserting on state that
/// settles asynchronously through an actor's mailbox rather than synchronously with the call
/// that triggered it.
async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition did not become true within the timeout");
}

#[tokio::test]
async fn cross_node_replication_with_self_echo_suppression() {
    let pubsub: Arc<InMemoryPubSub> = Arc::new(InMemoryPubSub::new());

    let mut options_a = ServerOptions::new(
        Arc::new(SharedStorageFactory {
            storage: Arc::new(InMemoryStorage::new()),
        }),
        pubsub.clone(),
    );
    options_a.config.node_id = docsync_pubsub::NodeId("node-a".to_string());
    let server_a = Server::new(options_a);

    let mut options_b = ServerOptions::new(
        Arc::new(SharedStorageFactory {
            storage: Arc::new(InMemoryStorage::new()),
        }),
        pubsub,
    );
    options_b.config.node_id = docsync_pubsub::NodeId("node-b".to_string());
    let server_b = Server::new(options_b);

    let a_id = ClientId::generate();
    let a_transport = RecordingTransport::new();
    let a_client = server_a.create_client(Some(a_id.clone()), Arc::new(a_transport.clone()));

    let b_id = ClientId::generate();
    let b_transport = RecordingTransport::new();
    let b_client = server_b.create_client(Some(b_id.clone()), Arc::new(b_transport.clone()));

    // Attach both clients to the same document on their respective node before the real update.
    server_a
        .handle_inbound(&a_id, &a_client, update_message("d1", a_id.clone(), b""))
        .await
        .unwrap();
    server_b
        .handle_inbound(&b_id, &b_client, update_message("d1", b_id.clone(), b""))
        .await
        .unwrap();

    a_transport.received.lock().unwrap().clear();
    b_transport.received.lock().unwrap().clear();

    let update = update_message("d1", a_id.clone(), b"from-a");
    let update_id = update.id.clone();
    server_a.handle_inbound(&a_id, &a_client, update).await.unwrap();

    // Node A only ever sees its own ack: the local broadcast excludes the sender, and the
    // publication node A makes of its own update is filtered back out by self-echo suppression
    // rather than being re-applied and re-broadcast to itself.
    wait_until(|| !a_transport.messages().is_empty()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let a_messages = a_transport.messages();
    assert_eq!(a_messages.len(), 1);
    assert!(matches!(a_messages[0].payload, MessagePayload::Ack { ref message_id } if *message_id == update_id));

    // Node B never sent a message of its own, so it receives only the replicated update, fanned
    // out to its local client once the dedupe set accepts the cross-node delivery.
    wait_until(|| !b_transport.messages().is_empty()).await;
    let b_messages = b_transport.messages();
    assert_eq!(b_messages.len(), 1);
    match &b_messages[0].payload {
        MessagePayload::Doc(DocPayload::Update { update }) => assert_eq!(update.as_ref(), b"from-a"),
        other => panic!("expected a replicated update, got {other:?}"),
    }
}

#[tokio::test]
async fn cleanup_grace_window_cancels_on_reconnect() {
    let server = make_server();
    let client_id = ClientId::generate();
    let transport = RecordingTransport::new();
    let client = server.create_client(Some(client_id.clone()), Arc::new(transport.clone()));

    let hello = update_message("d1", client_id.clone(), b"");
    server.handle_inbound(&client_id, &client, hello).await.unwrap();

    let context = MessageContext::new(client_id.clone());
    let session = server
        .get_or_open_session(DocumentName::from("d1"), false, &context)
        .await
        .unwrap();
    session.remove_client(client_id.clone()).await;
    assert_eq!(session.client_count().await, 0);

    // Reconnect well inside the grace window; the session must still be the same instance.
    session.add_client(client.clone()).await;
    assert_eq!(session.client_count().await, 1);

    let still_same = server
        .get_or_open_session(DocumentName::from("d1"), false, &context)
        .await
        .unwrap();
    assert_eq!(still_same.namespaced_document_id, session.namespaced_document_id);
}
