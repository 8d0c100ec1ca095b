//! # docsync-core
//!
//! The broker core: the CRDT sync state machine, client/session/server lifecycle, and the
//! observable event bus an embedding process wires transports, storage, and pub/sub around.
//!
//! ## Mental model
//!
//! A client holds a local CRDT replica of a document. It connects to a broker node, which
//! assigns it a [`client::ClientHandle`] (an outbound write half with its own in-flight ack
//! tracking). The client's first message for a document causes the [`Server`] to lazily open a
//! [`session::SessionHandle`] for that document — one per namespaced id, shared by every local
//! client of that document. From there, every message the client sends is routed: permission
//! checked, applied to the session's sync state machine, broadcast to every other local client,
//! published to the cross-node pub/sub topic for that document, and acknowledged back to the
//! sender.
//!
//! ## Key types
//!
//! | Type | Role |
//! |---|---|
//! | [`Server`] | process-wide supervisor: registries, ingress pipeline, shutdown |
//! | [`session::SessionHandle`] | per-document hub: sync handshake, broadcast, replication, cleanup |
//! | [`client::ClientHandle`] | per-connection outbound sink with serialized sends |
//! | [`events::Event`] | the observable lifecycle bus |
//! | [`permission::PermissionChecker`] | the read/write gate consulted before routing |
//! | [`factory::StorageFactory`] | produces a [`docsync_storage::DocumentStorage`] per document |
//!
//! ## Invariants
//!
//! - **At most one session per namespaced id per node.** Enforced in: `Server::get_or_open_session`'s
//!   pending-promise coalescing. Tested by: concurrent-open tests in `server.rs`. Failure
//!   symptom: two divergent in-memory copies of the same document silently drift apart.
//! - **A session's `encrypted` flag is immutable.** Enforced in: `SessionService::apply_inner`'s
//!   first check. Failure symptom: a plaintext message merged into an encrypted document's
//!   history, or vice versa.
//! - **Empty-session cleanup has a grace period.** Enforced in: `SessionService`'s cleanup timer
//!   plus `Server`'s double-check in `run_cleanup_listener`. Failure symptom without it: a
//!   client's brief reconnect (tab refresh, network blip) evicts and reloads the whole document.
//!
//! ## Concurrency & ordering
//!
//! Each session and each client is its own actor task; ordering is per-actor FIFO. Registries
//! are `parking_lot::Mutex`-guarded and never held across an `.await`. Replicated deliveries for
//! a document are serialized into the same queue as that document's client-originated messages,
//! so a session never reasons about two mutations at once.
//!
//! ## Failure modes & recovery
//!
//! Storage errors abort only the in-flight `apply` call; the session keeps running. Transport
//! send failures end that one client's actor (see `client.rs`) without affecting the session or
//! other clients. A session that outlives its last client is only disposed after
//! `Server` re-checks, under its registry lock, that no client reattached during the grace
//! window.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod permission;
pub mod rpc;
pub mod server;
pub mod session;
pub mod storage_handle;

pub use client::{ClientHandle, Transport};
pub use config::BrokerConfig;
pub use error::CoreError;
pub use events::{
    DisconnectReason, DocPayloadKind, Event, MessageDirection, MessageKind, MessageSource,
    UnloadReason,
};
pub use factory::StorageFactory;
pub use permission::{AllowAll, PermissionChecker, PermissionContext, PermissionKind};
pub use rpc::{RpcContext, RpcHandler, RpcRegistry};
pub use server::{Server, ServerOptions};
pub use session::SessionHandle;
pub use storage_handle::StorageHandle;
