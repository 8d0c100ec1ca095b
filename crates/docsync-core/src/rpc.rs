//! The RPC handler registry riding the same channel as document sync traffic.
//!
//! Method name maps to a boxed handler (`HashMap<String, Arc<dyn RpcHandler>>`); requests and
//! responses correlate by the original request's message id.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use docsync_proto::{ClientId, DocumentName, UserId};

use crate::session::SessionHandle;
use crate::Server;

/// Context handed to every RPC handler invocation, enriched with the calling client and the
/// session the message arrived on.
pub struct RpcContext {
    pub server: Weak<Server>,
    pub session: SessionHandle,
    pub document: DocumentName,
    pub user_id: Option<UserId>,
    pub client_id: ClientId,
}

/// An RPC handler. `stream` defaults to a single chunk wrapping `call`'s result; override it
/// for handlers that genuinely produce multiple chunks.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, body: Bytes, ctx: RpcContext) -> Result<Bytes, String>;

    async fn stream(&self, body: Bytes, ctx: RpcContext) -> Result<Vec<Bytes>, String> {
        self.call(body, ctx).await.map(|chunk| vec![chunk])
    }
}

/// Method-name-keyed handler registry, shared read-only across every session on a node.
#[derive(Default, Clone)]
pub struct RpcRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(method).cloned()
    }
}
