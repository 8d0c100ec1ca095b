//! The permission gate consulted before every doc read/write reaches storage.

use async_trait::async_trait;
use docsync_proto::{ClientId, DocumentName, NamespacedDocId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionKind {
    Read,
    Write,
}

#[derive(Clone, Debug)]
pub struct PermissionContext {
    pub client_id: ClientId,
    pub user_id: Option<UserId>,
    pub document: DocumentName,
    pub namespaced_document_id: NamespacedDocId,
    pub kind: PermissionKind,
}

/// Checked synchronously before routing every doc message other than `sync-done` /
/// `auth-message` (which never reach storage) and the replication path (already vetted on the
/// originating node). A missing checker allows everything — see [`AllowAll`].
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, ctx: &PermissionContext) -> bool;
}

/// The default checker: every read and write is permitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check(&self, _ctx: &PermissionContext) -> bool {
        true
    }
}
