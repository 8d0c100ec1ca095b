//! The embedder-supplied hook that produces a storage backend for a newly opened document.

use async_trait::async_trait;
use docsync_proto::{DocumentName, MessageContext, NamespacedDocId};

use crate::error::CoreError;
use crate::storage_handle::StorageHandle;

#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn get_storage(
        &self,
        document: &DocumentName,
        namespaced_document_id: &NamespacedDocId,
        context: &MessageContext,
    ) -> Result<StorageHandle, CoreError>;
}
