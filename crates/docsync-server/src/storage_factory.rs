//! The demonstration [`StorageFactory`]: one shared [`InMemoryStorage`] instance reused for
//! every document, since the in-memory backend already keys its state by namespaced id
//! internally.

use std::sync::Arc;

use async_trait::async_trait;
use docsync_core::factory::StorageFactory;
use docsync_core::{CoreError, StorageHandle};
use docsync_proto::{DocumentName, MessageContext, NamespacedDocId};
use docsync_storage::InMemoryStorage;

pub struct InMemoryStorageFactory {
    storage: Arc<InMemoryStorage>,
}

impl InMemoryStorageFactory {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
        }
    }
}

impl Default for InMemoryStorageFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageFactory for InMemoryStorageFactory {
    async fn get_storage(
        &self,
        _document: &DocumentName,
        _namespaced_document_id: &NamespacedDocId,
        _context: &MessageContext,
    ) -> Result<StorageHandle, CoreError> {
        Ok(StorageHandle::Plain(self.storage.clone()))
    }
}
