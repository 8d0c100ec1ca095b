//! Wraps a document's storage backend, distinguishing the encrypted extension from the base
//! contract.
//!
//! `Arc<dyn EncryptedDocumentStorage>` cannot be upcast to `Arc<dyn DocumentStorage>` on this
//! workspace's MSRV (trait upcasting coercion isn't available pre-1.86), so an encrypted-aware
//! factory hands back the same concrete value coerced into both trait objects up front.

use std::sync::Arc;

use docsync_storage::{DocumentStorage, EncryptedDocumentStorage};

#[derive(Clone)]
pub enum StorageHandle {
    Plain(Arc<dyn DocumentStorage>),
    Encrypted(Arc<dyn DocumentStorage>, Arc<dyn EncryptedDocumentStorage>),
}

impl StorageHandle {
    pub fn plain(&self) -> &Arc<dyn DocumentStorage> {
        match self {
            StorageHandle::Plain(s) => s,
            StorageHandle::Encrypted(s, _) => s,
        }
    }

    pub fn encrypted(&self) -> Option<&Arc<dyn EncryptedDocumentStorage>> {
        match self {
            StorageHandle::Plain(_) => None,
            StorageHandle::Encrypted(_, e) => Some(e),
        }
    }
}
