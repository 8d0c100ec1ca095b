//! A `HashMap`-backed [`DocumentStorage`] guarded by a single async mutex.
//!
//! Treats the CRDT payload as an opaque append log: a "state vector" is just the count of
//! updates the caller has already observed, and `handle_sync_step1` replies with every update
//! past that count. This is not a real CRDT — it exists to exercise every operation in the
//! trait and every testable property the sync handshake relies on without depending on an
//! actual CRDT engine.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut, Buf, BufMut};
use docsync_proto::NamespacedDocId;
use tokio::sync::Mutex;

use crate::{Document, DocumentContent, DocumentStorage, Metadata, MetadataMutation, StorageError};


#[derive(Default, Clone)]
struct Record {
    updates: Vec<Bytes>,
    metadata: Metadata,
}

impl Record {
    fn state_vector(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(self.updates.len() as u64);
        buf.freeze()
    }

    fn content_since(&self, remote_sv: &Bytes) -> Bytes {
        let seen = parse_count(remote_sv);
        let mut buf = BytesMut::new();
        for update in self.updates.iter().skip(seen) {
            buf.put_slice(update);
        }
        buf.freeze()
    }

    fn all_content(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for update in &self.updates {
            buf.put_slice(update);
        }
        buf.freeze()
    }

    fn push(&mut self, update: Bytes) {
        self.metadata.size_bytes += update.len() as u64;
        self.updates.push(update);
    }
}

fn parse_count(sv: &Bytes) -> usize {
    if sv.len() < 8 {
        return 0;
    }
    let mut cursor = sv.clone();
    cursor.get_u64_le() as usize
}

#[derive(Default)]
pub struct InMemoryStorage {
    docs: Mutex<HashMap<NamespacedDocId, Record>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStorage for InMemoryStorage {
    async fn handle_sync_step1(&self, doc: &NamespacedDocId, state_vector: Bytes) -> Result<Document, StorageError> {
        let docs = self.docs.lock().await;
        let record = docs.get(doc).cloned().unwrap_or_default();
        Ok(Document {
            id: doc.clone(),
            metadata: record.metadata.clone(),
            content: DocumentContent {
                update: record.content_since(&state_vector),
                state_vector: record.state_vector(),
            },
        })
    }

    async fn handle_sync_step2(&self, doc: &NamespacedDocId, update: Bytes) -> Result<(), StorageError> {
        if update.is_empty() {
            return Ok(());
        }
        let mut docs = self.docs.lock().await;
        docs.entry(doc.clone()).or_default().push(update);
        Ok(())
    }

    async fn handle_update(&self, doc: &NamespacedDocId, update: Bytes) -> Result<(), StorageError> {
        let mut docs = self.docs.lock().await;
        docs.entry(doc.clone()).or_default().push(update);
        Ok(())
    }

    async fn get_document(&self, doc: &NamespacedDocId) -> Result<Option<Document>, StorageError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(doc).map(|record| Document {
            id: doc.clone(),
            metadata: record.metadata.clone(),
            content: DocumentContent {
                update: record.all_content(),
                state_vector: record.state_vector(),
            },
        }))
    }

    async fn get_document_metadata(&self, doc: &NamespacedDocId) -> Result<Metadata, StorageError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(doc).map(|r| r.metadata.clone()).unwrap_or_default())
    }

    async fn write_document_metadata(&self, doc: &NamespacedDocId, metadata: Metadata) -> Result<(), StorageError> {
        let mut docs = self.docs.lock().await;
        docs.entry(doc.clone()).or_default().metadata = metadata;
        Ok(())
    }

    async fn delete_document(&self, doc: &NamespacedDocId) -> Result<(), StorageError> {
        let mut docs = self.docs.lock().await;
        docs.remove(doc);
        Ok(())
    }

    async fn transaction(&self, doc: &NamespacedDocId, mutate: MetadataMutation) -> Result<(), StorageError> {
        let mut docs = self.docs.lock().await;
        let record = docs.entry(doc.clone()).or_default();
        mutate(&mut record.metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(s: &str) -> NamespacedDocId {
        NamespacedDocId(s.to_string())
    }

    #[tokio::test]
    async fn sync_step1_on_empty_doc_returns_empty_content() {
        let storage = InMemoryStorage::new();
        let result = storage.handle_sync_step1(&doc("d1"), Bytes::new()).await.unwrap();
        assert!(result.content.update.is_empty());
    }

    #[tokio::test]
    async fn update_then_sync_step1_returns_it() {
        let storage = InMemoryStorage::new();
        storage.handle_update(&doc("d1"), Bytes::from_static(b"hello")).await.unwrap();
        let result = storage.handle_sync_step1(&doc("d1"), Bytes::new()).await.unwrap();
        assert_eq!(result.content.update, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn sync_step1_only_returns_updates_past_the_given_vector() {
        let storage = InMemoryStorage::new();
        storage.handle_update(&doc("d1"), Bytes::from_static(b"a")).await.unwrap();
        let sv = storage.handle_sync_step1(&doc("d1"), Bytes::new()).await.unwrap().content.state_vector;
        storage.handle_update(&doc("d1"), Bytes::from_static(b"b")).await.unwrap();
        let result = storage.handle_sync_step1(&doc("d1"), sv).await.unwrap();
        assert_eq!(result.content.update, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn delete_removes_the_document() {
        let storage = InMemoryStorage::new();
        storage.handle_update(&doc("d1"), Bytes::from_static(b"a")).await.unwrap();
        storage.delete_document(&doc("d1")).await.unwrap();
        assert!(storage.get_document(&doc("d1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_tracks_size() {
        let storage = InMemoryStorage::new();
        storage.handle_update(&doc("d1"), Bytes::from_static(b"12345")).await.unwrap();
        let meta = storage.get_document_metadata(&doc("d1")).await.unwrap();
        assert_eq!(meta.size_bytes, 5);
    }

    #[tokio::test]
    async fn transaction_mutates_metadata_in_place() {
        let storage = InMemoryStorage::new();
        storage
            .transaction(&doc("d1"), Box::new(|meta: &mut Metadata| meta.size_limit = Some(10)))
            .await
            .unwrap();
        let meta = storage.get_document_metadata(&doc("d1")).await.unwrap();
        assert_eq!(meta.size_limit, Some(10));
    }
}
