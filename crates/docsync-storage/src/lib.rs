//! The storage contract a [`Session`](../docsync_core) runs its sync handshake against, plus a
//! reference in-memory implementation.
//!
//! One record per document, kept behind a single owning map, with a running size metric
//! updated on every mutation. A CRDT has no single writer, so there is no "owner" field to
//! track the way a single-writer text model would need.

mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;
use docsync_proto::NamespacedDocId;

/// Size accounting for a document, read after every mutation to drive the size-warning and
/// size-limit events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub size_bytes: u64,
    pub size_warning_threshold: Option<u64>,
    pub size_limit: Option<u64>,
}

/// The diff/content payload handed back by the sync handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentContent {
    pub update: Bytes,
    pub state_vector: Bytes,
}

/// A document as the storage backend sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub id: NamespacedDocId,
    pub metadata: Metadata,
    pub content: DocumentContent,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("document {0} not found")]
    NotFound(NamespacedDocId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A mutation applied to a document's metadata inside [`DocumentStorage::transaction`].
pub type MetadataMutation = Box<dyn FnOnce(&mut Metadata) + Send>;

/// The pluggable CRDT store a [`Session`](../docsync_core) drives. The CRDT merge algorithm
/// itself lives entirely behind this trait; the core never inspects document bytes.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Produces the diff the caller is missing, given the state vector it announced, and this
    /// side's own state vector.
    async fn handle_sync_step1(
        &self,
        doc: &NamespacedDocId,
        state_vector: Bytes,
    ) -> Result<Document, StorageError>;

    /// Ingests a diff received from the other side of a sync handshake.
    async fn handle_sync_step2(&self, doc: &NamespacedDocId, update: Bytes) -> Result<(), StorageError>;

    /// Ingests an incremental update produced by a client's local replica.
    async fn handle_update(&self, doc: &NamespacedDocId, update: Bytes) -> Result<(), StorageError>;

    async fn get_document(&self, doc: &NamespacedDocId) -> Result<Option<Document>, StorageError>;

    async fn get_document_metadata(&self, doc: &NamespacedDocId) -> Result<Metadata, StorageError>;

    async fn write_document_metadata(&self, doc: &NamespacedDocId, metadata: Metadata) -> Result<(), StorageError>;

    async fn delete_document(&self, doc: &NamespacedDocId) -> Result<(), StorageError>;

    /// Serializes a metadata read-modify-write against concurrent callers for the same
    /// document.
    async fn transaction(&self, doc: &NamespacedDocId, mutate: MetadataMutation) -> Result<(), StorageError>;
}

/// Extension for backends that transform or suppress payloads under end-to-end encryption.
/// When present, [`Session::apply`](../docsync_core) broadcasts whatever this trait returns
/// instead of the client's raw payload.
#[async_trait]
pub trait EncryptedDocumentStorage: DocumentStorage {
    /// Returns the payload to broadcast, or `None` to suppress broadcasting entirely (e.g. the
    /// update was a no-op once merged).
    async fn handle_encrypted_update(
        &self,
        doc: &NamespacedDocId,
        update: Bytes,
    ) -> Result<Option<Bytes>, StorageError>;

    /// Returns zero or more payloads to broadcast as separate `doc/update` messages.
    async fn handle_encrypted_sync_step2(
        &self,
        doc: &NamespacedDocId,
        update: Bytes,
    ) -> Result<Vec<Bytes>, StorageError>;
}
