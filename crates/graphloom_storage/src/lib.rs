//! Object-store gateway.
//!
//! Raw artifacts and extracted text live in one `documents` bucket
//! namespace under stable keys:
//!
//! - `raw_documents/{document_id}.{ext}`
//! - `extracted_text/{document_id}.txt`
//!
//! All writes are upserts so retried phases are idempotent. The
//! backend is the `object_store` crate: a local filesystem directory
//! in production deployments, in-memory for tests.

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const BUCKET: &str = "documents";
pub const RAW_PREFIX: &str = "raw_documents";
pub const TEXT_PREFIX: &str = "extracted_text";

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("stored text is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable key for a document's raw artifact.
pub fn raw_document_key(document_id: &str, extension: &str) -> String {
    let ext = extension.trim_start_matches('.');
    format!("{RAW_PREFIX}/{document_id}.{ext}")
}

/// Stable key for a document's extracted text.
pub fn extracted_text_key(document_id: &str) -> String {
    format!("{TEXT_PREFIX}/{document_id}.txt")
}

#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<dyn ObjectStore>,
}

impl StorageGateway {
    /// Gateway over a local directory root.
    pub fn local(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Gateway over an in-memory store (tests, experiments).
    pub fn memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    fn object_path(location: &str) -> ObjectPath {
        ObjectPath::from(format!("{BUCKET}/{location}"))
    }

    /// Upsert raw bytes at a location key. Returns the key unchanged
    /// so call sites read like the store they are writing to.
    pub async fn put(&self, location: &str, data: Bytes) -> Result<String> {
        self.store
            .put(&Self::object_path(location), PutPayload::from(data))
            .await?;
        debug!(location, "stored object");
        Ok(location.to_string())
    }

    pub async fn get(&self, location: &str) -> Result<Bytes> {
        let result = self.store.get(&Self::object_path(location)).await;
        match result {
            Ok(object) => Ok(object.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(StorageError::NotFound(location.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, location: &str) -> Result<()> {
        match self.store.delete(&Self::object_path(location)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Store extracted text for a document, upserting on retries.
    pub async fn store_extracted_text(&self, document_id: &str, text: &str) -> Result<String> {
        let key = extracted_text_key(document_id);
        self.put(&key, Bytes::from(text.as_bytes().to_vec())).await
    }

    pub async fn load_extracted_text(&self, location: &str) -> Result<String> {
        let bytes = self.get(location).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Encoding(e.to_string()))
    }

    /// Store a raw document artifact, upserting on retries.
    pub async fn store_raw_document(
        &self,
        document_id: &str,
        data: Bytes,
        extension: &str,
    ) -> Result<String> {
        let key = raw_document_key(document_id, extension);
        self.put(&key, data).await
    }

    pub async fn load_raw_document(&self, location: &str) -> Result<Bytes> {
        self.get(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_conventions() {
        assert_eq!(raw_document_key("doc-1", ".mp4"), "raw_documents/doc-1.mp4");
        assert_eq!(raw_document_key("doc-1", "pdf"), "raw_documents/doc-1.pdf");
        assert_eq!(extracted_text_key("doc-1"), "extracted_text/doc-1.txt");
    }

    #[tokio::test]
    async fn text_round_trips_and_upserts() {
        let gateway = StorageGateway::memory();

        let key = gateway.store_extracted_text("doc-1", "first pass").await.unwrap();
        assert_eq!(key, "extracted_text/doc-1.txt");

        // Retried extraction overwrites in place.
        gateway.store_extracted_text("doc-1", "second pass").await.unwrap();
        let text = gateway.load_extracted_text(&key).await.unwrap();
        assert_eq!(text, "second pass");
    }

    #[tokio::test]
    async fn missing_objects_surface_as_not_found() {
        let gateway = StorageGateway::memory();
        let err = gateway.load_extracted_text("extracted_text/nope.txt").await;
        assert!(matches!(err, Err(StorageError::NotFound(_))));
        // Deleting something missing is fine.
        gateway.delete("raw_documents/nope.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn local_backend_persists_under_the_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = StorageGateway::local(dir.path()).unwrap();

        gateway
            .store_raw_document("doc-1", Bytes::from_static(b"%PDF-"), "pdf")
            .await
            .unwrap();
        assert!(dir
            .path()
            .join("documents/raw_documents/doc-1.pdf")
            .exists());

        let bytes = gateway
            .load_raw_document("raw_documents/doc-1.pdf")
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"%PDF-");
    }
}
