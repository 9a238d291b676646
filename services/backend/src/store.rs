use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A stored JSON object.
pub type Document = Map<String, Value>;

/// Field holding the store-assigned identity of a document.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The two operations the services need from a document store.
///
/// Implementations synchronize internally; callers share one instance across
/// request tasks without extra locking.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store `document` in `collection` and return the identity assigned to it.
    async fn insert(&self, collection: &str, document: Document)
        -> Result<DocumentId, StoreError>;

    async fn find_by_id(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Document>, StoreError>;
}

fn with_id(mut document: Document, id: &DocumentId) -> Document {
    document.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    document
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: tokio::sync::Mutex<HashMap<String, HashMap<DocumentId, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<DocumentId, StoreError> {
        let id = DocumentId::generate();
        self.collections
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), with_id(document, &id));
        Ok(id)
    }

    async fn find_by_id(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .lock()
            .await
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }
}

/// One JSON file per document under `<root>/<collection>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        Ok(self.root.join(collection))
    }

    fn document_path(&self, collection: &str, id: &DocumentId) -> Result<PathBuf, StoreError> {
        Ok(self
            .collection_dir(collection)?
            .join(format!("{}.json", id.as_str())))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn insert(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<DocumentId, StoreError> {
        let dir = self.collection_dir(collection)?;
        fs::create_dir_all(&dir).await?;

        let id = DocumentId::generate();
        let json = serde_json::to_vec_pretty(&with_id(document, &id))?;
        let mut file = fs::File::create(self.document_path(collection, &id)?).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        Ok(id)
    }

    async fn find_by_id(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Document>, StoreError> {
        match fs::read(self.document_path(collection, id)?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn sample() -> Document {
        match json!({ "name": "Vega", "distance": 25 }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn memory_store_assigns_ids_and_reads_back() {
        let store = MemoryDocumentStore::new();
        let id = store.insert("stars", sample()).await.unwrap();

        let found = store.find_by_id("stars", &id).await.unwrap().expect("document");
        assert_eq!(found["name"], json!("Vega"));
        assert_eq!(found[ID_FIELD], json!(id.to_string()));
        assert_eq!(store.count("stars").await, 1);

        assert!(store.find_by_id("planets", &id).await.unwrap().is_none());
        assert!(store
            .find_by_id("stars", &DocumentId::generate())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_persists_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        let id = store.insert("stars", sample()).await.unwrap();

        let reopened = FileDocumentStore::new(dir.path());
        let found = reopened
            .find_by_id("stars", &id)
            .await
            .unwrap()
            .expect("document");
        assert_eq!(found["distance"], json!(25));
        assert!(dir
            .path()
            .join("stars")
            .join(format!("{}.json", id))
            .exists());
    }

    #[tokio::test]
    async fn file_store_rejects_bad_collection_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        let err = store.insert("../escape", sample()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCollection(_)));
    }

    #[tokio::test]
    async fn file_store_missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        assert!(store
            .find_by_id("stars", &DocumentId::generate())
            .await
            .unwrap()
            .is_none());
    }
}
