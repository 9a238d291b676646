use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Document, DocumentId, DocumentStore, StoreError};

/// The projection returned to clients. Only the presence of both keys is
/// checked; their values are stored and echoed exactly as sent, so `8.6`,
/// `8`, `"8.6 ly"` and `null` all round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Star {
    pub name: Value,
    pub distance: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("missing field `{0}`")]
pub struct MissingField(pub &'static str);

#[derive(Debug, thiserror::Error)]
pub enum StarError {
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] axum::Error),
    #[error("request body is not valid JSON: {0}")]
    Body(#[from] serde_json::Error),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("invalid star: {0}")]
    Field(#[from] MissingField),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("star {0} was inserted but could not be read back")]
    ReadBackMissing(DocumentId),
    #[error("stored star {id} is malformed: {source}")]
    MalformedRecord {
        id: DocumentId,
        #[source]
        source: MissingField,
    },
}

impl Star {
    pub fn new(name: impl Into<Value>, distance: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            distance: distance.into(),
        }
    }

    /// Read the two required keys. Any other keys are ignored.
    pub fn from_document(document: &Document) -> Result<Self, MissingField> {
        let field = |key: &'static str| document.get(key).cloned().ok_or(MissingField(key));
        Ok(Self {
            name: field("name")?,
            distance: field("distance")?,
        })
    }

    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        document.insert("name".to_string(), self.name.clone());
        document.insert("distance".to_string(), self.distance.clone());
        document
    }

    /// Parse a raw `/star` request body.
    pub fn from_request_body(body: &[u8]) -> Result<Self, StarError> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Object(document) => Ok(Self::from_document(&document)?),
            _ => Err(StarError::NotAnObject),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedStar {
    pub id: DocumentId,
    pub star: Star,
}

/// Insert-then-read-back of stars against a [`DocumentStore`].
#[derive(Clone)]
pub struct StarService {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl StarService {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    /// Check the body, insert it and return the projection read back from the
    /// store. Both keys are checked before the store is touched.
    pub async fn create(&self, body: &[u8]) -> Result<CreatedStar, StarError> {
        let star = Star::from_request_body(body)?;
        let id = self
            .store
            .insert(&self.collection, star.to_document())
            .await?;
        tracing::debug!(%id, collection = self.collection.as_str(), "star inserted");

        match self.find(&id).await? {
            Some(star) => Ok(CreatedStar { id, star }),
            None => Err(StarError::ReadBackMissing(id)),
        }
    }

    pub async fn find(&self, id: &DocumentId) -> Result<Option<Star>, StarError> {
        let Some(document) = self.store.find_by_id(&self.collection, id).await? else {
            return Ok(None);
        };
        Star::from_document(&document)
            .map(Some)
            .map_err(|source| StarError::MalformedRecord {
                id: id.clone(),
                source,
            })
    }
}

/// What `/star` answers after a failed create.
///
/// `Degrade` keeps the historical behavior: the failure is logged and tagged
/// on the span, and the client still gets a `200` with an empty body.
/// `Surface` returns a `500` with a JSON message instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StarFailurePolicy {
    #[default]
    Degrade,
    Surface,
}

impl FromStr for StarFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "surface" => Ok(Self::Surface),
            other => Err(format!("unknown star failure policy {other:?}")),
        }
    }
}
