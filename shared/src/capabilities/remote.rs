use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::{AppError, ErrorKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("row already exists: {0}")]
    Conflict(String),

    #[error("malformed remote payload: {0}")]
    Decode(String),

    #[error("upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("remote tier misconfigured: {0}")]
    Config(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        let kind = match &e {
            RemoteError::Network(_) => ErrorKind::Network,
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::Status { .. } => ErrorKind::Remote,
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::Conflict(_) => ErrorKind::Conflict,
            RemoteError::Decode(_) => ErrorKind::Deserialization,
            RemoteError::Upload { .. } => ErrorKind::Upload,
            RemoteError::Config(_) => ErrorKind::Internal,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRow {
    pub name: String,
    pub image: String,
}

/// Wire shape of one row in the remote listings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub map_location: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub dates: Option<String>,
    #[serde(default)]
    pub main_image_url: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub host: Option<HostRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Opaque CRUD endpoint over the listings table.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// All rows, newest `created_at` first.
    async fn select_all(&self) -> Result<Vec<ListingRow>, RemoteError>;

    async fn select_by_id(&self, id: &str) -> Result<Option<ListingRow>, RemoteError>;

    async fn insert(&self, row: ListingRow) -> Result<ListingRow, RemoteError>;

    async fn update(&self, id: &str, row: ListingRow) -> Result<ListingRow, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}

/// File-upload endpoint returning a durable URL for the stored object.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, path: &str, mime: &str, bytes: Bytes) -> Result<String, RemoteError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTable {
    rows: RwLock<Vec<ListingRow>>,
}

impl InMemoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteTable for InMemoryTable {
    async fn select_all(&self) -> Result<Vec<ListingRow>, RemoteError> {
        let mut rows = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn select_by_id(&self, id: &str) -> Result<Option<ListingRow>, RemoteError> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn insert(&self, mut row: ListingRow) -> Result<ListingRow, RemoteError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows.iter().any(|r| r.id == row.id) {
            return Err(RemoteError::Conflict(row.id));
        }
        let now = Utc::now();
        row.created_at.get_or_insert(now);
        row.updated_at.get_or_insert(now);
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, id: &str, mut row: ListingRow) -> Result<ListingRow, RemoteError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let existing = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        row.id = id.to_string();
        row.created_at = existing.created_at;
        row.updated_at.get_or_insert_with(Utc::now);
        *existing = row.clone();
        Ok(row)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|r| r.id != id);
        if rows.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Object store kept in memory, serving objects under `base_url`.
#[derive(Debug)]
pub struct InMemoryUploader {
    base_url: String,
    objects: RwLock<HashMap<String, (String, Bytes)>>,
}

impl InMemoryUploader {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::default(),
        }
    }

    #[must_use]
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|(_, bytes)| bytes.clone())
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for InMemoryUploader {
    fn default() -> Self {
        Self::new("https://storage.invalid/listing-images")
    }
}

#[async_trait]
impl ImageUploader for InMemoryUploader {
    async fn upload(&self, path: &str, mime: &str, bytes: Bytes) -> Result<String, RemoteError> {
        if bytes.is_empty() {
            return Err(RemoteError::Upload {
                path: path.to_string(),
                reason: "empty payload".into(),
            });
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), (mime.to_string(), bytes));
        Ok(format!("{}/{path}", self.base_url))
    }
}

/// Makes images durable without any server by inlining them as `data:` URLs.
/// Used when the local store is the only tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataUrlUploader;

#[async_trait]
impl ImageUploader for DataUrlUploader {
    async fn upload(&self, path: &str, mime: &str, bytes: Bytes) -> Result<String, RemoteError> {
        if bytes.is_empty() {
            return Err(RemoteError::Upload {
                path: path.to_string(),
                reason: "empty payload".into(),
            });
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{mime};base64,{encoded}"))
    }
}
