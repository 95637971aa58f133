use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::model::ListingId;
use crate::{AppError, ErrorKind, UnixTimeMs};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

const LISTINGS_KEY: &str = "listings";
const LISTINGS_LAST_BACKUP_KEY: &str = "listings_last_backup";
pub const LISTING_IMAGES_PREFIX: &str = "listing_images_";
/// Separates a listing id from the backup timestamp; ids may not contain it.
pub(crate) const BACKUP_INFIX: &str = "_backup_";
const LISTING_BACKUP_PREFIX: &str = "listing_backup_";
const DELETED_LISTING_PREFIX: &str = "deleted_listing_";

/// Every key the local tier writes, and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Listings,
    ListingsLastBackup,
    ListingImages(ListingId),
    ListingImagesBackup(ListingId, UnixTimeMs),
    ListingBackup(ListingId),
    DeletedListing(ListingId),
}

impl StoreKey {
    #[must_use]
    pub fn raw(&self) -> String {
        match self {
            Self::Listings => LISTINGS_KEY.to_string(),
            Self::ListingsLastBackup => LISTINGS_LAST_BACKUP_KEY.to_string(),
            Self::ListingImages(id) => format!("{LISTING_IMAGES_PREFIX}{id}"),
            Self::ListingImagesBackup(id, ts) => {
                format!("{LISTING_IMAGES_PREFIX}{id}{BACKUP_INFIX}{}", ts.as_millis())
            }
            Self::ListingBackup(id) => format!("{LISTING_BACKUP_PREFIX}{id}"),
            Self::DeletedListing(id) => format!("{DELETED_LISTING_PREFIX}{id}"),
        }
    }

    /// Prefix shared by every image-set backup of one listing.
    #[must_use]
    pub fn image_backups_prefix(id: &ListingId) -> String {
        format!("{LISTING_IMAGES_PREFIX}{id}{BACKUP_INFIX}")
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            LISTINGS_KEY => return Some(Self::Listings),
            LISTINGS_LAST_BACKUP_KEY => return Some(Self::ListingsLastBackup),
            _ => {}
        }

        if let Some(rest) = raw.strip_prefix(LISTING_IMAGES_PREFIX) {
            if let Some((id, ts)) = rest.rsplit_once(BACKUP_INFIX) {
                if let (Ok(id), Ok(ts)) = (ListingId::new(id), ts.parse::<u64>()) {
                    return Some(Self::ListingImagesBackup(id, UnixTimeMs(ts)));
                }
            }
            return ListingId::new(rest).ok().map(Self::ListingImages);
        }
        if let Some(rest) = raw.strip_prefix(LISTING_BACKUP_PREFIX) {
            return ListingId::new(rest).ok().map(Self::ListingBackup);
        }
        if let Some(rest) = raw.strip_prefix(DELETED_LISTING_PREFIX) {
            return ListingId::new(rest).ok().map(Self::DeletedListing);
        }
        None
    }
}

pub fn validate_key(key: &str) -> Result<(), KvError> {
    if key.trim().is_empty() {
        return Err(KvError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(KvError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
        });
    }

    if key.chars().any(char::is_control) {
        return Err(KvError::InvalidKey {
            key: key.escape_debug().to_string(),
            reason: "key contains control characters".to_string(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("quota exceeded: {used}/{limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },
}

impl KvError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::InvalidKey { .. } => ErrorKind::Internal,
            KvError::ValueTooLarge { .. } | KvError::QuotaExceeded { .. } => {
                ErrorKind::QuotaExceeded
            }
            KvError::Storage { .. } => ErrorKind::Storage,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Synchronous string key-value store with `localStorage` semantics:
/// whole-value overwrites, last writer wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool, KvError>;

    /// Keys starting with `prefix`, in lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

fn check_value(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// In-process store. An optional byte quota (keys plus values) reproduces
/// browser storage quota failures.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: RwLock::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        validate_key(key)?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        validate_key(key)?;
        check_value(value)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(limit) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > limit {
                return Err(KvError::QuotaExceeded {
                    used: needed as u64,
                    limit: limit as u64,
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, KvError> {
        validate_key(key)?;
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

    use super::{check_value, validate_key, KeyValueStore, KvError, StorageErrorCode};
    use crate::get_current_time_ms;

    /// Single-table SQLite backend for native shells.
    pub struct SqliteKv {
        conn: Mutex<Connection>,
    }

    impl SqliteKv {
        pub fn open(path: &Path) -> Result<Self, KvError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KvError::storage(StorageErrorCode::IoError, e.to_string()))?;
            }
            let conn = Connection::open(path).map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(map_sqlite_error)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
            self.conn.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl KeyValueStore for SqliteKv {
        fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            validate_key(key)?;
            self.conn()
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(map_sqlite_error)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
            validate_key(key)?;
            check_value(value)?;
            let now = i64::try_from(get_current_time_ms()).unwrap_or(i64::MAX);
            self.conn()
                .execute(
                    r"
                    INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    ",
                    params![key, value, now],
                )
                .map_err(map_sqlite_error)?;
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<bool, KvError> {
            validate_key(key)?;
            let affected = self
                .conn()
                .execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(map_sqlite_error)?;
            Ok(affected > 0)
        }

        fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )
                .map_err(map_sqlite_error)?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sqlite_error)?;
            Ok(keys)
        }
    }

    fn map_sqlite_error(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}
