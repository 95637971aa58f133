//! Collaborator seams the persistence layer talks through.
//!
//! Each capability is a trait plus in-process implementations; shells inject
//! the backend they need (SQLite or memory for the key-value store,
//! PostgREST or memory for the remote tier).

pub mod http;
pub mod kv;
pub mod notify;
pub mod remote;

pub use self::http::{HttpError, ValidatedUrl};
pub use self::kv::{KeyValueStore, KvError, MemoryKv, StorageErrorCode, StoreKey};
pub use self::notify::{Notification, NotificationLevel, Notifier, QueuedNotifier, TracingNotifier};
pub use self::remote::{
    DataUrlUploader, HostRow, ImageUploader, InMemoryTable, InMemoryUploader, ListingRow,
    RemoteError, RemoteTable,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;

#[cfg(feature = "rest")]
pub use self::http::{PostgrestTable, StorageBucket};

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Storage error: {0}")]
    Kv(#[from] KvError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<CapabilityError> for crate::AppError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Http(e) => RemoteError::from(e).into(),
            CapabilityError::Kv(e) => e.into(),
            CapabilityError::Remote(e) => e.into(),
        }
    }
}
