//! Transient, same-session preview references for processed images.
//!
//! Every preview handed out by [`PreviewRegistry::register`] keeps its bytes
//! alive until it is revoked. Revocation is idempotent: revoking an unknown
//! or already revoked preview is a no-op that returns `false`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::image_processing::ImageFile;

const PREVIEW_SCHEME: &str = "blob:listing-preview/";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreviewUrl(String);

impl PreviewUrl {
    fn generate() -> Self {
        Self(format!("{PREVIEW_SCHEME}{}", Uuid::new_v4()))
    }

    /// Wraps a raw `blob:` string received back from the UI.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
pub struct PreviewRegistry {
    entries: Mutex<HashMap<PreviewUrl, Arc<ImageFile>>>,
}

impl PreviewRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, file: ImageFile) -> PreviewUrl {
        let url = PreviewUrl::generate();
        let mut entries = self.lock();
        entries.insert(url.clone(), Arc::new(file));
        gauge!("preview.live").set(entries.len() as f64);
        url
    }

    /// Returns the bytes behind a live preview, `None` once revoked.
    #[must_use]
    pub fn resolve(&self, url: &PreviewUrl) -> Option<Arc<ImageFile>> {
        self.lock().get(url).cloned()
    }

    pub fn revoke(&self, url: &PreviewUrl) -> bool {
        let mut entries = self.lock();
        let released = entries.remove(url).is_some();
        gauge!("preview.live").set(entries.len() as f64);
        if released {
            debug!(preview = %url, "preview revoked");
        }
        released
    }

    pub fn revoke_all<'a>(&self, urls: impl IntoIterator<Item = &'a PreviewUrl>) -> usize {
        urls.into_iter().filter(|url| self.revoke(url)).count()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PreviewUrl, Arc<ImageFile>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of a group of previews held by one piece of UI state.
///
/// Dropping the set revokes everything it still owns.
pub struct PreviewSet {
    registry: Arc<PreviewRegistry>,
    urls: Vec<PreviewUrl>,
}

impl PreviewSet {
    #[must_use]
    pub fn new(registry: Arc<PreviewRegistry>) -> Self {
        Self {
            registry,
            urls: Vec::new(),
        }
    }

    pub fn extend(&mut self, urls: impl IntoIterator<Item = PreviewUrl>) {
        self.urls.extend(urls);
    }

    #[must_use]
    pub fn urls(&self) -> &[PreviewUrl] {
        &self.urls
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Removes a preview from the UI state and revokes it.
    pub fn remove(&mut self, url: &PreviewUrl) -> bool {
        let Some(pos) = self.urls.iter().position(|u| u == url) else {
            return false;
        };
        let url = self.urls.remove(pos);
        self.registry.revoke(&url)
    }

    /// Hands ownership of every preview to another owner (the mutation
    /// pipeline) without revoking anything.
    #[must_use]
    pub fn detach_all(&mut self) -> Vec<PreviewUrl> {
        std::mem::take(&mut self.urls)
    }

    pub fn clear(&mut self) -> usize {
        let urls = std::mem::take(&mut self.urls);
        self.registry.revoke_all(&urls)
    }
}

impl Drop for PreviewSet {
    fn drop(&mut self) {
        self.clear();
    }
}
