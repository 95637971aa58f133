//! Upload-before-write: turns pending image references into durable URLs
//! before any row or snapshot that refers to them is written.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::{instrument, warn};

use crate::capabilities::remote::{ImageUploader, RemoteError};
use crate::model::{ImageRef, ListingId, PendingImage};
use crate::preview::PreviewRegistry;

const HASH_PREFIX_LEN: usize = 16;

/// Durable image fields for one listing after substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedImages {
    /// `None` when no explicit primary image survived.
    pub image: Option<String>,
    pub images: Vec<String>,
    /// Pending references that could not be made durable.
    pub dropped: usize,
}

pub struct AssetResolver {
    uploader: Arc<dyn ImageUploader>,
    previews: Arc<PreviewRegistry>,
}

impl AssetResolver {
    pub fn new(uploader: Arc<dyn ImageUploader>, previews: Arc<PreviewRegistry>) -> Self {
        Self { uploader, previews }
    }

    /// Resolves the primary image and the secondary images. A reference that
    /// fails to upload is dropped; it never aborts the rest.
    #[instrument(skip_all, fields(id = %id, count = images.len()))]
    pub async fn resolve_all(
        &self,
        id: &ListingId,
        image: &ImageRef,
        images: &[ImageRef],
    ) -> ResolvedImages {
        let mut uploaded = HashMap::new();
        let mut out = ResolvedImages::default();

        match self.resolve_one(id, image, &mut uploaded).await {
            Ok(url) => out.image = url,
            Err(e) => {
                out.dropped += 1;
                warn!(error = %e, "primary image dropped");
            }
        }

        for (index, r) in images.iter().enumerate() {
            match self.resolve_one(id, r, &mut uploaded).await {
                Ok(Some(url)) => out.images.push(url),
                Ok(None) => {}
                Err(e) => {
                    out.dropped += 1;
                    warn!(index, error = %e, "image dropped");
                }
            }
        }

        out
    }

    /// Resolves a set of secondary images only.
    pub async fn resolve_images(&self, id: &ListingId, images: &[ImageRef]) -> ResolvedImages {
        self.resolve_all(id, &ImageRef::None, images).await
    }

    async fn resolve_one(
        &self,
        id: &ListingId,
        image: &ImageRef,
        uploaded: &mut HashMap<String, String>,
    ) -> Result<Option<String>, RemoteError> {
        let pending = match image {
            ImageRef::None => return Ok(None),
            ImageRef::Ready(url) => return Ok(Some(url.clone())),
            ImageRef::Pending(pending) => pending,
        };

        let (mime, bytes) = match pending {
            PendingImage::Preview(url) => {
                let file = self.previews.resolve(url).ok_or_else(|| RemoteError::Upload {
                    path: url.to_string(),
                    reason: "preview was revoked before upload".into(),
                })?;
                (file.mime.clone(), file.bytes.clone())
            }
            PendingImage::Inline { mime, bytes } => (mime.clone(), bytes.clone()),
        };

        let path = object_path(id, &mime, &bytes);
        if let Some(url) = uploaded.get(&path) {
            return Ok(Some(url.clone()));
        }

        match self.uploader.upload(&path, &mime, bytes).await {
            Ok(url) => {
                counter!("assets.upload", "outcome" => "ok").increment(1);
                uploaded.insert(path, url.clone());
                Ok(Some(url))
            }
            Err(e) => {
                counter!("assets.upload", "outcome" => "failed").increment(1);
                Err(e)
            }
        }
    }
}

/// Content-addressed object name, so retrying the same bytes lands on the
/// same object.
#[must_use]
pub fn object_path(id: &ListingId, mime: &str, bytes: &Bytes) -> String {
    let hex = blake3::hash(bytes).to_hex();
    format!(
        "{id}/{}.{}",
        &hex.as_str()[..HASH_PREFIX_LEN],
        extension_for(mime)
    )
}

fn extension_for(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}
