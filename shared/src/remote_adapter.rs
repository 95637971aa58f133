//! Listing CRUD against the remote table, with row/entity mapping and
//! upload-before-write image substitution.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use metrics::counter;
use tracing::{instrument, warn};

use crate::assets::AssetResolver;
use crate::capabilities::remote::{HostRow, ListingRow, RemoteError, RemoteTable};
use crate::model::{Host, Listing, ListingDraft, ListingId, ListingPatch};
use crate::{UnixTimeMs, DATES_FORMAT};

pub struct RemoteListingAdapter {
    table: Arc<dyn RemoteTable>,
    assets: AssetResolver,
    last_error: Mutex<Option<RemoteError>>,
}

impl RemoteListingAdapter {
    pub fn new(table: Arc<dyn RemoteTable>, assets: AssetResolver) -> Self {
        Self {
            table,
            assets,
            last_error: Mutex::new(None),
        }
    }

    /// Error swallowed by the most recent read, kept for observability.
    #[must_use]
    pub fn last_error(&self) -> Option<RemoteError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every listing, newest first. Failures yield an empty sequence.
    pub async fn fetch_all(&self) -> Vec<Listing> {
        self.try_fetch_all().await.unwrap_or_default()
    }

    /// Like [`Self::fetch_all`] but hands the failure to the caller, so it
    /// does not depend on `last_error` surviving concurrent reads.
    #[instrument(skip(self))]
    pub async fn try_fetch_all(&self) -> Result<Vec<Listing>, RemoteError> {
        match self.table.select_all().await {
            Ok(rows) => {
                self.set_last_error(None);
                Ok(rows.into_iter().filter_map(row_to_listing).collect())
            }
            Err(e) => {
                counter!("remote.fetch.failed").increment(1);
                warn!(error = %e, "fetching listings failed");
                self.set_last_error(Some(e.clone()));
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn fetch_by_id(&self, id: &ListingId) -> Option<Listing> {
        match self.try_fetch_by_id(id).await {
            Ok(listing) => {
                self.set_last_error(None);
                listing
            }
            Err(e) => {
                warn!(error = %e, "fetching listing failed");
                self.set_last_error(Some(e));
                None
            }
        }
    }

    /// Like [`Self::fetch_by_id`] but reports failures, for write paths
    /// that must tell "missing" apart from "unreachable".
    pub async fn try_fetch_by_id(&self, id: &ListingId) -> Result<Option<Listing>, RemoteError> {
        Ok(self
            .table
            .select_by_id(id.as_str())
            .await?
            .and_then(row_to_listing))
    }

    /// Uploads pending images, then inserts the row referring to them.
    #[instrument(skip(self, draft), fields(id = %id))]
    pub async fn create(&self, id: ListingId, draft: &ListingDraft) -> Result<Listing, RemoteError> {
        let resolved = self.assets.resolve_all(&id, &draft.image, &draft.images).await;
        let listing = Listing::from_draft(id, draft, resolved.image, resolved.images, UnixTimeMs::now());

        let row = self.table.insert(listing_to_row(&listing)).await?;
        row_to_listing(row).ok_or_else(|| RemoteError::Decode("inserted row has an invalid id".into()))
    }

    /// Applies `patch` on top of `base`, uploading any pending images first,
    /// and stamps `updated_at`.
    #[instrument(skip(self, base, patch), fields(id = %base.id))]
    pub async fn update(&self, base: &Listing, patch: &ListingPatch) -> Result<Listing, RemoteError> {
        let next = resolve_patch(&self.assets, base, patch).await;

        let mut row = listing_to_row(&next);
        row.updated_at = Some(Utc::now());
        let row = self.table.update(base.id.as_str(), row).await?;
        row_to_listing(row).ok_or_else(|| RemoteError::Decode("updated row has an invalid id".into()))
    }

    /// Hard delete by id.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &ListingId) -> Result<(), RemoteError> {
        self.table.delete(id.as_str()).await
    }

    fn set_last_error(&self, error: Option<RemoteError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

/// Resolves the image fields a patch carries and applies it to `base`.
pub(crate) async fn resolve_patch(
    assets: &AssetResolver,
    base: &Listing,
    patch: &ListingPatch,
) -> Listing {
    let (image, images) = match (&patch.image, &patch.images) {
        (None, None) => (None, None),
        (Some(image), None) => {
            let resolved = assets.resolve_all(&base.id, image, &[]).await;
            (Some(resolved.image.unwrap_or_default()), None)
        }
        (image, Some(images)) => {
            let primary = image.clone().unwrap_or_default();
            let resolved = assets.resolve_all(&base.id, &primary, images).await;
            (resolved.image, Some(resolved.images))
        }
    };
    patch.apply(base, image, images)
}

/// Maps a row to an entity. Null text columns become empty strings, a
/// missing `dates` falls back to the row's creation day.
#[must_use]
pub fn row_to_listing(row: ListingRow) -> Option<Listing> {
    let id = match ListingId::new(row.id.as_str()) {
        Ok(id) => id,
        Err(e) => {
            warn!(row_id = %row.id, error = %e, "skipping row with invalid id");
            return None;
        }
    };
    let dates = row.dates.filter(|d| !d.trim().is_empty()).unwrap_or_else(|| {
        row.created_at
            .unwrap_or_else(Utc::now)
            .format(DATES_FORMAT)
            .to_string()
    });

    Some(
        Listing {
            id,
            title: row.title,
            description: row.description.unwrap_or_default(),
            location: row.location.unwrap_or_default(),
            neighborhood: row.neighborhood.unwrap_or_default(),
            map_location: row.map_location.unwrap_or_default(),
            price: row.price,
            rating: row.rating.unwrap_or(0.0),
            dates,
            image: row.main_image_url.unwrap_or_default(),
            images: row.images.unwrap_or_default(),
            host: row
                .host
                .map(|h| Host {
                    name: h.name,
                    image: h.image,
                })
                .unwrap_or_default(),
        }
        .normalized(),
    )
}

#[must_use]
pub fn listing_to_row(listing: &Listing) -> ListingRow {
    ListingRow {
        id: listing.id.to_string(),
        title: listing.title.clone(),
        description: Some(listing.description.clone()),
        price: listing.price,
        location: Some(listing.location.clone()),
        neighborhood: Some(listing.neighborhood.clone()),
        map_location: Some(listing.map_location.clone()),
        rating: Some(listing.rating),
        dates: Some(listing.dates.clone()),
        main_image_url: Some(listing.image.clone()),
        images: Some(listing.images.clone()),
        host: Some(HostRow {
            name: listing.host.name.clone(),
            image: listing.host.image.clone(),
        }),
        created_at: None,
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::remote::{ImageUploader, InMemoryTable, InMemoryUploader};
    use crate::model::{ImageRef, ListingForm};
    use crate::preview::PreviewRegistry;
    use crate::PLACEHOLDER_IMAGE_URL;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use serde_json::json;

    struct DownTable;

    #[async_trait]
    impl RemoteTable for DownTable {
        async fn select_all(&self) -> Result<Vec<ListingRow>, RemoteError> {
            Err(RemoteError::Network("connection refused".into()))
        }
        async fn select_by_id(&self, _id: &str) -> Result<Option<ListingRow>, RemoteError> {
            Err(RemoteError::Network("connection refused".into()))
        }
        async fn insert(&self, _row: ListingRow) -> Result<ListingRow, RemoteError> {
            Err(RemoteError::Status {
                status: 500,
                message: "boom".into(),
            })
        }
        async fn update(&self, id: &str, _row: ListingRow) -> Result<ListingRow, RemoteError> {
            Err(RemoteError::NotFound(id.into()))
        }
        async fn delete(&self, id: &str) -> Result<(), RemoteError> {
            Err(RemoteError::NotFound(id.into()))
        }
    }

    struct NoUploads;

    #[async_trait]
    impl ImageUploader for NoUploads {
        async fn upload(&self, path: &str, _mime: &str, _bytes: Bytes) -> Result<String, RemoteError> {
            Err(RemoteError::Upload {
                path: path.into(),
                reason: "bucket missing".into(),
            })
        }
    }

    fn adapter(table: Arc<dyn RemoteTable>, uploader: Arc<dyn ImageUploader>) -> RemoteListingAdapter {
        RemoteListingAdapter::new(table, AssetResolver::new(uploader, Arc::new(PreviewRegistry::new())))
    }

    fn draft(images: &[&str]) -> ListingDraft {
        ListingDraft::try_from(ListingForm {
            title: Some("Sea view".into()),
            price: Some(json!(99)),
            images: Some(images.iter().map(|s| (*s).to_string()).collect()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn null_columns_map_to_defaults() {
        let row = ListingRow {
            id: "r1".into(),
            title: "Row".into(),
            description: None,
            price: 12.0,
            location: None,
            neighborhood: None,
            map_location: None,
            rating: None,
            dates: None,
            main_image_url: None,
            images: None,
            host: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).single(),
            updated_at: None,
        };
        let listing = row_to_listing(row).unwrap();
        assert_eq!(listing.description, "");
        assert_eq!(listing.map_location, "");
        assert_eq!(listing.dates, "2024-03-09");
        assert!(listing.images.is_empty());
        assert_eq!(listing.image, PLACEHOLDER_IMAGE_URL);
        assert_eq!(listing.host, Host::default());
    }

    #[test]
    fn row_with_bad_id_is_skipped() {
        let mut row = listing_to_row(&crate::local_store::seed_listings()[0]);
        row.id = "has space".into();
        assert!(row_to_listing(row).is_none());
    }

    #[tokio::test]
    async fn create_substitutes_inline_images() {
        let table = Arc::new(InMemoryTable::new());
        let adapter = adapter(table.clone(), Arc::new(InMemoryUploader::new("https://cdn.test")));

        let created = adapter
            .create(ListingId::new("n1").unwrap(), &draft(&["data:image/png;base64,AQID"]))
            .await
            .unwrap();

        assert!(created.images[0].starts_with("https://cdn.test/n1/"));
        assert_eq!(created.image, created.images[0]);
        assert!(!created.image.starts_with("data:image/"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn create_survives_failed_uploads() {
        let adapter = adapter(Arc::new(InMemoryTable::new()), Arc::new(NoUploads));
        let created = adapter
            .create(
                ListingId::new("n1").unwrap(),
                &draft(&["data:image/png;base64,AQID", "https://cdn/kept.jpg"]),
            )
            .await
            .unwrap();
        assert_eq!(created.images, vec!["https://cdn/kept.jpg".to_string()]);
        assert_eq!(created.image, "https://cdn/kept.jpg");
    }

    #[tokio::test]
    async fn update_keeps_images_when_patch_omits_them() {
        let table = Arc::new(InMemoryTable::new());
        let adapter = adapter(table, Arc::new(InMemoryUploader::default()));
        let created = adapter
            .create(
                ListingId::new("n1").unwrap(),
                &draft(&["https://cdn/a.jpg", "https://cdn/b.jpg"]),
            )
            .await
            .unwrap();

        let patch = ListingPatch {
            price: Some(150.0),
            ..Default::default()
        };
        let updated = adapter.update(&created, &patch).await.unwrap();
        assert_eq!(updated.images, created.images);
        assert!((updated.price - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn update_with_explicit_primary_only() {
        let adapter = adapter(Arc::new(InMemoryTable::new()), Arc::new(InMemoryUploader::default()));
        let created = adapter
            .create(ListingId::new("n1").unwrap(), &draft(&["https://cdn/a.jpg"]))
            .await
            .unwrap();

        let patch = ListingPatch {
            image: Some(ImageRef::Ready("https://cdn/cover.jpg".into())),
            ..Default::default()
        };
        let updated = adapter.update(&created, &patch).await.unwrap();
        assert_eq!(updated.image, "https://cdn/cover.jpg");
        assert_eq!(updated.images, vec!["https://cdn/a.jpg".to_string()]);
    }

    #[tokio::test]
    async fn try_fetch_all_reports_the_failure_it_hit() {
        let down = adapter(Arc::new(DownTable), Arc::new(InMemoryUploader::default()));
        let up = adapter(Arc::new(InMemoryTable::new()), Arc::new(InMemoryUploader::default()));

        assert!(matches!(down.try_fetch_all().await, Err(RemoteError::Network(_))));
        assert!(up.try_fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_absorb_errors_and_writes_surface_them() {
        let adapter = adapter(Arc::new(DownTable), Arc::new(InMemoryUploader::default()));

        assert!(adapter.fetch_all().await.is_empty());
        assert!(matches!(adapter.last_error(), Some(RemoteError::Network(_))));
        assert!(adapter.fetch_by_id(&ListingId::new("x").unwrap()).await.is_none());

        let err = adapter
            .create(ListingId::new("n1").unwrap(), &draft(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 500, .. }));
        assert!(adapter.remove(&ListingId::new("x").unwrap()).await.is_err());
    }
}
