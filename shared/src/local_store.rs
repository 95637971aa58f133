//! Same-device persistence of the listing collection on top of a
//! [`KeyValueStore`].
//!
//! Reads never fail: a corrupt current snapshot degrades to the last backup,
//! and a corrupt backup degrades to the seed dataset. Writes report failures
//! so the mutation pipeline can decide what to do with an in-flight change.

use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capabilities::kv::{KeyValueStore, KvError, StoreKey, LISTING_IMAGES_PREFIX};
use crate::model::{Host, Listing, ListingId};
use crate::{AppError, ErrorKind, UnixTimeMs};

pub const DEFAULT_IMAGE_BACKUPS_KEPT: usize = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no image backup for listing {id} at {at}")]
    BackupNotFound { id: ListingId, at: u64 },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Kv(kv) => kv.into(),
            StoreError::Serialization(msg) => AppError::new(ErrorKind::Serialization, msg),
            e @ StoreError::BackupNotFound { .. } => {
                AppError::new(ErrorKind::NotFound, e.to_string())
            }
        }
    }
}

/// How many timestamped image-set backups survive per listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupRetention {
    KeepLatest(usize),
    Unbounded,
}

impl Default for BackupRetention {
    fn default() -> Self {
        Self::KeepLatest(DEFAULT_IMAGE_BACKUPS_KEPT)
    }
}

/// Where [`LocalListingStore::load_collection`] found its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Current,
    Backup,
    Seed,
}

impl SnapshotSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Backup => "backup",
            Self::Seed => "seed",
        }
    }
}

pub struct LocalListingStore {
    kv: Arc<dyn KeyValueStore>,
    retention: BackupRetention,
    seed: Vec<Listing>,
    last_backup_ts: Mutex<u64>,
}

impl LocalListingStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, retention: BackupRetention) -> Self {
        Self {
            kv,
            retention,
            seed: seed_listings(),
            last_backup_ts: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: Vec<Listing>) -> Self {
        self.seed = seed.into_iter().map(Listing::normalized).collect();
        self
    }

    #[must_use]
    pub fn retention(&self) -> BackupRetention {
        self.retention
    }

    pub fn load_collection(&self) -> Vec<Listing> {
        self.load_collection_with_source().0
    }

    #[instrument(skip(self))]
    pub fn load_collection_with_source(&self) -> (Vec<Listing>, SnapshotSource) {
        let (listings, source) = if let Some(current) =
            self.read_json::<Vec<Listing>>(&StoreKey::Listings)
        {
            (current, SnapshotSource::Current)
        } else if let Some(backup) = self.read_json::<Vec<Listing>>(&StoreKey::ListingsLastBackup)
        {
            warn!("current snapshot unusable, recovered from last backup");
            (backup, SnapshotSource::Backup)
        } else {
            debug!("no usable snapshot, using seed data");
            (self.seed.clone(), SnapshotSource::Seed)
        };

        if source != SnapshotSource::Current {
            counter!("local_store.load.fallback", "source" => source.as_str()).increment(1);
        }

        let listings = listings.into_iter().map(Listing::normalized).collect();
        (listings, source)
    }

    /// Writes a normalized snapshot. The previous current snapshot, when it
    /// is well-formed, becomes the last backup first.
    #[instrument(skip(self, listings), fields(count = listings.len()))]
    pub fn save_collection(&self, listings: &[Listing]) -> Result<(), StoreError> {
        let normalized: Vec<Listing> = listings.iter().cloned().map(Listing::normalized).collect();
        let payload = serde_json::to_string(&normalized)?;

        let current_key = StoreKey::Listings.raw();
        match self.kv.get(&current_key)? {
            Some(previous) if serde_json::from_str::<Vec<Listing>>(&previous).is_ok() => {
                self.kv.set(&StoreKey::ListingsLastBackup.raw(), &previous)?;
            }
            Some(_) => warn!("previous snapshot is corrupt, keeping existing backup"),
            None => {}
        }

        self.kv.set(&current_key, &payload).inspect_err(|e| {
            counter!("local_store.write.failed").increment(1);
            warn!(error = %e, "failed to write listings snapshot");
        })?;
        Ok(())
    }

    /// Stores the image set of one listing, snapshotting the previous set
    /// under a timestamped backup key and applying the retention policy.
    #[instrument(skip(self, images), fields(id = %id, count = images.len()))]
    pub fn save_listing_images(&self, id: &ListingId, images: &[String]) -> Result<(), StoreError> {
        let current_key = StoreKey::ListingImages(id.clone()).raw();

        if let Some(previous) = self.kv.get(&current_key)? {
            if serde_json::from_str::<Vec<String>>(&previous).is_ok() {
                let ts = self.next_backup_ts();
                self.kv
                    .set(&StoreKey::ListingImagesBackup(id.clone(), ts).raw(), &previous)?;
            }
        }

        self.kv.set(&current_key, &serde_json::to_string(images)?)?;
        self.prune_image_backups(id)?;
        Ok(())
    }

    /// Current image set, falling back to the newest valid backup, then to
    /// an empty set.
    pub fn load_listing_images(&self, id: &ListingId) -> Vec<String> {
        if let Some(images) = self.read_json(&StoreKey::ListingImages(id.clone())) {
            return images;
        }
        self.image_backup_times(id)
            .into_iter()
            .rev()
            .find_map(|ts| self.read_json(&StoreKey::ListingImagesBackup(id.clone(), ts)))
            .unwrap_or_default()
    }

    /// Backup timestamps for one listing, oldest first.
    pub fn image_backup_times(&self, id: &ListingId) -> Vec<UnixTimeMs> {
        let keys = match self.kv.keys_with_prefix(&StoreKey::image_backups_prefix(id)) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate image backups");
                return Vec::new();
            }
        };
        let mut times: Vec<UnixTimeMs> = keys
            .iter()
            .filter_map(|raw| match StoreKey::parse(raw) {
                Some(StoreKey::ListingImagesBackup(owner, ts)) if &owner == id => Some(ts),
                _ => None,
            })
            .collect();
        times.sort_unstable();
        times
    }

    pub fn restore_listing_images(
        &self,
        id: &ListingId,
        at: UnixTimeMs,
    ) -> Result<Vec<String>, StoreError> {
        let images: Vec<String> = self
            .read_json(&StoreKey::ListingImagesBackup(id.clone(), at))
            .ok_or_else(|| StoreError::BackupNotFound {
                id: id.clone(),
                at: at.as_millis(),
            })?;
        self.save_listing_images(id, &images)?;
        Ok(images)
    }

    /// Removes the image set of one listing together with all its backups.
    pub fn clear_listing_images(&self, id: &ListingId) -> Result<usize, StoreError> {
        let mut removed = usize::from(self.kv.remove(&StoreKey::ListingImages(id.clone()).raw())?);
        for ts in self.image_backup_times(id) {
            if self.kv.remove(&StoreKey::ListingImagesBackup(id.clone(), ts).raw())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every per-listing image key, current and backup alike.
    #[instrument(skip(self))]
    pub fn purge_all_listing_images(&self) -> Result<usize, StoreError> {
        let keys = self.kv.keys_with_prefix(LISTING_IMAGES_PREFIX)?;
        let mut removed = 0;
        for key in &keys {
            if self.kv.remove(key)? {
                removed += 1;
            }
        }
        debug!(removed, "purged listing image keys");
        Ok(removed)
    }

    /// Snapshot written before an update overwrites `listing`.
    pub fn backup_listing(&self, listing: &Listing) -> Result<(), StoreError> {
        self.write_json(&StoreKey::ListingBackup(listing.id.clone()), listing)
    }

    pub fn load_listing_backup(&self, id: &ListingId) -> Option<Listing> {
        self.read_json(&StoreKey::ListingBackup(id.clone()))
    }

    /// Audit snapshot written before a delete.
    pub fn record_deleted(&self, listing: &Listing) -> Result<(), StoreError> {
        self.write_json(&StoreKey::DeletedListing(listing.id.clone()), listing)
    }

    pub fn load_deleted(&self, id: &ListingId) -> Option<Listing> {
        self.read_json(&StoreKey::DeletedListing(id.clone()))
    }

    fn prune_image_backups(&self, id: &ListingId) -> Result<(), StoreError> {
        let BackupRetention::KeepLatest(keep) = self.retention else {
            return Ok(());
        };
        let times = self.image_backup_times(id);
        let excess = times.len().saturating_sub(keep);
        for ts in &times[..excess] {
            self.kv
                .remove(&StoreKey::ListingImagesBackup(id.clone(), *ts).raw())?;
        }
        if excess > 0 {
            debug!(id = %id, pruned = excess, "pruned image backups");
        }
        Ok(())
    }

    fn next_backup_ts(&self) -> UnixTimeMs {
        let mut last = self
            .last_backup_ts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ts = UnixTimeMs::now().as_millis().max(last.saturating_add(1));
        *last = ts;
        UnixTimeMs(ts)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<T> {
        let raw_key = key.raw();
        let raw = match self.kv.get(&raw_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %raw_key, error = %e, "read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                counter!("local_store.read.corrupt").increment(1);
                warn!(key = %raw_key, error = %e, "stored value is malformed");
                None
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &StoreKey, value: &T) -> Result<(), StoreError> {
        self.kv.set(&key.raw(), &serde_json::to_string(value)?)?;
        Ok(())
    }
}

/// Deterministic dataset returned when nothing usable has ever been stored.
#[must_use]
pub fn seed_listings() -> Vec<Listing> {
    let seed = |id: &str, title: &str, location: &str, neighborhood: &str, price: f64| Listing {
        id: ListingId::new(id).unwrap_or_else(|_| ListingId::generate()),
        title: title.to_string(),
        description: format!("{title} in {neighborhood}, {location}."),
        location: location.to_string(),
        neighborhood: neighborhood.to_string(),
        map_location: format!("{neighborhood}, {location}"),
        price,
        rating: 0.0,
        dates: "2024-01-01".to_string(),
        image: String::new(),
        images: Vec::new(),
        host: Host::default(),
    };

    vec![
        seed("seed-1", "Sunny studio", "Lisbon", "Alfama", 85.0),
        seed("seed-2", "Canal-side loft", "Amsterdam", "Jordaan", 140.0),
        seed("seed-3", "Garden cottage", "Porto", "Foz", 110.0),
    ]
    .into_iter()
    .map(Listing::normalized)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKv;
    use crate::PLACEHOLDER_IMAGE_URL;
    use proptest::prelude::*;

    fn listing(id: &str, images: &[&str]) -> Listing {
        Listing {
            id: ListingId::new(id).unwrap(),
            title: format!("Listing {id}"),
            description: String::new(),
            location: "Lisbon".into(),
            neighborhood: String::new(),
            map_location: String::new(),
            price: 50.0,
            rating: 4.5,
            dates: "2024-02-02".into(),
            image: String::new(),
            images: images.iter().map(|s| (*s).to_string()).collect(),
            host: Host::default(),
        }
    }

    fn store_with(kv: Arc<MemoryKv>) -> LocalListingStore {
        LocalListingStore::new(kv, BackupRetention::default())
    }

    fn id(s: &str) -> ListingId {
        ListingId::new(s).unwrap()
    }

    #[test]
    fn empty_store_loads_seed() {
        let store = store_with(Arc::new(MemoryKv::new()));
        let (listings, source) = store.load_collection_with_source();
        assert_eq!(source, SnapshotSource::Seed);
        assert_eq!(listings, seed_listings());
    }

    #[test]
    fn explicit_empty_collection_is_not_seed() {
        let store = store_with(Arc::new(MemoryKv::new()));
        store.save_collection(&[]).unwrap();
        let (listings, source) = store.load_collection_with_source();
        assert!(listings.is_empty());
        assert_eq!(source, SnapshotSource::Current);
    }

    #[test]
    fn backup_holds_previous_snapshot() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(Arc::clone(&kv));
        let a = vec![listing("a", &[])];
        let b = vec![listing("b", &[])];

        store.save_collection(&a).unwrap();
        assert!(kv.get("listings_last_backup").unwrap().is_none());

        store.save_collection(&b).unwrap();
        let backup: Vec<Listing> =
            serde_json::from_str(&kv.get("listings_last_backup").unwrap().unwrap()).unwrap();
        assert_eq!(backup[0].id.as_str(), "a");
    }

    #[test]
    fn corrupt_current_recovers_from_backup() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(Arc::clone(&kv));
        store.save_collection(&[listing("a", &[])]).unwrap();
        store.save_collection(&[listing("b", &[])]).unwrap();

        kv.set("listings", "{not json").unwrap();
        let (listings, source) = store.load_collection_with_source();
        assert_eq!(source, SnapshotSource::Backup);
        assert_eq!(listings[0].id.as_str(), "a");
    }

    #[test]
    fn corrupt_current_and_backup_fall_to_seed() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("listings", "[{").unwrap();
        kv.set("listings_last_backup", "oops").unwrap();
        let store = store_with(kv);
        assert_eq!(store.load_collection_with_source().1, SnapshotSource::Seed);
    }

    #[test]
    fn corrupt_current_is_not_promoted_to_backup() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(Arc::clone(&kv));
        store.save_collection(&[listing("a", &[])]).unwrap();
        store.save_collection(&[listing("b", &[])]).unwrap();
        kv.set("listings", "garbage").unwrap();

        store.save_collection(&[listing("c", &[])]).unwrap();
        let backup: Vec<Listing> =
            serde_json::from_str(&kv.get("listings_last_backup").unwrap().unwrap()).unwrap();
        assert_eq!(backup[0].id.as_str(), "a");
    }

    #[test]
    fn save_normalizes_entries() {
        let store = store_with(Arc::new(MemoryKv::new()));
        let mut l = listing("a", &["blob:tmp", "https://cdn/1.jpg"]);
        l.image = "blob:tmp".into();
        store.save_collection(&[l, listing("b", &[])]).unwrap();

        let loaded = store.load_collection();
        assert_eq!(loaded[0].image, "https://cdn/1.jpg");
        assert_eq!(loaded[0].images, vec!["https://cdn/1.jpg".to_string()]);
        assert_eq!(loaded[1].image, PLACEHOLDER_IMAGE_URL);
    }

    #[test]
    fn quota_failure_is_reported_and_state_kept() {
        let kv = Arc::new(MemoryKv::with_quota(600));
        let store = store_with(Arc::clone(&kv));
        store.save_collection(&[listing("a", &[])]).unwrap();

        let big: Vec<Listing> = (0..50).map(|i| listing(&format!("x{i}"), &[])).collect();
        let err = store.save_collection(&big).unwrap_err();
        assert!(matches!(err, StoreError::Kv(KvError::QuotaExceeded { .. })));
        assert_eq!(store.load_collection()[0].id.as_str(), "a");
    }

    #[test]
    fn image_sets_are_backed_up_and_pruned() {
        let kv = Arc::new(MemoryKv::new());
        let store = LocalListingStore::new(kv, BackupRetention::KeepLatest(2));
        let l = id("l1");

        for i in 0..5 {
            store
                .save_listing_images(&l, &[format!("https://cdn/{i}.jpg")])
                .unwrap();
        }

        let times = store.image_backup_times(&l);
        assert_eq!(times.len(), 2);
        assert!(times[0] < times[1]);
        assert_eq!(store.load_listing_images(&l), vec!["https://cdn/4.jpg".to_string()]);

        let restored = store.restore_listing_images(&l, times[0]).unwrap();
        assert_eq!(restored, vec!["https://cdn/2.jpg".to_string()]);
        assert_eq!(store.load_listing_images(&l), restored);
    }

    #[test]
    fn unbounded_retention_keeps_everything() {
        let store = LocalListingStore::new(Arc::new(MemoryKv::new()), BackupRetention::Unbounded);
        let l = id("l1");
        for i in 0..8 {
            store.save_listing_images(&l, &[i.to_string()]).unwrap();
        }
        assert_eq!(store.image_backup_times(&l).len(), 7);
    }

    #[test]
    fn corrupt_image_set_falls_back_to_latest_backup() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(Arc::clone(&kv));
        let l = id("l1");
        store.save_listing_images(&l, &["a".into()]).unwrap();
        store.save_listing_images(&l, &["b".into()]).unwrap();
        kv.set("listing_images_l1", "nope").unwrap();

        assert_eq!(store.load_listing_images(&l), vec!["a".to_string()]);
        assert!(store.load_listing_images(&id("other")).is_empty());
    }

    #[test]
    fn clear_only_touches_one_listing() {
        let store = store_with(Arc::new(MemoryKv::new()));
        let (a, b) = (id("a"), id("a2"));
        store.save_listing_images(&a, &["1".into()]).unwrap();
        store.save_listing_images(&a, &["2".into()]).unwrap();
        store.save_listing_images(&b, &["3".into()]).unwrap();

        assert_eq!(store.clear_listing_images(&a).unwrap(), 2);
        assert!(store.load_listing_images(&a).is_empty());
        assert_eq!(store.load_listing_images(&b), vec!["3".to_string()]);
    }

    #[test]
    fn purge_is_idempotent_and_spares_other_keys() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(Arc::clone(&kv));
        store.save_collection(&[listing("a", &[])]).unwrap();
        store.save_listing_images(&id("a"), &["1".into()]).unwrap();
        store.save_listing_images(&id("a"), &["2".into()]).unwrap();
        store.save_listing_images(&id("b"), &["3".into()]).unwrap();

        assert_eq!(store.purge_all_listing_images().unwrap(), 3);
        assert_eq!(store.purge_all_listing_images().unwrap(), 0);
        assert!(kv.keys_with_prefix("listing_images_").unwrap().is_empty());
        assert_eq!(store.load_collection().len(), 1);
    }

    #[test]
    fn entity_snapshots_roundtrip() {
        let store = store_with(Arc::new(MemoryKv::new()));
        let l = listing("a", &["https://cdn/1.jpg"]);
        store.backup_listing(&l).unwrap();
        store.record_deleted(&l).unwrap();
        assert_eq!(store.load_listing_backup(&l.id), Some(l.clone()));
        assert_eq!(store.load_deleted(&l.id), Some(l));
        assert!(store.load_deleted(&id("zzz")).is_none());
    }

    fn arb_listing() -> impl Strategy<Value = Listing> {
        (
            "[a-z0-9]{1,8}",
            "[A-Za-z ]{1,20}",
            0u32..10_000,
            proptest::collection::vec("https://cdn/[a-z]{1,6}\\.jpg", 0..4),
        )
            .prop_map(|(id, title, price, images)| Listing {
                id: ListingId::new(id).unwrap(),
                title,
                description: String::new(),
                location: String::new(),
                neighborhood: String::new(),
                map_location: String::new(),
                price: f64::from(price),
                rating: 0.0,
                dates: "2024-01-01".into(),
                image: String::new(),
                images,
                host: Host::default(),
            })
    }

    proptest! {
        #[test]
        fn load_after_save_returns_normalized_input(
            listings in proptest::collection::vec(arb_listing(), 0..6),
        ) {
            let store = store_with(Arc::new(MemoryKv::new()));
            store.save_collection(&listings).unwrap();
            let expected: Vec<Listing> = listings.into_iter().map(Listing::normalized).collect();
            prop_assert_eq!(store.load_collection(), expected);
        }
    }
}
