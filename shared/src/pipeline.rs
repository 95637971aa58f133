//! The only entry point the UI talks to.
//!
//! Every mutation runs under a single writer lock, goes through
//! `Pending -> Succeeded | Failed`, and raises exactly one notification.
//! The query cache is only touched after persistence has confirmed the
//! change, so a failed mutation leaves the cache exactly as it was.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::assets::AssetResolver;
use crate::capabilities::kv::{KeyValueStore, MemoryKv};
use crate::capabilities::notify::{Notification, Notifier};
use crate::capabilities::remote::{DataUrlUploader, ImageUploader, RemoteTable};
use crate::capabilities::CapabilityError;
use crate::config::{PipelineConfig, RemoteConfig};
use crate::image_processing::{ImageFile, ImageProcessor};
use crate::local_store::{LocalListingStore, StoreError};
use crate::model::{Listing, ListingDraft, ListingForm, ListingId, ListingPatch};
use crate::preview::{PreviewRegistry, PreviewSet, PreviewUrl};
use crate::query_cache::{CacheSnapshot, QueryCache};
use crate::remote_adapter::{resolve_patch, RemoteListingAdapter};
use crate::{AppError, AppResult, ErrorKind, UnixTimeMs};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Add,
    Update,
    Delete,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    const fn success_title(self) -> &'static str {
        match self {
            Self::Add => "Listing created",
            Self::Update => "Listing updated",
            Self::Delete => "Listing deleted",
        }
    }

    const fn failure_title(self) -> &'static str {
        match self {
            Self::Add => "Could not create listing",
            Self::Update => "Could not update listing",
            Self::Delete => "Could not delete listing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    Pending,
    Succeeded,
    Failed { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub op_id: OpId,
    pub kind: MutationKind,
    pub listing_id: ListingId,
    pub state: MutationState,
    pub started_at: UnixTimeMs,
    pub finished_at: Option<UnixTimeMs>,
}

/// Where confirmed listings are written.
enum Backend {
    /// The local store is the only tier; images become inline `data:` URLs.
    Local { assets: AssetResolver },
    Remote(RemoteListingAdapter),
}

pub struct MutationPipeline {
    store: LocalListingStore,
    backend: Backend,
    processor: ImageProcessor,
    previews: Arc<PreviewRegistry>,
    cache: Arc<QueryCache>,
    notifier: Arc<dyn Notifier>,
    writer: AsyncMutex<()>,
    history: Mutex<VecDeque<MutationRecord>>,
    history_limit: usize,
}

impl MutationPipeline {
    /// Pipeline whose only tier is the local store.
    pub fn local(
        kv: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        config: &PipelineConfig,
    ) -> Self {
        Self::with_backend(kv, notifier, config, |previews| Backend::Local {
            assets: AssetResolver::new(Arc::new(DataUrlUploader), previews),
        })
    }

    /// Pipeline writing listings to a remote table. The local store still
    /// receives the per-entity backup and deletion snapshots.
    pub fn remote(
        kv: Arc<dyn KeyValueStore>,
        table: Arc<dyn RemoteTable>,
        uploader: Arc<dyn ImageUploader>,
        notifier: Arc<dyn Notifier>,
        config: &PipelineConfig,
    ) -> Self {
        Self::with_backend(kv, notifier, config, |previews| {
            Backend::Remote(RemoteListingAdapter::new(
                table,
                AssetResolver::new(uploader, previews),
            ))
        })
    }

    /// Wires every collaborator from configuration.
    pub fn from_config(config: &PipelineConfig, notifier: Arc<dyn Notifier>) -> AppResult<Self> {
        config.validate()?;
        let kv = open_kv(config)?;

        let Some(remote) = &config.remote else {
            return Ok(Self::local(kv, notifier, config));
        };
        let (table, uploader) = open_remote(remote)?;
        Ok(Self::remote(kv, table, uploader, notifier, config))
    }

    fn with_backend(
        kv: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        config: &PipelineConfig,
        backend: impl FnOnce(Arc<PreviewRegistry>) -> Backend,
    ) -> Self {
        let previews = Arc::new(PreviewRegistry::new());
        let detail_capacity =
            NonZeroUsize::new(config.detail_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: LocalListingStore::new(kv, config.store.retention()),
            backend: backend(Arc::clone(&previews)),
            processor: ImageProcessor::new(config.images.clone(), Arc::clone(&previews)),
            previews,
            cache: Arc::new(QueryCache::new(detail_capacity)),
            notifier,
            writer: AsyncMutex::new(()),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit.max(1),
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    #[must_use]
    pub fn processor(&self) -> &ImageProcessor {
        &self.processor
    }

    #[must_use]
    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    #[must_use]
    pub fn store(&self) -> &LocalListingStore {
        &self.store
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
        self.cache.subscribe()
    }

    /// Compresses a batch of picked files into previews owned by the
    /// returned set.
    pub async fn process_images<F>(
        &self,
        files: Vec<ImageFile>,
        on_progress: F,
    ) -> AppResult<PreviewSet>
    where
        F: FnMut(u8) + Send,
    {
        let urls = self.processor.process_batch(files, on_progress).await?;
        let mut set = PreviewSet::new(Arc::clone(&self.previews));
        set.extend(urls);
        Ok(set)
    }

    /// Loads the collection into the cache. Never fails; a remote outage
    /// keeps whatever the cache already held.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Arc<Vec<Listing>> {
        match &self.backend {
            Backend::Local { .. } => self.cache.set_collection(self.store.load_collection()),
            Backend::Remote(adapter) => {
                match adapter.try_fetch_all().await {
                    Ok(listings) => self.cache.set_collection(listings),
                    Err(_) if self.cache.snapshot().loaded => {
                        warn!("remote unavailable, keeping cached listings");
                        self.cache.invalidate();
                    }
                    Err(_) => self.cache.set_collection(Vec::new()),
                }
            }
        }
        self.cache.listings()
    }

    /// Reloads only when an earlier mutation marked the cache stale.
    pub async fn refresh_if_stale(&self) -> Arc<Vec<Listing>> {
        let snapshot = self.cache.snapshot();
        if snapshot.loaded && !snapshot.stale {
            return snapshot.listings;
        }
        self.load().await
    }

    pub async fn get(&self, id: &ListingId) -> Option<Listing> {
        if let Some(hit) = self.cache.detail(id) {
            return Some(hit);
        }
        let found = match &self.backend {
            Backend::Local { .. } => self.store.load_collection().into_iter().find(|l| &l.id == id),
            Backend::Remote(adapter) => adapter.fetch_by_id(id).await,
        }?;
        self.cache.put_detail(found.clone());
        Some(found)
    }

    #[instrument(skip(self, form))]
    pub async fn add(&self, form: ListingForm) -> AppResult<Listing> {
        let _writer = self.writer.lock().await;
        let id = ListingId::generate();
        let op = self.begin(MutationKind::Add, &id);
        let result = self.add_inner(id, form).await;
        self.finish(op, result, |l| format!("\"{}\" was created.", l.title))
    }

    #[instrument(skip(self, form), fields(id = %id))]
    pub async fn update(&self, id: &ListingId, form: ListingForm) -> AppResult<Listing> {
        let _writer = self.writer.lock().await;
        let op = self.begin(MutationKind::Update, id);
        let result = match ListingPatch::try_from(form) {
            Ok(patch) => self.update_inner(id, &patch).await,
            Err(e) => Err(e.into()),
        };
        self.finish(op, result, |l| format!("\"{}\" was updated.", l.title))
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&self, id: &ListingId) -> AppResult<()> {
        let _writer = self.writer.lock().await;
        let op = self.begin(MutationKind::Delete, id);
        let result = self.delete_inner(id).await;
        self.finish(op, result, |_| "The listing was removed.".to_string())
    }

    /// Administrative sweep of every per-listing image key.
    pub async fn purge_listing_images(&self) -> AppResult<usize> {
        let _writer = self.writer.lock().await;
        Ok(self.store.purge_all_listing_images()?)
    }

    /// Recent mutations, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<MutationRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn add_inner(&self, id: ListingId, form: ListingForm) -> AppResult<Listing> {
        let draft = ListingDraft::try_from(form)?;
        let previews: Vec<PreviewUrl> = draft.previews().cloned().collect();

        let listing = match &self.backend {
            Backend::Local { assets } => {
                let resolved = assets.resolve_all(&id, &draft.image, &draft.images).await;
                let listing = Listing::from_draft(
                    id,
                    &draft,
                    resolved.image,
                    resolved.images,
                    UnixTimeMs::now(),
                );
                let mut collection = self.store.load_collection();
                collection.retain(|l| l.id != listing.id);
                collection.insert(0, listing.clone());
                self.store.save_collection(&collection)?;
                self.record_images(&listing);
                listing
            }
            Backend::Remote(adapter) => adapter.create(id, &draft).await?,
        };

        self.previews.revoke_all(&previews);
        self.cache.insert(listing.clone());
        self.cache.invalidate();
        Ok(listing)
    }

    async fn update_inner(&self, id: &ListingId, patch: &ListingPatch) -> AppResult<Listing> {
        let base = self.current(id).await?;
        let previews: Vec<PreviewUrl> = patch.previews().cloned().collect();

        let listing = match &self.backend {
            Backend::Local { assets } => {
                self.store.backup_listing(&base)?;
                let next = resolve_patch(assets, &base, patch).await;
                let collection: Vec<Listing> = self
                    .store
                    .load_collection()
                    .into_iter()
                    .map(|l| if l.id == next.id { next.clone() } else { l })
                    .collect();
                self.store.save_collection(&collection)?;
                if patch.touches_images() {
                    self.record_images(&next);
                }
                next
            }
            Backend::Remote(adapter) => {
                best_effort(self.store.backup_listing(&base), "listing backup");
                adapter.update(&base, patch).await?
            }
        };

        self.previews.revoke_all(&previews);
        self.cache.replace(listing.clone());
        self.cache.invalidate();
        Ok(listing)
    }

    async fn delete_inner(&self, id: &ListingId) -> AppResult<()> {
        match &self.backend {
            Backend::Local { .. } => {
                let mut collection = self.store.load_collection();
                let index = collection
                    .iter()
                    .position(|l| &l.id == id)
                    .ok_or_else(|| not_found(id))?;
                self.store.record_deleted(&collection[index])?;
                collection.remove(index);
                self.store.save_collection(&collection)?;
            }
            Backend::Remote(adapter) => {
                if let Some(existing) = adapter.try_fetch_by_id(id).await? {
                    best_effort(self.store.record_deleted(&existing), "deletion snapshot");
                }
                adapter.remove(id).await?;
            }
        }

        self.cache.remove(id);
        self.cache.invalidate();
        Ok(())
    }

    async fn current(&self, id: &ListingId) -> AppResult<Listing> {
        let found = match &self.backend {
            Backend::Local { .. } => self.store.load_collection().into_iter().find(|l| &l.id == id),
            Backend::Remote(adapter) => adapter.try_fetch_by_id(id).await?,
        };
        found.ok_or_else(|| not_found(id))
    }

    fn record_images(&self, listing: &Listing) {
        best_effort(
            self.store.save_listing_images(&listing.id, &listing.images),
            "image set snapshot",
        );
    }

    fn begin(&self, kind: MutationKind, id: &ListingId) -> (MutationRecord, Instant) {
        let record = MutationRecord {
            op_id: OpId::generate(),
            kind,
            listing_id: id.clone(),
            state: MutationState::Pending,
            started_at: UnixTimeMs::now(),
            finished_at: None,
        };
        self.push_history(record.clone());
        (record, Instant::now())
    }

    fn finish<T>(
        &self,
        (mut record, started): (MutationRecord, Instant),
        result: AppResult<T>,
        describe: impl FnOnce(&T) -> String,
    ) -> AppResult<T> {
        let kind = record.kind;
        histogram!("pipeline.mutation.duration_ms", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        match &result {
            Ok(value) => {
                counter!("pipeline.mutation", "kind" => kind.as_str(), "outcome" => "success")
                    .increment(1);
                info!(op = %record.op_id, id = %record.listing_id, kind = kind.as_str(), "mutation succeeded");
                record.state = MutationState::Succeeded;
                self.notifier
                    .notify(Notification::success(kind.success_title(), describe(value)));
            }
            Err(e) => {
                counter!("pipeline.mutation", "kind" => kind.as_str(), "outcome" => "failure")
                    .increment(1);
                error!(op = %record.op_id, id = %record.listing_id, kind = kind.as_str(), error = %e, "mutation failed");
                record.state = MutationState::Failed {
                    code: e.code().to_string(),
                };
                self.notifier.notify(Notification::error(
                    kind.failure_title(),
                    e.kind.user_message(),
                    e.code(),
                ));
            }
        }

        record.finished_at = Some(UnixTimeMs::now());
        self.push_history(record);
        result
    }

    /// Inserts or replaces the record with the same `op_id`.
    fn push_history(&self, record: MutationRecord) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = history.iter_mut().find(|r| r.op_id == record.op_id) {
            *existing = record;
            return;
        }
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

fn best_effort(result: Result<(), StoreError>, what: &str) {
    if let Err(e) = result {
        counter!("pipeline.best_effort.failed").increment(1);
        warn!(error = %e, "{what} not written");
    }
}

fn not_found(id: &ListingId) -> AppError {
    AppError::new(ErrorKind::NotFound, format!("listing {id} not found"))
        .with_context("listing_id", id.as_str())
}

fn open_kv(config: &PipelineConfig) -> Result<Arc<dyn KeyValueStore>, CapabilityError> {
    match &config.store.sqlite_path {
        #[cfg(not(target_arch = "wasm32"))]
        Some(path) => {
            let kv: Arc<dyn KeyValueStore> =
                Arc::new(crate::capabilities::kv::SqliteKv::open(path)?);
            Ok(kv)
        }
        _ => Ok(Arc::new(MemoryKv::new())),
    }
}

type RemoteBackends = (Arc<dyn RemoteTable>, Arc<dyn ImageUploader>);

#[cfg(feature = "rest")]
fn open_remote(remote: &RemoteConfig) -> AppResult<RemoteBackends> {
    use crate::capabilities::http::{PostgrestTable, StorageBucket};

    let url = remote.validated_url()?;
    let key = RemoteConfig::api_key()?;
    let table = PostgrestTable::new(&url, &remote.table, key.clone(), remote.timeout())
        .map_err(CapabilityError::from)?;
    let bucket = StorageBucket::new(url, remote.bucket.clone(), key, remote.timeout())
        .map_err(CapabilityError::from)?;
    let table: Arc<dyn RemoteTable> = Arc::new(table);
    let uploader: Arc<dyn ImageUploader> = Arc::new(bucket);
    Ok((table, uploader))
}

#[cfg(not(feature = "rest"))]
fn open_remote(_remote: &RemoteConfig) -> AppResult<RemoteBackends> {
    Err(AppError::new(
        ErrorKind::Internal,
        "remote tier configured but built without the `rest` feature",
    ))
}
