//! Shared, observer-visible read cache for listing queries.
//!
//! Holds the collection query and a bounded set of per-listing detail
//! entries. Every change publishes a fresh [`CacheSnapshot`] on a watch
//! channel so UI observers see it without refetching.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tokio::sync::watch;

use crate::model::{Listing, ListingId};

const DEFAULT_DETAIL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub listings: Arc<Vec<Listing>>,
    /// Set once the collection has been loaded at least once.
    pub loaded: bool,
    /// Marked by invalidation; observers should refetch when convenient.
    pub stale: bool,
    pub version: u64,
}

struct CacheState {
    listings: Arc<Vec<Listing>>,
    loaded: bool,
    stale: bool,
    version: u64,
    details: LruCache<ListingId, Listing>,
}

impl CacheState {
    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            listings: Arc::clone(&self.listings),
            loaded: self.loaded,
            stale: self.stale,
            version: self.version,
        }
    }
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    tx: watch::Sender<CacheSnapshot>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_DETAIL_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl QueryCache {
    #[must_use]
    pub fn new(detail_capacity: NonZeroUsize) -> Self {
        let (tx, _rx) = watch::channel(CacheSnapshot::default());
        Self {
            state: Mutex::new(CacheState {
                listings: Arc::new(Vec::new()),
                loaded: false,
                stale: false,
                version: 0,
                details: LruCache::new(detail_capacity),
            }),
            tx,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        self.lock().snapshot()
    }

    #[must_use]
    pub fn listings(&self) -> Arc<Vec<Listing>> {
        Arc::clone(&self.lock().listings)
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    /// Replaces the collection with freshly fetched data.
    pub fn set_collection(&self, listings: Vec<Listing>) {
        self.update(|state| {
            for listing in &listings {
                if state.details.contains(&listing.id) {
                    state.details.put(listing.id.clone(), listing.clone());
                }
            }
            state.listings = Arc::new(listings);
            state.loaded = true;
            state.stale = false;
        });
    }

    /// Optimistic insert of a confirmed create; newest first.
    pub fn insert(&self, listing: Listing) {
        self.update(|state| {
            let mut next = Vec::with_capacity(state.listings.len() + 1);
            next.push(listing.clone());
            next.extend(state.listings.iter().filter(|l| l.id != listing.id).cloned());
            state.listings = Arc::new(next);
            state.details.put(listing.id.clone(), listing);
        });
    }

    /// Optimistic replace of a confirmed update.
    pub fn replace(&self, listing: Listing) {
        self.update(|state| {
            let next = state
                .listings
                .iter()
                .map(|l| if l.id == listing.id { listing.clone() } else { l.clone() })
                .collect();
            state.listings = Arc::new(next);
            state.details.put(listing.id.clone(), listing);
        });
    }

    /// Optimistic removal of a confirmed delete.
    pub fn remove(&self, id: &ListingId) {
        self.update(|state| {
            let next = state.listings.iter().filter(|l| &l.id != id).cloned().collect();
            state.listings = Arc::new(next);
            state.details.pop(id);
        });
    }

    /// Marks the collection stale so observers reconcile eventually.
    pub fn invalidate(&self) {
        self.update(|state| state.stale = true);
    }

    /// Detail entry, falling back to the collection.
    #[must_use]
    pub fn detail(&self, id: &ListingId) -> Option<Listing> {
        let mut state = self.lock();
        if let Some(hit) = state.details.get(id) {
            return Some(hit.clone());
        }
        let found = state.listings.iter().find(|l| &l.id == id).cloned()?;
        state.details.put(id.clone(), found.clone());
        Some(found)
    }

    pub fn put_detail(&self, listing: Listing) {
        self.lock().details.put(listing.id.clone(), listing);
    }

    fn update(&self, f: impl FnOnce(&mut CacheState)) {
        let snapshot = {
            let mut state = self.lock();
            f(&mut state);
            state.version += 1;
            state.snapshot()
        };
        self.tx.send_replace(snapshot);
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
