//! Aggregate traffic counters
//!
//! `Statistics` is the exact byte layout shared with `statistics.dat`: six
//! native-endian u64 words (version, tracked, direct up/down, proxy up/down).
//! Every field is mutated with atomic operations only, so the same struct
//! works on the heap and on a shared file mapping.

use super::persistence::Persistence;
use crate::common::Chain;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Current on-disk format version
pub const STORE_VERSION: u64 = 3;

/// Size in bytes of the persisted record
pub const STATISTICS_SIZE: usize = std::mem::size_of::<Statistics>();

/// Which aggregate pair a connection's bytes count towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy,
}

impl Route {
    pub fn of(chain: &Chain) -> Self {
        if chain.is_direct() {
            Route::Direct
        } else {
            Route::Proxy
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct Statistics {
    version: AtomicU64,
    tracked: AtomicU64,
    direct_uploaded: AtomicU64,
    direct_downloaded: AtomicU64,
    proxy_uploaded: AtomicU64,
    proxy_downloaded: AtomicU64,
}

impl Statistics {
    /// Fresh in-memory counters tagged with the current version
    pub fn new() -> Self {
        let statistics = Statistics::default();
        statistics.version.store(STORE_VERSION, Ordering::Relaxed);
        statistics
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Zero every counter and retag with `version`
    pub(crate) fn reset(&self, version: u64) {
        self.tracked.store(0, Ordering::Relaxed);
        self.reset_bandwidth();
        self.version.store(version, Ordering::Release);
    }

    pub fn tracked(&self) -> u64 {
        self.tracked.load(Ordering::Relaxed)
    }

    pub(crate) fn add_tracked(&self) {
        self.tracked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_tracked(&self, tracked: u64) {
        self.tracked.store(tracked, Ordering::Relaxed);
    }

    /// Direct (upload, download) totals
    pub fn direct(&self) -> (u64, u64) {
        (
            self.direct_uploaded.load(Ordering::Relaxed),
            self.direct_downloaded.load(Ordering::Relaxed),
        )
    }

    /// Proxy (upload, download) totals
    pub fn proxy(&self) -> (u64, u64) {
        (
            self.proxy_uploaded.load(Ordering::Relaxed),
            self.proxy_downloaded.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn add_upload(&self, route: Route, bytes: u64) {
        match route {
            Route::Direct => self.direct_uploaded.fetch_add(bytes, Ordering::Relaxed),
            Route::Proxy => self.proxy_uploaded.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    pub(crate) fn add_download(&self, route: Route, bytes: u64) {
        match route {
            Route::Direct => self.direct_downloaded.fetch_add(bytes, Ordering::Relaxed),
            Route::Proxy => self.proxy_downloaded.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    pub(crate) fn reset_bandwidth(&self) {
        self.direct_uploaded.store(0, Ordering::Relaxed);
        self.direct_downloaded.store(0, Ordering::Relaxed);
        self.proxy_uploaded.store(0, Ordering::Relaxed);
        self.proxy_downloaded.store(0, Ordering::Relaxed);
    }
}

/// Backing storage for the aggregate counters
pub enum CounterStore {
    /// Process-local fallback, lost on exit
    Memory(Statistics),
    /// Counters living in a mapped `statistics.dat`
    Persisted(Persistence),
}

impl CounterStore {
    pub fn memory() -> Self {
        CounterStore::Memory(Statistics::new())
    }

    pub fn statistics(&self) -> &Statistics {
        match self {
            CounterStore::Memory(statistics) => statistics,
            CounterStore::Persisted(persistence) => persistence.statistics(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, CounterStore::Persisted(_))
    }
}

/// Slot holding whichever store is currently installed
///
/// Trackers share the slot rather than a store, so an increment always lands
/// in the store that is active at that moment.
pub(crate) struct StoreSlot(RwLock<Arc<CounterStore>>);

impl StoreSlot {
    pub(crate) fn new(store: CounterStore) -> Self {
        StoreSlot(RwLock::new(Arc::new(store)))
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&Statistics) -> R) -> R {
        f(self.0.read().statistics())
    }

    pub(crate) fn is_persisted(&self) -> bool {
        self.0.read().is_persisted()
    }

    /// Swap in a new store, returning the previous one
    pub(crate) fn install(&self, store: CounterStore) -> Arc<CounterStore> {
        std::mem::replace(&mut *self.0.write(), Arc::new(store))
    }
}
