//! Connection tracking and traffic statistics
//!
//! Provides:
//! - Admission of new connections under per-network caps
//! - Per-connection and aggregate byte accounting (direct vs proxy)
//! - A bounded history of recent connections for incremental polling
//! - Aggregate counters persisted across restarts in `statistics.dat`

mod mapfile;
mod persistence;
mod rule;
mod store;
mod tracker;

pub use mapfile::MappedFile;
pub use persistence::{initialize, Persistence, STORE_FILE};
pub use rule::{MatchedRule, Rule};
pub use store::{CounterStore, Route, Statistics, STATISTICS_SIZE, STORE_VERSION};
pub use tracker::{TrackedConn, TrackedPacketConn, Tracker, TrackerInfo};

use crate::common::{Chain, Closer, Metadata, Network, ProxyPacketConn, ProxyStream, Ring};
use crate::config::StatisticConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use store::StoreSlot;
use tracing::{debug, info};
use uuid::Uuid;

/// Default cap on concurrently open TCP connections
pub const MAX_ACTIVE_TCP_CONNECTION: u64 = 512;
/// Default cap on concurrently open UDP connections
pub const MAX_ACTIVE_UDP_CONNECTION: u64 = 256;
/// Default number of connections kept in history
pub const MAX_CONNECTION_HISTORY: usize = 1024;

struct Tracking {
    closer: Arc<dyn Closer>,
    info: Arc<TrackerInfo>,
}

/// Everything guarded by the manager lock
struct Registry {
    tcp_connections: u64,
    udp_connections: u64,
    connections: HashMap<Uuid, Tracking>,
    history: Ring<Arc<TrackerInfo>>,
}

impl Registry {
    fn active(&self, network: Network) -> u64 {
        match network {
            Network::Tcp => self.tcp_connections,
            Network::Udp => self.udp_connections,
        }
    }

    fn insert(&mut self, tracking: Tracking) {
        match tracking.info.metadata.network {
            Network::Tcp => self.tcp_connections += 1,
            Network::Udp => self.udp_connections += 1,
        }
        self.connections.insert(tracking.info.id, tracking);
    }

    fn remove(&mut self, id: &Uuid, network: Network) {
        if self.connections.remove(id).is_none() {
            return;
        }
        match network {
            Network::Tcp => self.tcp_connections = self.tcp_connections.saturating_sub(1),
            Network::Udp => self.udp_connections = self.udp_connections.saturating_sub(1),
        }
    }
}

/// Statistics manager for connections and traffic
///
/// One instance is created by the host and shared (`Arc`) with every
/// component that tracks or reports connections.
pub struct StatisticManager {
    registry: Arc<Mutex<Registry>>,
    counters: Arc<StoreSlot>,
    max_tcp_connections: u64,
    max_udp_connections: u64,
}

impl StatisticManager {
    /// Create a manager with default limits and in-memory counters
    pub fn new() -> Self {
        Self::with_config(&StatisticConfig::default())
    }

    /// Create a manager from configuration
    pub fn with_config(config: &StatisticConfig) -> Self {
        StatisticManager {
            registry: Arc::new(Mutex::new(Registry {
                tcp_connections: 0,
                udp_connections: 0,
                connections: HashMap::new(),
                history: Ring::new(config.history_size.max(1)),
            })),
            counters: Arc::new(StoreSlot::new(CounterStore::memory())),
            max_tcp_connections: config.max_tcp_connections,
            max_udp_connections: config.max_udp_connections,
        }
    }

    /// Track a stream connection, wrapping it for byte accounting
    pub fn track_conn<S: ProxyStream>(
        &self,
        conn: S,
        metadata: impl Into<Arc<Metadata>>,
        rule: Option<&dyn Rule>,
    ) -> Result<TrackedConn<S>> {
        let tracker = self.track(conn.chains().clone(), metadata.into(), rule)?;
        Ok(TrackedConn::new(conn, tracker))
    }

    /// Track a packet connection, wrapping it for byte accounting
    pub fn track_packet_conn<P: ProxyPacketConn>(
        &self,
        conn: P,
        metadata: impl Into<Arc<Metadata>>,
        rule: Option<&dyn Rule>,
    ) -> Result<TrackedPacketConn<P>> {
        let tracker = self.track(conn.chains().clone(), metadata.into(), rule)?;
        Ok(TrackedPacketConn::new(conn, tracker))
    }

    fn track(
        &self,
        chain: Chain,
        metadata: Arc<Metadata>,
        rule: Option<&dyn Rule>,
    ) -> Result<Arc<Tracker>> {
        let mut registry = self.registry.lock();

        let network = metadata.network;
        let limit = match network {
            Network::Tcp => self.max_tcp_connections,
            Network::Udp => self.max_udp_connections,
        };
        if registry.active(network) >= limit {
            return Err(Error::ConnectionLimit { network, limit });
        }

        let id = generate_id()?;
        let route = Route::of(&chain);

        self.counters.with(|s| s.add_tracked());

        let (rule, rule_payload) = rule
            .map(|r| (r.rule_type().to_string(), r.payload().to_string()))
            .unwrap_or_default();

        debug!("[{}] Tracking {} via {} ({:?})", id, metadata, chain, route);

        let info = Arc::new(TrackerInfo::new(id, metadata, chain, rule, rule_payload));

        let weak = Arc::downgrade(&self.registry);
        let dispose = Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().remove(&id, network);
                debug!("[{}] Disposed", id);
            }
        });

        let tracker = Arc::new(Tracker::new(
            info.clone(),
            self.counters.clone(),
            route,
            dispose,
        ));

        registry.history.append(&[info.clone()]);
        registry.insert(Tracking {
            closer: tracker.clone(),
            info,
        });

        Ok(tracker)
    }

    /// Direct (upload, download) totals
    pub fn bandwidth_direct(&self) -> (u64, u64) {
        self.counters.with(|s| s.direct())
    }

    /// Proxy (upload, download) totals
    pub fn bandwidth_proxy(&self) -> (u64, u64) {
        self.counters.with(|s| s.proxy())
    }

    /// (active, cumulative tracked) connection counts
    pub fn connections_count(&self) -> (u64, u64) {
        let active = {
            let registry = self.registry.lock();
            registry.tcp_connections + registry.udp_connections
        };
        (active, self.counters.with(|s| s.tracked()))
    }

    /// Get active connection count
    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    /// Zero all four bandwidth totals
    pub fn reset_bandwidth(&self) {
        self.counters.with(|s| s.reset_bandwidth());
    }

    /// Collapse the tracked count to the currently open connections
    pub fn reset_connections(&self) {
        let registry = self.registry.lock();
        let active = registry.tcp_connections + registry.udp_connections;
        self.counters.with(|s| s.set_tracked(active));
    }

    /// Get snapshot of all active connections
    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry.lock();

        let connections = registry
            .connections
            .values()
            .map(|t| t.info.clone())
            .collect();

        let (direct_up, direct_down) = self.bandwidth_direct();
        let (proxy_up, proxy_down) = self.bandwidth_proxy();

        Snapshot {
            download_total: direct_down + proxy_down,
            upload_total: direct_up + proxy_up,
            connections,
        }
    }

    /// Get an active connection by ID
    pub fn get(&self, id: &Uuid) -> Option<Arc<TrackerInfo>> {
        self.registry
            .lock()
            .connections
            .get(id)
            .map(|t| t.info.clone())
    }

    /// Close an active connection by ID
    ///
    /// Returns `Ok(false)` when no such connection is open.
    pub fn close_connection(&self, id: &Uuid) -> Result<bool> {
        let closer = self
            .registry
            .lock()
            .connections
            .get(id)
            .map(|t| t.closer.clone());

        match closer {
            Some(closer) => {
                debug!("[{}] Closing by request", id);
                closer.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every active connection, returning how many were closed
    pub fn close_all_connections(&self) -> usize {
        let closers: Vec<Arc<dyn Closer>> = self
            .registry
            .lock()
            .connections
            .values()
            .map(|t| t.closer.clone())
            .collect();

        closers
            .iter()
            .filter(|closer| closer.close().is_ok())
            .count()
    }

    /// Oldest history index still retrievable
    pub fn history_first(&self) -> usize {
        self.registry.lock().history.position()
    }

    /// One past the newest history index
    pub fn history_last(&self) -> usize {
        self.registry.lock().history.limit()
    }

    /// Append up to `max` history records starting at `index` to `out`
    ///
    /// Returns the number appended and whether anything was available.
    /// Reads start at `max(index, history_first())`. For copying into a
    /// caller-sized slice instead, see [`Ring::get`](crate::common::Ring::get).
    pub fn dump_history(
        &self,
        index: usize,
        max: usize,
        out: &mut Vec<Arc<TrackerInfo>>,
    ) -> (usize, bool) {
        let read = self.registry.lock().history.get_into(index, max, out);
        (read.copied, read.ok)
    }

    /// Switch aggregate counters to a persisted store
    ///
    /// Counters accumulated in the previous store are not migrated.
    pub fn install_persistence(&self, persistence: Persistence) {
        info!(
            "Installed persisted statistics (tracked={})",
            persistence.statistics().tracked()
        );
        self.counters.install(CounterStore::Persisted(persistence));
    }

    /// Whether counters are currently persisted
    pub fn is_persisted(&self) -> bool {
        self.counters.is_persisted()
    }

    /// Version tag of the active counter store
    pub fn store_version(&self) -> u64 {
        self.counters.with(|s| s.version())
    }
}

impl Default for StatisticManager {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_id() -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
}

/// Snapshot of all connections for API response
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Total download bytes
    #[serde(rename = "downloadTotal")]
    pub download_total: u64,
    /// Total upload bytes
    #[serde(rename = "uploadTotal")]
    pub upload_total: u64,
    /// List of active connections
    pub connections: Vec<Arc<TrackerInfo>>,
}
