//! Mihomo Statistic - connection accounting core of mihomo-rust
//!
//! Tracks every live connection flowing through the proxy:
//! - Admission under per-network (TCP/UDP) caps
//! - Per-connection upload/download counters
//! - Aggregate direct vs proxy bandwidth
//! - A bounded, pollable history of recent connections
//! - Aggregate counters persisted across restarts via a mapped file
//!
//! # Architecture
//!
//! ```text
//!   inbound / tunnel                     hub (API, CLI)
//!         |                                    ^
//!         | track_conn / track_packet_conn     | snapshot / bandwidth / history
//!         v                                    |
//! +-------+------------------------------------+-------+
//! |                  StatisticManager                  |
//! |  registry (id -> tracker)   history Ring           |
//! +-------+-----------------------------+--------------+
//!         |                             |
//! +-------v-------+            +--------v--------+
//! | TrackedConn / |            |  CounterStore   |
//! | PacketConn    +----------->|  memory | mmap  |
//! +---------------+   bytes    +-----------------+
//! ```

pub mod common;
pub mod config;
pub mod statistic;

pub use common::error::{Error, Result};
pub use config::{Config, StatisticConfig};
pub use statistic::StatisticManager;

use std::sync::Arc;
use tracing::info;

/// Mihomo version (compatible with Go version)
pub const VERSION: &str = "1.10.0";

/// Build the shared manager described by `config`
///
/// Persistence failures are logged and leave the manager on in-memory
/// counters.
pub fn build_manager(config: &Config) -> Arc<StatisticManager> {
    let manager = Arc::new(StatisticManager::with_config(&config.statistic));

    if config.statistic.persistence {
        statistic::initialize(&manager, config.store_path());
    } else {
        info!("Statistics persistence disabled");
    }

    manager
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.10.0");
    }

    #[test]
    fn test_build_manager_without_persistence() {
        let mut config = Config::default();
        config.statistic.persistence = false;

        let manager = build_manager(&config);
        assert!(!manager.is_persisted());
    }

    #[test]
    fn test_build_manager_with_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home_dir = dir.path().to_path_buf();

        let manager = build_manager(&config);
        assert!(manager.is_persisted());
        assert!(dir.path().join("statistics.dat").exists());
    }
}
