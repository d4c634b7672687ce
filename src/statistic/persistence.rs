//! Persisted traffic counters
//!
//! `statistics.dat` holds one `Statistics` record. On open a version mismatch
//! zeroes the whole record and retags it; there is no field-level migration.

use super::mapfile::MappedFile;
use super::store::{Statistics, STATISTICS_SIZE, STORE_VERSION};
use super::StatisticManager;
use crate::Result;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info, warn};

/// Default file name, resolved against the home directory
pub const STORE_FILE: &str = "statistics.dat";

/// Counters backed by a memory-mapped file
pub struct Persistence {
    statistics: NonNull<Statistics>,
    mapped: MappedFile,
    path: PathBuf,
}

// SAFETY: the mapped record is only touched through atomics, and the mapping
// stays valid until `mapped` is dropped together with the pointer.
unsafe impl Send for Persistence {}
unsafe impl Sync for Persistence {}

impl Persistence {
    /// Map `path` and bring its record up to the current version
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut mapped = MappedFile::map(path, STATISTICS_SIZE)?;

        // SAFETY: the mapping is page aligned, exactly STATISTICS_SIZE bytes,
        // and every bit pattern is a valid Statistics.
        let statistics = NonNull::new(mapped.as_mut_ptr().cast::<Statistics>())
            .ok_or_else(|| crate::Error::internal("mapped region is null"))?;

        let persistence = Persistence {
            statistics,
            mapped,
            path: path.to_path_buf(),
        };

        let version = persistence.statistics().version();
        if version != STORE_VERSION {
            debug!(
                "Upgrade {}: {} -> {}",
                path.display(),
                version,
                STORE_VERSION
            );
            persistence.statistics().reset(STORE_VERSION);
            persistence.mapped.flush()?;
        }

        Ok(persistence)
    }

    pub fn statistics(&self) -> &Statistics {
        // SAFETY: see the Send/Sync impls above.
        unsafe { self.statistics.as_ref() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        self.mapped.flush()
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("path", &self.path)
            .field("statistics", self.statistics())
            .finish()
    }
}

/// Install persisted counters on `manager`, degrading to memory on failure
///
/// Returns whether persistence is now active.
pub fn initialize(manager: &StatisticManager, path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match Persistence::open(path) {
        Ok(persistence) => {
            info!("Statistics persisted to {}", path.display());
            manager.install_persistence(persistence);
            true
        }
        Err(e) => {
            warn!("Map {} failed: {}", path.display(), e);
            false
        }
    }
}
