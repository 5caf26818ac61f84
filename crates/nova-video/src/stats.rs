use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline cache counters. Updated from the render thread and the build workers.
#[derive(Debug, Default)]
pub struct PipelineCacheStats {
    fast_path_hits: AtomicU64,
    map_hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    disk_entries_loaded: AtomicU64,
}

impl PipelineCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_fast_path_hits(&self) {
        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_map_hits(&self) {
        self.map_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_builds(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_build_failures(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_disk_entries_loaded(&self) {
        self.disk_entries_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineCacheStatsSnapshot {
        PipelineCacheStatsSnapshot {
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
            map_hits: self.map_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            disk_entries_loaded: self.disk_entries_loaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCacheStatsSnapshot {
    /// Draws whose key matched the previously returned pipeline.
    pub fast_path_hits: u64,
    pub map_hits: u64,
    /// Keys seen for the first time.
    pub misses: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub disk_entries_loaded: u64,
}

impl PipelineCacheStatsSnapshot {
    /// Lookups answered without building.
    pub fn hits(&self) -> u64 {
        self.fast_path_hits + self.map_hits
    }
}
