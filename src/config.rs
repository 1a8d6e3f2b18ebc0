use crate::cache::DEFAULT_TTL;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheBackend {
    /// Process-local map; lost on restart.
    Memory,
    /// Entries kept in the data directory.
    Sled,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Lifetime of the latest-table pointer and of cached pages.
    pub cache_ttl: Duration,
    /// Maximum accepted request body for uploads, in bytes.
    pub upload_limit_bytes: usize,
    /// Resolve the newest upload table from the catalog when the pointer
    /// has expired, instead of failing.
    pub fallback_to_newest: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            upload_limit_bytes: 50 * 1024 * 1024,
            fallback_to_newest: false,
        }
    }
}
