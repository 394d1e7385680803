//! Runtime configuration for sessions and connections.
//!
//! # Responsibility
//! - Hold the knobs the persistence core reads at runtime (lock wait,
//!   page-size bounds, flush mode).
//!
//! # Invariants
//! - `default_page_size` is never zero and never above `max_page_size`.

use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 2000;

/// When pending changes of a session are written to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush before every query and at commit.
    #[default]
    Auto,
    /// Flush only on explicit `flush()` and at commit.
    Commit,
}

/// Persistence configuration shared by a `SessionFactory` and its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrmConfig {
    /// How long a pessimistic lock request waits before failing.
    ///
    /// Applied as the SQLite busy timeout of connections opened through
    /// `open_db_with_config`.
    pub lock_timeout: Duration,
    /// Page size used when a `PageRequest` asks for size 0.
    pub default_page_size: u32,
    /// Upper bound applied to every requested page size.
    pub max_page_size: u32,
    pub flush_mode: FlushMode,
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            flush_mode: FlushMode::Auto,
        }
    }
}

impl OrmConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Sets both page-size bounds, keeping the default within the maximum.
    pub fn with_page_sizes(mut self, default_size: u32, max_size: u32) -> Self {
        let max_size = max_size.max(1);
        self.max_page_size = max_size;
        self.default_page_size = default_size.clamp(1, max_size);
        self
    }

    /// Normalizes a requested page size against this configuration.
    ///
    /// `0` falls back to the default size; larger values clamp to the max.
    pub fn normalize_page_size(&self, requested: u32) -> u32 {
        match requested {
            0 => self.default_page_size,
            value if value > self.max_page_size => self.max_page_size,
            value => value,
        }
    }
}
