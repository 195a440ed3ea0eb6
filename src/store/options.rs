#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use tracing::warn;

/// Disables the commit timeout when set to any value.
pub const ENV_NO_TIMEOUT: &str = "ATOMIC_STORE_NO_TIMEOUT";
/// Overrides the commit timeout, in milliseconds.
pub const ENV_COMMIT_TIMEOUT_MS: &str = "ATOMIC_STORE_COMMIT_TIMEOUT_MS";
/// Overrides the durability mode (`full`, `normal` or `off`).
pub const ENV_SYNCHRONOUS: &str = "ATOMIC_STORE_SYNCHRONOUS";

/// Durability mode for log appends.
///
/// Controls when appended records are synchronized to disk. The root metadata
/// swap is synced in every mode except [`Synchronous::Off`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Sync after every append (most durable).
    #[default]
    Full,
    /// Sync every touched log once at commit, before the root swap.
    Normal,
    /// No explicit syncs (fastest; for tests and benchmarks).
    Off,
}

impl Synchronous {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a mode from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Configuration for an [`AtomicStore`](crate::AtomicStore).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long `begin` waits for another commit to finish.
    pub commit_timeout: Duration,
    /// When appended records are synced to disk.
    pub synchronous: Synchronous,
    /// Archived root metadata files kept after each commit.
    pub retained_root_archives: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_millis(100),
            synchronous: Synchronous::Full,
            retained_root_archives: 4,
        }
    }
}

impl StoreOptions {
    /// Defaults overlaid with `ATOMIC_STORE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_COMMIT_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.commit_timeout = Duration::from_millis(ms),
                Err(_) => warn!(value = %raw, "options.commit_timeout.unparsable"),
            }
        }
        if lookup(ENV_NO_TIMEOUT).is_some() {
            self.commit_timeout = Duration::MAX;
        }
        if let Some(raw) = lookup(ENV_SYNCHRONOUS) {
            match Synchronous::from_str(raw.trim()) {
                Some(mode) => self.synchronous = mode,
                None => warn!(value = %raw, "options.synchronous.unparsable"),
            }
        }
        self
    }
}
