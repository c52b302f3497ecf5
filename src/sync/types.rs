//! Types for read-after-write synchronization

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::height::Height;

/// Default upper bound on how long a watcher waits for the index.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(3);

/// Policy for waiting on the index to catch up with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Longest time a single `wait()` may suspend.
    #[serde(rename = "maxWaitTime", with = "duration_millis")]
    pub max_wait: Duration,
    /// Fail with [`SyncError::Timeout`] when the deadline passes. When `false`, the wait resolves
    /// with the last captured result and reads may observe stale data.
    #[serde(rename = "errorOnTimeout")]
    pub error_on_timeout: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            error_on_timeout: true,
        }
    }
}

impl SyncConfig {
    /// Strict policy with a custom deadline.
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            max_wait,
            ..Self::default()
        }
    }

    /// Resolve with possibly stale data instead of failing on timeout.
    pub fn permissive(mut self) -> Self {
        self.error_on_timeout = false;
        self
    }
}

mod duration_millis {
    use serde::ser::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis())
            .map_err(|_| S::Error::custom(format!("duration {:?} overflows u64 millis", value)))?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Errors surfaced to callers waiting for the index
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("wait called before any result with a height was observed")]
    NoHeightCaptured,

    #[error(
        "index did not reach height {target} within {max_wait:?} (high-water mark is {high_water})"
    )]
    Timeout {
        target: Height,
        high_water: Height,
        max_wait: Duration,
    },
}

/// Error returned by [`SyncCoordinator::run`](super::SyncCoordinator::run).
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError<E> {
    #[error("operation failed: {0}")]
    Operation(E),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
