//! Read-after-write consistency between a ledger and its asynchronously built index.
//!
//! Writes go to the ledger; reads come from an index that replays ledger state and lags behind by
//! an unbounded amount. This crate lets a caller submit ledger calls and then wait until the index
//! has materialized at least the height those calls produced:
//!
//! - [`height`] extracts the committed height from an operation result.
//! - [`tracker`] holds the index high-water mark.
//! - [`notifier`] keeps the tracker fed from the index notification channel.
//! - [`sync`] provides the per-unit-of-work `Watcher` and the `SyncCoordinator` facade.
//! - [`config`] loads endpoints and the timeout policy from the environment.

pub mod config;
pub mod height;
pub mod notifier;
pub mod sync;
pub mod tracker;

pub use height::{Height, OperationResult, extract_height};
pub use tracker::HighWaterMarkTracker;
