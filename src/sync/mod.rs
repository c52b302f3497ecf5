//! Read-After-Write Synchronization Module
//!
//! This module lets a caller submit state-changing ledger calls and then wait until the index has
//! materialized the height those calls produced, before reading from the index.
//!
//! - `watcher`: captures the maximum height of a sequence of results and waits on the tracker.
//! - `coordinator`: runs a unit of work through an intercepting ledger client and waits afterwards.
//! - `types`: timeout policy and the errors surfaced to callers.

/// Facade running units of work followed by an index wait
pub mod coordinator;
/// Synchronization policy and error types
pub mod types;
/// Per-unit-of-work height capture and wait
pub mod watcher;

pub use coordinator::{Ledger, SyncCoordinator, SyncedLedger};
pub use types::*;
pub use watcher::{Recorder, Watcher};
