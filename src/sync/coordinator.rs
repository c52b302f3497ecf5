//! Coordinator facade tying ledger calls to a watcher.
//!
//! `SyncCoordinator::run` expresses "issue these ledger calls, then make sure the index has caught
//! up" as a single unit. The unit of work receives a `SyncedLedger`, a ledger client whose results
//! are intercepted by a fresh `Watcher`; once the unit of work succeeds, the coordinator waits for
//! the index before handing back the unit of work's own value.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::types::{CoordinatorError, SyncConfig};
use super::watcher::{Recorder, Watcher};
use crate::height::Height;
use crate::tracker::HighWaterMarkTracker;

/// Call primitive of the ledger. Transport and argument encoding are up to the implementer.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
	type Error: std::error::Error + Send + Sync + 'static;

	/// Submit a state-changing call and return its raw result.
	async fn call(&self, method: &str, args: Value) -> Result<Value, Self::Error>;
}

/// Ledger client whose results pass through a watcher.
pub struct SyncedLedger<L> {
	inner: Arc<L>,
	recorder: Recorder<Value>,
}

impl<L> Clone for SyncedLedger<L> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
			recorder: self.recorder.clone(),
		}
	}
}

impl<L: Ledger> SyncedLedger<L> {
	/// Submit a call; its height, if any, becomes part of the watcher's target.
	pub async fn call(&self, method: &str, args: Value) -> Result<Value, L::Error> {
		let result = self.inner.call(method, args).await?;
		Ok(self.recorder.update(result))
	}

	/// Highest height produced by calls made through this client so far.
	pub fn target(&self) -> Option<Height> {
		self.recorder.target()
	}

	/// The uninstrumented ledger client.
	pub fn inner(&self) -> &L {
		&self.inner
	}
}

/// Runs units of work against the ledger and synchronizes with the index afterwards.
pub struct SyncCoordinator<L> {
	ledger: Arc<L>,
	tracker: Arc<HighWaterMarkTracker>,
	config: SyncConfig,
}

impl<L> Clone for SyncCoordinator<L> {
	fn clone(&self) -> Self {
		Self {
			ledger: self.ledger.clone(),
			tracker: self.tracker.clone(),
			config: self.config,
		}
	}
}

impl<L: Ledger> SyncCoordinator<L> {
	pub fn new(ledger: Arc<L>, tracker: Arc<HighWaterMarkTracker>, config: SyncConfig) -> Self {
		Self {
			ledger,
			tracker,
			config,
		}
	}

	/// A fresh watcher bound to this coordinator's tracker and policy.
	pub fn watcher(&self) -> Watcher<Value> {
		Watcher::new(self.tracker.clone(), self.config)
	}

	pub fn tracker(&self) -> &Arc<HighWaterMarkTracker> {
		&self.tracker
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	/// Run `unit_of_work` and wait until the index reflects every call it made.
	///
	/// Errors from the unit of work are returned as [`CoordinatorError::Operation`] without
	/// waiting. A unit of work that made no call carrying a height fails with
	/// [`SyncError::NoHeightCaptured`](super::SyncError::NoHeightCaptured).
	pub async fn run<F, Fut, T, E>(&self, unit_of_work: F) -> Result<T, CoordinatorError<E>>
	where
		F: FnOnce(SyncedLedger<L>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let watcher = self.watcher();
		let ledger = SyncedLedger {
			inner: self.ledger.clone(),
			recorder: watcher.recorder(),
		};

		let value = unit_of_work(ledger)
			.await
			.map_err(CoordinatorError::Operation)?;

		debug!(
			"Unit of work finished, synchronizing index to {:?}",
			watcher.target()
		);
		watcher.wait().await?;
		Ok(value)
	}
}
