//!
//! Per-unit-of-work watcher for read-after-write consistency.
//!
//! A `Watcher` sits in the result path of one or more ledger calls and remembers the highest height
//! any of them produced. `wait()` then suspends until the shared high-water mark reaches that
//! height or the configured deadline passes.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{SyncConfig, SyncError};
use crate::height::{Height, OperationResult};
use crate::tracker::{HighWaterMarkTracker, Subscription};

/// What a watcher has captured so far.
struct Captured<R> {
	target: Option<Height>,
	last: Option<R>,
}

/// Shared handle to a watcher's captured state.
///
/// Clones record into the same watcher, which lets a unit of work thread the interception hook
/// through as many calls as it needs.
pub struct Recorder<R> {
	captured: Arc<Mutex<Captured<R>>>,
}

impl<R> Clone for Recorder<R> {
	fn clone(&self) -> Self {
		Self {
			captured: self.captured.clone(),
		}
	}
}

impl<R: OperationResult + Clone> Recorder<R> {
	fn new() -> Self {
		Self {
			captured: Arc::new(Mutex::new(Captured {
				target: None,
				last: None,
			})),
		}
	}

	/// Record the height carried by `result` and hand the result back unchanged.
	pub fn update(&self, result: R) -> R {
		if let Some(height) = result.height() {
			let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
			if captured.target.is_none_or(|target| height > target) {
				debug!("Watcher target raised to {}", height);
				captured.target = Some(height);
			}
			captured.last = Some(result.clone());
		}
		result
	}

	/// Highest height captured so far.
	pub fn target(&self) -> Option<Height> {
		self.captured
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.target
	}

	fn snapshot(&self) -> Option<(Height, R)> {
		let captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
		match (captured.target, captured.last.as_ref()) {
			(Some(target), Some(last)) => Some((target, last.clone())),
			_ => None,
		}
	}
}

/// Removes a tracker listener when dropped, including when a `wait()` future is cancelled.
struct ListenerGuard<'a> {
	tracker: &'a HighWaterMarkTracker,
	subscription: Subscription,
}

impl Drop for ListenerGuard<'_> {
	fn drop(&mut self) {
		self.tracker.unsubscribe(self.subscription);
	}
}

/// Captures the maximum height of a sequence of operation results and waits for the index to
/// materialize it.
pub struct Watcher<R> {
	tracker: Arc<HighWaterMarkTracker>,
	config: SyncConfig,
	recorder: Recorder<R>,
}

impl<R: OperationResult + Clone> Watcher<R> {
	/// Create a watcher bound to a shared tracker.
	pub fn new(tracker: Arc<HighWaterMarkTracker>, config: SyncConfig) -> Self {
		Self {
			tracker,
			config,
			recorder: Recorder::new(),
		}
	}

	/// Pass-through hook for ledger call results. See [`Recorder::update`].
	pub fn update(&self, result: R) -> R {
		self.recorder.update(result)
	}

	/// Handle that records into this watcher.
	pub fn recorder(&self) -> Recorder<R> {
		self.recorder.clone()
	}

	/// Highest height captured so far.
	pub fn target(&self) -> Option<Height> {
		self.recorder.target()
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	/// Wait until the index has materialized the captured target height.
	///
	/// Resolves with the last captured result. Fails immediately with
	/// [`SyncError::NoHeightCaptured`] when nothing with a height went through `update`. When the
	/// deadline passes, fails with [`SyncError::Timeout`] or, under the permissive policy, resolves
	/// with the last captured result anyway.
	pub async fn wait(self) -> Result<R, SyncError> {
		let (target, result) = self.recorder.snapshot().ok_or(SyncError::NoHeightCaptured)?;
		let deadline = Instant::now() + self.config.max_wait;

		let mut high_water = self.tracker.current_high_water();
		if high_water >= target {
			debug!(
				"Index already at {} (target {}), no wait needed",
				high_water, target
			);
			return Ok(result);
		}

		let (tx, mut rx) = mpsc::unbounded_channel();
		let _listener = ListenerGuard {
			tracker: &self.tracker,
			subscription: self.tracker.subscribe(move |height| {
				let _ = tx.send(height);
			}),
		};
		// The mark may have moved between the first check and the subscription.
		high_water = high_water.max(self.tracker.current_high_water());

		debug!(
			"Waiting up to {:?} for index to reach {} (currently {})",
			self.config.max_wait, target, high_water
		);

		let timeout = tokio::time::sleep_until(deadline);
		tokio::pin!(timeout);

		loop {
			if high_water >= target {
				debug!("Index reached {} (target {})", high_water, target);
				return Ok(result);
			}

			tokio::select! {
				biased;
				Some(height) = rx.recv() => {
					high_water = high_water.max(height);
				}
				_ = &mut timeout => {
					let high_water = self.tracker.current_high_water();
					if high_water >= target {
						return Ok(result);
					}
					if self.config.error_on_timeout {
						return Err(SyncError::Timeout {
							target,
							high_water,
							max_wait: self.config.max_wait,
						});
					}
					warn!(
						"Index still at {} after {:?}, proceeding without reaching {}",
						high_water, self.config.max_wait, target
					);
					return Ok(result);
				}
			}
		}
	}
}
