//!
//! Notification channel client feeding the high-water mark tracker.
//!
//! The client owns the only connection to the index's height channel. It keeps the subscription
//! alive for the lifetime of the process: every dropped connection is retried with exponential
//! backoff, without limit, since a tracker that stops receiving heights makes every later wait
//! time out. A subscription that stays silent longer than the idle timeout is dropped and
//! reopened, which catches half-open connections the transport never reports. Only local
//! configuration errors end the loop.

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::source::{HeightSource, HeightStream};
use super::types::*;
use crate::tracker::HighWaterMarkTracker;

/// How a live subscription ended.
enum ListenOutcome {
	/// The connection delivered at least one height before dropping.
	Delivered(ChannelError),
	/// The connection dropped before anything useful arrived.
	Idle(ChannelError),
}

/// Bridges a [`HeightSource`] to a [`HighWaterMarkTracker`].
pub struct NotificationChannelClient<S> {
	source: Arc<S>,
	tracker: Arc<HighWaterMarkTracker>,
	reconnect: ReconnectConfig,
	state: watch::Sender<ConnectionState>,
}

impl<S: HeightSource + 'static> NotificationChannelClient<S> {
	/// Create a client. Nothing connects until [`run`](Self::run) or [`spawn`](Self::spawn).
	pub fn new(
		source: Arc<S>,
		tracker: Arc<HighWaterMarkTracker>,
		reconnect: ReconnectConfig,
	) -> Self {
		let (state, _) = watch::channel(ConnectionState::Disconnected);
		Self {
			source,
			tracker,
			reconnect,
			state,
		}
	}

	/// Observe connection state transitions.
	pub fn state(&self) -> watch::Receiver<ConnectionState> {
		self.state.subscribe()
	}

	pub fn tracker(&self) -> &Arc<HighWaterMarkTracker> {
		&self.tracker
	}

	fn set_state(&self, state: ConnectionState) {
		self.state.send_replace(state);
	}

	/// Run the client on a background task.
	///
	/// The task only finishes with a fatal error; abort the handle to stop it.
	pub fn spawn(self) -> JoinHandle<Result<(), ChannelError>> {
		tokio::spawn(async move { self.run().await })
	}

	/// Keep the height channel connected and forward every height to the tracker.
	///
	/// Returns only when a fatal (configuration) error makes reconnecting pointless.
	pub async fn run(&self) -> Result<(), ChannelError> {
		let mut backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.reconnect.initial_interval)
			.with_max_interval(self.reconnect.max_interval)
			.with_multiplier(self.reconnect.multiplier)
			.with_max_elapsed_time(None)
			.build();

		info!("Starting notification channel client for {}", self.source.name());

		loop {
			self.set_state(ConnectionState::Connecting);

			let error = match self.source.subscribe().await {
				Ok(stream) => {
					self.set_state(ConnectionState::Listening);
					info!("Listening for index heights on {}", self.source.name());
					self.refresh().await;

					match self.listen(stream).await {
						ListenOutcome::Delivered(e) => {
							backoff.reset();
							e
						}
						ListenOutcome::Idle(e) => e,
					}
				}
				Err(e) if e.is_fatal() => {
					error!("Fatal notification channel error: {}", e);
					self.set_state(ConnectionState::Disconnected);
					return Err(e);
				}
				Err(e) => e,
			};

			self.set_state(ConnectionState::Disconnected);

			// max_elapsed_time is unset, so next_backoff always yields an interval
			let delay = backoff
				.next_backoff()
				.unwrap_or(self.reconnect.max_interval);
			warn!(
				"Notification channel disconnected ({}), reconnecting in {:?}",
				error, delay
			);
			tokio::time::sleep(delay).await;
		}
	}

	/// Query the index for heights published while no subscription was live.
	async fn refresh(&self) {
		match self.source.latest_height().await {
			Ok(Some(height)) => {
				debug!("Index reports height {} after connect", height);
				self.tracker.observe(height);
			}
			Ok(None) => {}
			Err(e) => warn!("Failed to query latest index height: {}", e),
		}
	}

	/// Forward notifications until the connection drops or goes silent for `idle_timeout`.
	async fn listen(&self, mut stream: HeightStream) -> ListenOutcome {
		let idle_timeout = self.reconnect.idle_timeout;
		let mut delivered = false;
		let mut last_event_time = tokio::time::Instant::now();

		loop {
			let timeout = tokio::time::sleep_until(last_event_time + idle_timeout);
			tokio::pin!(timeout);

			tokio::select! {
				item = stream.next() => {
					last_event_time = tokio::time::Instant::now();
					match item {
						Some(Ok(Notification::Height(height))) => {
							delivered = true;
							debug!("Received height notification {}", height);
							self.tracker.observe(height);
						}
						Some(Ok(Notification::KeepAlive)) => {
							trace!("Notification channel keepalive");
						}
						Some(Err(e)) if e.is_message_error() => {
							warn!("Skipping malformed height notification: {}", e);
						}
						Some(Err(e)) => {
							error!("Error on notification channel: {}", e);
							return Self::outcome(delivered, e);
						}
						None => return Self::outcome(delivered, ChannelError::Closed),
					}
				}
				_ = &mut timeout => {
					warn!(
						"No traffic on notification channel for {:?}, dropping connection",
						idle_timeout
					);
					return Self::outcome(delivered, ChannelError::IdleTimeout(idle_timeout));
				}
			}
		}
	}

	fn outcome(delivered: bool, error: ChannelError) -> ListenOutcome {
		if delivered {
			ListenOutcome::Delivered(error)
		} else {
			ListenOutcome::Idle(error)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::{SyncConfig, Watcher};
	use serde_json::json;
	use std::collections::VecDeque;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;
	use tokio::sync::mpsc;

	/// What the fake index does on the next subscribe call.
	enum Connect {
		Accept(mpsc::UnboundedReceiver<Result<Notification, ChannelError>>),
		/// Accepts the subscription and then never says anything again.
		Silent,
		Refuse,
		Misconfigured,
	}

	/// In-memory height source scripted by the test.
	struct FakeHeightSource {
		script: Mutex<VecDeque<Connect>>,
		latest: Mutex<Option<u64>>,
		subscribes: AtomicUsize,
	}

	impl FakeHeightSource {
		fn new(script: Vec<Connect>) -> Self {
			Self {
				script: Mutex::new(script.into()),
				latest: Mutex::new(None),
				subscribes: AtomicUsize::new(0),
			}
		}

		fn set_latest(&self, height: u64) {
			*self.latest.lock().unwrap() = Some(height);
		}
	}

	#[async_trait::async_trait]
	impl HeightSource for FakeHeightSource {
		async fn subscribe(&self) -> Result<HeightStream, ChannelError> {
			self.subscribes.fetch_add(1, Ordering::SeqCst);
			let next = self.script.lock().unwrap().pop_front();
			match next {
				Some(Connect::Accept(rx)) => Ok(Box::pin(futures::stream::unfold(
					rx,
					|mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
				))),
				Some(Connect::Silent) => Ok(Box::pin(futures::stream::pending::<
					Result<Notification, ChannelError>,
				>())),
				Some(Connect::Misconfigured) => {
					Err(ChannelError::ConfigurationError("bad channel name".to_string()))
				}
				Some(Connect::Refuse) | None => {
					Err(ChannelError::ProtocolError("connection refused".to_string()))
				}
			}
		}

		async fn latest_height(&self) -> Result<Option<u64>, ChannelError> {
			Ok(*self.latest.lock().unwrap())
		}

		fn name(&self) -> &str {
			"fake"
		}
	}

	fn fast_reconnect() -> ReconnectConfig {
		ReconnectConfig {
			initial_interval: Duration::from_millis(10),
			max_interval: Duration::from_millis(40),
			multiplier: 2.0,
			idle_timeout: Duration::from_secs(1),
		}
	}

	async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
		rx.wait_for(|current| *current == state).await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_forwards_heights_to_tracker() {
		let (tx, rx) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![Connect::Accept(rx)]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source, tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();

		wait_for_state(&mut state, ConnectionState::Listening).await;
		tx.send(Ok(Notification::Height(3))).unwrap();
		tx.send(Ok(Notification::Height(9))).unwrap();
		tx.send(Err(ChannelError::PayloadError("garbage".to_string()))).unwrap();
		tx.send(Ok(Notification::Height(4))).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;

		assert_eq!(tracker.current_high_water(), 9);
		assert_eq!(*state.borrow(), ConnectionState::Listening);
		handle.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn test_retries_until_connected() {
		let (tx, rx) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![
			Connect::Refuse,
			Connect::Refuse,
			Connect::Refuse,
			Connect::Accept(rx),
		]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source.clone(), tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();

		wait_for_state(&mut state, ConnectionState::Listening).await;
		assert_eq!(source.subscribes.load(Ordering::SeqCst), 4);

		tx.send(Ok(Notification::Height(2))).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert_eq!(tracker.current_high_water(), 2);
		handle.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn test_fatal_error_stops_client() {
		let source = Arc::new(FakeHeightSource::new(vec![Connect::Refuse, Connect::Misconfigured]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source.clone(), tracker, fast_reconnect());
		let state = client.state();

		let err = client.run().await.unwrap_err();
		assert!(err.is_fatal());
		assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);
		assert_eq!(*state.borrow(), ConnectionState::Disconnected);
	}

	#[tokio::test(start_paused = true)]
	async fn test_refreshes_height_after_reconnect() {
		let (tx1, rx1) = mpsc::unbounded_channel();
		let (_tx2, rx2) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![Connect::Accept(rx1), Connect::Accept(rx2)]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source.clone(), tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();

		wait_for_state(&mut state, ConnectionState::Listening).await;
		tx1.send(Ok(Notification::Height(5))).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;

		// The index moves on while the channel is down
		source.set_latest(8);
		drop(tx1);
		wait_for_state(&mut state, ConnectionState::Disconnected).await;
		wait_for_state(&mut state, ConnectionState::Listening).await;
		tokio::time::sleep(Duration::from_millis(1)).await;

		assert_eq!(tracker.current_high_water(), 8);
		handle.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_survives_disconnect() {
		let (tx1, rx1) = mpsc::unbounded_channel();
		let (tx2, rx2) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![
			Connect::Accept(rx1),
			Connect::Refuse,
			Connect::Accept(rx2),
		]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source, tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();
		wait_for_state(&mut state, ConnectionState::Listening).await;

		let watcher = Watcher::new(tracker.clone(), SyncConfig::with_max_wait(Duration::from_secs(2)));
		watcher.update(json!({ "height": 12 }));
		let waiting = tokio::spawn(watcher.wait());

		tx1.send(Ok(Notification::Height(7))).unwrap();
		tx1.send(Err(ChannelError::Closed)).unwrap();
		wait_for_state(&mut state, ConnectionState::Disconnected).await;
		wait_for_state(&mut state, ConnectionState::Listening).await;
		assert!(!waiting.is_finished());

		tx2.send(Ok(Notification::Height(12))).unwrap();
		let result = waiting.await.unwrap().unwrap();
		assert_eq!(result, json!({ "height": 12 }));
		assert_eq!(tracker.current_high_water(), 12);
		handle.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn test_silent_connection_is_reopened() {
		let (tx, rx) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![Connect::Silent, Connect::Accept(rx)]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source.clone(), tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();

		wait_for_state(&mut state, ConnectionState::Listening).await;
		assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);

		// Nothing arrives on the first connection, so the idle timeout has to notice
		wait_for_state(&mut state, ConnectionState::Disconnected).await;
		wait_for_state(&mut state, ConnectionState::Listening).await;
		assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);

		tx.send(Ok(Notification::Height(6))).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert_eq!(tracker.current_high_water(), 6);
		handle.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn test_keepalives_hold_connection_open() {
		let (tx, rx) = mpsc::unbounded_channel();
		let source = Arc::new(FakeHeightSource::new(vec![Connect::Accept(rx)]));
		let tracker = Arc::new(HighWaterMarkTracker::new());
		let client = NotificationChannelClient::new(source.clone(), tracker.clone(), fast_reconnect());
		let mut state = client.state();
		let handle = client.spawn();
		wait_for_state(&mut state, ConnectionState::Listening).await;

		// Five idle windows pass, but never one without traffic
		for _ in 0..10 {
			tokio::time::sleep(Duration::from_millis(500)).await;
			tx.send(Ok(Notification::KeepAlive)).unwrap();
		}
		tx.send(Ok(Notification::Height(4))).unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;

		assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
		assert_eq!(*state.borrow(), ConnectionState::Listening);
		assert_eq!(tracker.current_high_water(), 4);
		handle.abort();
	}
}
