//!
//! Sources of index height notifications.
//!
//! `HeightSource` is the seam between the notification channel client and whatever transport the
//! index publishes on. `WebSocketHeightSource` speaks the `graphql-transport-ws` protocol to the
//! index for the live channel and answers freshness queries over plain GraphQL HTTP.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{
	connect_async,
	tungstenite::{self, Message, client::IntoClientRequest},
};
use tracing::{debug, info, trace};

use super::types::*;
use crate::height::Height;

/// Stream of notifications from the index. Ends when the channel closes.
pub type HeightStream = Pin<Box<dyn Stream<Item = Result<Notification, ChannelError>> + Send>>;

/// How often a live subscription pings the index unless told otherwise.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Transport over which the index announces newly materialized heights.
#[async_trait::async_trait]
pub trait HeightSource: Send + Sync {
	/// Open a live subscription to the height channel.
	async fn subscribe(&self) -> Result<HeightStream, ChannelError>;

	/// Ask the index directly for its current height.
	///
	/// Used after every (re)connect to cover notifications published while disconnected. Sources
	/// without a query interface return `Ok(None)`.
	async fn latest_height(&self) -> Result<Option<Height>, ChannelError> {
		Ok(None)
	}

	/// Name of this source for logging.
	fn name(&self) -> &str;
}

/// Height source backed by the index GraphQL API
#[derive(Clone)]
pub struct WebSocketHeightSource {
	/// HTTP client for freshness queries.
	http_client: Client,
	/// GraphQL HTTP endpoint, if the index exposes one.
	http_url: Option<String>,
	/// WebSocket endpoint for the live channel.
	ws_url: String,
	/// Channel (subscription field) carrying heights.
	channel: String,
	/// Interval between client pings on a live subscription.
	keepalive: Duration,
}

impl WebSocketHeightSource {
	/// Create a new source.
	///
	/// # Arguments
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	/// * `http_url` - Optional HTTP endpoint used for freshness queries.
	/// * `channel` - Name of the height channel.
	///
	/// # Errors
	/// Returns `ChannelError::ConfigurationError` if the HTTP client cannot be built.
	pub fn new(
		ws_url: String,
		http_url: Option<String>,
		channel: String,
	) -> Result<Self, ChannelError> {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| {
				ChannelError::ConfigurationError(format!("failed to create HTTP client: {}", e))
			})?;

		Ok(Self {
			http_client,
			http_url,
			ws_url,
			channel,
			keepalive: DEFAULT_KEEPALIVE_INTERVAL,
		})
	}

	/// Ping the index this often so that silent connections still produce traffic.
	pub fn with_keepalive(mut self, interval: Duration) -> Self {
		self.keepalive = interval.max(MIN_KEEPALIVE_INTERVAL);
		self
	}

	pub fn channel(&self) -> &str {
		&self.channel
	}

	pub fn keepalive(&self) -> Duration {
		self.keepalive
	}

	/// Execute a GraphQL query against the HTTP endpoint.
	///
	/// # Returns
	/// The JSON response from the index, or a `ChannelError` if the request fails.
	async fn execute_query(&self, url: &str, query: &str) -> Result<Value, ChannelError> {
		let request_body = json!({
			"query": query,
			"variables": Value::Null
		});

		let response = self
			.http_client
			.post(url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ChannelError::ProtocolError(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let response_json: Value = response.json().await?;

		if let Some(errors) = response_json.get("errors") {
			return Err(ChannelError::ProtocolError(format!(
				"GraphQL errors: {}",
				errors
			)));
		}

		Ok(response_json)
	}
}

#[async_trait::async_trait]
impl HeightSource for WebSocketHeightSource {
	async fn subscribe(&self) -> Result<HeightStream, ChannelError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		// An unusable URL will never start working, so it is a configuration error
		let mut request = self.ws_url.clone().into_client_request().map_err(|e| {
			ChannelError::ConfigurationError(format!("invalid WebSocket URL {}: {}", self.ws_url, e))
		})?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				ChannelError::ConfigurationError(
					"Invalid WebSocket subprotocol header value".to_string(),
				)
			})?,
		);

		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		// Send connection init
		let init_message = json!({
			"type": "connection_init"
		});
		ws_sender
			.send(Message::Text(init_message.to_string()))
			.await?;

		// Wait for connection ack
		match ws_receiver.next().await {
			Some(msg) => match msg? {
				Message::Text(text) => {
					let parsed: Value = serde_json::from_str(&text)?;
					if parsed.get("type").and_then(|t| t.as_str()) != Some("connection_ack") {
						return Err(ChannelError::ProtocolError(
							"Connection not acknowledged".to_string(),
						));
					}
				}
				_ => {
					return Err(ChannelError::ProtocolError(
						"Unexpected message type during handshake".to_string(),
					));
				}
			},
			None => return Err(ChannelError::Closed),
		}

		let subscription_query = format!("subscription HeightChannel {{ {} }}", self.channel);
		let start_message = json!({
			"id": format!("{}-channel", self.channel),
			"type": "subscribe",
			"payload": {
				"query": subscription_query
			}
		});

		ws_sender
			.send(Message::Text(start_message.to_string()))
			.await?;

		info!("Subscribed to index channel '{}'", self.channel);

		Ok(live_stream(
			ws_sender,
			ws_receiver,
			self.channel.clone(),
			self.keepalive,
		))
	}

	async fn latest_height(&self) -> Result<Option<Height>, ChannelError> {
		let Some(url) = self.http_url.as_deref() else {
			return Ok(None);
		};

		let query = format!("query LatestHeight {{ {} }}", self.channel);
		let response = self.execute_query(url, &query).await?;

		let height = response
			.get("data")
			.and_then(|data| data.get(&self.channel))
			.ok_or_else(|| {
				ChannelError::ProtocolError("No data returned for height query".to_string())
			})?;

		match height {
			Value::Null => Ok(None),
			value => decode_height(value.clone()).map(Some),
		}
	}

	fn name(&self) -> &str {
		&self.ws_url
	}
}

/// A live subscription. The sink stays open so pings can be answered and sent.
struct LiveChannel<Tx, Rx> {
	sender: Tx,
	receiver: Rx,
	keepalive: Interval,
	channel: String,
}

impl<Tx, Rx> LiveChannel<Tx, Rx>
where
	Tx: Sink<Message, Error = tungstenite::Error> + Unpin,
	Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
	async fn send(&mut self, message: Value) -> Result<(), ChannelError> {
		self.sender.send(Message::Text(message.to_string())).await?;
		Ok(())
	}

	async fn next_notification(&mut self) -> Option<Result<Notification, ChannelError>> {
		loop {
			let msg = tokio::select! {
				msg = self.receiver.next() => msg?,
				_ = self.keepalive.tick() => {
					trace!("Pinging index on '{}'", self.channel);
					if let Err(e) = self.send(json!({ "type": "ping" })).await {
						return Some(Err(e));
					}
					continue;
				}
			};

			match msg {
				Ok(Message::Text(text)) => match decode_message(&self.channel, &text) {
					Some(Ok(Frame::Ping)) => {
						if let Err(e) = self.send(json!({ "type": "pong" })).await {
							return Some(Err(e));
						}
						return Some(Ok(Notification::KeepAlive));
					}
					Some(Ok(Frame::Notification(notification))) => return Some(Ok(notification)),
					Some(Err(e)) => return Some(Err(e)),
					None => {}
				},
				Ok(Message::Close(frame)) => {
					debug!("Index closed the channel: {:?}", frame);
					return Some(Err(ChannelError::Closed));
				}
				// Transport pings are answered by tungstenite on the next write
				Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
					return Some(Ok(Notification::KeepAlive));
				}
				Ok(_) => {}
				Err(e) => return Some(Err(ChannelError::WebSocketError(e))),
			}
		}
	}
}

/// Turn an acknowledged subscription into a notification stream that keeps the connection alive.
fn live_stream<Tx, Rx>(sender: Tx, receiver: Rx, channel: String, keepalive: Duration) -> HeightStream
where
	Tx: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
	Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
	let mut interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let live = LiveChannel {
		sender,
		receiver,
		keepalive: interval,
		channel,
	};

	Box::pin(futures_util::stream::unfold(live, |mut live| async move {
		let item = live.next_notification().await?;
		Some((item, live))
	}))
}

/// A decoded `graphql-transport-ws` frame.
#[derive(Debug, PartialEq)]
enum Frame {
	Notification(Notification),
	/// The index expects a `pong`
	Ping,
}

/// Decode one `graphql-transport-ws` text frame.
///
/// Returns `None` for frames that carry nothing for the client.
fn decode_message(channel: &str, text: &str) -> Option<Result<Frame, ChannelError>> {
	let parsed: Value = match serde_json::from_str(text) {
		Ok(parsed) => parsed,
		Err(e) => return Some(Err(ChannelError::PayloadError(e.to_string()))),
	};

	let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str()) else {
		return Some(Err(ChannelError::PayloadError(
			"Message missing type field".to_string(),
		)));
	};

	match msg_type {
		"next" => match parsed
			.get("payload")
			.and_then(|p| p.get("data"))
			.and_then(|d| d.get(channel))
		{
			Some(payload) => {
				debug!("Height notification: {}", payload);
				let height = match payload {
					Value::String(text) => parse_notification(text),
					other => decode_height(other.clone()),
				};
				Some(height.map(|h| Frame::Notification(Notification::Height(h))))
			}
			None => Some(Err(ChannelError::PayloadError(format!(
				"notification without '{}' data: {}",
				channel, parsed
			)))),
		},
		"error" => {
			let error_msg = parsed
				.get("payload")
				.and_then(|p| p.as_array().and_then(|a| a.first()).or(Some(p)))
				.and_then(|p| p.get("message"))
				.and_then(|m| m.as_str())
				.unwrap_or("Unknown subscription error");
			Some(Err(ChannelError::ProtocolError(error_msg.to_string())))
		}
		"complete" => {
			info!("Index completed the '{}' subscription", channel);
			Some(Err(ChannelError::Closed))
		}
		"ping" => Some(Ok(Frame::Ping)),
		"pong" | "ka" => Some(Ok(Frame::Notification(Notification::KeepAlive))),
		_ => {
			debug!("Ignoring message type: {}", msg_type);
			None
		}
	}
}
