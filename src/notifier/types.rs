//! Types for the index height notification channel

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::height::{Height, height_value};

/// Name of the channel on which the index announces newly materialized heights.
pub const DEFAULT_HEIGHT_CHANNEL: &str = "height";

/// Connection lifecycle of the notification channel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No live subscription; a reconnect is pending
    Disconnected,
    /// Opening the subscription
    Connecting,
    /// Subscribed and forwarding notifications to the tracker
    Listening,
}

/// Something the index said on a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The index materialized this height
    Height(Height),
    /// Keepalive traffic proving the connection is still alive
    KeepAlive,
}

/// Reconnect and liveness policy of the notification channel client.
///
/// Retries never give up; the interval grows from `initial_interval` up to `max_interval` and
/// resets once a connection delivers a notification. A subscription that yields nothing at all,
/// keepalives included, for `idle_timeout` is treated as dead and reconnected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after a dropped connection.
    pub initial_interval: Duration,
    /// Upper bound for the delay.
    pub max_interval: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Longest silence tolerated on a live subscription.
    pub idle_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Object form of a notification payload. `_height` wins when both fields are present.
#[derive(Debug, Deserialize)]
struct TaggedPayload {
    #[serde(rename = "_height", default)]
    underscored: Option<Value>,
    #[serde(default)]
    height: Option<Value>,
}

/// Decode a notification payload into a height.
///
/// Observed encodings: a bare integer, a numeric string, or an object carrying `_height`.
pub fn parse_notification(payload: &str) -> Result<Height, ChannelError> {
    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        // Bare text payloads such as `12` with surrounding whitespace or a trailing newline
        Err(_) => Value::String(payload.trim().to_string()),
    };
    decode_height(value)
}

/// Decode an already parsed notification value into a height.
pub fn decode_height(value: Value) -> Result<Height, ChannelError> {
    let height = if value.is_object() {
        let tagged: TaggedPayload = serde_json::from_value(value.clone())?;
        tagged
            .underscored
            .as_ref()
            .and_then(height_value)
            .or_else(|| tagged.height.as_ref().and_then(height_value))
    } else {
        height_value(&value)
    };
    height.ok_or_else(|| {
        ChannelError::PayloadError(format!("no height in notification payload: {}", value))
    })
}

/// Error types for the notification channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed notification: {0}")]
    PayloadError(String),

    #[error("Channel closed by the index")]
    Closed,

    #[error("No traffic on the channel for {0:?}")]
    IdleTimeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl ChannelError {
    /// Local misconfiguration that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::ConfigurationError(_))
    }

    /// A single bad message that does not affect the connection.
    pub fn is_message_error(&self) -> bool {
        matches!(self, ChannelError::PayloadError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_raw_integer() {
        assert_eq!(parse_notification("12").unwrap(), 12);
        assert_eq!(parse_notification(" 12\n").unwrap(), 12);
    }

    #[test]
    fn test_parse_numeric_string() {
        assert_eq!(parse_notification("\"31\"").unwrap(), 31);
    }

    #[test]
    fn test_parse_tagged_payload() {
        assert_eq!(parse_notification(r#"{"_height": 44}"#).unwrap(), 44);
        assert_eq!(parse_notification(r#"{"_height": "45", "table": "contracts"}"#).unwrap(), 45);
        assert_eq!(decode_height(json!({ "height": 46 })).unwrap(), 46);
    }

    #[test]
    fn test_parse_payload_with_both_height_fields() {
        assert_eq!(parse_notification(r#"{"_height": 12, "height": 12}"#).unwrap(), 12);
        assert_eq!(parse_notification(r#"{"_height": 14, "height": 9}"#).unwrap(), 14);
        assert_eq!(parse_notification(r#"{"_height": null, "height": "7"}"#).unwrap(), 7);
        assert_eq!(parse_notification(r#"{"_height": "x", "height": 8}"#).unwrap(), 8);
    }

    #[test]
    fn test_reject_payload_without_height() {
        for payload in ["", "abc", "-3", r#"{"_height": null}"#, r#"{"other": 1}"#, "[1]"] {
            let err = parse_notification(payload).unwrap_err();
            assert!(err.is_message_error(), "{payload:?} gave {err:?}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_only_configuration_errors_are_fatal() {
        assert!(ChannelError::ConfigurationError("bad url".to_string()).is_fatal());
        assert!(!ChannelError::Closed.is_fatal());
        assert!(!ChannelError::IdleTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!ChannelError::ProtocolError("nack".to_string()).is_fatal());
    }
}
