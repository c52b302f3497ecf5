//!
//! Process configuration.
//!
//! Values come from environment variables. `Config::from_lookup` takes any lookup function so the
//! parsing can be exercised without touching the process environment.

use reqwest::Url;
use std::time::Duration;

use crate::notifier::{DEFAULT_HEIGHT_CHANNEL, ReconnectConfig};
use crate::sync::SyncConfig;

pub const ENV_WS_URL: &str = "INDEX_WS_URL";
pub const ENV_HTTP_URL: &str = "INDEX_HTTP_URL";
pub const ENV_CHANNEL: &str = "INDEX_HEIGHT_CHANNEL";
pub const ENV_MAX_WAIT_MS: &str = "SYNC_MAX_WAIT_MS";
pub const ENV_ERROR_ON_TIMEOUT: &str = "SYNC_ERROR_ON_TIMEOUT";
pub const ENV_IDLE_TIMEOUT_MS: &str = "INDEX_IDLE_TIMEOUT_MS";

/// Configuration errors. These are not retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("missing required setting {0}")]
	Missing(&'static str),

	#[error("invalid value for {name}: {reason}")]
	Invalid { name: &'static str, reason: String },
}

/// Everything needed to connect to the index and synchronize with it
#[derive(Debug, Clone)]
pub struct Config {
	/// WebSocket endpoint of the index notification channel.
	pub ws_url: String,
	/// GraphQL HTTP endpoint used for freshness queries after reconnects.
	pub http_url: Option<String>,
	/// Name of the height channel.
	pub channel: String,
	pub sync: SyncConfig,
	pub reconnect: ReconnectConfig,
}

impl Config {
	/// Load configuration from the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Load configuration from an arbitrary lookup.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |name: &'static str| {
			lookup(name)
				.map(|value| value.trim().to_string())
				.filter(|value| !value.is_empty())
		};

		let ws_url = get(ENV_WS_URL).ok_or(ConfigError::Missing(ENV_WS_URL))?;
		validate_url(ENV_WS_URL, &ws_url, &["ws", "wss"])?;

		let http_url = get(ENV_HTTP_URL);
		if let Some(url) = &http_url {
			validate_url(ENV_HTTP_URL, url, &["http", "https"])?;
		}

		let channel = get(ENV_CHANNEL).unwrap_or_else(|| DEFAULT_HEIGHT_CHANNEL.to_string());
		if !channel
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_')
		{
			return Err(ConfigError::Invalid {
				name: ENV_CHANNEL,
				reason: format!("'{}' is not a valid channel name", channel),
			});
		}

		let mut sync = SyncConfig::default();
		if let Some(millis) = get(ENV_MAX_WAIT_MS) {
			let millis = millis.parse::<u64>().map_err(|e| ConfigError::Invalid {
				name: ENV_MAX_WAIT_MS,
				reason: e.to_string(),
			})?;
			sync.max_wait = Duration::from_millis(millis);
		}
		if let Some(flag) = get(ENV_ERROR_ON_TIMEOUT) {
			sync.error_on_timeout = parse_bool(&flag).ok_or_else(|| ConfigError::Invalid {
				name: ENV_ERROR_ON_TIMEOUT,
				reason: format!("expected true or false, got '{}'", flag),
			})?;
		}

		let mut reconnect = ReconnectConfig::default();
		if let Some(millis) = get(ENV_IDLE_TIMEOUT_MS) {
			let millis = millis.parse::<u64>().map_err(|e| ConfigError::Invalid {
				name: ENV_IDLE_TIMEOUT_MS,
				reason: e.to_string(),
			})?;
			// A zero timeout would drop every connection as soon as it opens
			if millis == 0 {
				return Err(ConfigError::Invalid {
					name: ENV_IDLE_TIMEOUT_MS,
					reason: "must be greater than zero".to_string(),
				});
			}
			reconnect.idle_timeout = Duration::from_millis(millis);
		}

		Ok(Self {
			ws_url,
			http_url,
			channel,
			sync,
			reconnect,
		})
	}
}

fn validate_url(name: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
	let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
		name,
		reason: e.to_string(),
	})?;
	if !schemes.contains(&url.scheme()) {
		return Err(ConfigError::Invalid {
			name,
			reason: format!("unsupported scheme '{}'", url.scheme()),
		});
	}
	Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
	match value.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}
