use ledger_index_sync::config::Config;
use ledger_index_sync::notifier::{NotificationChannelClient, WebSocketHeightSource};
use ledger_index_sync::tracker::HighWaterMarkTracker;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting index height follower");

	let config = match Config::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	info!(
		"Following channel '{}' on {} (max wait {:?}, error on timeout: {})",
		config.channel, config.ws_url, config.sync.max_wait, config.sync.error_on_timeout
	);

	let source = match WebSocketHeightSource::new(
		config.ws_url.clone(),
		config.http_url.clone(),
		config.channel.clone(),
	) {
		// Ping often enough that a healthy index always answers within the idle timeout
		Ok(source) => Arc::new(source.with_keepalive(config.reconnect.idle_timeout / 3)),
		Err(e) => {
			error!("Failed to create height source: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let tracker = Arc::new(HighWaterMarkTracker::new());
	tracker.subscribe(|height| info!("Index materialized height {}", height));

	let client = NotificationChannelClient::new(source, tracker, config.reconnect);

	tokio::select! {
		result = client.run() => {
			// run() only returns on errors that retrying cannot fix
			if let Err(e) = result {
				error!("Notification channel stopped: {}", e);
			}
			ExitCode::FAILURE
		}
		_ = tokio::signal::ctrl_c() => {
			info!("Shutting down");
			ExitCode::SUCCESS
		}
	}
}
