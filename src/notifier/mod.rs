//! Index notification channel integration
//!
//! This module keeps the high-water mark tracker fed with the heights the index announces on its
//! notification channel. The index publishes a message on a named channel (`height` by default)
//! every time it commits new state.

/// Supervised client forwarding notifications to the tracker
mod client;
/// Height source trait and the WebSocket implementation
mod source;
/// Type definitions for channel payloads, state and errors
mod types;

pub use client::NotificationChannelClient;
pub use source::{DEFAULT_KEEPALIVE_INTERVAL, HeightSource, HeightStream, WebSocketHeightSource};
pub use types::*;
