//! WebSocket channel transport: connect, join, heartbeat, and
//! reconnect-with-backoff over a Phoenix-style topic protocol.

mod backoff;
mod client;
mod state;

pub use backoff::Backoff;
pub use client::{ChannelClient, ChannelConfig};
pub use state::ChannelState;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
}
