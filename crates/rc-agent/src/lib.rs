//! Remote-control streaming agent: wires the capture/encode/buffer
//! pipeline (`rc-capture`, `rc-encode`, `rc-buffer`) to a two-channel
//! WebSocket session (`rc-transport`, `rc-wire`) and routes inbound
//! gestures through `rc-gesture`.
//!
//! This crate is both a library (so integration tests can drive
//! [`session::SessionController`] against mock channels and encoders)
//! and a binary (`src/main.rs`) that wires the real platform adapters.

pub mod channel;
pub mod config;
pub mod device;
pub mod permission;
pub mod session;

use rc_gesture::{GestureCommand, InputInjector};

/// Stand-in [`InputInjector`]: logs every mapped gesture instead of
/// dispatching it. Real dispatch is a platform-specific concern (an
/// accessibility-service or compositor-input binding) left to a
/// deployment's own adapter, the same way [`permission::AutoGrantPermissionProvider`]
/// stands in for a real permission prompt.
#[derive(Debug, Default)]
pub struct LoggingInputInjector;

impl InputInjector for LoggingInputInjector {
    fn inject(&self, command: GestureCommand) {
        tracing::info!(?command, "gesture injection requested (no platform adapter wired)");
    }
}
