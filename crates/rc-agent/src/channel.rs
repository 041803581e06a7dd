//! Seam between [`crate::session::SessionController`] and a concrete
//! channel transport. Production code wires in [`rc_transport::ChannelClient`];
//! integration tests substitute an in-process mock so the state machine
//! can be driven without a real network socket.

use std::sync::Arc;

use rc_diagnostics::Diagnostics;
use rc_transport::{ChannelClient, ChannelConfig, ChannelState};
use rc_wire::Message;
use tokio::sync::mpsc;

/// What `SessionController` needs from a joined (or joining) channel:
/// send an application event, read the connection state, and close it.
pub trait ChannelHandle: Send + Sync {
    fn send(&self, event: &str, payload: serde_json::Value);
    fn current_state(&self) -> ChannelState;
    fn disconnect(&self);
}

impl ChannelHandle for ChannelClient {
    fn send(&self, event: &str, payload: serde_json::Value) {
        ChannelClient::send(self, event, payload);
    }

    fn current_state(&self) -> ChannelState {
        ChannelClient::current_state(self)
    }

    fn disconnect(&self) {
        ChannelClient::disconnect(self);
    }
}

/// Constructs a channel and returns the handle `SessionController` sends
/// through plus the receiver its inbound application messages arrive on.
/// Production code points this at [`ChannelClient::new`]; tests supply a
/// factory backed by an in-process mock.
pub type ChannelFactory =
    Arc<dyn Fn(ChannelConfig, Arc<Diagnostics>) -> (Arc<dyn ChannelHandle>, mpsc::UnboundedReceiver<Message>) + Send + Sync>;

/// The production [`ChannelFactory`]: opens a real WebSocket via
/// [`ChannelClient`].
#[must_use]
pub fn real_channel_factory() -> ChannelFactory {
    Arc::new(|config, diagnostics| {
        let (client, rx) = ChannelClient::new(config, diagnostics);
        (client as Arc<dyn ChannelHandle>, rx)
    })
}
