//! Single-socket WebSocket channel client: connect, join, heartbeat,
//! reconnect with backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rc_diagnostics::Diagnostics;
use rc_wire::{events, Message, ReplyStatus, WireCodec};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::backoff::Backoff;
use crate::state::ChannelState;
use crate::TransportError;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Static connection parameters for one [`ChannelClient`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub heartbeat_interval: Duration,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl ChannelConfig {
    /// A config with the default 30s heartbeat and 1s/60s backoff bounds.
    #[must_use]
    pub fn new(url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: topic.into(),
            headers: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Override the default heartbeat interval and backoff bounds.
    #[must_use]
    pub fn with_timing(mut self, heartbeat_interval: Duration, backoff_initial_ms: u64, backoff_max_ms: u64) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.backoff_initial_ms = backoff_initial_ms;
        self.backoff_max_ms = backoff_max_ms;
        self
    }
}

fn state_to_u8(state: ChannelState) -> u8 {
    match state {
        ChannelState::Idle => 0,
        ChannelState::Connecting => 1,
        ChannelState::OpenUnjoined => 2,
        ChannelState::Joined => 3,
        ChannelState::Closing => 4,
        ChannelState::Backoff => 5,
    }
}

fn u8_to_state(v: u8) -> ChannelState {
    match v {
        1 => ChannelState::Connecting,
        2 => ChannelState::OpenUnjoined,
        3 => ChannelState::Joined,
        4 => ChannelState::Closing,
        5 => ChannelState::Backoff,
        _ => ChannelState::Idle,
    }
}

/// A single WebSocket channel: owns its socket, heartbeat, and
/// reconnect loop. External callers interact only through `connect`,
/// `send`, and `disconnect`; inbound application messages arrive on the
/// receiver returned by [`ChannelClient::new`].
pub struct ChannelClient {
    config: ChannelConfig,
    state: AtomicU8,
    join_ref: Mutex<String>,
    next_ref: AtomicU64,
    should_reconnect: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    diagnostics: Arc<Diagnostics>,
    wire: WireCodec,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelClient {
    /// Construct a new client and its inbound message queue. Call
    /// [`Self::connect`] to actually open the socket.
    #[must_use]
    pub fn new(config: ChannelConfig, diagnostics: Arc<Diagnostics>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            config,
            state: AtomicU8::new(state_to_u8(ChannelState::Idle)),
            join_ref: Mutex::new(String::new()),
            next_ref: AtomicU64::new(1),
            should_reconnect: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            diagnostics,
            wire: WireCodec::new(),
            task: Mutex::new(None),
        });

        client.connect(inbound_tx);
        (client, inbound_rx)
    }

    fn state(&self) -> ChannelState {
        u8_to_state(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    /// Current connection state.
    #[must_use]
    pub fn current_state(&self) -> ChannelState {
        self.state()
    }

    /// Begin the connect/join/heartbeat/reconnect loop on a background
    /// task. Calling this more than once before a `disconnect` has no
    /// additional effect.
    fn connect(self: &Arc<Self>, inbound_tx: mpsc::UnboundedSender<Message>) {
        if self.should_reconnect.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(outbound_rx) = self.outbound_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() else {
            return;
        };

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_reconnect_loop(inbound_tx, outbound_rx).await;
        });
        *self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    async fn run_reconnect_loop(
        self: Arc<Self>,
        inbound_tx: mpsc::UnboundedSender<Message>,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let mut backoff = Backoff::with_bounds(self.config.backoff_initial_ms, self.config.backoff_max_ms);

        loop {
            if !self.should_reconnect.load(Ordering::Acquire) {
                self.set_state(ChannelState::Idle);
                return;
            }

            self.set_state(ChannelState::Connecting);
            match self.connect_once().await {
                Ok(stream) => {
                    backoff.reset();
                    self.diagnostics.record_connection_start();
                    self.set_state(ChannelState::OpenUnjoined);

                    let join_denied = self.run_joined_session(stream, &inbound_tx, &mut outbound_rx).await;
                    self.diagnostics.record_disconnect();
                    if join_denied {
                        self.should_reconnect.store(false, Ordering::Release);
                    }
                }
                Err(_) => {
                    self.diagnostics.record_network_error();
                }
            }

            if !self.should_reconnect.load(Ordering::Acquire) {
                self.set_state(ChannelState::Idle);
                return;
            }

            self.set_state(ChannelState::Backoff);
            self.diagnostics.record_reconnect_attempt();
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    async fn connect_once(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in &self.config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(stream)
    }

    /// Run one connected session: send `phx_join`, then select over the
    /// heartbeat timer, outbound queue, and inbound socket frames until
    /// the socket closes. Returns `true` if the join was explicitly
    /// denied (auto-reconnect should stop).
    async fn run_joined_session(
        &self,
        stream: WsStream,
        inbound_tx: &mpsc::UnboundedSender<Message>,
        outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> bool {
        let (mut write, mut read) = stream.split();
        let join_ref = self.fresh_ref();
        *self.join_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = join_ref.clone();

        let join_msg = Message::new(
            Some(join_ref.clone()),
            Some(join_ref),
            self.config.topic.clone(),
            events::PHX_JOIN,
            serde_json::json!({ "token": self.token() }),
        );
        if write.send(WsMessage::Text(self.wire.encode(&join_msg).into())).await.is_err() {
            self.diagnostics.record_network_error();
            return false;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = self.make_message(events::PHX_HEARTBEAT, serde_json::json!({}));
                    if write.send(WsMessage::Text(self.wire.encode(&hb).into())).await.is_ok() {
                        self.diagnostics.record_heartbeat_sent();
                    } else {
                        self.diagnostics.record_network_error();
                        return false;
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if write.send(WsMessage::Text(self.wire.encode(&msg).into())).await.is_err() {
                                self.diagnostics.record_network_error();
                                return false;
                            }
                        }
                        None => return false,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(msg) = self.wire.decode(&text) else {
                                tracing::debug!("dropping undecodable wire message");
                                continue;
                            };

                            if msg.event == events::PHX_REPLY && self.state() == ChannelState::OpenUnjoined {
                                match msg.reply_status() {
                                    Some(ReplyStatus::Ok) => {
                                        self.set_state(ChannelState::Joined);
                                        self.diagnostics.record_successful_reconnect();
                                    }
                                    Some(ReplyStatus::Error) | None => {
                                        return true;
                                    }
                                }
                                continue;
                            }

                            if inbound_tx.send(msg).is_err() {
                                return false;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return false;
                        }
                        Some(Err(_)) => {
                            self.diagnostics.record_network_error();
                            return false;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn token(&self) -> Option<&str> {
        self.config
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-device-token"))
            .map(|(_, v)| v.as_str())
    }

    fn fresh_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn make_message(&self, event: &str, payload: serde_json::Value) -> Message {
        let join_ref = self.join_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        Message::new(Some(join_ref), Some(self.fresh_ref()), self.config.topic.clone(), event, payload)
    }

    /// Send an application event. Silently dropped (but counted as a
    /// network error) if the socket is not `Joined` and this is not the
    /// `phx_join` message itself.
    pub fn send(&self, event: &str, payload: serde_json::Value) {
        if event != events::PHX_JOIN && !self.state().is_joined() {
            self.diagnostics.record_network_error();
            return;
        }
        let msg = self.make_message(event, payload);
        if self.outbound_tx.send(msg).is_err() {
            self.diagnostics.record_network_error();
        }
    }

    /// Close the socket with code 1000 and stop auto-reconnect.
    /// Idempotent.
    pub fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::Release);
        self.set_state(ChannelState::Closing);
        if let Some(handle) = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
        self.set_state(ChannelState::Idle);
    }
}
