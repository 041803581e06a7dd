//! `SessionController`: the two-channel session state machine described
//! in the design's C8. Owns the control channel for the lifetime of the
//! process, opens a fresh media channel and [`CaptureCoordinator`] per
//! streaming session, and routes inbound gestures through
//! [`rc_gesture::GestureMapper`] to the platform's [`InputInjector`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rc_buffer::FrameBuffer;
use rc_capture::{CaptureCoordinator, CaptureEvent, StreamProfile};
use rc_diagnostics::Diagnostics;
use rc_gesture::{Display, GestureCommand, GestureMapper, InputInjector, KeyAction, Rotation, Viewport};
use rc_transport::{ChannelConfig, ChannelState};
use rc_wire::{events, FrameEnvelope, Message};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::channel::{ChannelFactory, ChannelHandle};
use crate::permission::{PermissionOutcome, PermissionProvider};

/// Frames handed to the media channel per pump wake, bounding how long a
/// single wake can hold the buffer's lock-adjacent atomics busy.
const PUMP_MAX_BATCH: usize = 5;

/// How long `start_session` waits for the freshly opened media channel
/// to reach `Joined` before giving up. `phx_join` is a round trip over
/// the socket, so this is polled rather than assumed instantaneous.
const MEDIA_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const MEDIA_JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Poll `handle.current_state()` until it reports `Joined` or
/// [`MEDIA_JOIN_TIMEOUT`] elapses.
async fn wait_for_join(handle: &Arc<dyn ChannelHandle>) -> bool {
    let deadline = tokio::time::Instant::now() + MEDIA_JOIN_TIMEOUT;
    loop {
        if handle.current_state() == ChannelState::Joined {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(MEDIA_JOIN_POLL_INTERVAL).await;
    }
}

/// States of [`SessionController`]'s state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Standby,
    PermissionPending,
    Streaming,
    Teardown,
}

fn state_to_u8(state: ControllerState) -> u8 {
    match state {
        ControllerState::Standby => 0,
        ControllerState::PermissionPending => 1,
        ControllerState::Streaming => 2,
        ControllerState::Teardown => 3,
    }
}

fn u8_to_state(v: u8) -> ControllerState {
    match v {
        1 => ControllerState::PermissionPending,
        2 => ControllerState::Streaming,
        3 => ControllerState::Teardown,
        _ => ControllerState::Standby,
    }
}

struct MediaSession {
    handle: Arc<dyn ChannelHandle>,
    _media_rx: mpsc::UnboundedReceiver<Message>,
    capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    pump_task: JoinHandle<()>,
}

/// Owns the control channel, and (only while `Streaming`) a media
/// channel and the capture pipeline feeding it.
pub struct SessionController {
    device_id: String,
    device_token: Option<String>,
    backend_url: String,
    channel_factory: ChannelFactory,
    capture: Arc<CaptureCoordinator>,
    permission: Arc<dyn PermissionProvider>,
    input_injector: Arc<dyn InputInjector>,
    diagnostics: Arc<Diagnostics>,
    buffer: Arc<FrameBuffer>,
    heartbeat_interval: Duration,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    state: AtomicU8,
    gesture_mapper: Mutex<GestureMapper>,
    display: Mutex<Display>,
    shutdown: Notify,
}

impl SessionController {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        device_token: Option<String>,
        backend_url: String,
        channel_factory: ChannelFactory,
        capture: Arc<CaptureCoordinator>,
        permission: Arc<dyn PermissionProvider>,
        input_injector: Arc<dyn InputInjector>,
        diagnostics: Arc<Diagnostics>,
        buffer: Arc<FrameBuffer>,
        display: Display,
        heartbeat_interval: Duration,
        backoff_initial_ms: u64,
        backoff_max_ms: u64,
    ) -> Self {
        Self {
            device_id,
            device_token,
            backend_url,
            channel_factory,
            capture,
            permission,
            input_injector,
            diagnostics,
            buffer,
            heartbeat_interval,
            backoff_initial_ms,
            backoff_max_ms,
            state: AtomicU8::new(state_to_u8(ControllerState::Standby)),
            gesture_mapper: Mutex::new(GestureMapper::new()),
            display: Mutex::new(display),
            shutdown: Notify::new(),
        }
    }

    #[must_use]
    pub fn current_state(&self) -> ControllerState {
        u8_to_state(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    /// Request a full teardown: stops any active session and
    /// disconnects both channels. `run` returns once this completes.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("X-Device-ID".to_string(), self.device_id.clone())];
        if let Some(token) = &self.device_token {
            headers.push(("X-Device-Token".to_string(), token.clone()));
        }
        headers
    }

    fn control_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.backend_url.clone(), format!("device_rc:{}", self.device_id))
            .with_headers(self.headers())
            .with_timing(self.heartbeat_interval, self.backoff_initial_ms, self.backoff_max_ms)
    }

    fn media_config(&self, session_id: &str) -> ChannelConfig {
        ChannelConfig::new(self.backend_url.clone(), format!("device_media:{}:{session_id}", self.device_id))
            .with_headers(self.headers())
            .with_timing(self.heartbeat_interval, self.backoff_initial_ms, self.backoff_max_ms)
    }

    /// Connect the control channel and run the session loop until
    /// [`Self::request_shutdown`] is called or the control channel's
    /// inbound queue closes permanently.
    pub async fn run(self: Arc<Self>) {
        self.set_state(ControllerState::Standby);
        let (control, mut control_rx) = (self.channel_factory)(self.control_config(), Arc::clone(&self.diagnostics));
        let mut media: Option<MediaSession> = None;

        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    self.shutdown_session(&control, &mut media).await;
                    return;
                }
                msg = control_rx.recv() => {
                    match msg {
                        Some(message) => self.handle_control_message(&control, &mut media, message).await,
                        None => {
                            tracing::warn!("control channel inbound queue closed; shutting down session");
                            self.shutdown_session(&control, &mut media).await;
                            return;
                        }
                    }
                }
                event = async {
                    media.as_mut().expect("guarded by is_some").capture_events.recv().await
                }, if media.is_some() => {
                    match event {
                        Some(event) => self.handle_capture_event(&control, &mut media, event).await,
                        None => self.handle_capture_event(&control, &mut media, CaptureEvent::SessionFailed).await,
                    }
                }
            }
        }
    }

    async fn handle_control_message(&self, control: &Arc<dyn ChannelHandle>, media: &mut Option<MediaSession>, message: Message) {
        match message.event.as_str() {
            events::START_SESSION => {
                let Some(session_id) = message.payload.get("session_id").and_then(Value::as_str) else {
                    tracing::warn!("start_session message missing session_id");
                    return;
                };
                self.start_session(session_id.to_string(), control, media).await;
            }
            events::CONTROL_EVENT => self.handle_control_event(&message.payload),
            events::SESSION_STOPPED => self.end_session(media).await,
            other => tracing::debug!(event = other, "ignoring unrecognized control event"),
        }
    }

    async fn start_session(&self, session_id: String, control: &Arc<dyn ChannelHandle>, media: &mut Option<MediaSession>) {
        if media.is_some() {
            tracing::warn!(session_id, "start_session received while already streaming; ignoring");
            return;
        }

        self.set_state(ControllerState::PermissionPending);
        let granted = if self.permission.cached() {
            true
        } else {
            self.permission.request().await == PermissionOutcome::Granted
        };

        if !granted {
            self.set_state(ControllerState::Standby);
            control.send(events::DEVICE_EVENT, json!({"kind": "permission_denied", "session_id": session_id}));
            return;
        }

        let (handle, media_rx) = (self.channel_factory)(self.media_config(&session_id), Arc::clone(&self.diagnostics));

        if !wait_for_join(&handle).await {
            tracing::warn!(session_id, "media channel did not join before the timeout; aborting session start");
            handle.disconnect();
            self.set_state(ControllerState::Standby);
            return;
        }

        match self.capture.start().await {
            Ok((profile, events_rx)) => {
                handle.send(events::MEDIA_METADATA, metadata_payload(profile));
                let pump_task = spawn_pump(Arc::clone(&self.buffer), Arc::clone(&self.diagnostics), Arc::clone(&handle));
                *media = Some(MediaSession {
                    handle,
                    _media_rx: media_rx,
                    capture_events: events_rx,
                    pump_task,
                });
                self.set_state(ControllerState::Streaming);
            }
            Err(e) => {
                tracing::error!(error = %e, session_id, "capture failed to start");
                handle.disconnect();
                self.set_state(ControllerState::Standby);
            }
        }
    }

    async fn handle_capture_event(&self, control: &Arc<dyn ChannelHandle>, media: &mut Option<MediaSession>, event: CaptureEvent) {
        match event {
            CaptureEvent::Downgraded(profile) => {
                if let Some(session) = media.as_ref() {
                    session.handle.send(events::MEDIA_METADATA, metadata_payload(profile));
                }
            }
            CaptureEvent::SessionFailed => {
                tracing::warn!("capture session failed; tearing down");
                self.end_session(media).await;
                control.send(events::DEVICE_EVENT, json!({"kind": "capture_failed"}));
            }
        }
    }

    /// Tear down the active session (if any) but keep the permission
    /// grant, returning to `Standby`.
    async fn end_session(&self, media: &mut Option<MediaSession>) {
        if let Some(session) = media.take() {
            session.pump_task.abort();
            session.handle.disconnect();
        }
        self.capture.pause().await;
        self.set_state(ControllerState::Standby);
    }

    /// Full teardown: release the permission and disconnect everything.
    async fn shutdown_session(&self, control: &Arc<dyn ChannelHandle>, media: &mut Option<MediaSession>) {
        self.set_state(ControllerState::Teardown);
        if let Some(session) = media.take() {
            session.pump_task.abort();
            session.handle.disconnect();
        }
        self.capture.stop().await;
        control.disconnect();
    }

    fn handle_control_event(&self, payload: &Value) {
        let Some(kind) = payload.get("kind").and_then(Value::as_str) else {
            tracing::debug!("control_event payload missing `kind`");
            return;
        };

        match kind {
            "viewport" => self.apply_viewport_update(payload),
            "display_rotated" => self.apply_display_rotation(payload),
            "tap" | "long_press" | "swipe" | "multi_step" | "key" | "global_action" => self.dispatch_gesture(kind, payload),
            other => tracing::debug!(kind = other, "unrecognized control_event kind"),
        }
    }

    fn apply_viewport_update(&self, payload: &Value) {
        let (Some(width), Some(height)) = (payload.get("width").and_then(Value::as_f64), payload.get("height").and_then(Value::as_f64)) else {
            tracing::debug!("viewport control_event missing width/height");
            return;
        };
        let display = *self.display.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.gesture_mapper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .update(Viewport { width, height }, display);
    }

    fn apply_display_rotation(&self, payload: &Value) {
        let Some(rotation) = payload.get("rotation").and_then(Value::as_str).and_then(parse_rotation) else {
            tracing::debug!("display_rotated control_event missing or invalid rotation");
            return;
        };
        self.display.lock().unwrap_or_else(std::sync::PoisonError::into_inner).rotation = rotation;
    }

    fn dispatch_gesture(&self, kind: &str, payload: &Value) {
        let command = {
            let mapper = self.gesture_mapper.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match kind {
                "tap" => point(payload).and_then(|(x, y)| mapper.map(x, y).ok()).map(|(x, y)| GestureCommand::tap(x, y)),
                "long_press" => point(payload)
                    .and_then(|(x, y)| mapper.map(x, y).ok())
                    .map(|(x, y)| GestureCommand::long_press(x, y)),
                "swipe" => swipe_points(payload)
                    .and_then(|(x1, y1, x2, y2)| Some((mapper.map(x1, y1).ok()?, mapper.map(x2, y2).ok()?)))
                    .map(|((x1, y1), (x2, y2))| GestureCommand::swipe(x1, y1, x2, y2)),
                "multi_step" => multi_points(payload)
                    .and_then(|points| mapper.map_multi(&points).ok())
                    .map(|points| GestureCommand::MultiStep { points, duration_ms: 300 }),
                "key" => key_command(payload),
                "global_action" => payload.get("action_kind").and_then(Value::as_str).map(|k| GestureCommand::GlobalAction { kind: k.to_string() }),
                _ => None,
            }
        };

        match command {
            Some(command) => self.input_injector.inject(command),
            None => tracing::debug!(kind, "dropped a gesture: missing fields or outside mapped geometry"),
        }
    }
}

fn metadata_payload(profile: StreamProfile) -> Value {
    json!({
        "width": profile.width,
        "height": profile.height,
        "fps": profile.fps,
        "codec": normalize_codec(profile.codec.as_str()),
    })
}

/// Maps an encoder's codec identifier onto the wire's `"h264"`/`"mjpeg"`
/// tags; anything else is lowercased and passed through with a warning.
fn normalize_codec(tag: &str) -> String {
    match tag {
        "h264" | "mjpeg" => tag.to_string(),
        other => {
            tracing::warn!(codec = other, "unrecognized codec identifier, passing through lowercased");
            other.to_lowercase()
        }
    }
}

fn parse_rotation(value: &str) -> Option<Rotation> {
    match value {
        "0" => Some(Rotation::Deg0),
        "90" => Some(Rotation::Deg90),
        "180" => Some(Rotation::Deg180),
        "270" => Some(Rotation::Deg270),
        _ => None,
    }
}

fn point(payload: &Value) -> Option<(f64, f64)> {
    Some((payload.get("x")?.as_f64()?, payload.get("y")?.as_f64()?))
}

fn swipe_points(payload: &Value) -> Option<(f64, f64, f64, f64)> {
    Some((
        payload.get("x1")?.as_f64()?,
        payload.get("y1")?.as_f64()?,
        payload.get("x2")?.as_f64()?,
        payload.get("y2")?.as_f64()?,
    ))
}

fn multi_points(payload: &Value) -> Option<Vec<(f64, f64)>> {
    payload
        .get("points")?
        .as_array()?
        .iter()
        .map(|p| Some((p.get("x")?.as_f64()?, p.get("y")?.as_f64()?)))
        .collect()
}

fn key_command(payload: &Value) -> Option<GestureCommand> {
    let action = match payload.get("action")?.as_str()? {
        "down" => KeyAction::Down,
        "up" => KeyAction::Up,
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation)]
    let code = payload.get("code")?.as_u64()? as u32;
    let flag = |name: &str| payload.get(name).and_then(Value::as_bool).unwrap_or(false);
    Some(GestureCommand::Key {
        action,
        code,
        shift: flag("shift"),
        ctrl: flag("ctrl"),
        alt: flag("alt"),
        meta: flag("meta"),
    })
}

/// Drains the frame buffer on a wake, handing up to
/// [`PUMP_MAX_BATCH`] frames to the media channel per wake so a burst
/// doesn't starve other tasks.
fn spawn_pump(buffer: Arc<FrameBuffer>, diagnostics: Arc<Diagnostics>, media: Arc<dyn ChannelHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = buffer.pop_wait().await;
            let mut batch = Vec::with_capacity(PUMP_MAX_BATCH);
            batch.push(first);
            batch.extend(buffer.pop_batch(PUMP_MAX_BATCH - 1));

            for frame in batch {
                let envelope = FrameEnvelope::from_frame(&frame);
                media.send(events::MEDIA_FRAME, envelope.to_payload());
                diagnostics.record_sent();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_normalization_passes_known_tags_through() {
        assert_eq!(normalize_codec("h264"), "h264");
        assert_eq!(normalize_codec("mjpeg"), "mjpeg");
    }

    #[test]
    fn codec_normalization_lowercases_unknown_tags() {
        assert_eq!(normalize_codec("VP9"), "vp9");
    }

    #[test]
    fn rotation_parses_known_degree_strings() {
        assert_eq!(parse_rotation("90"), Some(Rotation::Deg90));
        assert_eq!(parse_rotation("45"), None);
    }

    #[test]
    fn key_command_reads_modifiers_with_defaults() {
        let payload = json!({"action": "down", "code": 65, "shift": true});
        let command = key_command(&payload).unwrap();
        match command {
            GestureCommand::Key { action, code, shift, ctrl, alt, meta } => {
                assert_eq!(action, KeyAction::Down);
                assert_eq!(code, 65);
                assert!(shift);
                assert!(!ctrl && !alt && !meta);
            }
            _ => panic!("expected a Key command"),
        }
    }

    #[test]
    fn multi_points_rejects_a_malformed_point_list() {
        let payload = json!({"points": [{"x": 1.0, "y": 2.0}, {"x": 3.0}]});
        assert!(multi_points(&payload).is_none());
    }
}
