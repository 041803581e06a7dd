//! End-to-end exercise of `SessionController` against an in-process
//! mock channel transport and a scripted capture pipeline, no real
//! network socket or platform encoder involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rc_agent::channel::{ChannelFactory, ChannelHandle};
use rc_agent::permission::AutoGrantPermissionProvider;
use rc_agent::session::{ControllerState, SessionController};
use rc_agent::LoggingInputInjector;
use rc_buffer::FrameBuffer;
use rc_capture::{ActiveCapture, CaptureCoordinator, CaptureError, CaptureSource};
use rc_diagnostics::Diagnostics;
use rc_encode::{CodecTag, Encoder, EncoderError, EncoderParams, Frame, RawFrame, SurfaceHandle};
use rc_gesture::{Display, Rotation};
use rc_transport::{ChannelConfig, ChannelState};
use rc_wire::events;
use rc_wire::Message;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct RecordingChannel {
    sent: Mutex<Vec<(String, Value)>>,
    disconnected: AtomicBool,
    joined: AtomicBool,
}

impl Default for RecordingChannel {
    /// Starts already `Joined`, matching a transport that joins
    /// instantly; tests exercising join latency flip `joined` to
    /// `false` right after construction instead.
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            joined: AtomicBool::new(true),
        }
    }
}

impl RecordingChannel {
    fn events(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(event, _)| event.clone()).collect()
    }

    fn payloads_for(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl ChannelHandle for RecordingChannel {
    fn send(&self, event: &str, payload: Value) {
        self.sent.lock().unwrap().push((event.to_string(), payload));
    }

    fn current_state(&self) -> ChannelState {
        if self.disconnected.load(Ordering::SeqCst) {
            ChannelState::Idle
        } else if self.joined.load(Ordering::SeqCst) {
            ChannelState::Joined
        } else {
            ChannelState::OpenUnjoined
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Shared slots the mock factory drops its per-call artifacts into, so
/// the test can reach them after `SessionController::run` is spawned.
#[derive(Default)]
struct Slots {
    control_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    control_handle: Mutex<Option<Arc<RecordingChannel>>>,
    media_handle: Mutex<Option<Arc<RecordingChannel>>>,
    /// When set, the next constructed media channel starts `OpenUnjoined`
    /// and flips to `Joined` only after this delay.
    media_join_delay: Mutex<Option<Duration>>,
}

fn mock_factory(slots: Arc<Slots>) -> ChannelFactory {
    Arc::new(move |config: ChannelConfig, _diagnostics: Arc<Diagnostics>| {
        let handle = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();
        if config.topic.starts_with("device_rc:") {
            *slots.control_tx.lock().unwrap() = Some(tx);
            *slots.control_handle.lock().unwrap() = Some(Arc::clone(&handle));
        } else {
            if let Some(delay) = slots.media_join_delay.lock().unwrap().take() {
                handle.joined.store(false, Ordering::SeqCst);
                let delayed = Arc::clone(&handle);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    delayed.joined.store(true, Ordering::SeqCst);
                });
            }
            *slots.media_handle.lock().unwrap() = Some(Arc::clone(&handle));
        }
        (handle as Arc<dyn ChannelHandle>, rx)
    })
}

struct MockCapture {
    // Kept alive so the raw-frame channel isn't observed as disconnected.
    _tx: mpsc::Sender<RawFrame>,
}

impl ActiveCapture for MockCapture {
    fn stop(&mut self) {}
}

struct MockSource {
    screen: (u32, u32),
}

impl CaptureSource for MockSource {
    fn open(&self, _width: u32, _height: u32) -> Result<(Box<dyn ActiveCapture>, mpsc::Receiver<RawFrame>), CaptureError> {
        let (tx, rx) = mpsc::channel(4);
        Ok((Box::new(MockCapture { _tx: tx }), rx))
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}

/// Always-succeeds encoder that hands back one frame per `drain` call,
/// so the pump task always has something to forward.
struct SteadyEncoder {
    codec: CodecTag,
}

impl Encoder for SteadyEncoder {
    fn start(&mut self, _w: u32, _h: u32, _params: EncoderParams) -> Result<SurfaceHandle, EncoderError> {
        Ok(SurfaceHandle::new(1))
    }

    fn push_frame(&mut self, _handle: SurfaceHandle, _frame: &RawFrame) -> Result<(), EncoderError> {
        Ok(())
    }

    fn drain(&mut self, _handle: SurfaceHandle, _deadline: Duration) -> Result<Vec<Frame>, EncoderError> {
        Ok(vec![Frame {
            payload: bytes::Bytes::from_static(b"frame"),
            is_keyframe: true,
            codec: self.codec,
            timestamp_ms: 0,
        }])
    }

    fn stop(&mut self) {}

    fn codec(&self) -> CodecTag {
        self.codec
    }
}

fn build_controller(slots: Arc<Slots>) -> Arc<SessionController> {
    let diagnostics = Arc::new(Diagnostics::new());
    let buffer = Arc::new(FrameBuffer::new(8));
    let capture = Arc::new(CaptureCoordinator::new(
        Arc::new(MockSource { screen: (1280, 720) }),
        Arc::clone(&buffer),
        Arc::clone(&diagnostics),
        Arc::new(|| Box::new(SteadyEncoder { codec: CodecTag::H264 }) as Box<dyn Encoder>),
        Arc::new(|| Box::new(SteadyEncoder { codec: CodecTag::Mjpeg }) as Box<dyn Encoder>),
        EncoderParams::primary(),
        EncoderParams::fallback(),
        1280,
        720,
    ));

    Arc::new(SessionController::new(
        "test-device".to_string(),
        None,
        "wss://backend.test/socket/websocket".to_string(),
        mock_factory(slots),
        capture,
        Arc::new(AutoGrantPermissionProvider::new()),
        Arc::new(LoggingInputInjector),
        diagnostics,
        buffer,
        Display {
            width: 1280.0,
            height: 720.0,
            rotation: Rotation::Deg0,
        },
        Duration::from_secs(30),
        1_000,
        60_000,
    ))
}

async fn wait_for_control_tx(slots: &Slots) -> mpsc::UnboundedSender<Message> {
    for _ in 0..50 {
        if let Some(tx) = slots.control_tx.lock().unwrap().clone() {
            return tx;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control channel was never constructed");
}

async fn wait_for_media_handle(slots: &Slots) -> Arc<RecordingChannel> {
    for _ in 0..50 {
        if let Some(handle) = slots.media_handle.lock().unwrap().clone() {
            return handle;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("media channel was never constructed");
}

#[tokio::test]
async fn session_starts_streams_and_tears_down_on_session_stopped() {
    let slots = Arc::new(Slots::default());
    let controller = build_controller(Arc::clone(&slots));
    let run_task = tokio::spawn(Arc::clone(&controller).run());

    let control_tx = wait_for_control_tx(&slots).await;
    assert_eq!(controller.current_state(), ControllerState::Standby);

    control_tx
        .send(Message::new(None, None, "device_rc:test-device", events::START_SESSION, json!({"session_id": "s1"})))
        .unwrap();

    let media_handle = wait_for_media_handle(&slots).await;

    // Give the pump task a few drain ticks to move a frame through.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(controller.current_state(), ControllerState::Streaming);
    assert!(media_handle.events().contains(&events::MEDIA_METADATA.to_string()));
    assert!(media_handle.events().contains(&events::MEDIA_FRAME.to_string()));

    let metadata = media_handle.payloads_for(events::MEDIA_METADATA).remove(0);
    assert_eq!(metadata["codec"], "h264");

    control_tx
        .send(Message::new(None, None, "device_rc:test-device", events::SESSION_STOPPED, json!({})))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.current_state(), ControllerState::Standby);
    assert!(media_handle.disconnected.load(Ordering::SeqCst));

    controller.request_shutdown();
    tokio::time::timeout(Duration::from_secs(1), run_task).await.expect("run should exit after shutdown").unwrap();
    assert_eq!(controller.current_state(), ControllerState::Teardown);
}

#[tokio::test]
async fn media_metadata_is_withheld_until_the_media_channel_joins() {
    let slots = Arc::new(Slots::default());
    *slots.media_join_delay.lock().unwrap() = Some(Duration::from_millis(150));
    let controller = build_controller(Arc::clone(&slots));
    let run_task = tokio::spawn(Arc::clone(&controller).run());

    let control_tx = wait_for_control_tx(&slots).await;
    control_tx
        .send(Message::new(None, None, "device_rc:test-device", events::START_SESSION, json!({"session_id": "s1"})))
        .unwrap();

    let media_handle = wait_for_media_handle(&slots).await;

    // The channel is still OpenUnjoined at this point; nothing should
    // have been sent yet and the controller must not report Streaming.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(media_handle.events().is_empty(), "metadata sent before the media channel joined");
    assert_ne!(controller.current_state(), ControllerState::Streaming);

    // Past the mock's join delay, the controller should proceed and
    // send media_metadata.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(media_handle.events().contains(&events::MEDIA_METADATA.to_string()));
    assert_eq!(controller.current_state(), ControllerState::Streaming);

    controller.request_shutdown();
    tokio::time::timeout(Duration::from_secs(1), run_task).await.expect("run should exit after shutdown").unwrap();
}

#[tokio::test]
async fn permission_denied_returns_to_standby_without_opening_media() {
    struct DenyPermission;

    #[async_trait::async_trait]
    impl rc_agent::permission::PermissionProvider for DenyPermission {
        async fn request(&self) -> rc_agent::permission::PermissionOutcome {
            rc_agent::permission::PermissionOutcome::Denied
        }
        fn cached(&self) -> bool {
            false
        }
        fn clear_cache(&self) {}
    }

    let slots = Arc::new(Slots::default());
    let diagnostics = Arc::new(Diagnostics::new());
    let buffer = Arc::new(FrameBuffer::new(8));
    let capture = Arc::new(CaptureCoordinator::new(
        Arc::new(MockSource { screen: (1280, 720) }),
        Arc::clone(&buffer),
        Arc::clone(&diagnostics),
        Arc::new(|| Box::new(SteadyEncoder { codec: CodecTag::H264 }) as Box<dyn Encoder>),
        Arc::new(|| Box::new(SteadyEncoder { codec: CodecTag::Mjpeg }) as Box<dyn Encoder>),
        EncoderParams::primary(),
        EncoderParams::fallback(),
        1280,
        720,
    ));
    let controller = Arc::new(SessionController::new(
        "test-device".to_string(),
        None,
        "wss://backend.test/socket/websocket".to_string(),
        mock_factory(Arc::clone(&slots)),
        capture,
        Arc::new(DenyPermission),
        Arc::new(LoggingInputInjector),
        diagnostics,
        buffer,
        Display {
            width: 1280.0,
            height: 720.0,
            rotation: Rotation::Deg0,
        },
        Duration::from_secs(30),
        1_000,
        60_000,
    ));

    let run_task = tokio::spawn(Arc::clone(&controller).run());
    let control_tx = wait_for_control_tx(&slots).await;

    control_tx
        .send(Message::new(None, None, "device_rc:test-device", events::START_SESSION, json!({"session_id": "s1"})))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(controller.current_state(), ControllerState::Standby);
    assert!(slots.media_handle.lock().unwrap().is_none());

    let control_handle = slots.control_handle.lock().unwrap().clone().unwrap();
    assert!(control_handle.events().contains(&events::DEVICE_EVENT.to_string()));

    controller.request_shutdown();
    tokio::time::timeout(Duration::from_secs(1), run_task).await.unwrap().unwrap();
}
