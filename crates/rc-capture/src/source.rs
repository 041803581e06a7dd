//! Display capture resource: acquires the virtual display surface and
//! delivers raw pixel buffers.
//!
//! The reference backend goes through the `ScreenCast` portal (ashpd) to
//! negotiate a session, then reads frames from the negotiated `PipeWire`
//! node on a dedicated OS thread with its own main loop, mirroring how
//! this workspace's audio capture runs outside the async executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ashpd::desktop::screencast::{CursorMode, PersistMode, Screencast, SourceType};
use pipewire as pw;
use pw::properties::properties;
use pw::stream::{StreamFlags, StreamState};
use rc_encode::{PixelFormat, RawFrame};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("screencast portal request failed: {0}")]
    Portal(String),
    #[error("no capture stream negotiated with the portal")]
    NoStream,
    #[error("failed to spawn the PipeWire capture thread: {0}")]
    SpawnThread(#[from] std::io::Error),
    #[error("PipeWire main loop setup failed: {0}")]
    PipewireSetup(String),
}

/// Something that can hand back raw captured frames for a display.
///
/// Out of scope for this trait: multi-monitor compositing, audio,
/// cursor bitmap extraction — this core only needs one virtual desktop
/// surface and its pixel stream.
pub trait CaptureSource: Send + Sync {
    /// Begin capturing at `(width, height)`. Returns a handle whose
    /// `Drop` stops the capture, and the channel raw frames arrive on.
    fn open(&self, width: u32, height: u32) -> Result<(Box<dyn ActiveCapture>, mpsc::Receiver<RawFrame>), CaptureError>;

    /// Native screen size, used to compute the capture rectangle.
    fn screen_size(&self) -> (u32, u32);
}

/// A running capture session. Dropping it tears down the underlying
/// stream and thread.
pub trait ActiveCapture: Send {
    fn stop(&mut self);
}

/// `ScreenCast`-portal-backed [`CaptureSource`] for the Linux reference
/// backend.
pub struct PortalCaptureSource {
    screen_w: u32,
    screen_h: u32,
}

impl PortalCaptureSource {
    /// Negotiate a `ScreenCast` session with the desktop portal and
    /// measure the monitor source it returns.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Portal`] if the portal proxy or session
    /// request fails, or [`CaptureError::NoStream`] if the user
    /// declined or no monitor source was offered.
    pub async fn negotiate() -> Result<Self, CaptureError> {
        let proxy = Screencast::new().await.map_err(|e| CaptureError::Portal(e.to_string()))?;
        let session = proxy.create_session().await.map_err(|e| CaptureError::Portal(e.to_string()))?;
        proxy
            .select_sources(
                &session,
                CursorMode::Embedded,
                SourceType::Monitor.into(),
                false,
                None,
                PersistMode::DoNot,
            )
            .await
            .map_err(|e| CaptureError::Portal(e.to_string()))?;

        let response = proxy
            .start(&session, None)
            .await
            .map_err(|e| CaptureError::Portal(e.to_string()))?
            .response()
            .map_err(|e| CaptureError::Portal(e.to_string()))?;

        let stream = response.streams().first().ok_or(CaptureError::NoStream)?;
        let (screen_w, screen_h) = stream.size().ok_or(CaptureError::NoStream)?;

        Ok(Self {
            screen_w: screen_w.unsigned_abs(),
            screen_h: screen_h.unsigned_abs(),
        })
    }
}

impl CaptureSource for PortalCaptureSource {
    fn open(&self, width: u32, height: u32) -> Result<(Box<dyn ActiveCapture>, mpsc::Receiver<RawFrame>), CaptureError> {
        let (tx, rx) = mpsc::channel(8);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("rc-pw-video".into())
            .spawn(move || {
                if let Err(e) = run_video_loop(width, height, tx, running_clone) {
                    tracing::error!("PipeWire video capture thread exited with error: {e}");
                }
            })?;

        Ok((Box::new(PortalCapture { running, thread: Some(thread) }), rx))
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.screen_w, self.screen_h)
    }
}

struct PortalCapture {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ActiveCapture for PortalCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PortalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_video_loop(
    width: u32,
    height: u32,
    frame_tx: mpsc::Sender<RawFrame>,
    running: Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None).map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;
    let context = pw::context::Context::new(&mainloop).map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;
    let core = context.connect(None).map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;

    let stream = pw::stream::Stream::new(
        &core,
        "rc-agent-video",
        properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;

    let _listener = stream
        .add_local_listener_with_user_data(frame_tx)
        .state_changed(|_stream, _tx, old, new| {
            tracing::debug!("PipeWire video stream state: {old:?} -> {new:?}");
            if matches!(new, StreamState::Error(_)) {
                tracing::error!("PipeWire video stream entered error state");
            }
        })
        .process(move |stream_ref, tx| {
            process_video_buffer(stream_ref, tx, width, height);
        })
        .register()
        .map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;

    let video_info = pw::spa::param::video::VideoInfoRaw::new();
    let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(pw::spa::pod::Object {
            type_: pw::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
            id: pw::spa::param::ParamType::EnumFormat.as_raw(),
            properties: video_info.into(),
        }),
    )
    .map_err(|e| CaptureError::PipewireSetup(e.to_string()))?
    .0
    .into_inner();

    let mut params = [pw::spa::pod::Pod::from_bytes(&values).expect("valid pod")];

    stream
        .connect(
            pw::spa::utils::Direction::Input,
            None,
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;

    tracing::info!(width, height, "PipeWire video stream connected");

    while running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(std::time::Duration::from_millis(8));
    }

    tracing::info!("PipeWire video main loop exiting");
    Ok(())
}

fn process_video_buffer(stream: &pw::stream::StreamRef, tx: &mut mpsc::Sender<RawFrame>, width: u32, height: u32) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    let datas = buffer.datas_mut();
    if datas.is_empty() {
        return;
    }

    let data = &mut datas[0];
    let chunk = data.chunk();
    let size = chunk.size() as usize;
    let stride = if chunk.stride() > 0 { chunk.stride() as u32 } else { width * 4 };

    let Some(slice) = data.data() else {
        return;
    };
    if size == 0 || size > slice.len() {
        return;
    }

    let timestamp_ms = u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX);

    let frame = RawFrame {
        data: bytes::Bytes::copy_from_slice(&slice[..size]),
        width,
        height,
        stride,
        format: PixelFormat::Bgra,
        timestamp_ms,
    };

    if tx.try_send(frame).is_err() {
        tracing::trace!("capture channel full, dropping raw frame");
    }
}
