//! Owns the display surface and the active encoder, and drives the
//! periodic drain that feeds the frame buffer.

use std::sync::Arc;
use std::time::Duration;

use rc_buffer::FrameBuffer;
use rc_diagnostics::Diagnostics;
use rc_encode::{CodecTag, Encoder, EncoderError, EncoderParams};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::dimensions::compute_capture_dimensions;
use crate::source::{ActiveCapture, CaptureError, CaptureSource};

const DRAIN_INTERVAL: Duration = Duration::from_millis(30);
const DRAIN_DEADLINE: Duration = Duration::from_millis(20);

/// Stream parameters to announce in `media_metadata` after `start` (or
/// after a downgrade changes them).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: CodecTag,
}

/// Out-of-band notifications the drain task raises for the session
/// owner to act on.
#[derive(Debug, Clone, Copy)]
pub enum CaptureEvent {
    /// Primary encoder failed and the coordinator silently downgraded;
    /// callers should re-announce `media_metadata` with the new profile.
    Downgraded(StreamProfile),
    /// The fallback encoder also failed, or the capture resource was
    /// lost. The session cannot continue; the caller should tear down.
    SessionFailed,
}

type EncoderFactory = Arc<dyn Fn() -> Box<dyn Encoder> + Send + Sync>;

struct RunningSession {
    capture: Box<dyn ActiveCapture>,
    task: JoinHandle<()>,
}

/// Drives one capture session: measures the screen, picks an encoder,
/// and periodically drains it into a [`FrameBuffer`].
pub struct CaptureCoordinator {
    source: Arc<dyn CaptureSource>,
    buffer: Arc<FrameBuffer>,
    diagnostics: Arc<Diagnostics>,
    primary_factory: EncoderFactory,
    fallback_factory: EncoderFactory,
    primary_params: EncoderParams,
    fallback_params: EncoderParams,
    max_width: u32,
    max_height: u32,
    session: Mutex<Option<RunningSession>>,
}

impl CaptureCoordinator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn CaptureSource>,
        buffer: Arc<FrameBuffer>,
        diagnostics: Arc<Diagnostics>,
        primary_factory: EncoderFactory,
        fallback_factory: EncoderFactory,
        primary_params: EncoderParams,
        fallback_params: EncoderParams,
        max_width: u32,
        max_height: u32,
    ) -> Self {
        Self {
            source,
            buffer,
            diagnostics,
            primary_factory,
            fallback_factory,
            primary_params,
            fallback_params,
            max_width,
            max_height,
            session: Mutex::new(None),
        }
    }

    /// Measure the screen, acquire the capture resource, start the
    /// primary encoder (falling back to JPEG on `InitFailed`), and begin
    /// draining. Returns the profile to announce via `media_metadata`
    /// and a channel that carries later downgrade/failure notices.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError`] if the capture resource cannot be
    /// acquired, or if both the primary and fallback encoders fail to
    /// initialize.
    pub async fn start(&self) -> Result<(StreamProfile, mpsc::UnboundedReceiver<CaptureEvent>), CaptureError> {
        let (screen_w, screen_h) = self.source.screen_size();
        let (capture_w, capture_h) = compute_capture_dimensions(screen_w, screen_h, self.max_width, self.max_height);

        let (capture, raw_rx) = self.source.open(capture_w, capture_h)?;

        let mut primary = (self.primary_factory)();
        let (encoder, handle, profile) = match primary.start(capture_w, capture_h, self.primary_params) {
            Ok(handle) => {
                let profile = StreamProfile {
                    width: capture_w,
                    height: capture_h,
                    fps: self.primary_params.fps,
                    codec: CodecTag::H264,
                };
                (primary, handle, profile)
            }
            Err(EncoderError::InitFailed(reason)) => {
                tracing::warn!(reason, "primary encoder init failed, starting fallback");
                let mut fallback = (self.fallback_factory)();
                let handle = fallback
                    .start(capture_w, capture_h, self.fallback_params)
                    .map_err(|e| CaptureError::PipewireSetup(e.to_string()))?;
                let profile = StreamProfile {
                    width: capture_w,
                    height: capture_h,
                    fps: self.fallback_params.fps,
                    codec: CodecTag::Mjpeg,
                };
                (fallback, handle, profile)
            }
            Err(other) => return Err(CaptureError::PipewireSetup(other.to_string())),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain_loop(
            encoder,
            handle,
            raw_rx,
            Arc::clone(&self.buffer),
            Arc::clone(&self.diagnostics),
            Arc::clone(&self.fallback_factory),
            self.fallback_params,
            capture_w,
            capture_h,
            events_tx,
        ));

        *self.session.lock().await = Some(RunningSession { capture, task });
        Ok((profile, events_rx))
    }

    /// Tear down the encoder and display binding but keep whatever
    /// capture permission the source holds, so a later `start()` can
    /// skip re-prompting the user.
    pub async fn pause(&self) {
        self.teardown().await;
    }

    /// Tear down the encoder, display binding, and any held permission.
    pub async fn stop(&self) {
        self.teardown().await;
        self.buffer.clear();
    }

    async fn teardown(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.task.abort();
            session.capture.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_loop(
    mut encoder: Box<dyn Encoder>,
    mut handle: rc_encode::SurfaceHandle,
    mut raw_rx: mpsc::Receiver<rc_encode::RawFrame>,
    buffer: Arc<FrameBuffer>,
    diagnostics: Arc<Diagnostics>,
    fallback_factory: EncoderFactory,
    fallback_params: EncoderParams,
    width: u32,
    height: u32,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
) {
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
    let mut downgraded = false;

    loop {
        ticker.tick().await;

        loop {
            match raw_rx.try_recv() {
                Ok(raw) => {
                    if let Err(e) = encoder.push_frame(handle, &raw) {
                        tracing::debug!(error = %e, "encoder push_frame failed");
                        break;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::warn!("capture resource disconnected");
                    encoder.stop();
                    let _ = events_tx.send(CaptureEvent::SessionFailed);
                    return;
                }
            }
        }

        match encoder.drain(handle, DRAIN_DEADLINE) {
            Ok(frames) => {
                for frame in frames {
                    #[allow(clippy::cast_possible_truncation)]
                    diagnostics.record_frame_encoded(frame.size() as u64, frame.is_keyframe);
                    let outcome = buffer.try_push(frame);
                    if outcome != rc_buffer::PushOutcome::Accepted {
                        diagnostics.record_frame_dropped();
                    }
                }
            }
            Err(EncoderError::RuntimeError(reason)) if !downgraded => {
                tracing::warn!(reason, "primary encoder runtime error, downgrading to fallback");
                diagnostics.record_encoding_error();
                encoder.stop();
                let mut fallback = (fallback_factory)();
                match fallback.start(width, height, fallback_params) {
                    Ok(new_handle) => {
                        encoder = fallback;
                        handle = new_handle;
                        downgraded = true;
                        let _ = events_tx.send(CaptureEvent::Downgraded(StreamProfile {
                            width,
                            height,
                            fps: fallback_params.fps,
                            codec: CodecTag::Mjpeg,
                        }));
                    }
                    Err(_) => {
                        let _ = events_tx.send(CaptureEvent::SessionFailed);
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "encoder drain failed, tearing down session");
                diagnostics.record_encoding_error();
                encoder.stop();
                let _ = events_tx.send(CaptureEvent::SessionFailed);
                return;
            }
        }
    }
}
