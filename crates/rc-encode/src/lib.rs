// Video encoding abstraction for the remote-control agent.
//
// Provides the `Encoder` trait and two implementations:
// - gstreamer_enc.rs: hardware H.264 encoding via GStreamer (VAAPI/NVENC/x264)
// - jpeg_fallback.rs: per-frame JPEG encoding when the primary path fails

pub mod gstreamer_enc;
pub mod jpeg_fallback;

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Codec tag carried on the wire and in `media_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecTag {
    H264,
    Mjpeg,
}

impl CodecTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Mjpeg => "mjpeg",
        }
    }
}

impl std::fmt::Display for CodecTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel format of the raw frames handed to an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA with 8 bits per channel.
    Bgra,
    /// RGBA with 8 bits per channel.
    Rgba,
}

impl PixelFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// A single raw (undecoded) captured frame, as handed to an encoder.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture timestamp in milliseconds, monotonic within a session.
    pub timestamp_ms: u64,
}

/// An encoded picture produced by an [`Encoder`].
///
/// Produced exclusively by an encoder, transferred by move into the
/// frame buffer, moved out by the session controller, and dropped after
/// send.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
    pub is_keyframe: bool,
    pub codec: CodecTag,
    pub timestamp_ms: u64,
}

impl Frame {
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Handle to the surface an encoder was bound against.
///
/// Opaque outside this crate; the generation counter guards against a
/// coordinator pushing frames or draining through a handle from a
/// previous `start()`/`stop()` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceHandle {
    generation: u64,
}

/// Tunable parameters passed to [`Encoder::start`].
#[derive(Debug, Clone, Copy)]
pub struct EncoderParams {
    pub fps: u32,
    pub bitrate_bps: u32,
    pub keyframe_interval_ms: u32,
    /// JPEG quality (0-100); ignored by the primary encoder.
    pub jpeg_quality: u8,
}

impl EncoderParams {
    /// Parameters matching the primary (video) encoder's target profile:
    /// 15 fps, 2 Mbps CBR, 2 s keyframe interval.
    #[must_use]
    pub fn primary() -> Self {
        Self {
            fps: 15,
            bitrate_bps: 2_000_000,
            keyframe_interval_ms: 2_000,
            jpeg_quality: 0,
        }
    }

    /// Parameters matching the fallback (JPEG) encoder: 5 fps, quality 75.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            fps: 5,
            bitrate_bps: 0,
            keyframe_interval_ms: 0,
            jpeg_quality: 75,
        }
    }

    /// [`Self::primary`] with `fps`/`bitrate_bps` overridden from
    /// operator configuration, keeping the keyframe interval fixed.
    #[must_use]
    pub fn primary_with(fps: u32, bitrate_bps: u32) -> Self {
        Self {
            fps,
            bitrate_bps,
            ..Self::primary()
        }
    }
}

/// Errors an [`Encoder`] implementation may surface.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder initialization failed: {0}")]
    InitFailed(String),
    #[error("encoder runtime error: {0}")]
    RuntimeError(String),
    #[error("encoder surface lost: {0}")]
    SurfaceLost(String),
    #[error("operation attempted through a stale surface handle")]
    StaleHandle,
}

/// Uniform interface consumed by the capture coordinator.
///
/// Both the primary (hardware H.264) and fallback (JPEG) adapters
/// implement this trait identically from the coordinator's point of
/// view: `start` binds a surface, `push_frame`/`drain` move raw pixels
/// in and encoded [`Frame`]s out, `stop` releases everything and is
/// idempotent.
pub trait Encoder: Send {
    /// Initialize the encoder for the given output dimensions and return
    /// a handle identifying this start/stop cycle.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::InitFailed`] if the underlying codec or
    /// pipeline could not be constructed.
    fn start(
        &mut self,
        width: u32,
        height: u32,
        params: EncoderParams,
    ) -> Result<SurfaceHandle, EncoderError>;

    /// Feed one raw captured frame into the encoder.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::RuntimeError`] on a pipeline failure, or
    /// [`EncoderError::StaleHandle`] if `handle` is not the most recent
    /// one returned by `start`.
    fn push_frame(&mut self, handle: SurfaceHandle, frame: &RawFrame) -> Result<(), EncoderError>;

    /// Drain whatever the encoder has produced so far, waiting at most
    /// `deadline` for output.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::RuntimeError`] on a pipeline failure.
    fn drain(&mut self, handle: SurfaceHandle, deadline: Duration) -> Result<Vec<Frame>, EncoderError>;

    /// Release the codec and surface. Idempotent.
    fn stop(&mut self);

    /// The codec tag this encoder emits.
    fn codec(&self) -> CodecTag;
}

impl SurfaceHandle {
    /// Mint a handle with an explicit generation. Exposed so `Encoder`
    /// implementations outside this crate (and their tests) can
    /// participate in the same stale-handle protocol as the built-in
    /// adapters; real callers should otherwise obtain handles only from
    /// `Encoder::start`.
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self { generation }
    }
}

/// Shared generation counter so encoder implementations can mint fresh,
/// distinguishable [`SurfaceHandle`]s across `start()` calls.
#[derive(Debug, Default)]
pub struct HandleGenerator {
    next: u64,
}

impl HandleGenerator {
    #[must_use]
    pub fn next_handle(&mut self) -> SurfaceHandle {
        self.next += 1;
        SurfaceHandle::new(self.next)
    }
}
