//! Fallback encoder: per-frame JPEG via the `image` crate.
//!
//! Used when the primary `GStreamer` pipeline fails to initialize, or
//! after its first runtime error during a session. Every output is
//! independently decodable, so `is_keyframe` is always `true`. Frames
//! arriving faster than `params.fps` allows are dropped in `push_frame`
//! rather than encoded and discarded later, since JPEG encoding is the
//! expensive part.

use std::io::Cursor;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::{CodecTag, Encoder, EncoderError, EncoderParams, Frame, HandleGenerator, PixelFormat, RawFrame, SurfaceHandle};

/// JPEG fallback encoder, driven purely by `push_frame`/`drain` calls —
/// no background thread or pipeline, encoding happens synchronously in
/// `push_frame` so `drain` only has to hand back what accumulated.
pub struct FallbackEncoder {
    quality: u8,
    min_interval_ms: u64,
    last_accepted_ts: Option<u64>,
    handles: HandleGenerator,
    active: Option<SurfaceHandle>,
    pending: Vec<Frame>,
}

impl FallbackEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            quality: 75,
            min_interval_ms: 0,
            last_accepted_ts: None,
            handles: HandleGenerator::default(),
            active: None,
            pending: Vec::new(),
        }
    }
}

impl Default for FallbackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn to_rgba(frame: &RawFrame) -> Vec<u8> {
    if frame.format == PixelFormat::Rgba {
        return frame.data.to_vec();
    }
    let mut out = frame.data.to_vec();
    for px in out.chunks_exact_mut(4) {
        px.swap(0, 2); // BGRA -> RGBA
    }
    out
}

impl Encoder for FallbackEncoder {
    fn start(
        &mut self,
        _width: u32,
        _height: u32,
        params: EncoderParams,
    ) -> Result<SurfaceHandle, EncoderError> {
        self.quality = params.jpeg_quality;
        self.min_interval_ms = if params.fps == 0 { 0 } else { 1_000 / u64::from(params.fps) };
        self.last_accepted_ts = None;
        self.pending.clear();
        let handle = self.handles.next_handle();
        self.active = Some(handle);
        Ok(handle)
    }

    fn push_frame(&mut self, handle: SurfaceHandle, frame: &RawFrame) -> Result<(), EncoderError> {
        if self.active != Some(handle) {
            return Err(EncoderError::StaleHandle);
        }

        if let Some(last) = self.last_accepted_ts {
            if frame.timestamp_ms.saturating_sub(last) < self.min_interval_ms {
                return Ok(());
            }
        }
        self.last_accepted_ts = Some(frame.timestamp_ms);

        let rgba = to_rgba(frame);
        let mut buf = Cursor::new(Vec::new());
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.quality);
        encoder
            .encode(&rgba, frame.width, frame.height, ExtendedColorType::Rgba8)
            .map_err(|e| EncoderError::RuntimeError(e.to_string()))?;

        self.pending.push(Frame {
            payload: bytes::Bytes::from(buf.into_inner()),
            is_keyframe: true,
            codec: CodecTag::Mjpeg,
            timestamp_ms: frame.timestamp_ms,
        });
        Ok(())
    }

    fn drain(&mut self, handle: SurfaceHandle, _deadline: Duration) -> Result<Vec<Frame>, EncoderError> {
        if self.active != Some(handle) {
            return Err(EncoderError::StaleHandle);
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn stop(&mut self) {
        self.active = None;
        self.pending.clear();
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Mjpeg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, ts: u64) -> RawFrame {
        RawFrame {
            data: bytes::Bytes::from(vec![0x40u8; (w * h * 4) as usize]),
            width: w,
            height: h,
            stride: w * 4,
            format: PixelFormat::Rgba,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn every_output_is_a_keyframe() {
        let mut enc = FallbackEncoder::new();
        let handle = enc.start(16, 16, EncoderParams::fallback()).unwrap();
        enc.push_frame(handle, &solid_frame(16, 16, 10)).unwrap();
        enc.push_frame(handle, &solid_frame(16, 16, 210)).unwrap();

        let frames = enc.drain(handle, Duration::from_millis(0)).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_keyframe));
        assert!(frames.iter().all(|f| f.codec == CodecTag::Mjpeg));
        assert!(frames.iter().all(|f| !f.payload.is_empty()));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut enc = FallbackEncoder::new();
        let first = enc.start(16, 16, EncoderParams::fallback()).unwrap();
        let second = enc.start(16, 16, EncoderParams::fallback()).unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            enc.push_frame(first, &solid_frame(16, 16, 0)),
            Err(EncoderError::StaleHandle)
        ));
    }

    #[test]
    fn drain_empties_the_pending_queue() {
        let mut enc = FallbackEncoder::new();
        let handle = enc.start(8, 8, EncoderParams::fallback()).unwrap();
        enc.push_frame(handle, &solid_frame(8, 8, 0)).unwrap();
        let first = enc.drain(handle, Duration::from_millis(0)).unwrap();
        assert_eq!(first.len(), 1);
        let second = enc.drain(handle, Duration::from_millis(0)).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn frames_arriving_faster_than_5fps_are_dropped() {
        let mut enc = FallbackEncoder::new();
        let handle = enc.start(16, 16, EncoderParams::fallback()).unwrap();
        enc.push_frame(handle, &solid_frame(16, 16, 0)).unwrap();
        enc.push_frame(handle, &solid_frame(16, 16, 50)).unwrap(); // 50ms < 200ms floor
        enc.push_frame(handle, &solid_frame(16, 16, 220)).unwrap(); // past the floor

        let frames = enc.drain(handle, Duration::from_millis(0)).unwrap();
        assert_eq!(frames.len(), 2);
    }
}
