//! Diagnostics aggregator for the capture/encode/transport pipeline.
//!
//! Counters are plain atomics so any context can record an event without
//! contention. The windowed rate calculators (FPS, bitrate, jitter
//! average) are guarded by a small mutex that is only taken when at
//! least one second has elapsed since the last recompute — frequent
//! callers get the last cached value instead of fighting over the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const RATE_WINDOW: std::time::Duration = std::time::Duration::from_secs(1);
const JITTER_RING_SIZE: usize = 100;

#[derive(Debug, Default)]
struct Counters {
    heartbeats_sent: AtomicU64,
    reconnect_attempts: AtomicU64,
    successful_reconnects: AtomicU64,
    frames_encoded: AtomicU64,
    frames_dropped: AtomicU64,
    frames_sent: AtomicU64,
    keyframes: AtomicU64,
    bytes_encoded: AtomicU64,
    encoding_errors: AtomicU64,
    network_errors: AtomicU64,
}

struct Windows {
    frame_timestamps: VecDeque<Instant>,
    byte_samples: VecDeque<(Instant, u64)>,
    jitter_ring: VecDeque<f64>,
    last_compute: Option<Instant>,
    cached_fps: f64,
    cached_bitrate_bps: f64,
    connection_start: Option<SystemTime>,
    last_disconnect: Option<SystemTime>,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            frame_timestamps: VecDeque::new(),
            byte_samples: VecDeque::new(),
            jitter_ring: VecDeque::new(),
            last_compute: None,
            cached_fps: 0.0,
            cached_bitrate_bps: 0.0,
            connection_start: None,
            last_disconnect: None,
        }
    }
}

/// A coherent (but not cross-field-atomic) snapshot of every counter,
/// gauge, and event time. This is a monitoring surface, not a
/// correctness input — callers should not build control-flow decisions
/// on subtle inter-field consistency.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsReport {
    pub heartbeats_sent: u64,
    pub reconnect_attempts: u64,
    pub successful_reconnects: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub frames_sent: u64,
    pub keyframes: u64,
    pub bytes_encoded: u64,
    pub encoding_errors: u64,
    pub network_errors: u64,
    pub current_fps: f64,
    pub current_bitrate_bps: f64,
    pub average_jitter_ms: f64,
    pub connection_start_unix_ms: Option<u64>,
    pub last_disconnect_unix_ms: Option<u64>,
}

impl DiagnosticsReport {
    /// `frames_dropped / (frames_encoded + frames_dropped)`, or 0 when
    /// no frames have been observed yet.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_encoded + self.frames_dropped;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.frames_dropped as f64 / total as f64;
            rate
        }
    }
}

/// A condensed view of [`DiagnosticsReport`] for a status line / UI
/// badge: the handful of numbers someone watching the stream cares
/// about at a glance.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsSummary {
    pub fps: f64,
    pub bitrate_bps: f64,
    pub drop_rate: f64,
    pub reconnect_attempts: u64,
}

/// Aggregates pipeline health counters under concurrent updates from the
/// capture, transport, and pump contexts.
#[derive(Default)]
pub struct Diagnostics {
    counters: Counters,
    windows: Mutex<Windows>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one encoded frame: bumps `frames_encoded`, `bytes_encoded`,
    /// and `keyframes` (if applicable), and feeds the FPS/bitrate
    /// windows.
    pub fn record_frame_encoded(&self, size_bytes: u64, is_keyframe: bool) {
        self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_encoded
            .fetch_add(size_bytes, Ordering::Relaxed);
        if is_keyframe {
            self.counters.keyframes.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        windows.frame_timestamps.push_back(now);
        windows.byte_samples.push_back((now, size_bytes));
        self.maybe_recompute(&mut windows, now);
    }

    /// Record a dropped frame (old P-frame evicted, or new frame
    /// rejected). Never surfaced as an error — see §7 of the design.
    pub fn record_frame_dropped(&self) {
        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame handed off to the media channel.
    pub fn record_sent(&self) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self) {
        self.counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.counters
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_successful_reconnect(&self) {
        self.counters
            .successful_reconnects
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoding_error(&self) {
        self.counters.encoding_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.counters.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one jitter sample (milliseconds) into the last-100 ring.
    pub fn record_jitter_sample(&self, jitter_ms: f64) {
        let mut windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if windows.jitter_ring.len() == JITTER_RING_SIZE {
            windows.jitter_ring.pop_front();
        }
        windows.jitter_ring.push_back(jitter_ms);
    }

    pub fn record_connection_start(&self) {
        let mut windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        windows.connection_start = Some(SystemTime::now());
    }

    pub fn record_disconnect(&self) {
        let mut windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        windows.last_disconnect = Some(SystemTime::now());
    }

    /// Recompute FPS and bitrate if at least one second has passed since
    /// the last recompute; otherwise leave the cached gauges untouched.
    fn maybe_recompute(&self, windows: &mut Windows, now: Instant) {
        let should_recompute = windows
            .last_compute
            .is_none_or(|last| now.duration_since(last) >= RATE_WINDOW);
        if !should_recompute {
            return;
        }

        let cutoff = now.checked_sub(RATE_WINDOW).unwrap_or(now);
        while windows
            .frame_timestamps
            .front()
            .is_some_and(|t| *t < cutoff)
        {
            windows.frame_timestamps.pop_front();
        }
        while windows
            .byte_samples
            .front()
            .is_some_and(|(t, _)| *t < cutoff)
        {
            windows.byte_samples.pop_front();
        }

        #[allow(clippy::cast_precision_loss)]
        {
            windows.cached_fps = windows.frame_timestamps.len() as f64;
            let bytes_in_window: u64 = windows.byte_samples.iter().map(|(_, n)| n).sum();
            windows.cached_bitrate_bps = bytes_in_window as f64 * 8.0;
        }
        windows.last_compute = Some(now);
    }

    fn average_jitter_ms(windows: &Windows) -> f64 {
        if windows.jitter_ring.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = windows.jitter_ring.iter().sum::<f64>() / windows.jitter_ring.len() as f64;
        avg
    }

    /// A full, coherent-enough snapshot of all counters and gauges.
    #[must_use]
    pub fn get_report(&self) -> DiagnosticsReport {
        let windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let to_unix_ms = |t: SystemTime| {
            t.duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .ok()
        };

        DiagnosticsReport {
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
            successful_reconnects: self.counters.successful_reconnects.load(Ordering::Relaxed),
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            keyframes: self.counters.keyframes.load(Ordering::Relaxed),
            bytes_encoded: self.counters.bytes_encoded.load(Ordering::Relaxed),
            encoding_errors: self.counters.encoding_errors.load(Ordering::Relaxed),
            network_errors: self.counters.network_errors.load(Ordering::Relaxed),
            current_fps: windows.cached_fps,
            current_bitrate_bps: windows.cached_bitrate_bps,
            average_jitter_ms: Self::average_jitter_ms(&windows),
            connection_start_unix_ms: windows.connection_start.and_then(to_unix_ms),
            last_disconnect_unix_ms: windows.last_disconnect.and_then(to_unix_ms),
        }
    }

    /// A condensed view of [`get_report`](Self::get_report) for a status
    /// line.
    #[must_use]
    pub fn get_summary(&self) -> DiagnosticsSummary {
        let report = self.get_report();
        DiagnosticsSummary {
            fps: report.current_fps,
            bitrate_bps: report.current_bitrate_bps,
            drop_rate: report.drop_rate(),
            reconnect_attempts: report.reconnect_attempts,
        }
    }

    /// Reset every counter to zero and clear all windows.
    pub fn reset(&self) {
        self.counters.heartbeats_sent.store(0, Ordering::Relaxed);
        self.counters.reconnect_attempts.store(0, Ordering::Relaxed);
        self.counters
            .successful_reconnects
            .store(0, Ordering::Relaxed);
        self.counters.frames_encoded.store(0, Ordering::Relaxed);
        self.counters.frames_dropped.store(0, Ordering::Relaxed);
        self.counters.frames_sent.store(0, Ordering::Relaxed);
        self.counters.keyframes.store(0, Ordering::Relaxed);
        self.counters.bytes_encoded.store(0, Ordering::Relaxed);
        self.counters.encoding_errors.store(0, Ordering::Relaxed);
        self.counters.network_errors.store(0, Ordering::Relaxed);

        let mut windows = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *windows = Windows::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_and_dropped_sum_to_observed_total() {
        let d = Diagnostics::new();
        d.record_frame_encoded(1000, true);
        d.record_frame_encoded(500, false);
        d.record_frame_dropped();

        let r = d.get_report();
        assert_eq!(r.frames_encoded, 2);
        assert_eq!(r.frames_dropped, 1);
        assert_eq!(r.keyframes, 1);
        assert_eq!(r.bytes_encoded, 1500);
    }

    #[test]
    fn drop_rate_is_zero_with_no_observations() {
        let d = Diagnostics::new();
        assert_eq!(d.get_report().drop_rate(), 0.0);
    }

    #[test]
    fn drop_rate_divides_dropped_by_total() {
        let d = Diagnostics::new();
        for _ in 0..3 {
            d.record_frame_encoded(100, false);
        }
        d.record_frame_dropped();
        let r = d.get_report();
        assert!((r.drop_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_everything() {
        let d = Diagnostics::new();
        d.record_frame_encoded(100, true);
        d.record_heartbeat_sent();
        d.record_jitter_sample(5.0);
        d.reset();

        let r = d.get_report();
        assert_eq!(r.frames_encoded, 0);
        assert_eq!(r.heartbeats_sent, 0);
        assert_eq!(r.average_jitter_ms, 0.0);
    }

    #[test]
    fn jitter_ring_averages_samples() {
        let d = Diagnostics::new();
        d.record_jitter_sample(10.0);
        d.record_jitter_sample(20.0);
        let r = d.get_report();
        assert!((r.average_jitter_ms - 15.0).abs() < 1e-9);
    }

    #[test]
    fn jitter_ring_is_capped_at_100_samples() {
        let d = Diagnostics::new();
        for i in 0..150 {
            d.record_jitter_sample(f64::from(i));
        }
        let windows = d.windows.lock().unwrap();
        assert_eq!(windows.jitter_ring.len(), JITTER_RING_SIZE);
    }

    #[test]
    fn summary_mirrors_report() {
        let d = Diagnostics::new();
        d.record_frame_encoded(100, true);
        d.record_reconnect_attempt();
        let summary = d.get_summary();
        let report = d.get_report();
        assert_eq!(summary.reconnect_attempts, report.reconnect_attempts);
    }
}
