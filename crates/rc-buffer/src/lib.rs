//! Bounded, keyframe-aware frame buffer.
//!
//! The buffer mediates between the capture/encode context (producer) and
//! the media channel pump (consumer). It never blocks: every push
//! returns immediately with an outcome describing what happened, so
//! callers can attribute drops in [`rc_diagnostics`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rc_encode::Frame;
use tokio::sync::Notify;

/// Default capacity: ~2 seconds of video at the primary encoder's 15 fps.
pub const DEFAULT_CAPACITY: usize = 30;

/// Outcome of a [`FrameBuffer::try_push`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was appended without evicting anything.
    Accepted,
    /// The frame was appended after evicting the oldest non-keyframe.
    DroppedOldPFrame,
    /// The incoming non-keyframe was rejected; the buffer is unchanged.
    DroppedNew,
}

struct Inner {
    queue: VecDeque<Frame>,
    capacity: usize,
}

/// Bounded FIFO queue of encoded frames with a keyframe-preserving drop
/// policy. See the module docs for the eviction rules.
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    len: AtomicUsize,
    notify: Notify,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
            }),
            len: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Attempt to push a frame without blocking.
    ///
    /// See §4.1's drop policy: a keyframe is only rejected in favor of
    /// the incoming one never happens — keyframes in the buffer always
    /// survive. A non-keyframe may be rejected (`DroppedNew`) when the
    /// buffer is entirely full of keyframes.
    pub fn try_push(&self, frame: Frame) -> PushOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let capacity = inner.capacity;

        let outcome = if frame.is_keyframe {
            inner.queue.push_back(frame);
            if inner.queue.len() > capacity {
                if let Some(pos) = inner.queue.iter().position(|f| !f.is_keyframe) {
                    inner.queue.remove(pos);
                }
            }
            PushOutcome::Accepted
        } else if inner.queue.len() < capacity {
            inner.queue.push_back(frame);
            PushOutcome::Accepted
        } else if let Some(pos) = inner.queue.iter().position(|f| !f.is_keyframe) {
            inner.queue.remove(pos);
            inner.queue.push_back(frame);
            PushOutcome::DroppedOldPFrame
        } else {
            PushOutcome::DroppedNew
        };

        self.len.store(inner.queue.len(), Ordering::Release);
        if outcome != PushOutcome::Accepted {
            tracing::trace!(?outcome, "frame buffer push did not land cleanly");
        }
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Pop the oldest frame, if any.
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let frame = inner.queue.pop_front();
        self.len.store(inner.queue.len(), Ordering::Release);
        frame
    }

    /// Pop the oldest frame, waiting (without busy-polling) while the
    /// buffer is empty. Cancel-safe: dropping the future before it
    /// resolves leaves the buffer untouched.
    pub async fn pop_wait(&self) -> Frame {
        loop {
            // Registering interest before checking avoids missing a
            // notification that lands between the check and the await.
            let notified = self.notify.notified();
            if let Some(frame) = self.pop() {
                return frame;
            }
            notified.await;
        }
    }

    /// Pop up to `max` frames without blocking, for batch hand-off after
    /// a drain tick.
    pub fn pop_batch(&self, max: usize) -> Vec<Frame> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let drained: Vec<Frame> = (0..max).map_while(|_| inner.queue.pop_front()).collect();
        self.len.store(inner.queue.len(), Ordering::Release);
        drained
    }

    /// Drop all buffered frames.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.queue.clear();
        self.len.store(0, Ordering::Release);
    }

    /// Current number of buffered frames. Served from an atomic
    /// published alongside the mutex-guarded queue for O(1), lock-free
    /// observability.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).capacity
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Percentage of capacity currently in use (0-100, may exceed 100
    /// during the transient keyframe-overflow step).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = (self.len() as f64 / capacity as f64) * 100.0;
        pct
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_encode::CodecTag;

    fn keyframe(ts: u64) -> Frame {
        Frame {
            payload: bytes_for(ts),
            is_keyframe: true,
            codec: CodecTag::H264,
            timestamp_ms: ts,
        }
    }

    fn pframe(ts: u64) -> Frame {
        Frame {
            payload: bytes_for(ts),
            is_keyframe: false,
            codec: CodecTag::H264,
            timestamp_ms: ts,
        }
    }

    fn bytes_for(ts: u64) -> bytes::Bytes {
        bytes::Bytes::from(ts.to_le_bytes().to_vec())
    }

    #[test]
    fn accepts_until_capacity() {
        let buf = FrameBuffer::new(4);
        for i in 0..4 {
            assert_eq!(buf.try_push(pframe(i)), PushOutcome::Accepted);
        }
        assert_eq!(buf.len(), 4);
        assert!(buf.is_full());
    }

    #[test]
    fn non_keyframe_evicts_oldest_non_keyframe_when_full() {
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        buf.try_push(pframe(2));
        buf.try_push(pframe(3));

        let outcome = buf.try_push(pframe(4));
        assert_eq!(outcome, PushOutcome::DroppedOldPFrame);
        assert_eq!(buf.len(), 4);

        // oldest non-keyframe (ts=1) evicted, keyframe survives
        let mut remaining = Vec::new();
        while let Some(f) = buf.pop() {
            remaining.push(f.timestamp_ms);
        }
        assert_eq!(remaining, vec![0, 2, 3, 4]);
    }

    #[test]
    fn non_keyframe_rejected_when_buffer_is_all_keyframes() {
        let buf = FrameBuffer::new(2);
        buf.try_push(keyframe(0));
        buf.try_push(keyframe(1));

        let outcome = buf.try_push(pframe(2));
        assert_eq!(outcome, PushOutcome::DroppedNew);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn keyframe_evicts_one_non_keyframe_and_is_always_admitted() {
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        buf.try_push(pframe(2));
        buf.try_push(pframe(3));

        assert_eq!(buf.try_push(keyframe(4)), PushOutcome::Accepted);
        // one P-frame evicted to make room, keyframe admitted
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn keyframe_transiently_overflows_when_no_non_keyframe_to_evict() {
        let buf = FrameBuffer::new(2);
        buf.try_push(keyframe(0));
        buf.try_push(keyframe(1));

        assert_eq!(buf.try_push(keyframe(2)), PushOutcome::Accepted);
        assert_eq!(buf.len(), 3); // capacity + 1, tolerated for one step

        let drained = buf.pop();
        assert_eq!(drained.unwrap().timestamp_ms, 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn clear_resets_to_empty() {
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert!(buf.pop().is_none());
    }

    #[test]
    fn pop_is_fifo() {
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        buf.try_push(pframe(2));

        assert_eq!(buf.pop().unwrap().timestamp_ms, 0);
        assert_eq!(buf.pop().unwrap().timestamp_ms, 1);
        assert_eq!(buf.pop().unwrap().timestamp_ms, 2);
        assert!(buf.pop().is_none());
    }

    #[test]
    fn scenario_s4_backpressure() {
        // Buffer capacity 4, already holds [K, P, P, P].
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        buf.try_push(pframe(2));
        buf.try_push(pframe(3));

        // Producer pushes P5 -> [K, P, P, P5] (oldest P evicted).
        assert_eq!(buf.try_push(pframe(5)), PushOutcome::DroppedOldPFrame);
        assert_eq!(buf.len(), 4);

        // Producer pushes K6 -> [K, P, P, P5, K6] transiently (size 5).
        assert_eq!(buf.try_push(keyframe(6)), PushOutcome::Accepted);
        assert_eq!(buf.len(), 5);

        // Consumer pops K -> [P, P, P5, K6].
        assert_eq!(buf.pop().unwrap().timestamp_ms, 0);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn utilization_reports_percent() {
        let buf = FrameBuffer::new(4);
        assert_eq!(buf.utilization(), 0.0);
        buf.try_push(keyframe(0));
        buf.try_push(pframe(1));
        assert!((buf.utilization() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pop_wait_returns_immediately_when_nonempty() {
        let buf = FrameBuffer::new(4);
        buf.try_push(keyframe(0));
        let frame = tokio::time::timeout(std::time::Duration::from_millis(50), buf.pop_wait())
            .await
            .expect("pop_wait should not block when a frame is already queued");
        assert_eq!(frame.timestamp_ms, 0);
    }

    #[tokio::test]
    async fn pop_wait_wakes_on_a_later_push() {
        use std::sync::Arc;

        let buf = Arc::new(FrameBuffer::new(4));
        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.pop_wait().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        buf.try_push(pframe(7));

        let frame = tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("pop_wait should wake once a frame is pushed")
            .expect("waiter task should not panic");
        assert_eq!(frame.timestamp_ms, 7);
    }

    #[test]
    fn pop_batch_caps_at_max_and_drains_fifo() {
        let buf = FrameBuffer::new(8);
        for i in 0..6 {
            buf.try_push(pframe(i));
        }
        let batch = buf.pop_batch(5);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.iter().map(|f| f.timestamp_ms).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(buf.len(), 1);
    }
}
