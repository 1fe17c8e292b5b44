use crate::frame::SequencedFrame;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Result of offering a frame to the transmission queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued for transmission with this sequence number
    Accepted { sequence: u64 },
    /// Queue full; nothing was changed
    Backpressure,
    /// Pipeline no longer takes frames
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<SequencedFrame>,
    /// The worker holds a frame it has not finished sending
    in_flight: bool,
    closed: bool,
}

/// Bounded FIFO between the capture path and the drain worker.
///
/// The frame being transmitted still counts against capacity, so a queue of
/// capacity C holds at most C unsent frames.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unsent frames, including the one in flight
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.frames.len() + usize::from(state.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Build and push a frame only if there is room.
    ///
    /// `make` runs under the queue lock and only when the frame will be
    /// accepted, so a refused offer has no side effects.
    pub fn try_push_with<F>(&self, make: F) -> EnqueueOutcome
    where
        F: FnOnce() -> SequencedFrame,
    {
        let mut state = self.lock();
        if state.closed {
            return EnqueueOutcome::Closed;
        }
        if state.frames.len() + usize::from(state.in_flight) >= self.capacity {
            return EnqueueOutcome::Backpressure;
        }
        let frame = make();
        let sequence = frame.sequence;
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        EnqueueOutcome::Accepted { sequence }
    }

    /// Remove the oldest frame not yet handed to the worker.
    pub fn pop_oldest(&self) -> Option<SequencedFrame> {
        self.lock().frames.pop_front()
    }

    /// Wait for the next frame to transmit and mark it in flight.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<SequencedFrame> {
        loop {
            let ready = self.ready.notified();
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    state.in_flight = true;
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// The in-flight frame is done (sent or abandoned).
    pub fn complete(&self) {
        self.lock().in_flight = false;
    }

    /// Refuse new frames; queued frames remain for the worker to drain.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    /// Close and drop every queued frame, returning how many were dropped.
    pub fn discard(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let dropped = state.frames.len();
        state.frames.clear();
        drop(state);
        self.ready.notify_one();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(sequence: u64) -> SequencedFrame {
        SequencedFrame {
            session_id: Arc::from("s"),
            sequence,
            pcm: vec![0; 2],
            capture_timestamp_ms: sequence * 16,
            late: false,
        }
    }

    #[test]
    fn test_backpressure_leaves_contents_untouched() {
        let queue = FrameQueue::new(2);
        assert_eq!(
            queue.try_push_with(|| frame(0)),
            EnqueueOutcome::Accepted { sequence: 0 }
        );
        assert_eq!(
            queue.try_push_with(|| frame(1)),
            EnqueueOutcome::Accepted { sequence: 1 }
        );

        let mut called = false;
        let outcome = queue.try_push_with(|| {
            called = true;
            frame(2)
        });
        assert_eq!(outcome, EnqueueOutcome::Backpressure);
        assert!(!called, "refused offer must not build a frame");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_oldest().map(|f| f.sequence), Some(0));
    }

    #[tokio::test]
    async fn test_in_flight_frame_counts_against_capacity() {
        let queue = FrameQueue::new(1);
        queue.try_push_with(|| frame(0));
        let taken = queue.next().await.unwrap();
        assert_eq!(taken.sequence, 0);
        assert_eq!(queue.try_push_with(|| frame(1)), EnqueueOutcome::Backpressure);

        queue.complete();
        assert_eq!(
            queue.try_push_with(|| frame(1)),
            EnqueueOutcome::Accepted { sequence: 1 }
        );
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = FrameQueue::new(4);
        queue.try_push_with(|| frame(0));
        queue.close();
        assert_eq!(queue.try_push_with(|| frame(1)), EnqueueOutcome::Closed);
        assert_eq!(queue.next().await.map(|f| f.sequence), Some(0));
        queue.complete();
        assert!(queue.next().await.is_none());
    }

    #[test]
    fn test_discard_counts_dropped_frames() {
        let queue = FrameQueue::new(8);
        for seq in 0..5 {
            queue.try_push_with(|| frame(seq));
        }
        assert_eq!(queue.discard(), 5);
        assert!(queue.is_empty());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_worker_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.map(|f| f.sequence) })
        };
        tokio::task::yield_now().await;
        queue.try_push_with(|| frame(9));
        assert_eq!(worker.await.unwrap(), Some(9));
    }
}
