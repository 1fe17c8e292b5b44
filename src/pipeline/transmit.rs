use super::queue::{EnqueueOutcome, FrameQueue};
use super::retry::RetryPolicy;
use crate::error::{StreamError, TransportError};
use crate::frame::SequencedFrame;
use crate::results::ResultDemultiplexer;
use crate::transport::FrameSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Drain worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub capacity: usize,
    pub retry: RetryPolicy,
    /// Upper bound on a single send; exceeding it counts as a transient failure
    pub send_timeout: Duration,
}

/// Counters shared between the pipeline handle and its worker
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub sent: AtomicU64,
    pub retries: AtomicU64,
    pub backpressure: AtomicU64,
    pub dropped_oldest: AtomicU64,
}

/// How the drain worker ended
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Frames transmitted over the pipeline's life
    pub sent: u64,
    /// Frames dropped without being sent
    pub discarded: usize,
    /// Set when retries were exhausted
    pub failure: Option<StreamError>,
}

/// Bounded queue plus one drain worker for a single session.
///
/// Frames leave in exactly the order they were enqueued, one at a time.
pub struct TransmissionPipeline {
    session_id: Arc<str>,
    queue: Arc<FrameQueue>,
    counters: Arc<PipelineCounters>,
    worker: Mutex<Option<JoinHandle<DrainReport>>>,
}

impl TransmissionPipeline {
    /// Start the drain worker for a session.
    ///
    /// Sent frames are registered with `demux` before their first attempt so
    /// a fast result cannot arrive ahead of its registration. A fatal
    /// transmission failure is reported on `faults`.
    pub fn spawn(
        session_id: &str,
        sink: Box<dyn FrameSink>,
        config: WorkerConfig,
        demux: Arc<ResultDemultiplexer>,
        faults: mpsc::Sender<StreamError>,
    ) -> Self {
        let session_id: Arc<str> = Arc::from(session_id);
        let queue = Arc::new(FrameQueue::new(config.capacity));
        let counters = Arc::new(PipelineCounters::default());

        let worker = DrainWorker {
            session_id: Arc::clone(&session_id),
            queue: Arc::clone(&queue),
            counters: Arc::clone(&counters),
            sink,
            retry: config.retry,
            send_timeout: config.send_timeout,
            demux,
            faults,
        };

        info!(
            session_id = %session_id,
            capacity = queue.capacity(),
            "Transmission pipeline started"
        );

        Self {
            session_id,
            queue,
            counters,
            worker: Mutex::new(Some(tokio::spawn(worker.run()))),
        }
    }

    /// Offer a sequenced frame. Never blocks.
    pub fn enqueue(&self, frame: SequencedFrame) -> EnqueueOutcome {
        self.enqueue_with(|| frame)
    }

    /// Offer a frame built only once room is guaranteed.
    ///
    /// Lets the caller assign a sequence number atomically with acceptance.
    pub fn enqueue_with<F>(&self, make: F) -> EnqueueOutcome
    where
        F: FnOnce() -> SequencedFrame,
    {
        let outcome = self.queue.try_push_with(make);
        if outcome == EnqueueOutcome::Backpressure {
            self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %self.session_id, "Transmission queue full");
        }
        outcome
    }

    /// Drop the oldest frame still waiting to be sent.
    pub fn drop_oldest(&self) -> Option<SequencedFrame> {
        let dropped = self.queue.pop_oldest();
        if let Some(frame) = &dropped {
            self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %self.session_id,
                sequence = frame.sequence,
                "Dropped oldest unsent frame"
            );
        }
        dropped
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    /// Stop accepting frames, flush the queue, and wait for the worker.
    ///
    /// Frames still queued when `grace` runs out are discarded and counted.
    /// A send already in progress is allowed to finish.
    pub async fn close(&self, grace: Duration) -> DrainReport {
        self.queue.close();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return DrainReport {
                sent: self.counters.sent.load(Ordering::SeqCst),
                ..DrainReport::default()
            };
        };

        let joined = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                let discarded = self.queue.discard();
                warn!(
                    session_id = %self.session_id,
                    discarded,
                    "Flush grace period expired; discarding queued frames"
                );
                handle.await.map(|mut report| {
                    report.discarded += discarded;
                    report
                })
            }
        };

        joined.unwrap_or_else(|e| {
            error!(session_id = %self.session_id, "Drain worker panicked: {}", e);
            DrainReport {
                sent: self.counters.sent.load(Ordering::SeqCst),
                discarded: self.queue.discard(),
                failure: None,
            }
        })
    }
}

struct DrainWorker {
    session_id: Arc<str>,
    queue: Arc<FrameQueue>,
    counters: Arc<PipelineCounters>,
    sink: Box<dyn FrameSink>,
    retry: RetryPolicy,
    send_timeout: Duration,
    demux: Arc<ResultDemultiplexer>,
    faults: mpsc::Sender<StreamError>,
}

impl DrainWorker {
    async fn run(mut self) -> DrainReport {
        debug!(session_id = %self.session_id, "Drain worker started");
        let mut next_sequence = 0;

        while let Some(frame) = self.queue.next().await {
            self.demux.register_sent(frame.sequence);
            let result = self.transmit(&frame).await;
            self.queue.complete();

            match result {
                Ok(()) => {
                    next_sequence = frame.sequence + 1;
                    self.counters.sent.fetch_add(1, Ordering::SeqCst);
                }
                Err(cause) => {
                    let discarded = self.queue.discard();
                    error!(
                        session_id = %self.session_id,
                        sequence = frame.sequence,
                        discarded,
                        "Transmission failed: {}",
                        cause
                    );
                    if self.faults.send(cause.clone()).await.is_err() {
                        debug!(session_id = %self.session_id, "Fault receiver gone");
                    }
                    return DrainReport {
                        sent: self.counters.sent.load(Ordering::SeqCst),
                        discarded,
                        failure: Some(cause),
                    };
                }
            }
        }

        if let Err(e) = self.sink.finish(next_sequence).await {
            warn!(session_id = %self.session_id, "Failed to send end-of-stream marker: {}", e);
        }

        let sent = self.counters.sent.load(Ordering::SeqCst);
        info!(session_id = %self.session_id, sent, "Drain worker stopped");
        DrainReport {
            sent,
            discarded: 0,
            failure: None,
        }
    }

    /// Send one frame, retrying transient failures with backoff.
    async fn transmit(&mut self, frame: &SequencedFrame) -> Result<(), StreamError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(self.send_timeout, self.sink.send(frame)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout),
            };

            match outcome {
                Ok(()) => {
                    debug!(
                        session_id = %self.session_id,
                        sequence = frame.sequence,
                        attempts,
                        "Frame sent"
                    );
                    return Ok(());
                }
                Err(cause) if cause.is_transient() && attempts < self.retry.max_attempts => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay_after(attempts);
                    warn!(
                        session_id = %self.session_id,
                        sequence = frame.sequence,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient send failure, retrying: {}",
                        cause
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(cause) => {
                    return Err(StreamError::TransmissionFailed {
                        sequence: frame.sequence,
                        attempts,
                        cause,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Semaphore;

    /// Records sent sequences; fails according to a script; optionally gated.
    struct ScriptedSink {
        sent: Arc<Mutex<Vec<u64>>>,
        failures: VecDeque<TransportError>,
        gate: Option<Arc<Semaphore>>,
        finished: Arc<Mutex<Option<u64>>>,
    }

    #[async_trait::async_trait]
    impl FrameSink for ScriptedSink {
        async fn send(&mut self, frame: &SequencedFrame) -> Result<(), TransportError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(err) = self.failures.pop_front() {
                return Err(err);
            }
            self.sent.lock().unwrap().push(frame.sequence);
            Ok(())
        }

        async fn finish(&mut self, next_sequence: u64) -> Result<(), TransportError> {
            *self.finished.lock().unwrap() = Some(next_sequence);
            Ok(())
        }
    }

    struct Harness {
        pipeline: TransmissionPipeline,
        sent: Arc<Mutex<Vec<u64>>>,
        finished: Arc<Mutex<Option<u64>>>,
        faults: mpsc::Receiver<StreamError>,
        demux: Arc<ResultDemultiplexer>,
    }

    fn harness(
        capacity: usize,
        failures: Vec<TransportError>,
        gate: Option<Arc<Semaphore>>,
    ) -> Harness {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(None));
        let sink = ScriptedSink {
            sent: Arc::clone(&sent),
            failures: failures.into(),
            gate,
            finished: Arc::clone(&finished),
        };
        let demux = Arc::new(ResultDemultiplexer::new("s", 1024, Duration::from_secs(1)));
        let (fault_tx, faults) = mpsc::channel(4);
        let pipeline = TransmissionPipeline::spawn(
            "s",
            Box::new(sink),
            WorkerConfig {
                capacity,
                retry: RetryPolicy::default(),
                send_timeout: Duration::from_secs(1),
            },
            Arc::clone(&demux),
            fault_tx,
        );
        Harness {
            pipeline,
            sent,
            finished,
            faults,
            demux,
        }
    }

    fn frame(sequence: u64) -> SequencedFrame {
        SequencedFrame {
            session_id: Arc::from("s"),
            sequence,
            pcm: vec![0; 4],
            capture_timestamp_ms: sequence * 16,
            late: false,
        }
    }

    #[tokio::test]
    async fn test_frames_sent_in_enqueue_order() {
        let h = harness(64, vec![], None);
        for seq in 0..50 {
            assert_eq!(
                h.pipeline.enqueue(frame(seq)),
                EnqueueOutcome::Accepted { sequence: seq }
            );
        }
        let report = h.pipeline.close(Duration::from_secs(2)).await;
        assert_eq!(report.sent, 50);
        assert_eq!(report.discarded, 0);
        assert!(report.failure.is_none());
        assert_eq!(*h.sent.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(*h.finished.lock().unwrap(), Some(50));
        assert_eq!(h.demux.outstanding(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let failures = vec![
            TransportError::Unavailable("hiccup".into()),
            TransportError::Timeout,
        ];
        let h = harness(8, failures, None);
        h.pipeline.enqueue(frame(0));
        let report = h.pipeline.close(Duration::from_secs(2)).await;
        assert_eq!(report.sent, 1);
        assert_eq!(h.pipeline.counters().retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_reports_fault() {
        let failures = vec![TransportError::Unavailable("down".into()); 3];
        let mut h = harness(8, failures, None);
        h.pipeline.enqueue(frame(0));

        let fault = h.faults.recv().await.unwrap();
        assert!(matches!(
            fault,
            StreamError::TransmissionFailed {
                sequence: 0,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(h.pipeline.enqueue(frame(1)), EnqueueOutcome::Closed);
        let report = h.pipeline.close(Duration::from_secs(1)).await;
        assert!(report.failure.is_some());
        assert_eq!(report.sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_discards_queued_frames() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(16, vec![], Some(Arc::clone(&gate)));
        for seq in 0..10 {
            h.pipeline.enqueue(frame(seq));
        }
        gate.add_permits(3);

        let closing = tokio::spawn(async move {
            let report = h.pipeline.close(Duration::from_millis(500)).await;
            (report, h.sent)
        });
        // Let the flush stall, then release the in-flight send.
        tokio::time::sleep(Duration::from_millis(600)).await;
        gate.add_permits(1);

        let (report, sent) = closing.await.unwrap();
        assert_eq!(report.sent, 4);
        assert_eq!(report.discarded, 6);
        assert_eq!(*sent.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
