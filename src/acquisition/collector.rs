//! Frame collector: drains the camera ring buffer while the scan runs.
//!
//! The collector polls the buffer at a fixed interval, pops frames one at a
//! time and pairs each with the next [`SequenceEvent`] of the acquisition's
//! trigger order. Pairing is a strict zip: the n-th popped frame always gets
//! the n-th event, so frames are never reordered or skipped.
//!
//! Two watchdogs bound the loop:
//!
//! - **first-frame**: from collector start to the first pop
//! - **inter-frame**: between consecutive pops
//!
//! Cancellation is cooperative through [`CancelFlag`], observed once per poll
//! iteration. Whatever the outcome, surplus frames left in the buffer are
//! drained so the next run starts empty.

use futures::stream::{self, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::core::{AcquiredFrame, SequenceEvent};
use crate::error::{CollectError, WatchdogPhase};
use crate::hardware::CameraBuffer;

/// Upper bound on frames discarded by one drain, in case the camera keeps
/// producing while we drain.
pub const MAX_DRAIN_FRAMES: u32 = 4096;

/// Collector timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Sleep between empty-buffer checks.
    pub poll_interval: Duration,
    /// Maximum wait from start to the first frame.
    pub first_frame_timeout: Duration,
    /// Maximum wait between consecutive frames.
    pub inter_frame_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2),
            first_frame_timeout: Duration::from_secs(10),
            inter_frame_timeout: Duration::from_secs(5),
        }
    }
}

/// Cooperative cancellation flag shared between a run's handle and its collector.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where paired frames go.
pub enum FrameSink {
    /// Bounded channel. A full channel applies back-pressure to the collector;
    /// a closed channel discards frames.
    Channel(mpsc::Sender<AcquiredFrame>),
    /// Invoked inline on the collector task, once per frame in order.
    Callback(Box<dyn FnMut(AcquiredFrame) + Send>),
}

enum Delivery {
    Delivered,
    Discarded,
    Cancelled,
}

impl FrameSink {
    async fn emit(
        &mut self,
        frame: AcquiredFrame,
        cancel: &CancelFlag,
        poll_interval: Duration,
    ) -> Delivery {
        match self {
            FrameSink::Callback(callback) => {
                callback(frame);
                Delivery::Delivered
            }
            FrameSink::Channel(tx) => {
                let mut pending = frame;
                loop {
                    match tx.try_send(pending) {
                        Ok(()) => return Delivery::Delivered,
                        Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Discarded,
                        Err(mpsc::error::TrySendError::Full(frame)) => {
                            if cancel.is_cancelled() {
                                return Delivery::Cancelled;
                            }
                            pending = frame;
                            sleep(poll_interval).await;
                        }
                    }
                }
            }
        }
    }
}

/// How a collector run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// All expected frames were paired.
    Completed,
    /// The cancel flag was observed.
    Cancelled,
}

/// Summary of a collector run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectReport {
    /// Completion or cancellation.
    pub outcome: CollectOutcome,
    /// Frames paired and emitted.
    pub collected: u32,
    /// Frames the run expected.
    pub expected: u32,
    /// Frames found in the buffer after the loop ended.
    pub surplus_drained: u32,
    /// Time spent in the loop.
    pub elapsed: Duration,
}

/// Discard everything left in the ring buffer. Returns the number of frames dropped.
pub fn drain_ring_buffer(camera: &dyn CameraBuffer) -> u32 {
    let mut drained = 0;
    while drained < MAX_DRAIN_FRAMES && camera.remaining_count() > 0 {
        match camera.pop_next() {
            Ok(_) => drained += 1,
            Err(e) => {
                warn!(error = %e, drained, "Failed to drain ring buffer");
                break;
            }
        }
    }
    if drained > 0 {
        debug!(drained, "Drained surplus frames");
    }
    drained
}

/// Concurrent worker pairing camera frames with sequence events.
pub struct FrameCollector {
    camera: Arc<dyn CameraBuffer>,
    config: CollectorConfig,
    cancel: CancelFlag,
    progress: Arc<AtomicU32>,
}

impl FrameCollector {
    /// Create a collector polling `camera`.
    pub fn new(camera: Arc<dyn CameraBuffer>, config: CollectorConfig) -> Self {
        Self {
            camera,
            config,
            cancel: CancelFlag::new(),
            progress: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Use an existing cancel flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish progress through an existing counter.
    pub fn with_progress(mut self, progress: Arc<AtomicU32>) -> Self {
        self.progress = progress;
        self
    }

    /// Flag that stops this collector.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Live count of emitted frames.
    pub fn progress(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.progress)
    }

    /// Run the poll loop until `expected` frames are paired, the run is
    /// cancelled, or a fault stops it.
    pub async fn run(
        self,
        expected: u32,
        events: impl Iterator<Item = SequenceEvent> + Send,
        mut sink: FrameSink,
    ) -> Result<CollectReport, CollectError> {
        let started = Instant::now();
        let mut events = events;
        let mut last_frame_at: Option<Instant> = None;
        let mut collected: u32 = 0;
        let mut warned_closed = false;

        info!(
            expected,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Frame collector started"
        );

        let result = loop {
            if collected >= expected {
                break Ok(CollectOutcome::Completed);
            }
            if self.cancel.is_cancelled() {
                info!(collected, expected, "Frame collector cancelled");
                break Ok(CollectOutcome::Cancelled);
            }

            if self.camera.remaining_count() > 0 {
                let Some(event) = events.next() else {
                    break Err(CollectError::EventOrderExhausted { collected });
                };
                let raw = match self.camera.pop_next() {
                    Ok(raw) => raw,
                    Err(e) => {
                        break Err(CollectError::PopFailed {
                            collected,
                            reason: format!("{:#}", e),
                        })
                    }
                };
                let frame = AcquiredFrame::pair(raw, event, collected);
                debug!(
                    frame_index = collected,
                    timepoint = event.timepoint,
                    z_index = event.z_index,
                    channel = event.channel,
                    "Frame paired"
                );
                match sink
                    .emit(frame, &self.cancel, self.config.poll_interval)
                    .await
                {
                    Delivery::Delivered => {}
                    Delivery::Discarded => {
                        if !warned_closed {
                            warn!("Frame receiver dropped; discarding further frames");
                            warned_closed = true;
                        }
                    }
                    Delivery::Cancelled => {
                        info!(collected, expected, "Frame collector cancelled");
                        break Ok(CollectOutcome::Cancelled);
                    }
                }
                collected += 1;
                self.progress.store(collected, Ordering::SeqCst);
                last_frame_at = Some(Instant::now());
                continue;
            }

            // Re-check the count after the running flag to catch a frame that
            // landed between the two reads.
            if !self.camera.is_sequence_running() && self.camera.remaining_count() == 0 {
                break Err(CollectError::SequenceStoppedEarly {
                    collected,
                    expected,
                });
            }

            let (phase, since, limit) = match last_frame_at {
                None => (
                    WatchdogPhase::FirstFrame,
                    started,
                    self.config.first_frame_timeout,
                ),
                Some(t) => (WatchdogPhase::InterFrame, t, self.config.inter_frame_timeout),
            };
            let waited = since.elapsed();
            if waited >= limit {
                break Err(CollectError::Timeout {
                    phase,
                    waited,
                    collected,
                    expected,
                });
            }

            sleep(self.config.poll_interval).await;
        };

        let surplus_drained = drain_ring_buffer(self.camera.as_ref());

        match result {
            Ok(outcome) => {
                let elapsed = started.elapsed();
                info!(
                    collected,
                    expected,
                    surplus_drained,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Frame collector finished"
                );
                Ok(CollectReport {
                    outcome,
                    collected,
                    expected,
                    surplus_drained,
                    elapsed,
                })
            }
            Err(e) => {
                warn!(error = %e, surplus_drained, "Frame collector stopped early");
                Err(e)
            }
        }
    }

    /// Spawn the collector and expose its output as a stream.
    ///
    /// Frames are yielded in pairing order; if the run fails, the error is the
    /// final item. Must be called from within a tokio runtime.
    pub fn collect(
        self,
        expected: u32,
        events: impl Iterator<Item = SequenceEvent> + Send + 'static,
        capacity: usize,
    ) -> impl Stream<Item = Result<AcquiredFrame, CollectError>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(expected, events, FrameSink::Channel(tx)));

        let terminal = stream::once(async move {
            match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(Err(e)),
                Err(join) => Some(Err(CollectError::TaskFailed(join.to_string()))),
            }
        })
        .filter_map(|item| async move { item });

        ReceiverStream::new(rx).map(Ok).chain(terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::sequence::SequenceOrder;
    use crate::core::PixelBuffer;
    use crate::hardware::mock::{FaultPlan, SimulatedCamera};

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_millis(1),
            first_frame_timeout: Duration::from_millis(100),
            inter_frame_timeout: Duration::from_millis(50),
        }
    }

    fn camera() -> Arc<SimulatedCamera> {
        Arc::new(SimulatedCamera::new(2, 2, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_frames_paired_in_pop_order() {
        let cam = camera();
        cam.push_frames(6);
        let (tx, mut rx) = mpsc::channel(16);

        let report = FrameCollector::new(cam.clone(), fast_config())
            .run(6, SequenceOrder::new(2, 3, 1), FrameSink::Channel(tx))
            .await
            .unwrap();
        assert_eq!(report.outcome, CollectOutcome::Completed);
        assert_eq!(report.collected, 6);

        let mut expected_events = SequenceOrder::new(2, 3, 1);
        for i in 0..6u32 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.frame_index, i);
            assert_eq!(Some(frame.event), expected_events.next());
            assert_eq!(frame.pixels, PixelBuffer::U16(vec![i as u16; 4]));
        }
    }

    #[tokio::test]
    async fn test_stall_hits_inter_frame_timeout() {
        let cam = camera();
        cam.push_frames(4);
        cam.set_running(true);
        let (tx, _rx) = mpsc::channel(16);

        let err = FrameCollector::new(cam, fast_config())
            .run(5, SequenceOrder::new(1, 5, 1), FrameSink::Channel(tx))
            .await
            .unwrap_err();
        match err {
            CollectError::Timeout {
                phase,
                collected,
                expected,
                ..
            } => {
                assert_eq!(phase, WatchdogPhase::InterFrame);
                assert_eq!((collected, expected), (4, 5));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_frame_timeout() {
        let cam = camera();
        cam.set_running(true);
        let (tx, _rx) = mpsc::channel(1);

        let err = FrameCollector::new(cam, fast_config())
            .run(3, SequenceOrder::new(1, 3, 1), FrameSink::Channel(tx))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollectError::Timeout {
                phase: WatchdogPhase::FirstFrame,
                collected: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sequence_stopped_early() {
        let cam = camera();
        cam.push_frames(2);
        let (tx, _rx) = mpsc::channel(16);

        let err = FrameCollector::new(cam, fast_config())
            .run(5, SequenceOrder::new(1, 5, 1), FrameSink::Channel(tx))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CollectError::SequenceStoppedEarly {
                collected: 2,
                expected: 5
            }
        );
    }

    #[tokio::test]
    async fn test_pop_failure_is_fatal() {
        let cam = Arc::new(
            SimulatedCamera::new(2, 2, Duration::from_millis(1)).with_faults(FaultPlan {
                fail_pop_at: Some(2),
                ..Default::default()
            }),
        );
        cam.push_frames(4);
        let (tx, _rx) = mpsc::channel(16);

        let err = FrameCollector::new(cam, fast_config())
            .run(4, SequenceOrder::new(1, 4, 1), FrameSink::Channel(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::PopFailed { collected: 2, .. }));
    }

    #[tokio::test]
    async fn test_surplus_frames_drained() {
        let cam = camera();
        cam.push_frames(7);
        let (tx, _rx) = mpsc::channel(16);

        let report = FrameCollector::new(cam.clone(), fast_config())
            .run(5, SequenceOrder::new(1, 5, 1), FrameSink::Channel(tx))
            .await
            .unwrap();
        assert_eq!(report.collected, 5);
        assert_eq!(report.surplus_drained, 2);
        assert_eq!(cam.remaining_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_keeps_collecting() {
        let cam = camera();
        cam.push_frames(3);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let report = FrameCollector::new(cam, fast_config())
            .run(3, SequenceOrder::new(1, 3, 1), FrameSink::Channel(tx))
            .await
            .unwrap();
        assert_eq!(report.collected, 3);
    }

    #[tokio::test]
    async fn test_cancel_observed_before_pop() {
        let cam = camera();
        cam.push_frames(3);
        let collector = FrameCollector::new(cam, fast_config());
        collector.cancel_flag().cancel();
        let (tx, _rx) = mpsc::channel(16);

        let report = collector
            .run(3, SequenceOrder::new(1, 3, 1), FrameSink::Channel(tx))
            .await
            .unwrap();
        assert_eq!(report.outcome, CollectOutcome::Cancelled);
        assert_eq!(report.collected, 0);
        assert_eq!(report.surplus_drained, 3);
    }

    #[tokio::test]
    async fn test_callback_sink_in_order() {
        let cam = camera();
        cam.push_frames(4);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = FrameSink::Callback(Box::new(move |frame: AcquiredFrame| {
            sink_seen.lock().push(frame.frame_index);
        }));

        FrameCollector::new(cam, fast_config())
            .run(4, SequenceOrder::new(1, 4, 1), sink)
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_ends_with_terminal_error() {
        let cam = camera();
        cam.push_frames(2);
        let items: Vec<_> = FrameCollector::new(cam, fast_config())
            .collect(3, SequenceOrder::new(1, 3, 1), 8)
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(
            items[2],
            Err(CollectError::SequenceStoppedEarly { collected: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_completes_without_error() {
        let cam = camera();
        cam.push_frames(3);
        let items: Vec<_> = FrameCollector::new(cam, fast_config())
            .collect(3, SequenceOrder::new(1, 3, 1), 8)
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.is_ok()));
    }
}
