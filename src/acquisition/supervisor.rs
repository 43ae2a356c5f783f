//! Acquisition supervisor: the engine's public entry point.
//!
//! Owns the rig handle, runs the acquisition state machine and guarantees the
//! rig is returned to idle after every run, whatever the outcome.
//!
//! # Run Sequence
//!
//! 1. Claim the session slot (fail fast with `Busy` otherwise), enter `Preparing`
//! 2. Compile the timing program (no hardware touched on failure)
//! 3. Program the logic card and scanner, switch the camera to external
//!    trigger, arm the ring buffer for the expected image count
//! 4. Enter `Acquiring`, spawn the frame collector, **then** trigger the scan
//! 5. Await the collector on a supervise task; map its outcome
//! 6. `CleaningUp`: stop the sequence, drain the buffer, restore the rig
//! 7. Release the slot and return to `Idle`
//!
//! Steps 1-4 and 6-7 make blocking property and camera calls, so they run on
//! the blocking thread pool rather than on a runtime worker.
//!
//! Cleanup failures are logged and published on the diagnostics channel; they
//! never change the run's result.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::acquisition::collector::{
    drain_ring_buffer, CancelFlag, CollectOutcome, CollectReport, CollectorConfig,
    FrameCollector, FrameSink,
};
use crate::acquisition::sequence::SequenceOrder;
use crate::acquisition::state::AcquisitionState;
use crate::config::RigConfig;
use crate::core::{AcquiredFrame, AcquisitionParameters, CalibrationConstants};
use crate::error::{AcquisitionError, CollectError, HardwareError};
use crate::hardware::{CleanupFailure, CleanupScope, HardwareProgrammer, RigHandle};
use crate::timing::{LogicProgram, ScanParameters, TimingProgramCompiler};

const STATE_CHANNEL_CAPACITY: usize = 32;
const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 64;

/// Result of a completed acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionReport {
    /// Session identifier.
    pub session_id: Uuid,
    /// Frames delivered.
    pub images_collected: u32,
    /// Frames expected.
    pub images_expected: u32,
    /// Time from trigger to collector completion.
    pub elapsed: Duration,
    /// Extra frames discarded from the ring buffer.
    pub surplus_drained: u32,
}

/// A cleanup failure attributed to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupDiagnostic {
    /// Session whose cleanup failed.
    pub session_id: Uuid,
    /// What failed.
    pub failure: CleanupFailure,
    /// When it failed.
    pub at: DateTime<Utc>,
}

/// The active run, from successful compilation until the return to `Idle`.
#[derive(Debug)]
pub struct AcquisitionSession {
    /// Session identifier.
    pub session_id: Uuid,
    /// Parameters of the run.
    pub params: AcquisitionParameters,
    /// Compiled logic program.
    pub program: LogicProgram,
    /// Compiled scan settings.
    pub scan: ScanParameters,
    /// Frames the run expects.
    pub total_images_expected: u32,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    images_collected: Arc<AtomicU32>,
    state: Arc<RwLock<AcquisitionState>>,
}

impl AcquisitionSession {
    /// Current state of the run.
    pub fn state(&self) -> AcquisitionState {
        self.state.read().clone()
    }

    /// Frames delivered so far.
    pub fn images_collected(&self) -> u32 {
        self.images_collected.load(Ordering::SeqCst)
    }
}

struct Inner {
    rig: RigHandle,
    calibration: CalibrationConstants,
    compiler: TimingProgramCompiler,
    programmer: HardwareProgrammer,
    collector_config: CollectorConfig,
    camera_channels: u32,
    frame_capacity: usize,
    state: Arc<RwLock<AcquisitionState>>,
    session: RwLock<Option<Arc<AcquisitionSession>>>,
    session_active: AtomicBool,
    state_tx: broadcast::Sender<AcquisitionState>,
    diagnostics_tx: broadcast::Sender<CleanupDiagnostic>,
}

/// Holds the singleton hardware for one run. Released on drop.
struct SessionSlot {
    inner: Arc<Inner>,
}

impl SessionSlot {
    fn claim(inner: &Arc<Inner>) -> Result<Self, AcquisitionError> {
        inner
            .session_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AcquisitionError::Busy {
                state: inner.state.read().clone(),
            })?;
        Ok(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.inner.session_active.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn transition(&self, state: AcquisitionState) {
        *self.state.write() = state.clone();
        info!(state = %state, "Acquisition state changed");
        let _ = self.state_tx.send(state);
    }

    fn publish(&self, session_id: Uuid, failure: CleanupFailure) {
        let _ = self.diagnostics_tx.send(CleanupDiagnostic {
            session_id,
            failure,
            at: Utc::now(),
        });
    }

    /// Enter `CleaningUp` and restore what the run touched. Returns the number
    /// of frames drained after stopping the sequence.
    fn cleanup(&self, session_id: Uuid, scope: &CleanupScope) -> u32 {
        self.transition(AcquisitionState::CleaningUp);
        if !scope.hardware_touched {
            return 0;
        }

        if let Err(e) = self.rig.camera.stop_sequence() {
            warn!(error = %e, "Failed to stop camera sequence");
            self.publish(
                session_id,
                CleanupFailure {
                    device: self.programmer.devices().camera.clone(),
                    property: "Sequence".into(),
                    reason: format!("{:#}", e),
                },
            );
        }
        let drained = drain_ring_buffer(self.rig.camera.as_ref());

        for failure in self.programmer.cleanup(scope) {
            self.publish(session_id, failure);
        }
        drained
    }

    /// Return to `Idle`. The slot is released before the notification so a
    /// caller reacting to `Idle` can start the next run immediately.
    fn finish(&self, slot: SessionSlot) {
        *self.state.write() = AcquisitionState::Idle;
        *self.session.write() = None;
        drop(slot);
        info!(state = %AcquisitionState::Idle, "Acquisition state changed");
        let _ = self.state_tx.send(AcquisitionState::Idle);
    }

    /// Error path before the collector is running.
    fn abort(
        &self,
        slot: SessionSlot,
        session_id: Uuid,
        scope: &CleanupScope,
        err: AcquisitionError,
    ) -> AcquisitionError {
        error!(error = %err, "Acquisition aborted");
        self.transition(AcquisitionState::Error(err.to_string()));
        self.cleanup(session_id, scope);
        self.finish(slot);
        err
    }

    fn prepare_hardware(
        &self,
        program: &LogicProgram,
        scan: &ScanParameters,
        expected: u32,
    ) -> Result<(), HardwareError> {
        self.programmer.apply(program, scan)?;
        self.programmer.arm_external_trigger()?;
        self.rig
            .camera
            .start_sequence(expected, true)
            .map_err(|e| HardwareError::SequenceStartFailed {
                count: expected,
                reason: format!("{:#}", e),
            })?;
        info!(expected, "Camera sequence armed");
        Ok(())
    }

    fn conclude(
        &self,
        slot: SessionSlot,
        session_id: Uuid,
        scope: &CleanupScope,
        expected: u32,
        started: Instant,
        joined: Result<Result<CollectReport, CollectError>, tokio::task::JoinError>,
    ) -> Result<AcquisitionReport, AcquisitionError> {
        let outcome = match joined {
            Ok(Ok(report)) if report.outcome == CollectOutcome::Completed => Ok(report),
            Ok(Ok(report)) => {
                self.transition(AcquisitionState::Cancelled);
                Err(AcquisitionError::Cancelled {
                    collected: report.collected,
                    expected,
                })
            }
            Ok(Err(cause)) => {
                self.transition(AcquisitionState::Error(cause.to_string()));
                Err(AcquisitionError::AcquisitionIncomplete {
                    collected: cause.collected(),
                    expected,
                    cause,
                })
            }
            Err(join) => {
                let reason = join.to_string();
                self.transition(AcquisitionState::Error(reason.clone()));
                Err(AcquisitionError::Internal(reason))
            }
        };
        let elapsed = started.elapsed();

        let late_surplus = self.cleanup(session_id, scope);
        self.finish(slot);

        match outcome {
            Ok(report) => {
                let report = AcquisitionReport {
                    session_id,
                    images_collected: report.collected,
                    images_expected: expected,
                    elapsed,
                    surplus_drained: report.surplus_drained + late_surplus,
                };
                info!(
                    collected = report.images_collected,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Acquisition complete"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Acquisition ended without completing");
                Err(e)
            }
        }
    }
}

/// Orchestrates compile, program, trigger, collect and cleanup for one rig.
///
/// Cheap to clone; clones share the rig and the session slot, so at most one
/// acquisition runs at a time across all clones.
///
/// # Example
///
/// ```rust,ignore
/// let supervisor = AcquisitionSupervisor::new(rig, &config);
/// let mut handle = supervisor.run(params).await?;
/// while let Some(frame) = handle.next_frame().await {
///     store(frame);
/// }
/// let report = handle.wait().await?;
/// ```
#[derive(Clone)]
pub struct AcquisitionSupervisor {
    inner: Arc<Inner>,
}

impl AcquisitionSupervisor {
    /// Create a supervisor owning `rig`.
    pub fn new(rig: RigHandle, config: &RigConfig) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (diagnostics_tx, _) = broadcast::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        let programmer =
            HardwareProgrammer::new(Arc::clone(&rig.store), config.devices.clone());
        Self {
            inner: Arc::new(Inner {
                rig,
                calibration: config.calibration,
                compiler: TimingProgramCompiler::new(config.logic.clone(), config.scan.clone()),
                programmer,
                collector_config: config.collector.collector_config(),
                camera_channels: config.collector.camera_channels.max(1),
                frame_capacity: config.collector.frame_channel_capacity.max(1),
                state: Arc::new(RwLock::new(AcquisitionState::Idle)),
                session: RwLock::new(None),
                session_active: AtomicBool::new(false),
                state_tx,
                diagnostics_tx,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.inner.state.read().clone()
    }

    /// The active session, if any.
    pub fn current_session(&self) -> Option<Arc<AcquisitionSession>> {
        self.inner.session.read().clone()
    }

    /// Subscribe to state notifications.
    pub fn subscribe_states(&self) -> broadcast::Receiver<AcquisitionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to cleanup diagnostics.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<CleanupDiagnostic> {
        self.inner.diagnostics_tx.subscribe()
    }

    /// Start an acquisition delivering frames through the handle's channel.
    ///
    /// Returns once the scan is triggered; frames and the final outcome are
    /// read from the returned handle.
    ///
    /// # Errors
    ///
    /// - `Busy` if another run holds the rig
    /// - `InvalidParameters` if compilation fails (no hardware touched)
    /// - `HardwareProgrammingFailed` if programming, arming or triggering fails
    ///   (cleanup has already run)
    pub async fn run(
        &self,
        params: AcquisitionParameters,
    ) -> Result<AcquisitionHandle, AcquisitionError> {
        let (tx, rx) = mpsc::channel(self.inner.frame_capacity);
        let mut handle = self.start_blocking(params, FrameSink::Channel(tx)).await?;
        handle.frames = Some(rx);
        Ok(handle)
    }

    /// Start an acquisition invoking `callback` once per frame, in order, on
    /// the collector task. The callback must not block.
    pub async fn run_with_callback<F>(
        &self,
        params: AcquisitionParameters,
        callback: F,
    ) -> Result<AcquisitionHandle, AcquisitionError>
    where
        F: FnMut(AcquiredFrame) + Send + 'static,
    {
        self.start_blocking(params, FrameSink::Callback(Box::new(callback)))
            .await
    }

    async fn start_blocking(
        &self,
        params: AcquisitionParameters,
        sink: FrameSink,
    ) -> Result<AcquisitionHandle, AcquisitionError> {
        let supervisor = self.clone();
        tokio::task::spawn_blocking(move || supervisor.start(params, sink))
            .await
            .map_err(|e| AcquisitionError::Internal(e.to_string()))?
    }

    fn start(
        &self,
        params: AcquisitionParameters,
        sink: FrameSink,
    ) -> Result<AcquisitionHandle, AcquisitionError> {
        let inner = &self.inner;
        let slot = SessionSlot::claim(inner)?;
        let session_id = Uuid::new_v4();
        info!(
            session = %session_id,
            slices = params.num_slices,
            timepoints = params.num_timepoints,
            "Acquisition requested"
        );
        inner.transition(AcquisitionState::Preparing);

        let (program, scan) = match inner.compiler.compile(&params, &inner.calibration) {
            Ok(compiled) => compiled,
            Err(e) => {
                return Err(inner.abort(slot, session_id, &CleanupScope::default(), e.into()))
            }
        };

        let expected = params.total_images(inner.camera_channels);
        let scope = CleanupScope::for_program(&program, params.piezo_center_um);
        let progress = Arc::new(AtomicU32::new(0));
        *inner.session.write() = Some(Arc::new(AcquisitionSession {
            session_id,
            params: params.clone(),
            program: program.clone(),
            scan: scan.clone(),
            total_images_expected: expected,
            started_at: Utc::now(),
            images_collected: Arc::clone(&progress),
            state: Arc::clone(&inner.state),
        }));

        if let Err(e) = inner.prepare_hardware(&program, &scan, expected) {
            return Err(inner.abort(slot, session_id, &scope, e.into()));
        }

        let cancel = CancelFlag::new();
        let collector = FrameCollector::new(Arc::clone(&inner.rig.camera), inner.collector_config)
            .with_cancel_flag(cancel.clone())
            .with_progress(Arc::clone(&progress));
        let events = SequenceOrder::new(
            params.num_timepoints,
            params.num_slices,
            inner.camera_channels,
        );

        inner.transition(AcquisitionState::Acquiring);
        let collector_task = tokio::spawn(collector.run(expected, events, sink));

        if let Err(e) = inner.programmer.trigger_scan() {
            cancel.cancel();
            collector_task.abort();
            return Err(inner.abort(slot, session_id, &scope, e.into()));
        }
        let started = Instant::now();

        let supervise = Arc::clone(inner);
        let completion = tokio::spawn(async move {
            let joined = collector_task.await;
            tokio::task::spawn_blocking(move || {
                supervise.conclude(slot, session_id, &scope, expected, started, joined)
            })
            .await
            .map_err(|e| AcquisitionError::Internal(e.to_string()))?
        });

        Ok(AcquisitionHandle {
            session_id,
            expected,
            frames: None,
            cancel,
            progress,
            completion,
        })
    }
}

/// Caller's view of a running acquisition.
pub struct AcquisitionHandle {
    session_id: Uuid,
    expected: u32,
    frames: Option<mpsc::Receiver<AcquiredFrame>>,
    cancel: CancelFlag,
    progress: Arc<AtomicU32>,
    completion: JoinHandle<Result<AcquisitionReport, AcquisitionError>>,
}

impl AcquisitionHandle {
    /// Session identifier.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Frames the run expects.
    pub fn images_expected(&self) -> u32 {
        self.expected
    }

    /// Frames delivered so far.
    pub fn images_collected(&self) -> u32 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation. Takes effect within one poll interval.
    pub fn cancel(&self) {
        info!(session = %self.session_id, "Cancellation requested");
        self.cancel.cancel();
    }

    /// Cancel flag, for cancelling from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Next frame in trigger order, or `None` once the run has ended (or for
    /// callback runs).
    pub async fn next_frame(&mut self) -> Option<AcquiredFrame> {
        match self.frames.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take the frame receiver as a stream.
    pub fn frame_stream(&mut self) -> Option<ReceiverStream<AcquiredFrame>> {
        self.frames.take().map(ReceiverStream::new)
    }

    /// Wait for the run to finish and the rig to be back in `Idle`.
    ///
    /// Frames not yet read from the handle are discarded.
    pub async fn wait(mut self) -> Result<AcquisitionReport, AcquisitionError> {
        self.frames = None;
        self.completion
            .await
            .map_err(|e| AcquisitionError::Internal(e.to_string()))?
    }

    /// Hand every frame to `f` in order, then wait for the run to finish.
    pub async fn for_each_frame<F>(
        mut self,
        mut f: F,
    ) -> Result<AcquisitionReport, AcquisitionError>
    where
        F: FnMut(AcquiredFrame),
    {
        while let Some(frame) = self.next_frame().await {
            f(frame);
        }
        self.wait().await
    }
}

impl std::fmt::Debug for AcquisitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionHandle")
            .field("session_id", &self.session_id)
            .field("expected", &self.expected)
            .field("collected", &self.images_collected())
            .finish()
    }
}
