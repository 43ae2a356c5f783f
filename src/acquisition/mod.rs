//! Acquisition orchestration.
//!
//! - [`supervisor`] - session lifecycle and the public entry point
//! - [`collector`] - frame draining and pairing with the trigger sequence
//! - [`sequence`] - physical trigger order of frames
//! - [`state`] - state machine states

pub mod collector;
pub mod sequence;
pub mod state;
pub mod supervisor;

pub use collector::{
    CancelFlag, CollectOutcome, CollectReport, CollectorConfig, FrameCollector, FrameSink,
};
pub use sequence::SequenceOrder;
pub use state::AcquisitionState;
pub use supervisor::{
    AcquisitionHandle, AcquisitionReport, AcquisitionSession, AcquisitionSupervisor,
    CleanupDiagnostic,
};
