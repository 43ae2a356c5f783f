//! Error types for the acquisition engine.
//!
//! Errors are layered by the phase that produces them so that callers can tell
//! whether hardware was touched:
//!
//! - **`CompileError`**: caller-input problems found while translating
//!   [`AcquisitionParameters`](crate::core::AcquisitionParameters) into a logic
//!   program. These are always raised before any property write.
//! - **`HardwareError`**: a property write or camera command failed while
//!   programming or arming the rig. The run is aborted and cleanup follows.
//! - **`CollectError`**: the frame collector stopped before all expected frames
//!   were paired. Fatal to the run, never to the process.
//! - **`AcquisitionError`**: the user-visible outcome of a run, wrapping the
//!   first fatal error of the phases above.
//!
//! Cleanup-phase failures are not represented here: they are logged and published
//! on the supervisor's diagnostics channel instead of being returned.

use std::time::Duration;
use thiserror::Error;

use crate::acquisition::state::AcquisitionState;

/// Convenience alias for results using the user-visible acquisition error.
pub type AppResult<T> = std::result::Result<T, AcquisitionError>;

/// Errors raised while compiling acquisition parameters into a timing program.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{field} of {duration_ms} ms is shorter than one clock cycle ({cycle_ms} ms)")]
    DurationTooShort {
        field: &'static str,
        duration_ms: f64,
        cycle_ms: f64,
    },

    #[error("{field} of {duration_ms} ms needs {cycles} cycles, the duration register holds at most {max_cycles}")]
    DurationOverflow {
        field: &'static str,
        duration_ms: f64,
        cycles: u64,
        max_cycles: u32,
    },

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Invalid acquisition parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid logic program: {0}")]
    InvalidProgram(String),
}

/// Errors raised while writing to, arming or triggering hardware.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("Failed to write {device}.{property} = {value}: {reason}")]
    PropertyWriteFailed {
        device: String,
        property: String,
        value: String,
        reason: String,
    },

    #[error("Camera '{camera}' does not expose a TriggerMode property")]
    TriggerModeUnsupported { camera: String },

    #[error("Camera '{camera}' offers no external trigger mode (allowed: {allowed:?})")]
    NoExternalTriggerMode {
        camera: String,
        allowed: Vec<String>,
    },

    #[error("Failed to start camera sequence of {count} images: {reason}")]
    SequenceStartFailed { count: u32, reason: String },
}

/// Which watchdog elapsed inside the frame collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    /// Between the scan trigger and the first popped frame.
    FirstFrame,
    /// Between two consecutive popped frames.
    InterFrame,
}

impl std::fmt::Display for WatchdogPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstFrame => write!(f, "first-frame"),
            Self::InterFrame => write!(f, "inter-frame"),
        }
    }
}

/// Errors that terminate the frame collector early.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    #[error("{phase} timeout after {waited:?}: collected {collected} of {expected} frames")]
    Timeout {
        phase: WatchdogPhase,
        waited: Duration,
        collected: u32,
        expected: u32,
    },

    #[error("Camera sequence stopped early: collected {collected} of {expected} frames")]
    SequenceStoppedEarly { collected: u32, expected: u32 },

    #[error("Failed to pop frame {collected} from the ring buffer: {reason}")]
    PopFailed { collected: u32, reason: String },

    #[error("Sequence event order exhausted after {collected} frames")]
    EventOrderExhausted { collected: u32 },

    #[error("Collector task failed: {0}")]
    TaskFailed(String),
}

impl CollectError {
    /// Number of frames delivered before the collector stopped.
    pub fn collected(&self) -> u32 {
        match self {
            Self::Timeout { collected, .. }
            | Self::SequenceStoppedEarly { collected, .. }
            | Self::PopFailed { collected, .. }
            | Self::EventOrderExhausted { collected } => *collected,
            Self::TaskFailed(_) => 0,
        }
    }
}

/// User-visible outcome of a failed or interrupted acquisition run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("Acquisition engine is busy (state: {state})")]
    Busy { state: AcquisitionState },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[from] CompileError),

    #[error("Hardware programming failed: {0}")]
    HardwareProgrammingFailed(#[from] HardwareError),

    #[error("Acquisition incomplete: collected {collected} of {expected} frames ({cause})")]
    AcquisitionIncomplete {
        collected: u32,
        expected: u32,
        cause: CollectError,
    },

    #[error("Acquisition cancelled after {collected} of {expected} frames")]
    Cancelled { collected: u32, expected: u32 },

    #[error("Supervisor task failed: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_names_field() {
        let err = CompileError::DurationTooShort {
            field: "laser_pulse_ms",
            duration_ms: 0.1,
            cycle_ms: 0.25,
        };
        assert!(err.to_string().contains("laser_pulse_ms"));
    }

    #[test]
    fn test_collect_error_reports_collected() {
        let err = CollectError::Timeout {
            phase: WatchdogPhase::InterFrame,
            waited: Duration::from_millis(50),
            collected: 4,
            expected: 5,
        };
        assert_eq!(err.collected(), 4);
        assert!(err.to_string().starts_with("inter-frame timeout"));
    }

    #[test]
    fn test_hardware_error_converts_to_acquisition_error() {
        let err: AcquisitionError = HardwareError::PropertyWriteFailed {
            device: "Scanner:AB:33".into(),
            property: "SPIMNumSlices".into(),
            value: "10".into(),
            reason: "timeout".into(),
        }
        .into();
        assert!(matches!(err, AcquisitionError::HardwareProgrammingFailed(_)));
        assert!(err.to_string().contains("Scanner:AB:33.SPIMNumSlices"));
    }
}
