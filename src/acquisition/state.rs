//! Acquisition state machine states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the acquisition engine.
///
/// ```text
/// Idle -> Preparing -> Acquiring -> CleaningUp -> Idle
///                          |            ^
///                          v            |
///                      Cancelled -------+
/// any non-Idle state -> Error -> CleaningUp
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// No session active.
    Idle,
    /// Compiling and programming hardware.
    Preparing,
    /// Scan running, collector draining frames.
    Acquiring,
    /// Returning the rig to a safe idle state.
    CleaningUp,
    /// The run was cancelled by the caller.
    Cancelled,
    /// The run failed.
    Error(String),
}

impl AcquisitionState {
    /// Whether a session currently holds the hardware.
    pub fn is_busy(&self) -> bool {
        !matches!(self, AcquisitionState::Idle)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Preparing => write!(f, "Preparing"),
            AcquisitionState::Acquiring => write!(f, "Acquiring"),
            AcquisitionState::CleaningUp => write!(f, "CleaningUp"),
            AcquisitionState::Cancelled => write!(f, "Cancelled"),
            AcquisitionState::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}
