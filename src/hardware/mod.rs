//! Hardware collaborator interfaces.
//!
//! The engine talks to the rig through two capabilities injected at
//! construction:
//!
//! - [`PropertyStore`] - named device properties (scanner, piezo, logic card,
//!   camera settings)
//! - [`CameraBuffer`] - the camera's circular frame buffer and sequence control
//!
//! Both are synchronous and `Send + Sync`; the transport behind them is out of
//! scope. [`mock`] provides in-memory implementations for tests and the
//! `simulate` CLI command.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::RawFrame;

pub mod mock;
pub mod programmer;

pub use programmer::{ApplyReport, CleanupFailure, CleanupScope, HardwareProgrammer};

/// Get/set access to named device properties.
pub trait PropertyStore: Send + Sync {
    /// Read the current value of a property.
    fn get(&self, device: &str, property: &str) -> Result<String>;

    /// Write a property value.
    fn set(&self, device: &str, property: &str, value: &str) -> Result<()>;

    /// Whether the device exposes the property.
    fn has_property(&self, device: &str, property: &str) -> bool;

    /// Allowed values of an enumerated property (empty if unrestricted).
    fn allowed_values(&self, device: &str, property: &str) -> Vec<String>;
}

/// The camera's circular frame buffer.
pub trait CameraBuffer: Send + Sync {
    /// Frames waiting in the buffer.
    fn remaining_count(&self) -> u32;

    /// Remove and return the oldest frame.
    fn pop_next(&self) -> Result<RawFrame>;

    /// Whether the camera's hardware sequence is still running.
    fn is_sequence_running(&self) -> bool;

    /// Arm a hardware-triggered sequence of `count` images.
    fn start_sequence(&self, count: u32, stop_on_overflow: bool) -> Result<()>;

    /// Stop the running sequence.
    fn stop_sequence(&self) -> Result<()>;
}

/// Owned handle to the rig's singleton hardware.
///
/// Passed into the supervisor at construction; only one acquisition may use it
/// at a time.
#[derive(Clone)]
pub struct RigHandle {
    /// Device property access.
    pub store: Arc<dyn PropertyStore>,
    /// Camera frame buffer.
    pub camera: Arc<dyn CameraBuffer>,
}

impl RigHandle {
    /// Bundle a property store and camera buffer.
    pub fn new(store: Arc<dyn PropertyStore>, camera: Arc<dyn CameraBuffer>) -> Self {
        Self { store, camera }
    }
}

impl std::fmt::Debug for RigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigHandle").finish_non_exhaustive()
    }
}

/// Device labels the rig's components are registered under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLabels {
    /// Camera device.
    pub camera: String,
    /// Light-sheet scanner (galvo) device.
    pub galvo: String,
    /// Piezo objective stage.
    pub piezo: String,
    /// Programmable logic card.
    pub logic_card: String,
}

impl Default for DeviceLabels {
    fn default() -> Self {
        Self {
            camera: "Camera-1".into(),
            galvo: "Scanner:AB:33".into(),
            piezo: "PiezoStage:P:34".into(),
            logic_card: "PLogic:E:36".into(),
        }
    }
}
