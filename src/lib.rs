//! Hardware-synchronized light-sheet (SPIM) acquisition engine.
//!
//! The engine compiles an acquisition request into a programmable-logic
//! timing program and scanner settings, writes them to the rig, triggers the
//! scan and collects camera frames from the ring buffer in trigger order,
//! returning the rig to idle after every run.
//!
//! # Modules
//!
//! - [`timing`] - pure compilation of parameters into a [`LogicProgram`] and
//!   [`ScanParameters`]
//! - [`hardware`] - collaborator traits, the idempotent [`HardwareProgrammer`]
//!   and in-memory mocks
//! - [`acquisition`] - the [`AcquisitionSupervisor`] state machine and the
//!   frame collector
//! - [`config`] - Figment-based rig configuration
//! - [`logging`] - tracing subscriber setup
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use spim_daq::hardware::mock::{SimulatedCamera, SimulatedRig};
//! use spim_daq::{AcquisitionParameters, AcquisitionSupervisor, RigConfig};
//!
//! # tokio_test::block_on(async {
//! let config = RigConfig::default();
//! let rig = Arc::new(SimulatedRig::new(config.devices.clone(), SimulatedCamera::default()));
//! let supervisor = AcquisitionSupervisor::new(rig.handle(), &config);
//!
//! let mut handle = supervisor.run(AcquisitionParameters::default()).await?;
//! while let Some(frame) = handle.next_frame().await {
//!     println!("t={} z={}", frame.event.timepoint, frame.event.z_index);
//! }
//! let report = handle.wait().await?;
//! assert_eq!(report.images_collected, 3);
//! # Ok::<(), spim_daq::AcquisitionError>(())
//! # }).unwrap();
//! ```

pub mod acquisition;
pub mod config;
pub mod core;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod timing;

pub use acquisition::{
    AcquisitionHandle, AcquisitionReport, AcquisitionState, AcquisitionSupervisor,
    CleanupDiagnostic,
};
pub use config::RigConfig;
pub use core::{AcquiredFrame, AcquisitionParameters, CalibrationConstants, SequenceEvent};
pub use error::{AcquisitionError, CollectError, CompileError, HardwareError};
pub use hardware::{CameraBuffer, HardwareProgrammer, PropertyStore, RigHandle};
pub use timing::{LogicProgram, ScanParameters, TimingProgramCompiler};
