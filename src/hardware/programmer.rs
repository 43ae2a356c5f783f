//! Applies compiled programs to the rig through a [`PropertyStore`].
//!
//! Device properties go through a change-detecting setter: the current value
//! is read first and the write is skipped when it already matches. Re-applying
//! an unchanged program therefore issues no writes. The first failed write aborts
//! the remaining writes; nothing is rolled back, the caller proceeds to cleanup.
//!
//! Logic-card registers are reached through a pointer: writing
//! `PointerPosition` selects a cell or output port, and the `EditCell*`
//! properties then address that location.
//!
//! | Location       | Registers after the select                                   |
//! |----------------|--------------------------------------------------------------|
//! | cell 1-16      | `EditCellCellType`, `EditCellConfig`, `EditCellInput1`..`4`  |
//! | output port    | `EditCellConfig` (source address)                            |
//!
//! The pointer makes register reads unreliable, so change detection for the
//! card uses the blocks this programmer last wrote: a location whose registers
//! are unchanged is skipped, select write included.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::error::HardwareError;
use crate::hardware::{DeviceLabels, PropertyStore};
use crate::timing::program::{
    LogicCell, LogicProgram, OutputPort, ScanParameters, SignalAddress,
};

const TRIGGER_MODE: &str = "TriggerMode";
const INTERNAL_TRIGGER: &str = "Internal Trigger";
/// External trigger modes in order of preference.
pub const EXTERNAL_TRIGGER_MODES: [&str; 2] = ["Level Trigger", "Edge Trigger"];

const BEAM_ENABLED: &str = "BeamEnabled";
const SPIM_STATE: &str = "SPIMState";
const PIEZO_OFFSET: &str = "SingleAxisOffset(um)";

/// Selects the logic-card location the `EditCell*` registers address.
pub const POINTER_POSITION: &str = "PointerPosition";
/// Prefix shared by the pointer-addressed logic-card registers.
pub const EDIT_CELL_PREFIX: &str = "EditCell";
const EDIT_CELL_TYPE: &str = "EditCellCellType";
const EDIT_CELL_CONFIG: &str = "EditCellConfig";
const SET_CARD_PRESET: &str = "SetCardPreset";
const SAVE_CARD_SETTINGS: &str = "SaveCardSettings";
const SAVE_SETTINGS_PARTIAL: &str = "Z - save settings to card (partial)";

const DEGREE_DECIMALS: usize = 4;
const MICRON_DECIMALS: usize = 3;
const MS_DECIMALS: usize = 3;

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Registers of one card location, in write order.
type RegisterBlock = Vec<(String, String)>;

fn cell_block(cell: &LogicCell) -> RegisterBlock {
    let mut block = vec![
        (EDIT_CELL_TYPE.to_string(), cell.kind.type_code().to_string()),
        (EDIT_CELL_CONFIG.to_string(), cell.config_value().to_string()),
    ];
    for (i, input) in cell.inputs.iter().enumerate() {
        block.push((format!("EditCellInput{}", i + 1), input.code().to_string()));
    }
    block
}

fn route_block(source: SignalAddress) -> RegisterBlock {
    vec![(EDIT_CELL_CONFIG.to_string(), source.code().to_string())]
}

/// Write counts from one [`HardwareProgrammer::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Properties actually written.
    pub writes_issued: u32,
    /// Properties already holding the requested value.
    pub writes_skipped: u32,
}

impl ApplyReport {
    fn record(&mut self, written: bool) {
        self.record_many(written, 1);
    }

    fn record_many(&mut self, written: bool, count: u32) {
        if written {
            self.writes_issued += count;
        } else {
            self.writes_skipped += count;
        }
    }
}

/// A cleanup step that failed. Logged and published, never escalated.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cleanup of {device}.{property} failed: {reason}")]
pub struct CleanupFailure {
    /// Device label.
    pub device: String,
    /// Property that could not be restored.
    pub property: String,
    /// Underlying error.
    pub reason: String,
}

/// What a run touched, and therefore what cleanup must restore.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupScope {
    /// Whether any hardware write was attempted.
    pub hardware_touched: bool,
    /// Output ports the run's program drives.
    pub routed_ports: Vec<OutputPort>,
    /// Piezo position to return to.
    pub piezo_center_um: f64,
}

impl CleanupScope {
    /// Scope for a run about to program `program`.
    pub fn for_program(program: &LogicProgram, piezo_center_um: f64) -> Self {
        Self {
            hardware_touched: true,
            routed_ports: program.routes().iter().map(|r| r.port).collect(),
            piezo_center_um,
        }
    }
}

/// Writes logic programs, scan settings and trigger modes to the rig.
///
/// Clones share the record of what was last written to the logic card.
#[derive(Clone)]
pub struct HardwareProgrammer {
    store: Arc<dyn PropertyStore>,
    devices: DeviceLabels,
    card_blocks: Arc<Mutex<HashMap<u16, RegisterBlock>>>,
}

impl HardwareProgrammer {
    /// Create a programmer writing through `store`.
    ///
    /// The logic card's contents are unknown until this programmer writes them,
    /// so the first apply programs every location.
    pub fn new(store: Arc<dyn PropertyStore>, devices: DeviceLabels) -> Self {
        Self {
            store,
            devices,
            card_blocks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Device labels in use.
    pub fn devices(&self) -> &DeviceLabels {
        &self.devices
    }

    /// Write `value` unless the store already reports it. Returns whether a write
    /// was issued. A failed read is treated as "changed".
    pub fn set_if_changed(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> Result<bool, HardwareError> {
        if let Ok(current) = self.store.get(device, property) {
            if current == value {
                trace!(device, property, value, "Property unchanged, skipping write");
                return Ok(false);
            }
        }
        self.write(device, property, value)?;
        Ok(true)
    }

    fn write(&self, device: &str, property: &str, value: &str) -> Result<(), HardwareError> {
        self.store
            .set(device, property, value)
            .map_err(|e| HardwareError::PropertyWriteFailed {
                device: device.to_string(),
                property: property.to_string(),
                value: value.to_string(),
                reason: format!("{:#}", e),
            })?;
        debug!(device, property, value, "Property written");
        Ok(())
    }

    fn put(
        &self,
        report: &mut ApplyReport,
        device: &str,
        property: &str,
        value: impl AsRef<str>,
    ) -> Result<(), HardwareError> {
        let written = self.set_if_changed(device, property, value.as_ref())?;
        report.record(written);
        Ok(())
    }

    /// Apply a logic program and scan settings.
    pub fn apply(
        &self,
        program: &LogicProgram,
        scan: &ScanParameters,
    ) -> Result<ApplyReport, HardwareError> {
        let mut report = ApplyReport::default();
        self.apply_logic(program, &mut report)?;
        self.apply_scan(scan, &mut report)?;
        info!(
            writes_issued = report.writes_issued,
            writes_skipped = report.writes_skipped,
            "Hardware programmed"
        );
        Ok(report)
    }

    fn block_current(&self, address: u16, block: &RegisterBlock) -> bool {
        self.card_blocks.lock().get(&address) == Some(block)
    }

    /// Select `address` and write every register of `block`. The location is
    /// forgotten until all its registers are written.
    fn write_block(&self, address: u16, block: RegisterBlock) -> Result<(), HardwareError> {
        let card = self.devices.logic_card.as_str();
        self.card_blocks.lock().remove(&address);
        self.write(card, POINTER_POSITION, &address.to_string())?;
        for (register, value) in &block {
            self.write(card, register, value)?;
        }
        self.card_blocks.lock().insert(address, block);
        Ok(())
    }

    /// Program the logic card: laser preset, cells, port routes, then save.
    ///
    /// Locations whose registers already hold the program are skipped. When
    /// nothing on the card changes, the preset and save writes are skipped too.
    pub fn apply_logic(
        &self,
        program: &LogicProgram,
        report: &mut ApplyReport,
    ) -> Result<(), HardwareError> {
        let card = self.devices.logic_card.as_str();
        let blocks: Vec<(u16, RegisterBlock, bool)> = program
            .cells()
            .iter()
            .map(|cell| (u16::from(cell.id.0), cell_block(cell)))
            .chain(
                program
                    .routes()
                    .iter()
                    .map(|route| (route.port.address(), route_block(route.source))),
            )
            .map(|(address, block)| {
                let stale = !self.block_current(address, &block);
                (address, block, stale)
            })
            .collect();
        let changed = blocks.iter().any(|(_, _, stale)| *stale);

        if let Some(preset) = program.laser_preset() {
            if changed {
                self.write(card, SET_CARD_PRESET, &preset.to_string())?;
            }
            report.record(changed);
        }

        for (address, block, stale) in blocks {
            let writes = block.len() as u32 + 1;
            if stale {
                self.write_block(address, block)?;
            } else {
                trace!(address, "Logic card location unchanged, skipping");
            }
            report.record_many(stale, writes);
        }

        if program.saves_to_card() {
            if changed {
                self.write(card, SAVE_CARD_SETTINGS, SAVE_SETTINGS_PARTIAL)?;
            }
            report.record(changed);
        }
        Ok(())
    }

    /// Program the scanner and piezo for a slice scan.
    pub fn apply_scan(
        &self,
        scan: &ScanParameters,
        report: &mut ApplyReport,
    ) -> Result<(), HardwareError> {
        let galvo = self.devices.galvo.as_str();
        let piezo = self.devices.piezo.as_str();
        let geo = &scan.geometry;
        let slices = scan.slice_count_for_controller.to_string();

        self.put(report, galvo, BEAM_ENABLED, "Yes")?;
        self.put(
            report,
            galvo,
            "SPIMNumSlicesPerPiezo",
            geo.line_scans_per_slice.to_string(),
        )?;
        self.put(
            report,
            galvo,
            "SPIMDelayBeforeRepeat(ms)",
            format!("{:.*}", MS_DECIMALS, scan.repeat_delay_ms),
        )?;
        self.put(report, galvo, "SPIMNumRepeats", scan.num_repeats.to_string())?;
        self.put(
            report,
            galvo,
            "SPIMDelayBeforeSide(ms)",
            format!("{:.*}", MS_DECIMALS, geo.delay_before_side_ms),
        )?;
        self.put(
            report,
            galvo,
            "SPIMAlternateDirectionsEnable",
            yes_no(geo.alternate_directions),
        )?;
        self.put(
            report,
            galvo,
            "SPIMScanDuration(ms)",
            format!("{:.*}", MS_DECIMALS, geo.scan_duration_ms),
        )?;
        self.put(
            report,
            galvo,
            "SingleAxisYAmplitude(deg)",
            format!("{:.*}", DEGREE_DECIMALS, scan.amplitude_deg),
        )?;
        self.put(
            report,
            galvo,
            "SingleAxisYOffset(deg)",
            format!("{:.*}", DEGREE_DECIMALS, scan.center_deg),
        )?;
        self.put(report, galvo, "SPIMNumSlices", &slices)?;
        self.put(report, galvo, "SPIMNumSides", geo.num_sides.to_string())?;
        self.put(report, galvo, "SPIMFirstSide", geo.first_side.as_str())?;
        self.put(report, galvo, "SPIMPiezoHomeDisable", "No")?;
        self.put(
            report,
            galvo,
            "SPIMInterleaveSidesEnable",
            yes_no(geo.interleave_sides),
        )?;
        self.put(
            report,
            galvo,
            "SingleAxisXAmplitude(deg)",
            format!("{:.*}", DEGREE_DECIMALS, geo.sheet_width_deg),
        )?;
        self.put(
            report,
            galvo,
            "SingleAxisXOffset(deg)",
            format!("{:.*}", DEGREE_DECIMALS, geo.sheet_offset_deg),
        )?;

        self.put(
            report,
            piezo,
            "SingleAxisAmplitude(um)",
            format!("{:.*}", MICRON_DECIMALS, 0.0),
        )?;
        self.put(
            report,
            piezo,
            PIEZO_OFFSET,
            format!("{:.*}", MICRON_DECIMALS, scan.piezo_center_um),
        )?;
        self.put(report, piezo, "SPIMNumSlices", &slices)?;
        self.put(report, piezo, SPIM_STATE, "Armed")?;
        Ok(())
    }

    /// Switch the camera to the best available external trigger mode.
    ///
    /// Returns the mode selected.
    pub fn arm_external_trigger(&self) -> Result<&'static str, HardwareError> {
        let camera = self.devices.camera.as_str();
        if !self.store.has_property(camera, TRIGGER_MODE) {
            return Err(HardwareError::TriggerModeUnsupported {
                camera: camera.to_string(),
            });
        }
        let allowed = self.store.allowed_values(camera, TRIGGER_MODE);
        let mode = EXTERNAL_TRIGGER_MODES
            .iter()
            .copied()
            .find(|mode| allowed.iter().any(|a| a == mode))
            .ok_or_else(|| HardwareError::NoExternalTriggerMode {
                camera: camera.to_string(),
                allowed: allowed.clone(),
            })?;
        self.set_if_changed(camera, TRIGGER_MODE, mode)?;
        info!(camera, mode, "Camera set to external trigger");
        Ok(mode)
    }

    /// Start the scan. Always written, since the write itself is the trigger.
    pub fn trigger_scan(&self) -> Result<(), HardwareError> {
        self.write(&self.devices.galvo, SPIM_STATE, "Running")?;
        info!(galvo = %self.devices.galvo, "Scan triggered");
        Ok(())
    }

    /// Return the rig to a safe idle state.
    ///
    /// Every step runs regardless of earlier failures; failures are returned for
    /// the caller to report.
    pub fn cleanup(&self, scope: &CleanupScope) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        if !scope.hardware_touched {
            return failures;
        }

        let camera = self.devices.camera.as_str();
        let galvo = self.devices.galvo.as_str();
        let piezo = self.devices.piezo.as_str();
        let piezo_center = format!("{:.*}", MICRON_DECIMALS, scope.piezo_center_um);

        let mut steps: Vec<(&str, String, &str)> = Vec::new();
        if self.store.has_property(camera, TRIGGER_MODE) {
            steps.push((camera, TRIGGER_MODE.to_string(), INTERNAL_TRIGGER));
        }
        steps.push((galvo, BEAM_ENABLED.to_string(), "No"));
        steps.push((galvo, SPIM_STATE.to_string(), "Idle"));
        steps.push((piezo, SPIM_STATE.to_string(), "Idle"));
        steps.push((piezo, PIEZO_OFFSET.to_string(), piezo_center.as_str()));

        for (device, property, value) in steps {
            if let Err(e) = self.set_if_changed(device, &property, value) {
                let failure = CleanupFailure {
                    device: device.to_string(),
                    property: property.clone(),
                    reason: e.to_string(),
                };
                warn!(device, property = %property, error = %e, "Cleanup step failed");
                failures.push(failure);
            }
        }

        let card = self.devices.logic_card.as_str();
        for port in &scope.routed_ports {
            let address = port.address();
            let block = route_block(SignalAddress::Ground);
            if self.block_current(address, &block) {
                continue;
            }
            if let Err(e) = self.write_block(address, block) {
                let property = format!("{}@{}", EDIT_CELL_CONFIG, address);
                warn!(device = card, property = %property, error = %e, "Cleanup step failed");
                failures.push(CleanupFailure {
                    device: card.to_string(),
                    property,
                    reason: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            info!("Rig returned to idle");
        }
        failures
    }
}
