//! Logic-card program model.
//!
//! A [`LogicProgram`] is an ordered list of cell assignments plus output-port
//! routing entries for the programmable logic card. Addresses follow the card's
//! memory map:
//!
//! | Range   | Meaning                          |
//! |---------|----------------------------------|
//! | 0       | ground (always low)              |
//! | 1-16    | logic cell outputs               |
//! | 33-40   | BNC 1-8                          |
//! | 41-48   | backplane TTL 0-7                |
//! | 63      | always high                      |
//! | 192     | internal clock                   |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::CompileError;

/// Number of addressable logic cells on the card.
pub const LOGIC_CELL_COUNT: u8 = 16;

/// Largest value the 16-bit cell duration/config register can hold.
pub const DURATION_REGISTER_MAX: u32 = u16::MAX as u32;

/// Number of inputs wired into each logic cell.
pub const CELL_INPUTS: usize = 4;

const BNC_BASE: u16 = 32;
const TTL_BASE: u16 = 41;
const ALWAYS_HIGH: u16 = 63;
const INTERNAL_CLOCK: u16 = 192;

/// Logic cell identifier (1-16).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u8);

impl CellId {
    /// Check the id lies within the card's cell range.
    pub fn validate(self) -> Result<(), CompileError> {
        if (1..=LOGIC_CELL_COUNT).contains(&self.0) {
            Ok(())
        } else {
            Err(CompileError::InvalidProgram(format!(
                "cell id {} outside 1..={}",
                self.0, LOGIC_CELL_COUNT
            )))
        }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Function performed by a logic cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Fixed-width pulse on a trigger edge, ignoring re-triggers until done.
    OneShotNonRetrig,
    /// Counts clock edges, wrapping at the configured modulus.
    Counter,
    /// Output follows input 1.
    PassThrough,
    /// Constant low.
    Ground,
}

impl CellKind {
    /// Card cell-type code written to the type register.
    pub fn type_code(self) -> u8 {
        match self {
            CellKind::Ground => 0,
            CellKind::PassThrough => 2,
            CellKind::OneShotNonRetrig => 14,
            CellKind::Counter => 21,
        }
    }
}

/// A signal source on the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAddress {
    /// Constant low.
    Ground,
    /// Constant high.
    AlwaysHigh,
    /// Front-panel BNC input (1-8).
    BncIn(u8),
    /// Backplane TTL input (0-7).
    TtlIn(u8),
    /// The card's internal clock.
    InternalClock,
    /// Output of a logic cell.
    CellOutput(CellId),
}

impl SignalAddress {
    /// Address code written to a cell input or port source register.
    pub fn code(self) -> u16 {
        match self {
            SignalAddress::Ground => 0,
            SignalAddress::AlwaysHigh => ALWAYS_HIGH,
            SignalAddress::BncIn(n) => BNC_BASE + u16::from(n),
            SignalAddress::TtlIn(n) => TTL_BASE + u16::from(n),
            SignalAddress::InternalClock => INTERNAL_CLOCK,
            SignalAddress::CellOutput(id) => u16::from(id.0),
        }
    }

    /// Check the address lies within the card's memory map.
    pub fn validate(self) -> Result<(), CompileError> {
        match self {
            SignalAddress::BncIn(n) if !(1..=8).contains(&n) => Err(
                CompileError::InvalidProgram(format!("BNC input {} outside 1..=8", n)),
            ),
            SignalAddress::TtlIn(n) if n > 7 => Err(CompileError::InvalidProgram(format!(
                "TTL input {} outside 0..=7",
                n
            ))),
            SignalAddress::CellOutput(id) => id.validate(),
            _ => Ok(()),
        }
    }

    /// Whether this address can act as a trigger (is not a constant).
    pub fn is_signal(self) -> bool {
        !matches!(self, SignalAddress::Ground | SignalAddress::AlwaysHigh)
    }
}

/// A physical output port that can be driven from a signal source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPort {
    /// Front-panel BNC (1-8).
    Bnc(u8),
    /// Backplane TTL line (0-7).
    Ttl(u8),
}

impl OutputPort {
    /// Port address on the card.
    pub fn address(self) -> u16 {
        match self {
            OutputPort::Bnc(n) => BNC_BASE + u16::from(n),
            OutputPort::Ttl(n) => TTL_BASE + u16::from(n),
        }
    }

    /// Check the port exists on the card.
    pub fn validate(self) -> Result<(), CompileError> {
        let ok = match self {
            OutputPort::Bnc(n) => (1..=8).contains(&n),
            OutputPort::Ttl(n) => n <= 7,
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::InvalidProgram(format!(
                "output port {:?} does not exist",
                self
            )))
        }
    }
}

/// Configuration of one logic cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicCell {
    /// Cell being configured.
    pub id: CellId,
    /// Cell function.
    pub kind: CellKind,
    /// Pulse width or counter modulus in clock cycles.
    pub duration_cycles: u32,
    /// Input wiring; unused inputs are grounded.
    pub inputs: [SignalAddress; CELL_INPUTS],
}

impl LogicCell {
    /// A non-retriggerable one-shot fired by `trigger` and timed by `clock`.
    pub fn one_shot(
        id: CellId,
        duration_cycles: u32,
        trigger: SignalAddress,
        clock: SignalAddress,
    ) -> Self {
        Self {
            id,
            kind: CellKind::OneShotNonRetrig,
            duration_cycles,
            inputs: [
                trigger,
                clock,
                SignalAddress::Ground,
                SignalAddress::Ground,
            ],
        }
    }

    /// Value written to the cell's config register.
    pub fn config_value(&self) -> u32 {
        match self.kind {
            CellKind::OneShotNonRetrig | CellKind::Counter => self.duration_cycles,
            // LUT truth table selecting input 1
            CellKind::PassThrough => 0b1010,
            CellKind::Ground => 0,
        }
    }

    /// Check register width, id range and trigger wiring.
    pub fn validate(&self) -> Result<(), CompileError> {
        self.id.validate()?;
        if self.duration_cycles > DURATION_REGISTER_MAX {
            return Err(CompileError::InvalidProgram(format!(
                "cell {} duration {} exceeds register maximum {}",
                self.id, self.duration_cycles, DURATION_REGISTER_MAX
            )));
        }
        for input in &self.inputs {
            input.validate()?;
        }
        if self.kind == CellKind::OneShotNonRetrig && !self.inputs[0].is_signal() {
            return Err(CompileError::InvalidProgram(format!(
                "one-shot cell {} has no trigger input",
                self.id
            )));
        }
        Ok(())
    }
}

/// Drives an output port from a signal source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRoute {
    /// Port being driven.
    pub port: OutputPort,
    /// Signal driving it.
    pub source: SignalAddress,
}

/// Ordered cell assignments and port routes for one acquisition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicProgram {
    cells: Vec<LogicCell>,
    routes: Vec<PortRoute>,
    /// Card preset selected before any cell is programmed.
    #[serde(default)]
    laser_preset: Option<u8>,
    /// Persist the card settings once programming completes.
    #[serde(default)]
    save_to_card: bool,
}

impl LogicProgram {
    /// Create an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell assignment. Fails if the cell is invalid or already assigned.
    pub fn add_cell(&mut self, cell: LogicCell) -> Result<&mut Self, CompileError> {
        cell.validate()?;
        if self.cell(cell.id).is_some() {
            return Err(CompileError::InvalidProgram(format!(
                "cell {} assigned twice",
                cell.id
            )));
        }
        self.cells.push(cell);
        Ok(self)
    }

    /// Append a port route. The source must be a constant, an input, or a cell
    /// already defined in this program.
    pub fn route(
        &mut self,
        port: OutputPort,
        source: SignalAddress,
    ) -> Result<&mut Self, CompileError> {
        port.validate()?;
        source.validate()?;
        if let SignalAddress::CellOutput(id) = source {
            if self.cell(id).is_none() {
                return Err(CompileError::InvalidProgram(format!(
                    "port {:?} routed from undefined cell {}",
                    port, id
                )));
            }
        }
        if self.routes.iter().any(|r| r.port == port) {
            return Err(CompileError::InvalidProgram(format!(
                "port {:?} routed twice",
                port
            )));
        }
        self.routes.push(PortRoute { port, source });
        Ok(self)
    }

    /// Select a card preset to apply ahead of the cells.
    pub fn with_laser_preset(&mut self, preset: Option<u8>) -> &mut Self {
        self.laser_preset = preset;
        self
    }

    /// Save the card settings after programming.
    pub fn with_save_to_card(&mut self, save: bool) -> &mut Self {
        self.save_to_card = save;
        self
    }

    /// Card preset applied before the cells, if any.
    pub fn laser_preset(&self) -> Option<u8> {
        self.laser_preset
    }

    /// Whether the card settings are saved after programming.
    pub fn saves_to_card(&self) -> bool {
        self.save_to_card
    }

    /// Cell assignments in programming order.
    pub fn cells(&self) -> &[LogicCell] {
        &self.cells
    }

    /// Port routes in programming order.
    pub fn routes(&self) -> &[PortRoute] {
        &self.routes
    }

    /// Look up a cell assignment.
    pub fn cell(&self, id: CellId) -> Option<&LogicCell> {
        self.cells.iter().find(|c| c.id == id)
    }

    /// Re-check every invariant, e.g. for a program loaded from JSON.
    pub fn validate(&self) -> Result<(), CompileError> {
        let mut seen = HashSet::new();
        for cell in &self.cells {
            cell.validate()?;
            if !seen.insert(cell.id) {
                return Err(CompileError::InvalidProgram(format!(
                    "cell {} assigned twice",
                    cell.id
                )));
            }
        }
        let mut ports = HashSet::new();
        for route in &self.routes {
            route.port.validate()?;
            route.source.validate()?;
            if let SignalAddress::CellOutput(id) = route.source {
                if !seen.contains(&id) {
                    return Err(CompileError::InvalidProgram(format!(
                        "port {:?} routed from undefined cell {}",
                        route.port, id
                    )));
                }
            }
            if !ports.insert(route.port) {
                return Err(CompileError::InvalidProgram(format!(
                    "port {:?} routed twice",
                    route.port
                )));
            }
        }
        Ok(())
    }
}

/// Which side of a dual-sided light sheet fires first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanSide {
    /// Side A.
    A,
    /// Side B.
    B,
}

impl ScanSide {
    /// Controller property value.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanSide::A => "A",
            ScanSide::B => "B",
        }
    }
}

/// Fixed scan geometry of the rig, independent of the acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanGeometry {
    /// Line scans per slice.
    pub line_scans_per_slice: u32,
    /// Duration of one line scan in milliseconds.
    pub scan_duration_ms: f64,
    /// Number of illumination sides.
    pub num_sides: u32,
    /// First illuminated side.
    pub first_side: ScanSide,
    /// Alternate scan direction between slices.
    pub alternate_directions: bool,
    /// Interleave sides slice-by-slice instead of stack-by-stack.
    pub interleave_sides: bool,
    /// Light-sheet width (fast axis amplitude) in degrees.
    pub sheet_width_deg: f64,
    /// Light-sheet fast-axis offset in degrees.
    pub sheet_offset_deg: f64,
    /// Delay before each side in milliseconds.
    pub delay_before_side_ms: f64,
}

impl Default for ScanGeometry {
    fn default() -> Self {
        Self {
            line_scans_per_slice: 1,
            scan_duration_ms: 1.0,
            num_sides: 1,
            first_side: ScanSide::A,
            alternate_directions: false,
            interleave_sides: false,
            sheet_width_deg: 0.5,
            sheet_offset_deg: 0.0,
            delay_before_side_ms: 0.0,
        }
    }
}

/// Scan controller settings for one acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Slow-axis sweep amplitude in degrees.
    pub amplitude_deg: f64,
    /// Slow-axis sweep centre in degrees.
    pub center_deg: f64,
    /// Slice count programmed into the controller (may exceed the requested slices).
    pub slice_count_for_controller: u32,
    /// Number of volumes the controller repeats.
    pub num_repeats: u32,
    /// Idle time between volumes in milliseconds.
    pub repeat_delay_ms: f64,
    /// Fixed piezo position in microns.
    pub piezo_center_um: f64,
    /// Rig scan geometry.
    pub geometry: ScanGeometry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_address_codes() {
        assert_eq!(SignalAddress::Ground.code(), 0);
        assert_eq!(SignalAddress::CellOutput(CellId(10)).code(), 10);
        assert_eq!(SignalAddress::BncIn(1).code(), 33);
        assert_eq!(SignalAddress::TtlIn(0).code(), 41);
        assert_eq!(SignalAddress::InternalClock.code(), 192);
        assert_eq!(OutputPort::Bnc(1).address(), 33);
        assert_eq!(OutputPort::Ttl(7).address(), 48);
    }

    #[test]
    fn test_duplicate_cell_rejected() {
        let mut program = LogicProgram::new();
        let cell = LogicCell::one_shot(
            CellId(10),
            40,
            SignalAddress::TtlIn(0),
            SignalAddress::InternalClock,
        );
        program.add_cell(cell.clone()).unwrap();
        assert!(matches!(
            program.add_cell(cell),
            Err(CompileError::InvalidProgram(_))
        ));
    }

    #[test]
    fn test_route_requires_defined_cell() {
        let mut program = LogicProgram::new();
        let err = program
            .route(OutputPort::Bnc(1), SignalAddress::CellOutput(CellId(3)))
            .unwrap_err();
        assert!(err.to_string().contains("undefined cell"));

        // Constants and inputs need no definition
        program
            .route(OutputPort::Bnc(2), SignalAddress::Ground)
            .unwrap();
        assert_eq!(program.routes().len(), 1);
    }

    #[test]
    fn test_one_shot_requires_trigger() {
        let cell = LogicCell::one_shot(
            CellId(1),
            4,
            SignalAddress::Ground,
            SignalAddress::InternalClock,
        );
        assert!(cell.validate().is_err());
    }

    #[test]
    fn test_register_width_enforced() {
        let cell = LogicCell::one_shot(
            CellId(1),
            DURATION_REGISTER_MAX + 1,
            SignalAddress::TtlIn(0),
            SignalAddress::InternalClock,
        );
        assert!(cell.validate().is_err());
    }

    #[test]
    fn test_validate_catches_deserialized_duplicates() {
        let json = r#"{
            "cells": [
                {"id": 2, "kind": "ground", "duration_cycles": 0,
                 "inputs": ["ground", "ground", "ground", "ground"]},
                {"id": 2, "kind": "ground", "duration_cycles": 0,
                 "inputs": ["ground", "ground", "ground", "ground"]}
            ],
            "routes": []
        }"#;
        let program: LogicProgram = serde_json::from_str(json).unwrap();
        assert!(program.validate().is_err());
    }
}
