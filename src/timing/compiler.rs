//! Translates acquisition parameters into a logic-card program and scan settings.
//!
//! Compilation is pure: it never touches hardware, so every [`CompileError`] is
//! raised before the first property write.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{AcquisitionParameters, CalibrationConstants};
use crate::error::CompileError;
use crate::timing::program::{
    CellId, LogicCell, LogicProgram, OutputPort, ScanGeometry, ScanParameters, SignalAddress,
    DURATION_REGISTER_MAX,
};

/// Smallest calibration slope treated as non-zero.
pub const MIN_SLOPE_UM_PER_DEGREE: f64 = 1e-9;

const DEGREE_DECIMALS: i32 = 4;

/// Convert a millisecond duration into whole clock cycles.
///
/// Uses `round(ms * clock_hz / 1000)`. Results below one cycle fail with
/// [`CompileError::DurationTooShort`]; results wider than the 16-bit duration
/// register fail with [`CompileError::DurationOverflow`].
pub fn ms_to_cycles(ms: f64, clock_hz: f64) -> Result<u32, CompileError> {
    field_to_cycles("duration_ms", ms, clock_hz)
}

/// Convert clock cycles back into milliseconds.
pub fn cycles_to_ms(cycles: u32, clock_hz: f64) -> f64 {
    f64::from(cycles) * 1000.0 / clock_hz
}

fn field_to_cycles(field: &'static str, ms: f64, clock_hz: f64) -> Result<u32, CompileError> {
    if !ms.is_finite() {
        return Err(CompileError::InvalidParameters(format!(
            "{} must be finite, got {}",
            field, ms
        )));
    }
    let cycles = (ms * clock_hz / 1000.0).round();
    if cycles < 1.0 {
        return Err(CompileError::DurationTooShort {
            field,
            duration_ms: ms,
            cycle_ms: 1000.0 / clock_hz,
        });
    }
    if cycles > f64::from(DURATION_REGISTER_MAX) {
        return Err(CompileError::DurationOverflow {
            field,
            duration_ms: ms,
            cycles: cycles as u64,
            max_cycles: DURATION_REGISTER_MAX,
        });
    }
    Ok(cycles as u32)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Which cells and ports carry the camera and laser pulses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicLayout {
    /// One-shot cell timing the camera exposure pulse.
    pub camera_cell: CellId,
    /// One-shot cell timing the laser pulse.
    pub laser_cell: CellId,
    /// Trigger shared by both one-shots (the scan controller's slice sync).
    pub trigger_input: SignalAddress,
    /// Clock shared by both one-shots.
    pub clock_input: SignalAddress,
    /// Port driving the camera trigger.
    pub camera_port: OutputPort,
    /// Port driving the laser trigger.
    pub laser_port: OutputPort,
    /// Card preset routing the laser outputs, selected before the cells.
    pub laser_preset: Option<u8>,
    /// Save the card settings after programming.
    pub save_to_card: bool,
}

impl Default for LogicLayout {
    fn default() -> Self {
        Self {
            camera_cell: CellId(11),
            laser_cell: CellId(10),
            trigger_input: SignalAddress::TtlIn(0),
            clock_input: SignalAddress::InternalClock,
            camera_port: OutputPort::Bnc(1),
            laser_port: OutputPort::Bnc(2),
            laser_preset: Some(30),
            save_to_card: true,
        }
    }
}

/// Compiles [`AcquisitionParameters`] into a [`LogicProgram`] and [`ScanParameters`].
///
/// The compiler only holds rig wiring and scan geometry; calibration is passed
/// per call so the same compiler can be reused across runs.
#[derive(Clone, Debug, Default)]
pub struct TimingProgramCompiler {
    layout: LogicLayout,
    geometry: ScanGeometry,
}

impl TimingProgramCompiler {
    /// Create a compiler for the given wiring and scan geometry.
    pub fn new(layout: LogicLayout, geometry: ScanGeometry) -> Self {
        Self { layout, geometry }
    }

    /// Wiring used for the pulse cells.
    pub fn layout(&self) -> &LogicLayout {
        &self.layout
    }

    /// Compile one acquisition.
    pub fn compile(
        &self,
        params: &AcquisitionParameters,
        calib: &CalibrationConstants,
    ) -> Result<(LogicProgram, ScanParameters), CompileError> {
        validate_calibration(calib)?;
        validate_parameters(params)?;

        let camera_cycles =
            field_to_cycles("camera_exposure_ms", params.camera_exposure_ms, calib.clock_hz)?;
        let laser_cycles = field_to_cycles("laser_pulse_ms", params.laser_pulse_ms, calib.clock_hz)?;

        let layout = &self.layout;
        let mut program = LogicProgram::new();
        program
            .add_cell(LogicCell::one_shot(
                layout.camera_cell,
                camera_cycles,
                layout.trigger_input,
                layout.clock_input,
            ))?
            .add_cell(LogicCell::one_shot(
                layout.laser_cell,
                laser_cycles,
                layout.trigger_input,
                layout.clock_input,
            ))?;
        program
            .route(
                layout.camera_port,
                SignalAddress::CellOutput(layout.camera_cell),
            )?
            .route(
                layout.laser_port,
                SignalAddress::CellOutput(layout.laser_cell),
            )?;
        program
            .with_laser_preset(layout.laser_preset)
            .with_save_to_card(layout.save_to_card);

        let scan = self.scan_parameters(params, calib);

        debug!(
            camera_cycles,
            laser_cycles,
            amplitude_deg = scan.amplitude_deg,
            center_deg = scan.center_deg,
            controller_slices = scan.slice_count_for_controller,
            "Compiled timing program"
        );

        Ok((program, scan))
    }

    fn scan_parameters(
        &self,
        params: &AcquisitionParameters,
        calib: &CalibrationConstants,
    ) -> ScanParameters {
        let n = params.num_slices;
        let mut piezo_amplitude_um = f64::from(n - 1) * params.step_size_um;
        let mut slice_count_for_controller = n;

        if params.overlap_mode {
            // Controller compensation for overlap readout: n/(n-1) sweep, one extra slice.
            if n > 1 {
                piezo_amplitude_um *= f64::from(n) / f64::from(n - 1);
            }
            slice_count_for_controller += 1;
            info!(
                slices = n,
                controller_slices = slice_count_for_controller,
                "Overlap mode: scan amplitude and slice count compensated"
            );
        }

        let stack_ms = params.stack_duration_ms();
        let interval_ms = params.timepoint_interval_s * 1000.0;
        if params.num_timepoints > 1 && interval_ms > 0.0 && interval_ms < stack_ms {
            warn!(
                interval_ms,
                stack_ms, "Timepoint interval is shorter than one Z-stack; volumes run back to back"
            );
        }

        ScanParameters {
            amplitude_deg: round_to(
                piezo_amplitude_um / calib.slope_um_per_degree,
                DEGREE_DECIMALS,
            ),
            center_deg: round_to(
                (params.piezo_center_um - calib.offset_um) / calib.slope_um_per_degree,
                DEGREE_DECIMALS,
            ),
            slice_count_for_controller,
            num_repeats: params.num_timepoints,
            repeat_delay_ms: (interval_ms - stack_ms).max(0.0),
            piezo_center_um: params.piezo_center_um,
            geometry: self.geometry.clone(),
        }
    }
}

/// Compile with the default wiring and scan geometry.
pub fn compile(
    params: &AcquisitionParameters,
    calib: &CalibrationConstants,
) -> Result<(LogicProgram, ScanParameters), CompileError> {
    TimingProgramCompiler::default().compile(params, calib)
}

fn validate_calibration(calib: &CalibrationConstants) -> Result<(), CompileError> {
    if !calib.slope_um_per_degree.is_finite()
        || calib.slope_um_per_degree.abs() < MIN_SLOPE_UM_PER_DEGREE
    {
        return Err(CompileError::InvalidCalibration(format!(
            "slope must be non-zero, got {} um/deg",
            calib.slope_um_per_degree
        )));
    }
    if !calib.offset_um.is_finite() {
        return Err(CompileError::InvalidCalibration(format!(
            "offset must be finite, got {} um",
            calib.offset_um
        )));
    }
    if !(calib.clock_hz.is_finite() && calib.clock_hz > 0.0) {
        return Err(CompileError::InvalidCalibration(format!(
            "clock must be positive, got {} Hz",
            calib.clock_hz
        )));
    }
    Ok(())
}

fn validate_parameters(params: &AcquisitionParameters) -> Result<(), CompileError> {
    if params.num_slices < 1 {
        return Err(CompileError::InvalidParameters(
            "num_slices must be at least 1".into(),
        ));
    }
    if params.num_timepoints < 1 {
        return Err(CompileError::InvalidParameters(
            "num_timepoints must be at least 1".into(),
        ));
    }
    if params.num_slices > 1 && !(params.step_size_um.is_finite() && params.step_size_um > 0.0) {
        return Err(CompileError::InvalidParameters(format!(
            "step_size_um must be positive for {} slices, got {}",
            params.num_slices, params.step_size_um
        )));
    }
    if !(params.timepoint_interval_s.is_finite() && params.timepoint_interval_s >= 0.0) {
        return Err(CompileError::InvalidParameters(format!(
            "timepoint_interval_s must be non-negative, got {}",
            params.timepoint_interval_s
        )));
    }
    if !params.piezo_center_um.is_finite() {
        return Err(CompileError::InvalidParameters(format!(
            "piezo_center_um must be finite, got {}",
            params.piezo_center_um
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::program::CellKind;

    fn calib() -> CalibrationConstants {
        CalibrationConstants {
            slope_um_per_degree: 100.0,
            offset_um: 0.0,
            clock_hz: 4000.0,
        }
    }

    fn params(num_slices: u32) -> AcquisitionParameters {
        AcquisitionParameters {
            num_slices,
            step_size_um: 1.0,
            laser_pulse_ms: 10.0,
            camera_exposure_ms: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_amplitude_from_slices_and_step() {
        let (_, scan) = compile(&params(10), &calib()).unwrap();
        // (10 - 1) * 1.0 um / 100 um/deg
        assert!((scan.amplitude_deg - 0.09).abs() < 1e-12);
        assert_eq!(scan.slice_count_for_controller, 10);
        assert_eq!(scan.center_deg, 0.0);
    }

    #[test]
    fn test_laser_pulse_cycles() {
        let (program, _) = compile(&params(10), &calib()).unwrap();
        let laser = program.cell(LogicLayout::default().laser_cell).unwrap();
        assert_eq!(laser.duration_cycles, 40);
        assert_eq!(laser.kind, CellKind::OneShotNonRetrig);
    }

    #[test]
    fn test_overlap_mode_compensation() {
        let mut p = params(10);
        p.overlap_mode = true;
        let (_, scan) = compile(&p, &calib()).unwrap();
        assert_eq!(scan.slice_count_for_controller, 11);
        // 9 um scaled by 10/9 = 10 um
        assert!((scan.amplitude_deg - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_single_slice_keeps_zero_amplitude() {
        let mut p = params(1);
        p.step_size_um = 0.0;
        p.overlap_mode = true;
        let (_, scan) = compile(&p, &calib()).unwrap();
        assert_eq!(scan.amplitude_deg, 0.0);
        assert_eq!(scan.slice_count_for_controller, 2);
    }

    #[test]
    fn test_center_uses_offset_and_rounding() {
        let mut p = params(5);
        p.piezo_center_um = 50.0;
        let c = CalibrationConstants {
            slope_um_per_degree: 30.0,
            offset_um: 10.0,
            clock_hz: 4000.0,
        };
        let (_, scan) = compile(&p, &c).unwrap();
        // 40 / 30 = 1.3333..
        assert_eq!(scan.center_deg, 1.3333);
        // 4 / 30 = 0.1333..
        assert_eq!(scan.amplitude_deg, 0.1333);
    }

    #[test]
    fn test_duration_too_short() {
        let err = ms_to_cycles(0.1, 4000.0).unwrap_err();
        assert!(matches!(err, CompileError::DurationTooShort { .. }));

        let mut p = params(3);
        p.laser_pulse_ms = 0.0;
        assert!(matches!(
            compile(&p, &calib()),
            Err(CompileError::DurationTooShort {
                field: "laser_pulse_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_duration_overflow_at_register_width() {
        // 65535 cycles at 4 kHz
        assert_eq!(ms_to_cycles(16_383.75, 4000.0).unwrap(), 65_535);
        let err = ms_to_cycles(16_384.0, 4000.0).unwrap_err();
        assert!(matches!(
            err,
            CompileError::DurationOverflow {
                cycles: 65_536,
                max_cycles: 65_535,
                ..
            }
        ));
    }

    #[test]
    fn test_round_trip_within_one_cycle() {
        let clock = 4000.0;
        let cycle_ms = 1000.0 / clock;
        for d in [0.25, 0.3, 1.0, 7.77, 10.0, 123.456, 5000.1, 16_383.0] {
            let back = cycles_to_ms(ms_to_cycles(d, clock).unwrap(), clock);
            assert!(
                (back - d).abs() <= cycle_ms,
                "{} ms round-tripped to {} ms",
                d,
                back
            );
        }
    }

    #[test]
    fn test_invalid_calibration() {
        let mut c = calib();
        c.slope_um_per_degree = 1e-12;
        assert!(matches!(
            compile(&params(3), &c),
            Err(CompileError::InvalidCalibration(_))
        ));

        let mut c = calib();
        c.clock_hz = 0.0;
        assert!(matches!(
            compile(&params(3), &c),
            Err(CompileError::InvalidCalibration(_))
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        let mut p = params(3);
        p.step_size_um = 0.0;
        assert!(matches!(
            compile(&p, &calib()),
            Err(CompileError::InvalidParameters(_))
        ));

        let mut p = params(0);
        p.step_size_um = 1.0;
        assert!(matches!(
            compile(&p, &calib()),
            Err(CompileError::InvalidParameters(_))
        ));

        // A single slice needs no step
        let mut p = params(1);
        p.step_size_um = 0.0;
        assert!(compile(&p, &calib()).is_ok());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut p = params(17);
        p.step_size_um = 0.37;
        p.laser_pulse_ms = 3.3;
        p.piezo_center_um = -12.5;
        let first = compile(&p, &calib()).unwrap();
        for _ in 0..10 {
            assert_eq!(compile(&p, &calib()).unwrap(), first);
        }
    }

    #[test]
    fn test_pulse_cells_share_trigger_and_clock() {
        let layout = LogicLayout::default();
        let (program, _) = compile(&params(4), &calib()).unwrap();
        let camera = program.cell(layout.camera_cell).unwrap();
        let laser = program.cell(layout.laser_cell).unwrap();
        assert_eq!(camera.inputs[..2], laser.inputs[..2]);
        assert_eq!(camera.inputs[0], layout.trigger_input);
        assert_eq!(camera.inputs[1], layout.clock_input);

        let routes = program.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].port, layout.camera_port);
        assert_eq!(
            routes[0].source,
            SignalAddress::CellOutput(layout.camera_cell)
        );
    }

    #[test]
    fn test_card_preset_and_save_follow_layout() {
        let (program, _) = compile(&params(4), &calib()).unwrap();
        assert_eq!(program.laser_preset(), Some(30));
        assert!(program.saves_to_card());

        let layout = LogicLayout {
            laser_preset: None,
            save_to_card: false,
            ..LogicLayout::default()
        };
        let compiler = TimingProgramCompiler::new(layout, ScanGeometry::default());
        let (program, _) = compiler.compile(&params(4), &calib()).unwrap();
        assert_eq!(program.laser_preset(), None);
        assert!(!program.saves_to_card());
    }

    #[test]
    fn test_repeat_delay() {
        let mut p = params(10);
        p.num_timepoints = 3;
        p.timepoint_interval_s = 1.0;
        let (_, scan) = compile(&p, &calib()).unwrap();
        assert_eq!(scan.num_repeats, 3);
        // 1000 ms - 10 slices * 10 ms
        assert!((scan.repeat_delay_ms - 900.0).abs() < 1e-9);

        p.timepoint_interval_s = 0.05;
        let (_, scan) = compile(&p, &calib()).unwrap();
        assert_eq!(scan.repeat_delay_ms, 0.0);
    }
}
