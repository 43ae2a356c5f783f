//! Core data types shared by the timing compiler, hardware programmer and
//! acquisition engine.
//!
//! # Data Flow
//!
//! ```text
//! AcquisitionParameters + CalibrationConstants
//!         --compile--> LogicProgram + ScanParameters --apply--> PropertyStore
//! CameraBuffer --RawFrame--> FrameCollector --AcquiredFrame--> consumer
//! ```
//!
//! `AcquisitionParameters` are supplied per run, `CalibrationConstants` are
//! loaded once at startup and shared read-only for the process lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Acquisition inputs
// =============================================================================

/// User-facing parameters for one volumetric time-series acquisition.
///
/// # Fields
///
/// * `num_slices` - Z-slices per volume (>= 1)
/// * `step_size_um` - Distance between slices; must be positive unless `num_slices == 1`
/// * `laser_pulse_ms` - Width of the laser trigger pulse (> 0)
/// * `camera_exposure_ms` - Width of the camera trigger pulse
/// * `num_timepoints` - Volumes to acquire (>= 1)
/// * `timepoint_interval_s` - Start-to-start interval between volumes (0 = as fast as possible)
/// * `piezo_center_um` - Fixed piezo position the light sheet is centred on
/// * `overlap_mode` - Camera runs in overlap (rolling) mode; see the compiler for the
///   scan compensation this implies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParameters {
    /// Z-slices per volume.
    pub num_slices: u32,
    /// Distance between slices in microns.
    pub step_size_um: f64,
    /// Laser trigger pulse width in milliseconds.
    pub laser_pulse_ms: f64,
    /// Camera trigger pulse width in milliseconds.
    pub camera_exposure_ms: f64,
    /// Number of volumes.
    pub num_timepoints: u32,
    /// Interval between volume starts in seconds.
    pub timepoint_interval_s: f64,
    /// Piezo centre position in microns.
    pub piezo_center_um: f64,
    /// Camera overlap mode.
    #[serde(default)]
    pub overlap_mode: bool,
}

impl Default for AcquisitionParameters {
    fn default() -> Self {
        Self {
            num_slices: 3,
            step_size_um: 1.0,
            laser_pulse_ms: 10.0,
            camera_exposure_ms: 10.0,
            num_timepoints: 1,
            timepoint_interval_s: 0.0,
            piezo_center_um: 0.0,
            overlap_mode: false,
        }
    }
}

impl AcquisitionParameters {
    /// Total frames the camera will deliver for these parameters.
    ///
    /// `camera_channels` is the number of physical cameras interleaved by the
    /// camera device (1 for a single camera).
    pub fn total_images(&self, camera_channels: u32) -> u32 {
        self.num_slices
            .saturating_mul(self.num_timepoints)
            .saturating_mul(camera_channels.max(1))
    }

    /// Duration of one Z-stack sweep in milliseconds.
    pub fn stack_duration_ms(&self) -> f64 {
        f64::from(self.num_slices) * self.camera_exposure_ms
    }
}

/// Rig calibration, immutable for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConstants {
    /// Light-sheet displacement per degree of galvo rotation (must be non-zero).
    pub slope_um_per_degree: f64,
    /// Piezo position corresponding to a galvo angle of zero.
    pub offset_um: f64,
    /// Logic card clock frequency.
    pub clock_hz: f64,
}

impl Default for CalibrationConstants {
    fn default() -> Self {
        Self {
            slope_um_per_degree: 100.0,
            offset_um: 0.0,
            clock_hz: 4000.0,
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Memory-efficient pixel buffer in the camera's native bit depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the memory size in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }
}

/// A frame as popped from the camera ring buffer, before sequence pairing.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    /// Pixel data.
    pub pixels: PixelBuffer,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Camera-side image counter, if the camera reports one.
    pub camera_frame_number: Option<u64>,
}

/// Position of a frame within the acquisition, in physical trigger order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceEvent {
    /// Volume index.
    pub timepoint: u32,
    /// Slice index within the volume.
    pub z_index: u32,
    /// Camera channel index.
    pub channel: u32,
}

/// A frame paired with its sequence event.
///
/// Ownership passes to the consumer when the frame is emitted; the engine keeps
/// no reference afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquiredFrame {
    /// Pixel data.
    pub pixels: PixelBuffer,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Where this frame sits in the acquisition.
    pub event: SequenceEvent,
    /// Zero-based pop order within the run.
    pub frame_index: u32,
    /// Host time at which the frame was popped.
    pub capture_time: DateTime<Utc>,
}

impl AcquiredFrame {
    /// Pair a raw frame with its event, stamping the host capture time.
    pub fn pair(raw: RawFrame, event: SequenceEvent, frame_index: u32) -> Self {
        Self {
            pixels: raw.pixels,
            width: raw.width,
            height: raw.height,
            event,
            frame_index,
            capture_time: Utc::now(),
        }
    }
}
