//! Mock Hardware Implementations
//!
//! In-memory rig components for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `RecordingPropertyStore` - property map that records every write and can
//!   inject write failures
//! - `SimulatedCamera` - circular frame buffer fed by a background emitter
//!   thread, with stop/stall/pop fault injection
//! - `SimulatedRig` - both of the above wired together: writing the scanner's
//!   `SPIMState=Running` starts frame emission, like the real trigger chain
//!
//! # Performance Characteristics
//!
//! - SimulatedCamera: one frame per configured period (default 5ms)
//! - Ring buffer capacity 1024 frames; overflow stops the sequence when
//!   `stop_on_overflow` is set

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::core::{PixelBuffer, RawFrame};
use crate::hardware::programmer::{EDIT_CELL_PREFIX, POINTER_POSITION};
use crate::hardware::{CameraBuffer, DeviceLabels, PropertyStore, RigHandle};

type PropertyKey = (String, String);
/// Device, pointer location, register.
type RegisterKey = (String, u16, String);

fn key(device: &str, property: &str) -> PropertyKey {
    (device.to_string(), property.to_string())
}

// =============================================================================
// RecordingPropertyStore
// =============================================================================

/// One recorded property write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyWrite {
    /// Device label.
    pub device: String,
    /// Property name.
    pub property: String,
    /// Value written.
    pub value: String,
}

#[derive(Default)]
struct StoreState {
    values: HashMap<PropertyKey, String>,
    registers: HashMap<RegisterKey, String>,
    allowed: HashMap<PropertyKey, Vec<String>>,
    fail_on: HashSet<PropertyKey>,
    writes: Vec<PropertyWrite>,
}

/// Property store that reports back what was written and logs every write.
///
/// Reading a property that was never written fails, which the programmer
/// treats as "changed". `EditCell*` properties are indexed by the device's
/// current `PointerPosition`, like a logic card's register file.
#[derive(Default)]
pub struct RecordingPropertyStore {
    state: Mutex<StoreState>,
}

impl RecordingPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without recording a write.
    pub fn with_value(self, device: &str, property: &str, value: &str) -> Self {
        self.state
            .lock()
            .values
            .insert(key(device, property), value.to_string());
        self
    }

    /// Declare an enumerated property and its allowed values.
    pub fn set_allowed_values(&self, device: &str, property: &str, values: &[&str]) {
        self.state.lock().allowed.insert(
            key(device, property),
            values.iter().map(|v| v.to_string()).collect(),
        );
    }

    /// Make every subsequent write of this property fail.
    pub fn fail_on(&self, device: &str, property: &str) {
        self.state.lock().fail_on.insert(key(device, property));
    }

    /// Stop injecting write failures.
    pub fn clear_failures(&self) {
        self.state.lock().fail_on.clear();
    }

    /// Current value of a property, if set.
    pub fn value(&self, device: &str, property: &str) -> Option<String> {
        self.state.lock().values.get(&key(device, property)).cloned()
    }

    /// Register held at a pointer location, if written.
    pub fn register(&self, device: &str, address: u16, register: &str) -> Option<String> {
        self.state
            .lock()
            .registers
            .get(&(device.to_string(), address, register.to_string()))
            .cloned()
    }

    /// All successful writes in order.
    pub fn writes(&self) -> Vec<PropertyWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Forget recorded writes, keeping current values.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

impl StoreState {
    fn pointer(&self, device: &str) -> Result<u16> {
        let position = self
            .values
            .get(&key(device, POINTER_POSITION))
            .ok_or_else(|| anyhow!("{}: no location selected", device))?;
        position
            .parse()
            .map_err(|_| anyhow!("{}: bad pointer position '{}'", device, position))
    }
}

impl PropertyStore for RecordingPropertyStore {
    fn get(&self, device: &str, property: &str) -> Result<String> {
        let state = self.state.lock();
        let value = if property.starts_with(EDIT_CELL_PREFIX) {
            let address = state.pointer(device)?;
            state
                .registers
                .get(&(device.to_string(), address, property.to_string()))
        } else {
            state.values.get(&key(device, property))
        };
        value
            .cloned()
            .ok_or_else(|| anyhow!("{}.{} has no value", device, property))
    }

    fn set(&self, device: &str, property: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let k = key(device, property);
        if state.fail_on.contains(&k) {
            bail!("injected write failure");
        }
        if let Some(allowed) = state.allowed.get(&k) {
            if !allowed.iter().any(|a| a == value) {
                bail!("'{}' is not an allowed value for {}.{}", value, device, property);
            }
        }
        if property.starts_with(EDIT_CELL_PREFIX) {
            let address = state.pointer(device)?;
            state
                .registers
                .insert((device.to_string(), address, property.to_string()), value.to_string());
        } else {
            state.values.insert(k, value.to_string());
        }
        state.writes.push(PropertyWrite {
            device: device.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn has_property(&self, device: &str, property: &str) -> bool {
        let state = self.state.lock();
        let k = key(device, property);
        state.values.contains_key(&k) || state.allowed.contains_key(&k)
    }

    fn allowed_values(&self, device: &str, property: &str) -> Vec<String> {
        self.state
            .lock()
            .allowed
            .get(&key(device, property))
            .cloned()
            .unwrap_or_default()
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Faults the simulated camera injects during a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Stop the hardware sequence after emitting this many frames.
    pub stop_after: Option<u32>,
    /// Stop emitting after this many frames while the sequence keeps running.
    pub stall_after: Option<u32>,
    /// Fail the pop with this zero-based index.
    pub fail_pop_at: Option<u32>,
}

struct CameraState {
    buffer: VecDeque<RawFrame>,
    running: bool,
    armed_count: u32,
    stop_on_overflow: bool,
    emitted: u32,
    pops: u32,
    generation: u64,
    faults: FaultPlan,
}

/// Camera with an in-memory circular buffer.
///
/// Frames are `width x height` 16-bit images whose pixels all equal the frame's
/// emission index, so tests can verify pairing order from pixel data.
pub struct SimulatedCamera {
    state: Arc<Mutex<CameraState>>,
    width: u32,
    height: u32,
    frame_period: Duration,
    capacity: usize,
}

impl SimulatedCamera {
    /// Default ring buffer capacity in frames.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a camera emitting one frame per `frame_period` once triggered.
    pub fn new(width: u32, height: u32, frame_period: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraState {
                buffer: VecDeque::new(),
                running: false,
                armed_count: 0,
                stop_on_overflow: true,
                emitted: 0,
                pops: 0,
                generation: 0,
                faults: FaultPlan::default(),
            })),
            width,
            height,
            frame_period,
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    /// Set the faults injected into subsequent sequences.
    pub fn with_faults(self, faults: FaultPlan) -> Self {
        self.state.lock().faults = faults;
        self
    }

    /// Replace the fault plan.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    /// Test frame whose pixels all equal `index`.
    pub fn test_frame(&self, index: u32) -> RawFrame {
        let pixel_count = (self.width * self.height) as usize;
        RawFrame {
            pixels: PixelBuffer::U16(vec![index as u16; pixel_count]),
            width: self.width,
            height: self.height,
            camera_frame_number: Some(u64::from(index)),
        }
    }

    /// Queue a frame directly, bypassing the emitter.
    pub fn push_frame(&self, frame: RawFrame) {
        self.state.lock().buffer.push_back(frame);
    }

    /// Queue `count` test frames numbered from the current emission count.
    pub fn push_frames(&self, count: u32) {
        let start = self.state.lock().emitted;
        for index in start..start + count {
            let frame = self.test_frame(index);
            let mut state = self.state.lock();
            state.buffer.push_back(frame);
            state.emitted += 1;
        }
    }

    /// Force the running flag, e.g. to model a sequence the camera ended itself.
    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Frames emitted in the current sequence.
    pub fn emitted(&self) -> u32 {
        self.state.lock().emitted
    }

    /// Begin emitting frames for the armed sequence on a background thread.
    pub fn start_emitting(&self) {
        let generation = {
            let state = self.state.lock();
            if !state.running {
                debug!("Scan triggered without an armed sequence; nothing to emit");
                return;
            }
            state.generation
        };

        let state = Arc::clone(&self.state);
        let period = self.frame_period;
        let capacity = self.capacity;
        let (width, height) = (self.width, self.height);
        let pixel_count = (width * height) as usize;

        let spawned = std::thread::Builder::new()
            .name("sim-camera".into())
            .spawn(move || loop {
                std::thread::sleep(period);
                let mut s = state.lock();
                if s.generation != generation || !s.running {
                    break;
                }
                if s.faults.stall_after == Some(s.emitted) {
                    debug!(emitted = s.emitted, "Simulated camera stalled");
                    break;
                }
                if s.faults.stop_after == Some(s.emitted) {
                    debug!(emitted = s.emitted, "Simulated camera stopped sequence");
                    s.running = false;
                    break;
                }
                if s.buffer.len() >= capacity {
                    if s.stop_on_overflow {
                        error!(capacity, "Simulated ring buffer overflow");
                        s.running = false;
                        break;
                    }
                    s.buffer.pop_front();
                }
                let index = s.emitted;
                s.buffer.push_back(RawFrame {
                    pixels: PixelBuffer::U16(vec![index as u16; pixel_count]),
                    width,
                    height,
                    camera_frame_number: Some(u64::from(index)),
                });
                s.emitted += 1;
                if s.emitted >= s.armed_count {
                    s.running = false;
                    break;
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn simulated camera emitter");
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(64, 64, Duration::from_millis(5))
    }
}

impl CameraBuffer for SimulatedCamera {
    fn remaining_count(&self) -> u32 {
        self.state.lock().buffer.len() as u32
    }

    fn pop_next(&self) -> Result<RawFrame> {
        let mut state = self.state.lock();
        let index = state.pops;
        state.pops += 1;
        if state.faults.fail_pop_at == Some(index) {
            bail!("injected pop failure at frame {}", index);
        }
        state
            .buffer
            .pop_front()
            .ok_or_else(|| anyhow!("circular buffer is empty"))
    }

    fn is_sequence_running(&self) -> bool {
        self.state.lock().running
    }

    fn start_sequence(&self, count: u32, stop_on_overflow: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.running {
            bail!("a sequence is already running");
        }
        state.running = true;
        state.armed_count = count;
        state.stop_on_overflow = stop_on_overflow;
        state.emitted = 0;
        state.pops = 0;
        debug!(count, "Simulated camera sequence armed");
        Ok(())
    }

    fn stop_sequence(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.generation += 1;
        Ok(())
    }
}

// =============================================================================
// SimulatedRig
// =============================================================================

const TRIGGER_MODES: [&str; 3] = ["Internal Trigger", "Edge Trigger", "Level Trigger"];

/// Property store and camera wired together like a real rig.
///
/// # Example
///
/// ```rust,ignore
/// let rig = Arc::new(SimulatedRig::new(DeviceLabels::default(), SimulatedCamera::default()));
/// let supervisor = AcquisitionSupervisor::new(rig.handle(), &RigConfig::default());
/// ```
pub struct SimulatedRig {
    store: RecordingPropertyStore,
    camera: Arc<SimulatedCamera>,
    devices: DeviceLabels,
}

impl SimulatedRig {
    /// Create a rig whose camera starts in internal trigger mode.
    pub fn new(devices: DeviceLabels, camera: SimulatedCamera) -> Self {
        let store = RecordingPropertyStore::new().with_value(
            &devices.camera,
            "TriggerMode",
            TRIGGER_MODES[0],
        );
        store.set_allowed_values(&devices.camera, "TriggerMode", &TRIGGER_MODES);
        info!(camera = %devices.camera, galvo = %devices.galvo, "Simulated rig ready");
        Self {
            store,
            camera: Arc::new(camera),
            devices,
        }
    }

    /// The underlying recording store.
    pub fn store(&self) -> &RecordingPropertyStore {
        &self.store
    }

    /// The simulated camera.
    pub fn camera(&self) -> Arc<SimulatedCamera> {
        Arc::clone(&self.camera)
    }

    /// Rig handle backed by this simulation.
    pub fn handle(self: &Arc<Self>) -> RigHandle {
        let store: Arc<dyn PropertyStore> = Arc::clone(self) as Arc<dyn PropertyStore>;
        let camera: Arc<dyn CameraBuffer> = Arc::clone(self) as Arc<dyn CameraBuffer>;
        RigHandle::new(store, camera)
    }
}

impl PropertyStore for SimulatedRig {
    fn get(&self, device: &str, property: &str) -> Result<String> {
        self.store.get(device, property)
    }

    fn set(&self, device: &str, property: &str, value: &str) -> Result<()> {
        self.store.set(device, property, value)?;
        if device == self.devices.galvo && property == "SPIMState" && value == "Running" {
            self.camera.start_emitting();
        }
        Ok(())
    }

    fn has_property(&self, device: &str, property: &str) -> bool {
        self.store.has_property(device, property)
    }

    fn allowed_values(&self, device: &str, property: &str) -> Vec<String> {
        self.store.allowed_values(device, property)
    }
}

impl CameraBuffer for SimulatedRig {
    fn remaining_count(&self) -> u32 {
        self.camera.remaining_count()
    }

    fn pop_next(&self) -> Result<RawFrame> {
        self.camera.pop_next()
    }

    fn is_sequence_running(&self) -> bool {
        self.camera.is_sequence_running()
    }

    fn start_sequence(&self, count: u32, stop_on_overflow: bool) -> Result<()> {
        self.camera.start_sequence(count, stop_on_overflow)
    }

    fn stop_sequence(&self) -> Result<()> {
        self.camera.stop_sequence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_records_and_fails() {
        let store = RecordingPropertyStore::new();
        store.set("Dev", "Prop", "1").unwrap();
        assert_eq!(store.get("Dev", "Prop").unwrap(), "1");
        assert!(store.get("Dev", "Other").is_err());

        store.fail_on("Dev", "Prop");
        assert!(store.set("Dev", "Prop", "2").is_err());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.value("Dev", "Prop").as_deref(), Some("1"));
    }

    #[test]
    fn test_cell_registers_follow_pointer() {
        let store = RecordingPropertyStore::new();
        assert!(store.set("Card", "EditCellConfig", "40").is_err());

        store.set("Card", "PointerPosition", "10").unwrap();
        store.set("Card", "EditCellConfig", "40").unwrap();
        store.set("Card", "PointerPosition", "11").unwrap();
        store.set("Card", "EditCellConfig", "80").unwrap();

        assert_eq!(store.get("Card", "EditCellConfig").unwrap(), "80");
        assert_eq!(store.register("Card", 10, "EditCellConfig").as_deref(), Some("40"));
        assert_eq!(store.register("Card", 11, "EditCellConfig").as_deref(), Some("80"));
        assert_eq!(store.value("Card", "EditCellConfig"), None);
    }

    #[test]
    fn test_store_rejects_disallowed_value() {
        let store = RecordingPropertyStore::new();
        store.set_allowed_values("Cam", "TriggerMode", &["Internal Trigger"]);
        assert!(store.has_property("Cam", "TriggerMode"));
        assert!(store.set("Cam", "TriggerMode", "Level Trigger").is_err());
    }

    #[test]
    fn test_camera_pop_order_and_fault() {
        let camera = SimulatedCamera::new(2, 2, Duration::from_millis(1))
            .with_faults(FaultPlan {
                fail_pop_at: Some(1),
                ..Default::default()
            });
        camera.push_frames(3);
        assert_eq!(camera.remaining_count(), 3);
        assert_eq!(camera.pop_next().unwrap().camera_frame_number, Some(0));
        assert!(camera.pop_next().is_err());
    }

    #[test]
    fn test_rig_trigger_emits_armed_frames() {
        let rig = Arc::new(SimulatedRig::new(
            DeviceLabels::default(),
            SimulatedCamera::new(4, 4, Duration::from_millis(1)),
        ));
        rig.start_sequence(3, true).unwrap();
        rig.set("Scanner:AB:33", "SPIMState", "Running").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while rig.is_sequence_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!rig.is_sequence_running());
        assert_eq!(rig.remaining_count(), 3);
    }

    #[test]
    fn test_second_sequence_rejected_while_running() {
        let camera = SimulatedCamera::default();
        camera.start_sequence(5, true).unwrap();
        assert!(camera.start_sequence(5, true).is_err());
        camera.stop_sequence().unwrap();
        assert!(camera.start_sequence(5, true).is_ok());
    }
}
