//! Simulated Hardware Implementations
//!
//! Provides simulated devices for running the acquisition core without physical hardware.
//! All simulated devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Simulations
//!
//! - `SimulatedTrigger` - pulse generator with channel and pulse-width checks
//! - `SimulatedCamera` - triggered camera producing 16-bit noise frames
//! - `SimulatedStage` - motion stage with realistic move timing
//!
//! # Fault Injection
//!
//! Every device takes a [`FaultPlan`]. A "hang" never completes on its own, the same way
//! a wedged vendor call behaves, so the worker's timeout is what ends it.
//!
//! All devices created from one [`SimulatedRig`] share an [`OpenDeviceCounter`] and a
//! [`CallLog`], which lets tests check that every adapter was released and that calls
//! happened in causal order.

use crate::core::{CameraImage, DeviceKind, PixelBuffer};
use crate::error::DeviceError;
use crate::hardware::{
    CameraCommand, CameraSettings, DeviceSet, HardwareAdapter, StageCommand, StageSettings,
    TriggerAck, TriggerCommand, TriggerSettings,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::debug;

// =============================================================================
// Shared bookkeeping
// =============================================================================

/// Number of simulated devices currently open.
#[derive(Clone, Debug, Default)]
pub struct OpenDeviceCounter(Arc<AtomicUsize>);

impl OpenDeviceCounter {
    /// Devices opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One recorded adapter call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCall {
    /// Device that was called
    pub device: DeviceKind,
    /// `open`, `arm`, `execute`, `read_position` or `close`
    pub operation: &'static str,
}

/// Ordered record of adapter calls across a rig.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<DeviceCall>>>);

impl CallLog {
    /// Copy of every call recorded so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.0.lock().clone()
    }

    /// Number of `execute` calls made on one device.
    pub fn executions(&self, device: DeviceKind) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|call| call.device == device && call.operation == "execute")
            .count()
    }

    fn record(&self, device: DeviceKind, operation: &'static str) {
        self.0.lock().push(DeviceCall { device, operation });
    }
}

/// Faults a simulated device will inject.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// `open` fails with `Unavailable`
    pub unavailable: bool,
    /// `arm` fails with `Busy`
    pub busy: bool,
    /// `arm` fails with `InvalidParameters` carrying this reason
    pub reject_arm: Option<String>,
    /// `open` never completes
    pub hang_on_open: bool,
    /// `arm` never completes
    pub hang_on_arm: bool,
    /// Every `execute` never completes
    pub hang_always: bool,
    /// These `execute` calls (0-based) never complete
    pub hang_on_calls: Vec<u64>,
    /// This `execute` call (0-based) fails with `Fault`
    pub fault_on_call: Option<u64>,
    /// This `execute` call (0-based) panics inside the driver
    pub panic_on_call: Option<u64>,
}

impl FaultPlan {
    /// Every `execute` hangs.
    pub fn hang_always() -> Self {
        Self {
            hang_always: true,
            ..Self::default()
        }
    }

    /// The listed `execute` calls hang.
    pub fn hang_on(calls: impl IntoIterator<Item = u64>) -> Self {
        Self {
            hang_on_calls: calls.into_iter().collect(),
            ..Self::default()
        }
    }

    /// The given `execute` call reports a device fault.
    pub fn fault_on(call: u64) -> Self {
        Self {
            fault_on_call: Some(call),
            ..Self::default()
        }
    }

    /// The given `execute` call panics, as a buggy vendor binding would.
    pub fn panic_on(call: u64) -> Self {
        Self {
            panic_on_call: Some(call),
            ..Self::default()
        }
    }

    /// `open` reports the device as unavailable.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// `arm` reports the device as busy.
    pub fn busy() -> Self {
        Self {
            busy: true,
            ..Self::default()
        }
    }
}

/// Lifecycle bookkeeping shared by all simulated devices.
#[derive(Debug)]
struct SimCore {
    kind: DeviceKind,
    plan: FaultPlan,
    counter: OpenDeviceCounter,
    log: CallLog,
    open: bool,
    armed: bool,
    calls: u64,
}

impl SimCore {
    fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            plan: FaultPlan::default(),
            counter: OpenDeviceCounter::default(),
            log: CallLog::default(),
            open: false,
            armed: false,
            calls: 0,
        }
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.log.record(self.kind, "open");
        if self.plan.hang_on_open {
            std::future::pending::<()>().await;
        }
        if self.plan.unavailable {
            return Err(DeviceError::Unavailable {
                device: self.kind,
                reason: "simulated link down".into(),
            });
        }
        if !self.open {
            self.counter.acquire();
            self.open = true;
        }
        self.calls = 0;
        debug!(device = %self.kind, "simulated device opened");
        Ok(())
    }

    async fn begin_arm(&mut self) -> Result<(), DeviceError> {
        self.log.record(self.kind, "arm");
        if !self.open {
            return Err(DeviceError::fault(self.kind, "arm before open"));
        }
        if self.plan.hang_on_arm {
            std::future::pending::<()>().await;
        }
        if self.plan.busy {
            return Err(DeviceError::Busy { device: self.kind });
        }
        if let Some(reason) = &self.plan.reject_arm {
            return Err(DeviceError::invalid(self.kind, reason.clone()));
        }
        Ok(())
    }

    #[allow(clippy::panic)]
    async fn begin_execute(&mut self) -> Result<u64, DeviceError> {
        self.log.record(self.kind, "execute");
        if !self.armed {
            return Err(DeviceError::fault(self.kind, "execute before arm"));
        }
        let call = self.calls;
        self.calls += 1;
        if self.plan.hang_always || self.plan.hang_on_calls.contains(&call) {
            std::future::pending::<()>().await;
        }
        if self.plan.panic_on_call == Some(call) {
            panic!("simulated {} driver panic on call {call}", self.kind);
        }
        if self.plan.fault_on_call == Some(call) {
            return Err(DeviceError::fault(self.kind, format!("simulated fault on call {call}")));
        }
        Ok(call)
    }

    fn close(&mut self) {
        self.log.record(self.kind, "close");
        if self.open {
            self.counter.release();
            debug!(device = %self.kind, "simulated device closed");
        }
        self.open = false;
        self.armed = false;
    }
}

// =============================================================================
// SimulatedTrigger
// =============================================================================

/// Simulated pulse generator.
///
/// Mirrors a digital-pattern DAQ: each channel carries the same pulse train, and a
/// pulse must be shorter than its period.
#[derive(Debug)]
pub struct SimulatedTrigger {
    core: SimCore,
    channel_count: u8,
    settings: Option<TriggerSettings>,
    pulses: u64,
}

impl SimulatedTrigger {
    /// Trigger device with 16 digital outputs.
    pub fn new() -> Self {
        Self {
            core: SimCore::new(DeviceKind::Trigger),
            channel_count: 16,
            settings: None,
            pulses: 0,
        }
    }

    /// Inject faults.
    pub fn with_faults(mut self, plan: FaultPlan) -> Self {
        self.core.plan = plan;
        self
    }

    /// Pulses emitted since the last arm.
    pub fn pulses(&self) -> u64 {
        self.pulses
    }
}

impl Default for SimulatedTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedTrigger {
    type Settings = TriggerSettings;
    type Command = TriggerCommand;
    type Output = TriggerAck;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Trigger
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.core.open().await
    }

    async fn arm(&mut self, settings: &TriggerSettings) -> Result<(), DeviceError> {
        self.core.begin_arm().await?;
        if let Some(channel) = settings
            .channels
            .iter()
            .find(|&&channel| channel >= self.channel_count)
        {
            return Err(DeviceError::invalid(
                DeviceKind::Trigger,
                format!("channel {channel} not present"),
            ));
        }
        if settings.pulse_width.is_zero() || settings.pulse_width >= settings.interval {
            return Err(DeviceError::invalid(
                DeviceKind::Trigger,
                "pulse width must be positive and shorter than the period",
            ));
        }
        self.settings = Some(settings.clone());
        self.pulses = 0;
        self.core.armed = true;
        debug!(
            rate_hz = settings.rate_hz(),
            channels = ?settings.channels,
            "simulated trigger armed"
        );
        Ok(())
    }

    async fn execute(&mut self, _command: TriggerCommand) -> Result<TriggerAck, DeviceError> {
        self.core.begin_execute().await?;
        let pulse_width = self
            .settings
            .as_ref()
            .map(|s| s.pulse_width)
            .unwrap_or_default();
        let fired_at = Instant::now();
        sleep(pulse_width).await;
        self.pulses += 1;
        Ok(TriggerAck {
            fired_at,
            pulse_number: self.pulses,
        })
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.core.close();
        self.settings = None;
        Ok(())
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Simulated triggered camera.
///
/// Reading a frame takes the configured exposure; pixel values are noise around a
/// fixed background level.
#[derive(Debug)]
pub struct SimulatedCamera {
    core: SimCore,
    sensor: (u32, u32),
    exposure_range: (Duration, Duration),
    settings: Option<CameraSettings>,
    armed_at: Option<Instant>,
}

impl SimulatedCamera {
    /// Camera with the given sensor size and a 1 ms - 100 ms exposure range.
    pub fn new(sensor_width: u32, sensor_height: u32) -> Self {
        Self {
            core: SimCore::new(DeviceKind::Camera),
            sensor: (sensor_width, sensor_height),
            exposure_range: (Duration::from_millis(1), Duration::from_millis(100)),
            settings: None,
            armed_at: None,
        }
    }

    /// Override the supported exposure range.
    pub fn with_exposure_range(mut self, min: Duration, max: Duration) -> Self {
        self.exposure_range = (min, max);
        self
    }

    /// Inject faults.
    pub fn with_faults(mut self, plan: FaultPlan) -> Self {
        self.core.plan = plan;
        self
    }

    /// Sensor size in pixels.
    pub fn sensor(&self) -> (u32, u32) {
        self.sensor
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedCamera {
    type Settings = CameraSettings;
    type Command = CameraCommand;
    type Output = CameraImage;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Camera
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.core.open().await
    }

    async fn arm(&mut self, settings: &CameraSettings) -> Result<(), DeviceError> {
        self.core.begin_arm().await?;
        let (min, max) = self.exposure_range;
        if settings.exposure < min || settings.exposure > max {
            return Err(DeviceError::invalid(
                DeviceKind::Camera,
                format!("exposure {:?} outside {:?}..={:?}", settings.exposure, min, max),
            ));
        }
        let right = settings.offset_x.saturating_add(settings.width);
        let bottom = settings.offset_y.saturating_add(settings.height);
        if settings.width == 0 || settings.height == 0 || right > self.sensor.0 || bottom > self.sensor.1 {
            return Err(DeviceError::invalid(
                DeviceKind::Camera,
                format!(
                    "region {}x{}+{}+{} outside {}x{} sensor",
                    settings.width,
                    settings.height,
                    settings.offset_x,
                    settings.offset_y,
                    self.sensor.0,
                    self.sensor.1
                ),
            ));
        }
        self.settings = Some(settings.clone());
        self.armed_at = Some(Instant::now());
        self.core.armed = true;
        Ok(())
    }

    async fn execute(&mut self, _command: CameraCommand) -> Result<CameraImage, DeviceError> {
        self.core.begin_execute().await?;
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| DeviceError::fault(DeviceKind::Camera, "no settings"))?;

        sleep(settings.exposure).await;

        let count = settings.width as usize * settings.height as usize;
        let pixels = {
            let mut rng = rand::thread_rng();
            (0..count).map(|_| rng.gen_range(96..160)).collect()
        };
        Ok(CameraImage {
            width: settings.width,
            height: settings.height,
            pixels: PixelBuffer::U16(pixels),
            hardware_timestamp: self.armed_at.map(|t| t.elapsed()),
        })
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.core.close();
        self.settings = None;
        self.armed_at = None;
        Ok(())
    }
}

// =============================================================================
// SimulatedStage
// =============================================================================

/// Simulated motion stage with realistic timing.
///
/// Moves take `distance / speed`; homing returns to 0.
#[derive(Debug)]
pub struct SimulatedStage {
    core: SimCore,
    position: f64,
    speed_per_sec: f64,
    travel: (f64, f64),
    settings: StageSettings,
}

impl SimulatedStage {
    /// Rotation stage at 0 degrees, 360 degrees/sec, travel 0..=360.
    pub fn new() -> Self {
        Self {
            core: SimCore::new(DeviceKind::Stage),
            position: 0.0,
            speed_per_sec: 360.0,
            travel: (0.0, 360.0),
            settings: StageSettings::default(),
        }
    }

    /// Create stage with custom speed (units/sec).
    pub fn with_speed(mut self, speed_per_sec: f64) -> Self {
        self.speed_per_sec = speed_per_sec;
        self
    }

    /// Override the travel range.
    pub fn with_travel(mut self, min: f64, max: f64) -> Self {
        self.travel = (min, max);
        self
    }

    /// Start at a non-zero position.
    pub fn at_position(mut self, position: f64) -> Self {
        self.position = position;
        self
    }

    /// Inject faults.
    pub fn with_faults(mut self, plan: FaultPlan) -> Self {
        self.core.plan = plan;
        self
    }

    async fn travel_to(&mut self, target: f64) {
        let distance = (target - self.position).abs();
        let delay = if self.speed_per_sec > 0.0 {
            Duration::from_secs_f64(distance / self.speed_per_sec)
        } else {
            Duration::ZERO
        };
        debug!(from = self.position, to = target, ?delay, "simulated stage moving");
        sleep(delay).await;
        self.position = target;
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedStage {
    type Settings = StageSettings;
    type Command = StageCommand;
    type Output = f64;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Stage
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.core.open().await
    }

    async fn arm(&mut self, settings: &StageSettings) -> Result<(), DeviceError> {
        self.core.begin_arm().await?;
        self.settings = settings.clone();
        if settings.home_on_arm {
            self.travel_to(0.0).await;
        }
        self.core.armed = true;
        Ok(())
    }

    async fn execute(&mut self, command: StageCommand) -> Result<f64, DeviceError> {
        match command {
            StageCommand::ReadPosition => {
                self.core.log.record(DeviceKind::Stage, "read_position");
                if !self.core.open {
                    return Err(DeviceError::fault(DeviceKind::Stage, "read before open"));
                }
                Ok(self.position)
            }
            StageCommand::MoveTo(target) => {
                self.core.begin_execute().await?;
                let (min, max) = self.travel;
                if !target.is_finite() || target < min || target > max {
                    return Err(DeviceError::invalid(
                        DeviceKind::Stage,
                        format!("target {target} outside travel {min}..={max}"),
                    ));
                }
                self.travel_to(target).await;
                Ok(self.position)
            }
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.core.close();
        Ok(())
    }
}

// =============================================================================
// SimulatedRig
// =============================================================================

/// Trigger, camera and stage wired to one counter and call log.
#[derive(Debug)]
pub struct SimulatedRig {
    trigger: SimulatedTrigger,
    camera: SimulatedCamera,
    stage: SimulatedStage,
    counter: OpenDeviceCounter,
    log: CallLog,
}

impl SimulatedRig {
    /// Fault-free rig with a 640x480 camera.
    pub fn new() -> Self {
        Self::from_devices(
            SimulatedTrigger::new(),
            SimulatedCamera::default(),
            SimulatedStage::new(),
        )
    }

    /// Wire custom devices into one rig.
    pub fn from_devices(
        mut trigger: SimulatedTrigger,
        mut camera: SimulatedCamera,
        mut stage: SimulatedStage,
    ) -> Self {
        let counter = OpenDeviceCounter::default();
        let log = CallLog::default();
        for core in [&mut trigger.core, &mut camera.core, &mut stage.core] {
            core.counter = counter.clone();
            core.log = log.clone();
        }
        Self {
            trigger,
            camera,
            stage,
            counter,
            log,
        }
    }

    /// Inject trigger faults.
    pub fn trigger_faults(mut self, plan: FaultPlan) -> Self {
        self.trigger.core.plan = plan;
        self
    }

    /// Inject camera faults.
    pub fn camera_faults(mut self, plan: FaultPlan) -> Self {
        self.camera.core.plan = plan;
        self
    }

    /// Inject stage faults.
    pub fn stage_faults(mut self, plan: FaultPlan) -> Self {
        self.stage.core.plan = plan;
        self
    }

    /// Shared open-device counter.
    pub fn counter(&self) -> OpenDeviceCounter {
        self.counter.clone()
    }

    /// Shared call log.
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    /// Hand the devices to a worker.
    pub fn into_device_set(self) -> DeviceSet {
        DeviceSet::new(
            Box::new(self.trigger),
            Box::new(self.camera),
            Box::new(self.stage),
        )
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
