//! The periodic attitude task
//!
//! One iteration per sensor period: take pending settings, gather samples,
//! condition them, run the selected estimator and publish the result. The
//! task is the single writer of [`SharedAttitude`]; the home location and
//! arming state are owned elsewhere and only read here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::arbiter::{DEFAULT_SENSOR_TIMEOUT, SampleArbiter};
use crate::calibration::SensorCalibration;
use crate::complementary::DEFAULT_WARMUP;
use crate::error::{EstimatorError, Result};
use crate::estimator::{self, CycleContext, Estimator, Prediction};
use crate::math::QuaternionExt;
use crate::settings::{SettingsHandle, SettingsReactor};
use crate::types::{
    Alarm, ArmingState, AttitudeSettings, AttitudeSnapshot, EstimatorKind, HomeLocation,
};

/// Name of the estimator thread
pub const THREAD_NAME: &str = "attitude";

/// Startup configuration of the task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskConfig {
    /// Fusion algorithm, fixed for the lifetime of the task
    pub estimator: EstimatorKind,
    /// Bound on each mandatory sensor wait, used to build the `SensorQueues`
    pub sensor_timeout: Duration,
    /// Aggressive-gain window of the complementary filter
    pub warmup: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::Complementary,
            sensor_timeout: DEFAULT_SENSOR_TIMEOUT,
            warmup: DEFAULT_WARMUP,
        }
    }
}

/// Published estimator output
#[derive(Debug, Clone, Default)]
pub struct SharedAttitude {
    inner: Arc<RwLock<AttitudeSnapshot>>,
}

impl SharedAttitude {
    /// Copy of the latest snapshot
    pub fn read(&self) -> AttitudeSnapshot {
        *self.inner.read()
    }

    fn write(&self, snapshot: AttitudeSnapshot) {
        *self.inner.write() = snapshot;
    }

    fn set_alarm(&self, alarm: Alarm) {
        self.inner.write().alarm = alarm;
    }
}

/// Liveness counter bumped once per loop iteration, successful or not
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    count: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Home location shared with the subsystem that owns it
#[derive(Debug, Clone, Default)]
pub struct SharedHome {
    inner: Arc<RwLock<HomeLocation>>,
}

impl SharedHome {
    pub fn new(home: HomeLocation) -> Self {
        Self {
            inner: Arc::new(RwLock::new(home)),
        }
    }

    pub fn set(&self, home: HomeLocation) {
        *self.inner.write() = home;
    }

    pub fn get(&self) -> HomeLocation {
        *self.inner.read()
    }
}

/// Arming state shared with the flight-status owner
#[derive(Debug, Clone, Default)]
pub struct ArmingStatus {
    state: Arc<AtomicU8>,
}

impl ArmingStatus {
    pub fn set(&self, state: ArmingState) {
        let raw = match state {
            ArmingState::Disarmed => 0,
            ArmingState::Arming => 1,
            ArmingState::Armed => 2,
        };
        self.state.store(raw, Ordering::Relaxed);
    }

    pub fn get(&self) -> ArmingState {
        match self.state.load(Ordering::Relaxed) {
            1 => ArmingState::Arming,
            2 => ArmingState::Armed,
            _ => ArmingState::Disarmed,
        }
    }
}

/// Estimator task state
pub struct AttitudeTask {
    arbiter: SampleArbiter,
    settings: SettingsReactor,
    estimator: Box<dyn Estimator>,
    calibration: SensorCalibration,
    output: SharedAttitude,
    heartbeat: Heartbeat,
    home: SharedHome,
    arming: ArmingStatus,
    /// Gyro timestamp of the first sample seen, anchors the warm-up window
    start: Option<Duration>,
    alarm: Alarm,
    iteration: u64,
}

impl AttitudeTask {
    /// Create the task; `settings` are applied on the first iteration
    pub fn new(config: TaskConfig, arbiter: SampleArbiter, settings: AttitudeSettings) -> Self {
        log::info!(
            "Attitude task using {:?} estimator, sensor timeout {:?}",
            config.estimator,
            arbiter.timeout()
        );

        Self {
            arbiter,
            settings: SettingsReactor::new(settings),
            estimator: estimator::build(config.estimator, &settings, config.warmup),
            calibration: SensorCalibration::from_settings(&settings),
            output: SharedAttitude::default(),
            heartbeat: Heartbeat::default(),
            home: SharedHome::default(),
            arming: ArmingStatus::default(),
            start: None,
            alarm: Alarm::Clear,
            iteration: 0,
        }
    }

    /// Read the home location from an externally owned slot
    pub fn with_home(mut self, home: SharedHome) -> Self {
        self.home = home;
        self
    }

    /// Read the arming state from an externally owned slot
    pub fn with_arming(mut self, arming: ArmingStatus) -> Self {
        self.arming = arming;
        self
    }

    pub fn settings_handle(&self) -> SettingsHandle {
        self.settings.handle()
    }

    pub fn output(&self) -> SharedAttitude {
        self.output.clone()
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    pub fn home(&self) -> SharedHome {
        self.home.clone()
    }

    pub fn arming(&self) -> ArmingStatus {
        self.arming.clone()
    }

    pub fn estimator(&self) -> &dyn Estimator {
        self.estimator.as_ref()
    }

    pub fn alarm(&self) -> Alarm {
        self.alarm
    }

    /// Run one period
    ///
    /// A sensor timeout raises the alarm and leaves the estimator untouched.
    /// An incomplete INS/GPS initialization is returned without touching
    /// the alarm.
    pub fn run_iteration(&mut self) -> Result<()> {
        if let Some(settings) = self.settings.take() {
            self.apply_settings(&settings);
        }

        let mut frame = match self.arbiter.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                self.raise_alarm(&e);
                return Err(e);
            }
        };
        self.calibration.apply(&mut frame);

        let start = *self.start.get_or_insert(frame.gyro.timestamp);
        let home = self.home.get();
        let ctx = CycleContext {
            since_start: frame.gyro.timestamp.saturating_sub(start),
            arming: self.arming.get(),
            home: &home,
        };

        if self.estimator.predict(&frame, &ctx)? == Prediction::Propagated {
            self.estimator.correct(&frame, &ctx);
        }

        self.clear_alarm();
        self.publish();
        Ok(())
    }

    /// Iterate until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!("Attitude task started");

        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.run_iteration() {
                log::trace!("Attitude iteration skipped: {e}");
            }
            self.heartbeat.beat();
        }

        log::info!("Attitude task stopped after {} iterations", self.iteration);
    }

    /// Move the task onto its own named thread
    pub fn spawn(mut self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run(&running))
    }

    fn apply_settings(&mut self, settings: &AttitudeSettings) {
        log::debug!("Applying attitude settings {settings:?}");
        self.calibration = SensorCalibration::from_settings(settings);
        self.estimator.apply_settings(settings);
    }

    fn raise_alarm(&mut self, error: &EstimatorError) {
        if self.alarm != Alarm::Warning {
            log::warn!("Attitude alarm raised: {error}");
        }
        self.alarm = Alarm::Warning;
        self.output.set_alarm(Alarm::Warning);
    }

    fn clear_alarm(&mut self) {
        if self.alarm != Alarm::Clear {
            log::info!("Attitude alarm cleared");
        }
        self.alarm = Alarm::Clear;
    }

    fn publish(&mut self) {
        self.iteration += 1;

        let quaternion = self.estimator.orientation();
        let euler = quaternion.to_euler_degrees();
        let navigation = self.estimator.navigation();

        self.output.write(AttitudeSnapshot {
            quaternion,
            roll: euler.x,
            pitch: euler.y,
            yaw: euler.z,
            gyro_bias: self.estimator.gyro_bias(),
            position: navigation.map(|n| n.position),
            velocity: navigation.map(|n| n.velocity),
            alarm: self.alarm,
            iteration: self.iteration,
        });
    }
}
