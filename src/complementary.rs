//! Complementary filter estimator
//!
//! Integrates the bias-corrected gyro rate and pulls the result towards the
//! gravity direction measured by the accelerometer. The magnetometer only
//! trims yaw. Integral terms accumulate into the gyro bias.

use core::time::Duration;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::arbiter::SensorFrame;
use crate::error::Result;
use crate::estimator::{CycleContext, Estimator, Prediction};
use crate::math::{QuaternionExt, integrate_rate, normalize_or_identity};
use crate::types::{ArmingState, AttitudeSettings, EstimatorKind};

/// Time after the first sample during which aggressive gains are used
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(7);

/// Field vectors shorter than this are not trusted for a yaw correction
const MIN_FIELD_NORM: f32 = 1.0e-3;

/// Gravity direction in NED, unit length
const GRAVITY_DIRECTION: Vector3<f32> = Vector3::new(0.0, 0.0, -1.0);

/// Gains used by one correction step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub accel_kp: f32,
    pub accel_ki: f32,
    pub yaw_bias_rate: f32,
    pub mag_kp: f32,
    pub mag_ki: f32,
}

impl Gains {
    /// Accelerometer gains used while warming up or zeroing during arming
    pub const AGGRESSIVE_ACCEL_KP: f32 = 1.0;
    pub const AGGRESSIVE_ACCEL_KI: f32 = 0.9;
    pub const AGGRESSIVE_YAW_BIAS_RATE: f32 = 0.23;

    /// Gains as configured
    pub fn configured(settings: &AttitudeSettings) -> Self {
        Self {
            accel_kp: settings.accel_kp,
            accel_ki: settings.accel_ki,
            yaw_bias_rate: settings.yaw_bias_rate,
            mag_kp: settings.mag_kp,
            mag_ki: settings.mag_ki,
        }
    }

    /// Fast-converging gains; the magnetometer gains are left as configured
    pub fn aggressive(settings: &AttitudeSettings) -> Self {
        Self {
            accel_kp: Self::AGGRESSIVE_ACCEL_KP,
            accel_ki: Self::AGGRESSIVE_ACCEL_KI,
            yaw_bias_rate: Self::AGGRESSIVE_YAW_BIAS_RATE,
            ..Self::configured(settings)
        }
    }
}

/// Errors and step size of the last iteration
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ComplementaryStates {
    /// Cross product of measured and predicted gravity direction
    pub accel_error: Vector3<f32>,
    /// Yaw component of the magnetic error, zero when no fresh mag sample
    pub mag_yaw_error: f32,
    /// Time step in seconds, zero on the first iteration
    pub dt: f32,
}

/// Filter status flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComplementaryFlags {
    /// The last correction ran with aggressive gains
    pub aggressive_gains: bool,
    /// The quaternion collapsed at some point and was reset to identity
    pub quaternion_reset: bool,
}

/// Complementary attitude filter
///
/// ```
/// use core::time::Duration;
/// use fusion_nav::ComplementaryFilter;
///
/// let filter = ComplementaryFilter::new().with_warmup(Duration::ZERO);
/// assert_eq!(filter.quaternion().w, 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct ComplementaryFilter {
    settings: AttitudeSettings,
    /// Aggressive-gain window measured from the first sample
    warmup: Duration,
    /// Body to NED rotation
    quaternion: UnitQuaternion<f32>,
    /// Additive gyro bias in deg/s
    gyro_bias: Vector3<f32>,
    /// Timestamp of the previous gyro sample, `None` until the time base is set
    last_timestamp: Option<Duration>,
    /// Bias-corrected rate of the current iteration in deg/s
    rate: Vector3<f32>,
    states: ComplementaryStates,
    flags: ComplementaryFlags,
}

impl ComplementaryFilter {
    pub fn new() -> Self {
        Self::with_settings(AttitudeSettings::default())
    }

    pub fn with_settings(settings: AttitudeSettings) -> Self {
        Self {
            settings,
            warmup: DEFAULT_WARMUP,
            quaternion: UnitQuaternion::identity(),
            gyro_bias: settings.gyro_bias_prior(),
            last_timestamp: None,
            rate: Vector3::zeros(),
            states: ComplementaryStates::default(),
            flags: ComplementaryFlags::default(),
        }
    }

    /// Override the aggressive-gain window
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn quaternion(&self) -> UnitQuaternion<f32> {
        self.quaternion
    }

    /// Set orientation directly; the sign is canonicalized
    pub fn set_quaternion(&mut self, quaternion: UnitQuaternion<f32>) {
        self.quaternion = quaternion.canonical();
    }

    pub fn settings(&self) -> &AttitudeSettings {
        &self.settings
    }

    pub fn internal_states(&self) -> ComplementaryStates {
        self.states
    }

    pub fn flags(&self) -> ComplementaryFlags {
        self.flags
    }

    /// Gains for this iteration
    ///
    /// Aggressive while inside the warm-up window, or while arming when the
    /// settings ask for the bias to be re-zeroed then.
    pub fn select_gains(&self, ctx: &CycleContext<'_>) -> Gains {
        if self.is_aggressive(ctx) {
            Gains::aggressive(&self.settings)
        } else {
            Gains::configured(&self.settings)
        }
    }

    fn is_aggressive(&self, ctx: &CycleContext<'_>) -> bool {
        let warming_up = ctx.since_start < self.warmup;
        let zeroing = self.settings.zero_during_arming && ctx.arming == ArmingState::Arming;
        warming_up || zeroing
    }

    /// Step size from the previous gyro timestamp
    ///
    /// Differences are taken on the `Duration`s so the step keeps full
    /// precision at any uptime. Repeated or out-of-order samples give zero
    /// and are skipped.
    fn step(&mut self, timestamp: Duration) -> f32 {
        let dt = match self.last_timestamp {
            Some(previous) => timestamp.checked_sub(previous).map_or(0.0, |d| d.as_secs_f32()),
            None => 0.0,
        };
        self.last_timestamp = Some(timestamp);
        dt
    }

    fn accel_error(&self, accel: &Vector3<f32>) -> Vector3<f32> {
        let norm = accel.norm();
        if !(norm > 0.0) {
            return Vector3::zeros();
        }

        let predicted = self.quaternion.reference_to_body(&GRAVITY_DIRECTION);
        accel.cross(&predicted) / norm
    }

    fn mag_yaw_error(&self, mag: &Vector3<f32>, reference: &Vector3<f32>) -> f32 {
        let predicted = self.quaternion.reference_to_body(reference);
        let (mag_norm, predicted_norm) = (mag.norm(), predicted.norm());
        if !(mag_norm >= MIN_FIELD_NORM && predicted_norm >= MIN_FIELD_NORM) {
            return 0.0;
        }

        (mag / mag_norm).cross(&(predicted / predicted_norm)).z
    }

    fn renormalize(&mut self, q: Quaternion<f32>) {
        let (q, reset) = normalize_or_identity(q);
        if reset {
            log::warn!("Complementary filter quaternion collapsed, reset to identity");
            self.flags.quaternion_reset = true;
        }
        self.quaternion = q;
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimator for ComplementaryFilter {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Complementary
    }

    fn apply_settings(&mut self, settings: &AttitudeSettings) {
        self.settings = *settings;
        self.gyro_bias = settings.gyro_bias_prior();
    }

    fn predict(&mut self, frame: &SensorFrame, _ctx: &CycleContext<'_>) -> Result<Prediction> {
        let dt = self.step(frame.gyro.timestamp);
        self.states.dt = dt;
        self.rate = frame.gyro.rate + self.gyro_bias;

        if dt > 0.0 {
            let q = integrate_rate(self.quaternion.quaternion(), &self.rate, dt);
            self.renormalize(q);
        }

        Ok(Prediction::Propagated)
    }

    fn correct(&mut self, frame: &SensorFrame, ctx: &CycleContext<'_>) {
        let gains = self.select_gains(ctx);
        self.flags.aggressive_gains = self.is_aggressive(ctx);

        let accel_error = self.accel_error(&frame.accel.acceleration);
        let mag_yaw_error = match &frame.mag {
            Some(mag) => self.mag_yaw_error(&mag.field, &ctx.home.be),
            None => 0.0,
        };
        self.states.accel_error = accel_error;
        self.states.mag_yaw_error = mag_yaw_error;

        let bias_step = Vector3::new(
            accel_error.x * gains.accel_ki,
            accel_error.y * gains.accel_ki,
            mag_yaw_error * gains.mag_ki - self.rate.z * gains.yaw_bias_rate,
        );
        if bias_step.iter().all(|v| v.is_finite()) {
            self.gyro_bias += bias_step;
        }

        let dt = self.states.dt;
        if dt > 0.0 {
            let mut correction = accel_error * gains.accel_kp;
            correction.z += mag_yaw_error * gains.mag_kp;
            let q = integrate_rate(self.quaternion.quaternion(), &(correction / dt), dt);
            self.renormalize(q);
        }
    }

    fn orientation(&self) -> UnitQuaternion<f32> {
        self.quaternion
    }

    fn gyro_bias(&self) -> Vector3<f32> {
        self.gyro_bias
    }

    fn reset(&mut self) {
        self.quaternion = UnitQuaternion::identity();
        self.gyro_bias = self.settings.gyro_bias_prior();
        self.last_timestamp = None;
        self.rate = Vector3::zeros();
        self.states = ComplementaryStates::default();
        self.flags = ComplementaryFlags::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccelSample, GyroSample, HomeLocation, MagSample};

    const DT_MS: u64 = 10;

    fn frame(step: u64, gyro: Vector3<f32>, accel: Vector3<f32>) -> SensorFrame {
        let timestamp = Duration::from_millis(step * DT_MS);
        SensorFrame::new(
            GyroSample { timestamp, rate: gyro },
            AccelSample {
                timestamp,
                acceleration: accel,
            },
        )
    }

    fn level() -> Vector3<f32> {
        Vector3::new(0.0, 0.0, -9.81)
    }

    fn context(home: &HomeLocation, step: u64) -> CycleContext<'_> {
        CycleContext {
            since_start: Duration::from_millis(step * DT_MS),
            arming: ArmingState::Disarmed,
            home,
        }
    }

    fn iterate(filter: &mut ComplementaryFilter, frame: &SensorFrame, ctx: &CycleContext<'_>) {
        assert_eq!(filter.predict(frame, ctx), Ok(Prediction::Propagated));
        filter.correct(frame, ctx);
    }

    #[test]
    fn test_new_filter() {
        let settings = AttitudeSettings {
            gyro_bias: [0.5, -0.25, 0.0],
            ..Default::default()
        };
        let filter = ComplementaryFilter::with_settings(settings);
        assert_eq!(filter.quaternion(), UnitQuaternion::identity());
        assert_eq!(filter.gyro_bias(), Vector3::new(0.5, -0.25, 0.0));
        assert_eq!(filter.kind(), EstimatorKind::Complementary);
    }

    #[test]
    fn test_first_iteration_sets_time_base() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new().with_warmup(Duration::ZERO);

        // Large rate on the very first sample must not rotate anything
        let first = frame(50, Vector3::new(100.0, 0.0, 0.0), level());
        iterate(&mut filter, &first, &context(&home, 50));
        assert_eq!(filter.internal_states().dt, 0.0);
        assert_eq!(filter.quaternion(), UnitQuaternion::identity());

        let second = frame(51, Vector3::new(100.0, 0.0, 0.0), level());
        iterate(&mut filter, &second, &context(&home, 51));
        assert!((filter.internal_states().dt - 0.01).abs() < 1e-6);
        assert!(filter.quaternion().angle() > 0.0);
    }

    #[test]
    fn test_step_keeps_precision_after_long_uptime() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new().with_warmup(Duration::ZERO);
        let base = Duration::from_secs(100_000);

        let at = |timestamp: Duration| {
            let mut f = frame(0, Vector3::new(10.0, 0.0, 0.0), level());
            f.gyro.timestamp = timestamp;
            f.accel.timestamp = timestamp;
            f
        };

        for i in 0..8u64 {
            iterate(&mut filter, &at(base + Duration::from_millis(5 * i)), &context(&home, 0));
            if i > 0 {
                let dt = filter.internal_states().dt;
                assert!((dt - 0.005).abs() < 1e-6, "step {i}: dt {dt}");
            }
        }

        // Out of order: no step at all
        let before = filter.quaternion();
        iterate(&mut filter, &at(base), &context(&home, 0));
        assert_eq!(filter.internal_states().dt, 0.0);
        assert!(filter.quaternion().angle_to(&before) < 1e-6);
    }

    #[test]
    fn test_stationary_level_stays_identity() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new().with_warmup(Duration::ZERO);

        for step in 0..100 {
            iterate(&mut filter, &frame(step, Vector3::zeros(), level()), &context(&home, step));
        }

        let euler = filter.quaternion().to_euler_degrees();
        assert!(euler.norm() < 1e-3, "euler {euler:?}");
        assert!(filter.gyro_bias().norm() < 1e-6);
    }

    #[test]
    fn test_accel_error_pulls_towards_gravity() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new();
        filter.set_quaternion(UnitQuaternion::from_euler_degrees(10.0, 0.0, 0.0));

        for step in 0..600 {
            iterate(&mut filter, &frame(step, Vector3::zeros(), level()), &context(&home, step));
        }

        // Six seconds of warm-up gains remove the roll error
        let roll = filter.quaternion().to_euler_degrees().x;
        assert!(roll.abs() < 0.5, "roll {roll}");
        assert!(filter.flags().aggressive_gains);
    }

    #[test]
    fn test_zero_accel_skips_correction() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new();
        let tilted = UnitQuaternion::from_euler_degrees(5.0, 5.0, 0.0);
        filter.set_quaternion(tilted);

        for step in 0..10 {
            let f = frame(step, Vector3::zeros(), Vector3::zeros());
            iterate(&mut filter, &f, &context(&home, step));
        }

        assert!((filter.quaternion().coords - tilted.coords).norm() < 1e-6);
        assert_eq!(filter.internal_states().accel_error, Vector3::zeros());
    }

    #[test]
    fn test_mag_corrects_yaw_only() {
        let home = HomeLocation {
            be: Vector3::new(1.0, 0.0, 0.0),
            ..Default::default()
        };

        // Field tilted in the x-z plane: the error lies on body y, not yaw
        let mut pitched = ComplementaryFilter::new().with_warmup(Duration::ZERO);
        for step in 0..50 {
            let mut f = frame(step, Vector3::zeros(), level());
            f.mag = Some(MagSample {
                timestamp: f.gyro.timestamp,
                field: Vector3::new(0.9, 0.0, 0.3),
            });
            iterate(&mut pitched, &f, &context(&home, step));
        }
        assert_eq!(pitched.internal_states().mag_yaw_error, 0.0);
        assert!(pitched.quaternion().to_euler_degrees().norm() < 1e-4);

        // Field rotated about z: the filter turns towards the measured heading
        let mut yawed = ComplementaryFilter::new().with_warmup(Duration::ZERO);
        for step in 0..50 {
            let mut f = frame(step, Vector3::zeros(), level());
            f.mag = Some(MagSample {
                timestamp: f.gyro.timestamp,
                field: Vector3::new(0.9, 0.3, 0.0),
            });
            iterate(&mut yawed, &f, &context(&home, step));
        }
        let euler = yawed.quaternion().to_euler_degrees();
        assert!(euler.z < 0.0, "yaw {}", euler.z);
        assert!(euler.x.abs() < 1e-4 && euler.y.abs() < 1e-4);
    }

    #[test]
    fn test_stale_mag_is_ignored() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new().with_warmup(Duration::ZERO);
        iterate(&mut filter, &frame(0, Vector3::zeros(), level()), &context(&home, 0));
        assert_eq!(filter.internal_states().mag_yaw_error, 0.0);
    }

    #[test]
    fn test_gain_selection() {
        let home = HomeLocation::default();
        let settings = AttitudeSettings {
            zero_during_arming: true,
            ..Default::default()
        };
        let filter =
            ComplementaryFilter::with_settings(settings).with_warmup(Duration::from_secs(7));

        let early = context(&home, 100);
        assert_eq!(filter.select_gains(&early).accel_kp, Gains::AGGRESSIVE_ACCEL_KP);

        let late = CycleContext {
            since_start: Duration::from_secs(8),
            ..early
        };
        assert_eq!(filter.select_gains(&late), Gains::configured(&settings));

        let arming = CycleContext {
            arming: ArmingState::Arming,
            ..late
        };
        assert_eq!(filter.select_gains(&arming), Gains::aggressive(&settings));

        let aggressive = filter.select_gains(&arming);
        assert_eq!(aggressive.mag_kp, settings.mag_kp);
        assert_eq!(aggressive.yaw_bias_rate, Gains::AGGRESSIVE_YAW_BIAS_RATE);
    }

    #[test]
    fn test_nan_gyro_recovers_to_identity() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new();
        iterate(&mut filter, &frame(0, Vector3::zeros(), level()), &context(&home, 0));
        let f = frame(1, Vector3::new(f32::NAN, 0.0, 0.0), level());
        iterate(&mut filter, &f, &context(&home, 1));

        assert!(filter.flags().quaternion_reset);
        assert_eq!(filter.quaternion(), UnitQuaternion::identity());
        assert!(filter.gyro_bias().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_settings_restore_bias_prior() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new();
        for step in 0..20 {
            let f = frame(step, Vector3::new(0.0, 0.0, 2.0), level());
            iterate(&mut filter, &f, &context(&home, step));
        }
        assert!(filter.gyro_bias().z != 0.0);

        let settings = AttitudeSettings {
            gyro_bias: [0.1, 0.2, 0.3],
            ..Default::default()
        };
        filter.apply_settings(&settings);
        assert_eq!(filter.gyro_bias(), Vector3::new(0.1, 0.2, 0.3));
    }

    #[test]
    fn test_reset() {
        let home = HomeLocation::default();
        let mut filter = ComplementaryFilter::new();
        for step in 0..20 {
            let f = frame(step, Vector3::new(5.0, 0.0, 0.0), level());
            iterate(&mut filter, &f, &context(&home, step));
        }
        filter.reset();
        assert_eq!(filter.quaternion(), UnitQuaternion::identity());
        assert_eq!(filter.gyro_bias(), Vector3::zeros());
        assert_eq!(filter.internal_states(), ComplementaryStates::default());
    }
}
