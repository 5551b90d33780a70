//! INS/GPS extended Kalman filter
//!
//! Sixteen states: NED position and velocity, the body to NED quaternion,
//! and additive gyro and accelerometer biases. Gyro and accel drive the
//! prediction; magnetometer, barometer and GPS are folded in whenever they
//! were fresh in the current cycle.

use core::time::Duration;

use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, Matrix4x3, Quaternion, SMatrix, SVector,
    UnitQuaternion, Vector3,
};

use crate::arbiter::SensorFrame;
use crate::error::{EstimatorError, Result};
use crate::estimator::{CycleContext, Estimator, Prediction};
use crate::geodesy::geodetic_to_ned;
use crate::math::{
    GRAVITY, QuaternionExt, Vector3Ext, normalize_or_identity, rotation_from_two_vectors,
};
use crate::types::{AttitudeSettings, EstimatorKind, HomeLocation, NavigationState};

pub const NUM_STATES: usize = 16;

type StateVector = SVector<f32, NUM_STATES>;
type Covariance = SMatrix<f32, NUM_STATES, NUM_STATES>;

// State layout
const POS: usize = 0;
const VEL: usize = 3;
const ATT: usize = 6;
const GYRO_BIAS: usize = 10;
const ACCEL_BIAS: usize = 13;

/// Bounds on the prediction step in seconds
pub const MIN_DT: f32 = 0.001;
pub const MAX_DT: f32 = 0.01;

/// Any bias component beyond this zeroes the whole bias vector
pub const BIAS_LIMIT: f32 = 0.1;

/// Covariance diagonal after initialization
#[rustfmt::skip]
const INITIAL_VARIANCE: [f32; NUM_STATES] = [
    25.0, 25.0, 25.0, // position
    5.0, 5.0, 5.0, // velocity
    1e-5, 1e-5, 1e-5, 1e-5, // quaternion
    1e-5, 1e-5, 1e-5, // gyro bias
    1e-4, 1e-4, 1e-4, // accel bias
];

/// Gravity as the accelerometer reads it when level, NED
const GRAVITY_REFERENCE: Vector3<f32> = Vector3::new(0.0, 0.0, -GRAVITY);

/// Field vectors shorter than this are not used
const MIN_FIELD_NORM: f32 = 1.0e-3;

/// Process and measurement noise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    /// Gyro noise density, (rad/s)² · s
    pub gyro: f32,
    /// Accelerometer noise density, (m/s²)² · s
    pub accel: f32,
    /// Gyro bias random walk per second
    pub gyro_bias_walk: f32,
    /// Accelerometer bias random walk per second
    pub accel_bias_walk: f32,
    /// Variance of each component of the normalized magnetometer reading
    pub mag: f32,
    /// Barometric altitude variance, m²
    pub baro: f32,
    /// GPS north/east position variance, m²
    pub gps_horizontal: f32,
    /// GPS down position variance, m²
    pub gps_vertical: f32,
    /// GPS velocity variance, (m/s)²
    pub gps_velocity: f32,
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            gyro: 1e-5,
            accel: 1e-3,
            gyro_bias_walk: 1e-9,
            accel_bias_walk: 1e-7,
            mag: 1e-2,
            baro: 1.0,
            gps_horizontal: 1.0,
            gps_vertical: 4.0,
            gps_velocity: 0.25,
        }
    }
}

/// One scalar row of a measurement update
#[derive(Debug, Clone, Copy)]
struct Observation {
    residual: f32,
    jacobian: StateVector,
    variance: f32,
}

/// INS/GPS navigation filter
#[derive(Debug, Clone)]
pub struct InsGps {
    settings: AttitudeSettings,
    noise: NoiseModel,
    initialized: bool,
    x: StateVector,
    p: Covariance,
    last_timestamp: Option<Duration>,
    dt: f32,
}

impl InsGps {
    pub fn new() -> Self {
        Self::with_settings(AttitudeSettings::default())
    }

    pub fn with_settings(settings: AttitudeSettings) -> Self {
        let mut filter = Self {
            settings,
            noise: NoiseModel::default(),
            initialized: false,
            x: StateVector::zeros(),
            p: Covariance::zeros(),
            last_timestamp: None,
            dt: 0.0,
        };
        filter.reset();
        filter
    }

    pub fn with_noise(mut self, noise: NoiseModel) -> Self {
        self.noise = noise;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Step used by the last prediction, after clamping
    pub fn last_dt(&self) -> f32 {
        self.dt
    }

    /// Full navigation state, `None` until initialized
    pub fn state(&self) -> Option<NavigationState> {
        if !self.initialized {
            return None;
        }

        Some(NavigationState {
            position: self.position(),
            velocity: self.velocity(),
            attitude: self.attitude(),
            gyro_bias: self.x.fixed_rows::<3>(GYRO_BIAS).into_owned(),
            accel_bias: self.x.fixed_rows::<3>(ACCEL_BIAS).into_owned(),
            covariance: self.p,
        })
    }

    /// Overwrite the gyro bias state, rad/s
    pub fn set_gyro_bias(&mut self, bias: Vector3<f32>) {
        self.x.fixed_rows_mut::<3>(GYRO_BIAS).copy_from(&bias);
    }

    /// Overwrite the accelerometer bias state, m/s²
    pub fn set_accel_bias(&mut self, bias: Vector3<f32>) {
        self.x.fixed_rows_mut::<3>(ACCEL_BIAS).copy_from(&bias);
    }

    fn position(&self) -> Vector3<f32> {
        self.x.fixed_rows::<3>(POS).into_owned()
    }

    fn velocity(&self) -> Vector3<f32> {
        self.x.fixed_rows::<3>(VEL).into_owned()
    }

    fn raw_quaternion(&self) -> Quaternion<f32> {
        Quaternion::new(self.x[ATT], self.x[ATT + 1], self.x[ATT + 2], self.x[ATT + 3])
    }

    fn set_raw_quaternion(&mut self, q: &Quaternion<f32>) {
        self.x[ATT] = q.w;
        self.x[ATT + 1] = q.i;
        self.x[ATT + 2] = q.j;
        self.x[ATT + 3] = q.k;
    }

    fn attitude(&self) -> UnitQuaternion<f32> {
        UnitQuaternion::new_normalize(self.raw_quaternion())
    }

    /// Seed the state from a frame with every stream fresh
    fn initialize(&mut self, frame: &SensorFrame, home: &HomeLocation) -> Result<()> {
        let (Some(mag), Some(_), Some(gps)) = (&frame.mag, &frame.baro, &frame.gps) else {
            return Err(EstimatorError::InitializationIncomplete);
        };

        let Some(attitude) = rotation_from_two_vectors(
            &frame.accel.acceleration,
            &GRAVITY_REFERENCE,
            &mag.field,
            &home.be,
        ) else {
            log::debug!("INS/GPS alignment degenerate, waiting for usable accel and mag");
            return Err(EstimatorError::InitializationIncomplete);
        };

        let (latitude, longitude, altitude) = gps.geodetic();
        let position = geodetic_to_ned(latitude, longitude, altitude, home);
        let velocity = gps.velocity_ned();

        self.x = StateVector::zeros();
        self.x.fixed_rows_mut::<3>(POS).copy_from(&position);
        self.x.fixed_rows_mut::<3>(VEL).copy_from(&velocity);
        self.set_raw_quaternion(attitude.quaternion());
        self.set_gyro_bias(self.settings.gyro_bias_prior().deg_to_rad());
        self.p = Covariance::from_diagonal(&StateVector::from(INITIAL_VARIANCE));
        self.last_timestamp = Some(frame.gyro.timestamp);
        self.dt = 0.0;
        self.initialized = true;

        log::info!(
            "INS/GPS initialized at NED ({:.1}, {:.1}, {:.1})",
            position.x,
            position.y,
            position.z
        );
        Ok(())
    }

    fn step(&mut self, timestamp: Duration) -> f32 {
        let elapsed = match self.last_timestamp {
            Some(previous) => timestamp.checked_sub(previous).map_or(0.0, |d| d.as_secs_f32()),
            None => MAX_DT,
        };
        self.last_timestamp = Some(timestamp);

        if elapsed > MAX_DT {
            MAX_DT
        } else if elapsed <= MIN_DT {
            MIN_DT
        } else {
            elapsed
        }
    }

    /// Propagate state and covariance over `dt`
    ///
    /// `gyro` is in rad/s and `accel` in m/s², both raw.
    fn propagate(&mut self, gyro: &Vector3<f32>, accel: &Vector3<f32>, dt: f32) {
        let q = self.raw_quaternion();
        let omega = gyro + self.x.fixed_rows::<3>(GYRO_BIAS);
        let force = accel + self.x.fixed_rows::<3>(ACCEL_BIAS);
        let rotation = self.attitude().rotation_matrix();

        let a = self.state_jacobian(&q, &rotation, &omega, &force);
        let f = Covariance::identity() + a * dt;
        let g = self.process_noise(&q, dt);
        self.p = f * self.p * f.transpose() + g;
        self.symmetrize();

        let acceleration = rotation * force + Vector3::new(0.0, 0.0, GRAVITY);
        let velocity = self.velocity();
        let position = self.position() + velocity * dt;
        self.x.fixed_rows_mut::<3>(POS).copy_from(&position);
        self.x.fixed_rows_mut::<3>(VEL).copy_from(&(velocity + acceleration * dt));

        let derivative = q * Quaternion::from_parts(0.0, omega) * 0.5;
        self.normalize_attitude(q + derivative * dt);
    }

    /// Continuous-time state Jacobian evaluated at the current state
    fn state_jacobian(
        &self,
        q: &Quaternion<f32>,
        rotation: &Matrix3<f32>,
        omega: &Vector3<f32>,
        force: &Vector3<f32>,
    ) -> Covariance {
        let mut a = Covariance::zeros();
        a.fixed_view_mut::<3, 3>(POS, VEL).copy_from(&Matrix3::identity());
        a.fixed_view_mut::<3, 4>(VEL, ATT).copy_from(&rotate_jacobian(q, force));
        a.fixed_view_mut::<3, 3>(VEL, ACCEL_BIAS).copy_from(rotation);
        a.fixed_view_mut::<4, 4>(ATT, ATT).copy_from(&(omega_matrix(omega) * 0.5));
        a.fixed_view_mut::<4, 3>(ATT, GYRO_BIAS).copy_from(&(xi_matrix(q) * 0.5));
        a
    }

    /// Discrete process noise for one step
    fn process_noise(&self, q: &Quaternion<f32>, dt: f32) -> Covariance {
        let mut noise = Covariance::zeros();

        let xi = xi_matrix(q) * 0.5;
        noise
            .fixed_view_mut::<4, 4>(ATT, ATT)
            .copy_from(&(xi * xi.transpose() * (self.noise.gyro * dt)));
        noise
            .fixed_view_mut::<3, 3>(VEL, VEL)
            .copy_from(&(Matrix3::identity() * (self.noise.accel * dt)));
        for i in 0..3 {
            noise[(GYRO_BIAS + i, GYRO_BIAS + i)] = self.noise.gyro_bias_walk * dt;
            noise[(ACCEL_BIAS + i, ACCEL_BIAS + i)] = self.noise.accel_bias_walk * dt;
        }
        noise
    }

    fn mag_observations(
        &self,
        mag: &Vector3<f32>,
        reference: &Vector3<f32>,
        rows: &mut Vec<Observation>,
    ) {
        let (mag_norm, reference_norm) = (mag.norm(), reference.norm());
        if !(mag_norm >= MIN_FIELD_NORM && reference_norm >= MIN_FIELD_NORM) {
            log::debug!("Skipping magnetometer update, field too weak");
            return;
        }

        let measured = mag / mag_norm;
        let reference = reference / reference_norm;
        let q = self.raw_quaternion();
        let predicted = self.attitude().reference_to_body(&reference);
        let jacobian = inverse_rotate_jacobian(&q, &reference);

        for row in 0..3 {
            let mut h = StateVector::zeros();
            for col in 0..4 {
                h[ATT + col] = jacobian[(row, col)];
            }
            rows.push(Observation {
                residual: measured[row] - predicted[row],
                jacobian: h,
                variance: self.noise.mag,
            });
        }
    }

    fn baro_observation(&self, altitude: f32, rows: &mut Vec<Observation>) {
        let mut h = StateVector::zeros();
        h[POS + 2] = -1.0;
        rows.push(Observation {
            residual: altitude + self.x[POS + 2],
            jacobian: h,
            variance: self.noise.baro,
        });
    }

    fn gps_observations(
        &self,
        position: &Vector3<f32>,
        velocity: &Vector3<f32>,
        rows: &mut Vec<Observation>,
    ) {
        let variances = [
            self.noise.gps_horizontal,
            self.noise.gps_horizontal,
            self.noise.gps_vertical,
        ];

        for (axis, variance) in variances.iter().enumerate() {
            let mut h = StateVector::zeros();
            h[POS + axis] = 1.0;
            rows.push(Observation {
                residual: position[axis] - self.x[POS + axis],
                jacobian: h,
                variance: *variance,
            });
        }

        for axis in 0..3 {
            let mut h = StateVector::zeros();
            h[VEL + axis] = 1.0;
            rows.push(Observation {
                residual: velocity[axis] - self.x[VEL + axis],
                jacobian: h,
                variance: self.noise.gps_velocity,
            });
        }
    }

    /// Batch Kalman update over all fresh measurement rows
    fn update(&mut self, observations: &[Observation]) {
        let m = observations.len();
        if m == 0 {
            return;
        }

        let h = DMatrix::from_fn(m, NUM_STATES, |r, c| observations[r].jacobian[c]);
        let residual = DVector::from_fn(m, |r, _| observations[r].residual);
        let p = DMatrix::from_iterator(NUM_STATES, NUM_STATES, self.p.iter().copied());

        let hp = &h * &p;
        let mut s = &hp * h.transpose();
        for (i, observation) in observations.iter().enumerate() {
            s[(i, i)] += observation.variance;
        }

        // S is symmetric, so K^T = S^-1 H P
        let Some(cholesky) = s.cholesky() else {
            log::warn!("INS/GPS innovation covariance not positive definite, update skipped");
            return;
        };
        let gain = cholesky.solve(&hp).transpose();

        let correction = &gain * residual;
        let p = &p - &gain * &hp;

        for (state, delta) in self.x.iter_mut().zip(correction.iter()) {
            *state += delta;
        }
        self.p = Covariance::from_iterator(p.iter().copied());
        self.symmetrize();

        let q = self.raw_quaternion();
        self.normalize_attitude(q);
    }

    /// Zero any bias vector that has run away
    fn clamp_biases(&mut self) {
        for (offset, name) in [(GYRO_BIAS, "gyro"), (ACCEL_BIAS, "accel")] {
            let mut bias = self.x.fixed_rows_mut::<3>(offset);
            if bias.iter().any(|b| !(b.abs() <= BIAS_LIMIT)) {
                log::debug!("INS/GPS {name} bias out of range, zeroed");
                bias.fill(0.0);
            }
        }
    }

    /// Renormalize and canonicalize the attitude states
    ///
    /// Flipping the quaternion sign also flips its covariance cross terms.
    fn normalize_attitude(&mut self, q: Quaternion<f32>) {
        let flipped = q.w < 0.0;
        let (unit, reset) = normalize_or_identity(q);
        if reset {
            log::warn!("INS/GPS quaternion collapsed, reset to identity");
        }
        self.set_raw_quaternion(unit.quaternion());

        if flipped && !reset {
            for i in ATT..ATT + 4 {
                for j in (0..NUM_STATES).filter(|j| !(ATT..ATT + 4).contains(j)) {
                    self.p[(i, j)] = -self.p[(i, j)];
                    self.p[(j, i)] = -self.p[(j, i)];
                }
            }
        }
    }

    fn symmetrize(&mut self) {
        self.p = (self.p + self.p.transpose()) * 0.5;
    }
}

impl Default for InsGps {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimator for InsGps {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::InsGps
    }

    fn apply_settings(&mut self, settings: &AttitudeSettings) {
        self.settings = *settings;
        if self.initialized {
            self.set_gyro_bias(settings.gyro_bias_prior().deg_to_rad());
        }
    }

    fn predict(&mut self, frame: &SensorFrame, ctx: &CycleContext<'_>) -> Result<Prediction> {
        if !self.initialized {
            self.initialize(frame, ctx.home)?;
            return Ok(Prediction::Initialized);
        }

        let dt = self.step(frame.gyro.timestamp);
        self.dt = dt;

        let gyro = frame.gyro.rate.deg_to_rad();
        let accel = frame.accel.acceleration;
        if gyro.iter().chain(accel.iter()).all(|v| v.is_finite()) {
            self.propagate(&gyro, &accel, dt);
        } else {
            log::warn!("INS/GPS skipped propagation on non-finite inertial sample");
        }
        Ok(Prediction::Propagated)
    }

    fn correct(&mut self, frame: &SensorFrame, ctx: &CycleContext<'_>) {
        if !self.initialized {
            return;
        }

        // Union of the fresh channels: a GPS fix adds its six rows on top of
        // mag and baro rather than replacing them
        let mut observations = Vec::with_capacity(10);
        if let Some(mag) = &frame.mag {
            self.mag_observations(&mag.field, &ctx.home.be, &mut observations);
        }
        if let Some(baro) = &frame.baro {
            self.baro_observation(baro.altitude, &mut observations);
        }
        if let Some(gps) = &frame.gps {
            let (latitude, longitude, altitude) = gps.geodetic();
            let position = geodetic_to_ned(latitude, longitude, altitude, ctx.home);
            self.gps_observations(&position, &gps.velocity_ned(), &mut observations);
        }

        observations.retain(|o| o.residual.is_finite());
        self.update(&observations);
        self.clamp_biases();
    }

    fn orientation(&self) -> UnitQuaternion<f32> {
        if self.initialized {
            self.attitude().canonical()
        } else {
            UnitQuaternion::identity()
        }
    }

    fn gyro_bias(&self) -> Vector3<f32> {
        self.x.fixed_rows::<3>(GYRO_BIAS).into_owned().rad_to_deg()
    }

    fn navigation(&self) -> Option<NavigationState> {
        self.state()
    }

    fn reset(&mut self) {
        self.initialized = false;
        self.x = StateVector::zeros();
        self.x[ATT] = 1.0;
        self.p = Covariance::from_diagonal(&StateVector::from(INITIAL_VARIANCE));
        self.last_timestamp = None;
        self.dt = 0.0;
    }
}

/// Body rate matrix such that `q̇ = ½ Ω(ω) q`
#[rustfmt::skip]
fn omega_matrix(omega: &Vector3<f32>) -> Matrix4<f32> {
    let (x, y, z) = (omega.x, omega.y, omega.z);
    Matrix4::new(
        0.0, -x, -y, -z,
        x, 0.0, z, -y,
        y, -z, 0.0, x,
        z, y, -x, 0.0,
    )
}

/// Quaternion matrix such that `q ⊗ (0, ω) = Ξ(q) ω`
#[rustfmt::skip]
fn xi_matrix(q: &Quaternion<f32>) -> Matrix4x3<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4x3::new(
        -x, -y, -z,
        w, -z, y,
        z, w, -x,
        -y, x, w,
    )
}

/// Partial derivatives of `R(q) v` with respect to (w, x, y, z)
#[rustfmt::skip]
fn rotate_jacobian(q: &Quaternion<f32>, v: &Vector3<f32>) -> Matrix3x4<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let (v0, v1, v2) = (v.x, v.y, v.z);
    Matrix3x4::new(
        w * v0 - z * v1 + y * v2, x * v0 + y * v1 + z * v2,
            -y * v0 + x * v1 + w * v2, -z * v0 - w * v1 + x * v2,
        z * v0 + w * v1 - x * v2, y * v0 - x * v1 - w * v2,
            x * v0 + y * v1 + z * v2, w * v0 - z * v1 + y * v2,
        -y * v0 + x * v1 + w * v2, z * v0 + w * v1 - x * v2,
            -w * v0 + z * v1 - y * v2, x * v0 + y * v1 + z * v2,
    ) * 2.0
}

/// Partial derivatives of `R(q)ᵀ v` with respect to (w, x, y, z)
#[rustfmt::skip]
fn inverse_rotate_jacobian(q: &Quaternion<f32>, v: &Vector3<f32>) -> Matrix3x4<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let (v0, v1, v2) = (v.x, v.y, v.z);
    Matrix3x4::new(
        w * v0 + z * v1 - y * v2, x * v0 + y * v1 + z * v2,
            -y * v0 + x * v1 - w * v2, -z * v0 + w * v1 + x * v2,
        -z * v0 + w * v1 + x * v2, y * v0 - x * v1 + w * v2,
            x * v0 + y * v1 + z * v2, -w * v0 - z * v1 + y * v2,
        y * v0 - x * v1 + w * v2, z * v0 - w * v1 - x * v2,
            w * v0 + z * v1 - y * v2, x * v0 + y * v1 + z * v2,
    ) * 2.0
}
