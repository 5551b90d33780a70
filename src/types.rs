//! Core types shared by the estimators, the arbiter and the task loop

use core::fmt;
use core::time::Duration;

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geodesy;

/// Sensor streams consumed by the estimator task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Gyro,
    Accel,
    Mag,
    Baro,
    Gps,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Gyro => "gyro",
            Stream::Accel => "accel",
            Stream::Mag => "mag",
            Stream::Baro => "baro",
            Stream::Gps => "gps",
        };
        f.write_str(name)
    }
}

/// Gyroscope sample, body frame, degrees per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GyroSample {
    /// Monotonic time since boot
    pub timestamp: Duration,
    pub rate: Vector3<f32>,
}

/// Accelerometer sample, body frame, m/s²
///
/// A level, stationary vehicle reads roughly `(0, 0, -9.81)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelSample {
    pub timestamp: Duration,
    pub acceleration: Vector3<f32>,
}

/// Magnetometer sample, body frame, arbitrary units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagSample {
    pub timestamp: Duration,
    pub field: Vector3<f32>,
}

/// Barometric altitude sample in meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaroSample {
    pub timestamp: Duration,
    pub altitude: f32,
}

/// GPS fix as delivered by the receiver driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSample {
    pub timestamp: Duration,
    /// Latitude in 1e-7 degrees
    pub latitude: i32,
    /// Longitude in 1e-7 degrees
    pub longitude: i32,
    /// Altitude above mean sea level in meters
    pub altitude: f32,
    /// Geoid separation in meters
    pub geoid_separation: f32,
    /// Ground speed in m/s
    pub groundspeed: f32,
    /// Course over ground in degrees from north
    pub heading: f32,
}

impl GpsSample {
    /// Geodetic position as (latitude deg, longitude deg, ellipsoid height m)
    pub fn geodetic(&self) -> (f64, f64, f64) {
        (
            f64::from(self.latitude) / 1e7,
            f64::from(self.longitude) / 1e7,
            f64::from(self.altitude) + f64::from(self.geoid_separation),
        )
    }

    /// Ground velocity decomposed into NED; down velocity is taken as zero
    pub fn velocity_ned(&self) -> Vector3<f32> {
        let heading = self.heading.to_radians();
        Vector3::new(
            self.groundspeed * heading.cos(),
            self.groundspeed * heading.sin(),
            0.0,
        )
    }
}

/// Reference location anchoring all local-frame conversions
///
/// Owned by whoever sets home (usually the GPS subsystem); the estimator only
/// reads it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeLocation {
    /// ECEF origin in meters
    pub ecef: Vector3<f64>,
    /// Rotation from ECEF into the local NED frame
    pub rne: Matrix3<f64>,
    /// Reference magnetic field in NED
    pub be: Vector3<f32>,
}

impl HomeLocation {
    /// Build a home location from geodetic coordinates and a reference field
    ///
    /// # Example
    /// ```
    /// use nalgebra::Vector3;
    /// use fusion_nav::HomeLocation;
    ///
    /// let field = Vector3::new(21500.0, 150.0, 43000.0);
    /// let home = HomeLocation::from_geodetic(47.0, 8.0, 400.0, field);
    /// assert!(home.ecef.norm() > 6.3e6);
    /// ```
    pub fn from_geodetic(latitude: f64, longitude: f64, altitude: f64, be: Vector3<f32>) -> Self {
        Self {
            ecef: geodesy::geodetic_to_ecef(latitude, longitude, altitude),
            rne: geodesy::ecef_to_ned_rotation(latitude, longitude),
            be,
        }
    }
}

impl Default for HomeLocation {
    fn default() -> Self {
        Self::from_geodetic(0.0, 0.0, 0.0, Vector3::new(1.0, 0.0, 0.0))
    }
}

/// Arming status of the vehicle as published by the flight-status owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmingState {
    #[default]
    Disarmed,
    /// Transitioning into the armed state
    Arming,
    Armed,
}

/// Estimator health as seen by the rest of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alarm {
    #[default]
    Clear,
    Warning,
}

/// Which fusion algorithm the task runs, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    Complementary,
    InsGps,
}

/// Sensor board mounting offset in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardRotation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl BoardRotation {
    /// Whether the rotation is the identity and can be skipped
    pub fn is_zero(&self) -> bool {
        self.roll == 0.0 && self.pitch == 0.0 && self.yaw == 0.0
    }
}

/// Attitude estimator settings
///
/// The whole value is replaced atomically between iterations; see
/// [`SettingsHandle`](crate::settings::SettingsHandle).
///
/// # Example
/// ```
/// use fusion_nav::AttitudeSettings;
///
/// let settings = AttitudeSettings {
///     accel_kp: 0.1,
///     zero_during_arming: true,
///     ..Default::default()
/// };
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttitudeSettings {
    /// Proportional gain on the gravity error
    pub accel_kp: f32,
    /// Integral gain on the gravity error, feeds the gyro bias
    pub accel_ki: f32,
    /// Rate at which the yaw bias is pulled towards a zero-mean yaw rate
    pub yaw_bias_rate: f32,
    /// Proportional gain on the magnetic yaw error
    pub mag_kp: f32,
    /// Integral gain on the magnetic yaw error
    pub mag_ki: f32,
    /// Sensor board mounting offset
    pub board_rotation: BoardRotation,
    /// Re-converge the gyro bias with aggressive gains while arming
    pub zero_during_arming: bool,
    /// Gyro bias prior in deg/s, additive
    pub gyro_bias: [f32; 3],
    /// Accelerometer bias prior in m/s², subtracted from raw readings
    pub accel_bias: [f32; 3],
}

impl Default for AttitudeSettings {
    fn default() -> Self {
        Self {
            accel_kp: 0.05,
            accel_ki: 0.0001,
            yaw_bias_rate: 0.000001,
            mag_kp: 0.0001,
            mag_ki: 0.000001,
            board_rotation: BoardRotation::default(),
            zero_during_arming: false,
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
        }
    }
}

impl AttitudeSettings {
    /// Gyro bias prior as a vector (deg/s)
    pub fn gyro_bias_prior(&self) -> Vector3<f32> {
        Vector3::from(self.gyro_bias)
    }

    /// Accelerometer bias prior as a vector (m/s²)
    pub fn accel_bias_prior(&self) -> Vector3<f32> {
        Vector3::from(self.accel_bias)
    }
}

/// Navigation solution of the INS/GPS estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationState {
    /// Position in NED relative to home, meters
    pub position: Vector3<f32>,
    /// Velocity in NED, m/s
    pub velocity: Vector3<f32>,
    /// Body to NED rotation
    pub attitude: UnitQuaternion<f32>,
    /// Additive gyro bias, rad/s
    pub gyro_bias: Vector3<f32>,
    /// Additive accelerometer bias, m/s²
    pub accel_bias: Vector3<f32>,
    /// Full state covariance, ordered position, velocity, quaternion, gyro bias, accel bias
    pub covariance: SMatrix<f32, 16, 16>,
}

impl NavigationState {
    pub fn position_covariance(&self) -> Matrix3<f32> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn velocity_covariance(&self) -> Matrix3<f32> {
        self.covariance.fixed_view::<3, 3>(3, 3).into_owned()
    }

    pub fn gyro_bias_covariance(&self) -> Matrix3<f32> {
        self.covariance.fixed_view::<3, 3>(10, 10).into_owned()
    }
}

/// Snapshot published by the estimator task after every iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttitudeSnapshot {
    /// Body to NED rotation, canonical sign (w >= 0)
    pub quaternion: UnitQuaternion<f32>,
    /// Roll, pitch, yaw in degrees
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Gyro bias in deg/s
    pub gyro_bias: Vector3<f32>,
    /// NED position (INS/GPS only)
    pub position: Option<Vector3<f32>>,
    /// NED velocity (INS/GPS only)
    pub velocity: Option<Vector3<f32>>,
    pub alarm: Alarm,
    /// Number of successful iterations published so far
    pub iteration: u64,
}

impl Default for AttitudeSnapshot {
    fn default() -> Self {
        Self {
            quaternion: UnitQuaternion::identity(),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            gyro_bias: Vector3::zeros(),
            position: None,
            velocity: None,
            alarm: Alarm::Clear,
            iteration: 0,
        }
    }
}
