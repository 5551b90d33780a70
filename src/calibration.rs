//! Sensor conditioning applied to raw samples before fusion
//!
//! Corrects for the board being mounted at an angle to the airframe and
//! removes the accelerometer bias prior. Both come from [`AttitudeSettings`]
//! and are rebuilt whenever the settings are swapped.

use nalgebra::{Rotation3, Vector3};

use crate::arbiter::SensorFrame;
use crate::math::DEG_TO_RAD;
use crate::types::{AttitudeSettings, BoardRotation};

/// Conditioning derived from the current settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorCalibration {
    /// Board to body rotation, `None` when the board is mounted straight
    rotation: Option<Rotation3<f32>>,
    /// Subtracted from accelerometer readings before rotation
    accel_bias: Vector3<f32>,
}

impl SensorCalibration {
    /// Build the conditioning for the given settings
    ///
    /// # Example
    /// ```
    /// use nalgebra::Vector3;
    /// use fusion_nav::{AttitudeSettings, BoardRotation, SensorCalibration};
    ///
    /// let settings = AttitudeSettings {
    ///     board_rotation: BoardRotation { roll: 0.0, pitch: 0.0, yaw: 90.0 },
    ///     ..Default::default()
    /// };
    /// let calibration = SensorCalibration::from_settings(&settings);
    /// let body = calibration.apply_gyro(Vector3::new(1.0, 0.0, 0.0));
    /// assert!((body - Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-6);
    /// ```
    pub fn from_settings(settings: &AttitudeSettings) -> Self {
        Self {
            rotation: board_rotation(&settings.board_rotation),
            accel_bias: settings.accel_bias_prior(),
        }
    }

    /// Rotate a gyroscope reading into the body frame
    pub fn apply_gyro(&self, gyro: Vector3<f32>) -> Vector3<f32> {
        self.rotate(gyro)
    }

    /// Remove the bias prior and rotate an accelerometer reading into the body frame
    pub fn apply_accel(&self, accel: Vector3<f32>) -> Vector3<f32> {
        self.rotate(accel - self.accel_bias)
    }

    /// Rotate a magnetometer reading into the body frame
    pub fn apply_mag(&self, mag: Vector3<f32>) -> Vector3<f32> {
        self.rotate(mag)
    }

    /// Condition every sample of a frame in place
    pub fn apply(&self, frame: &mut SensorFrame) {
        frame.gyro.rate = self.apply_gyro(frame.gyro.rate);
        frame.accel.acceleration = self.apply_accel(frame.accel.acceleration);
        if let Some(mag) = frame.mag.as_mut() {
            mag.field = self.apply_mag(mag.field);
        }
    }

    fn rotate(&self, v: Vector3<f32>) -> Vector3<f32> {
        match &self.rotation {
            Some(rotation) => rotation * v,
            None => v,
        }
    }
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self::from_settings(&AttitudeSettings::default())
    }
}

/// Rotation taking board-frame vectors into the body frame
fn board_rotation(rotation: &BoardRotation) -> Option<Rotation3<f32>> {
    if rotation.is_zero() {
        return None;
    }

    Some(Rotation3::from_euler_angles(
        rotation.roll * DEG_TO_RAD,
        rotation.pitch * DEG_TO_RAD,
        rotation.yaw * DEG_TO_RAD,
    ))
}
