//! Fusion Nav - real-time attitude and navigation estimation for small flight controllers
//!
//! Fuses gyroscope, accelerometer, magnetometer, barometer and GPS samples
//! into a continuously updated body to NED orientation and, with the INS/GPS
//! estimator, a full navigation state.
//!
//! # Features
//!
//! - Complementary filter with gyro bias estimation and warm-up gains
//! - 16-state INS/GPS extended Kalman filter (position, velocity, attitude, gyro and accel bias)
//! - Single-slot sensor queues with bounded waits on the mandatory streams
//! - Settings swapped whole between iterations, loadable from TOML
//! - Periodic task with alarm, heartbeat and a published snapshot
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use nalgebra::Vector3;
//! use fusion_nav::{
//!     AccelSample, AttitudeSettings, AttitudeTask, GyroSample, SensorQueues, TaskConfig,
//! };
//!
//! let (publishers, arbiter) = SensorQueues::new(Duration::from_millis(10)).split();
//! let mut task = AttitudeTask::new(TaskConfig::default(), arbiter, AttitudeSettings::default());
//! let output = task.output();
//!
//! // Sensor readings
//! let timestamp = Duration::from_millis(10);
//! let rate = Vector3::new(0.1, 0.2, 0.3); // deg/s
//! let acceleration = Vector3::new(0.0, 0.0, -9.81); // m/s²
//! publishers.gyro.publish(GyroSample { timestamp, rate });
//! publishers.accel.publish(AccelSample { timestamp, acceleration });
//!
//! task.run_iteration().unwrap();
//!
//! let snapshot = output.read();
//! println!("roll {} pitch {} yaw {}", snapshot.roll, snapshot.pitch, snapshot.yaw);
//! ```

pub mod arbiter;
pub mod calibration;
pub mod complementary;
pub mod error;
pub mod estimator;
pub mod geodesy;
pub mod insgps;
pub mod math;
pub mod settings;
pub mod task;
mod types;

// Re-export all public types and functions
pub use arbiter::{SampleArbiter, SensorFrame, SensorPublisher, SensorPublishers, SensorQueues};
pub use calibration::SensorCalibration;
pub use complementary::{ComplementaryFilter, Gains};
pub use error::{EstimatorError, Result, SettingsError};
pub use estimator::{CycleContext, Estimator, Prediction};
pub use insgps::{InsGps, NoiseModel};
pub use math::{DEG_TO_RAD, QuaternionExt, RAD_TO_DEG, Vector3Ext};
pub use settings::{SettingsHandle, SettingsReactor};
pub use task::{ArmingStatus, AttitudeTask, Heartbeat, SharedAttitude, SharedHome, TaskConfig};
pub use types::*;
