//! Common interface of the two fusion algorithms
//!
//! The task loop only ever talks to a `Box<dyn Estimator>`, so downstream
//! consumers see the same orientation slot whichever algorithm was picked at
//! startup.

use core::time::Duration;

use nalgebra::{UnitQuaternion, Vector3};

use crate::arbiter::SensorFrame;
use crate::complementary::ComplementaryFilter;
use crate::error::Result;
use crate::insgps::InsGps;
use crate::types::{ArmingState, AttitudeSettings, EstimatorKind, HomeLocation, NavigationState};

/// Read-only inputs of one iteration besides the samples themselves
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    /// Time since the first sample seen by the task
    pub since_start: Duration,
    pub arming: ArmingState,
    pub home: &'a HomeLocation,
}

/// Outcome of a successful prediction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    /// State propagated; the correction step should follow
    Propagated,
    /// Filter was seeded from this frame; nothing left to correct this cycle
    Initialized,
}

/// Attitude estimator driven once per task period
pub trait Estimator: Send {
    fn kind(&self) -> EstimatorKind;

    /// Adopt a new settings value, including the gyro bias prior
    fn apply_settings(&mut self, settings: &AttitudeSettings);

    /// Propagate the state with the gyro and accel samples of `frame`
    fn predict(&mut self, frame: &SensorFrame, ctx: &CycleContext<'_>) -> Result<Prediction>;

    /// Fold in whichever reference measurements were fresh this cycle
    fn correct(&mut self, frame: &SensorFrame, ctx: &CycleContext<'_>);

    /// Current body to NED rotation, canonical sign
    fn orientation(&self) -> UnitQuaternion<f32>;

    /// Current additive gyro bias in deg/s
    fn gyro_bias(&self) -> Vector3<f32>;

    /// Full navigation solution, if this estimator produces one
    fn navigation(&self) -> Option<NavigationState> {
        None
    }

    /// Drop all run-time state; the last applied settings are kept
    fn reset(&mut self);
}

/// Build the estimator selected in the task configuration
///
/// `warmup` is the aggressive-gain window of the complementary filter.
pub fn build(
    kind: EstimatorKind,
    settings: &AttitudeSettings,
    warmup: Duration,
) -> Box<dyn Estimator> {
    match kind {
        EstimatorKind::Complementary => {
            Box::new(ComplementaryFilter::with_settings(*settings).with_warmup(warmup))
        }
        EstimatorKind::InsGps => Box::new(InsGps::with_settings(*settings)),
    }
}
