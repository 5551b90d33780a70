//! Error types for the estimator task

use thiserror::Error;

use crate::types::Stream;

/// Per-iteration estimator failure
///
/// Every variant is contained within the iteration that produced it; the
/// task loop carries on with the next period.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorError {
    /// A mandatory stream did not deliver within the bounded wait
    #[error("{0} sample not received within timeout")]
    SensorTimeout(Stream),

    /// INS/GPS still waiting for all five streams to be fresh in one cycle
    #[error("INS/GPS initialization incomplete")]
    InitializationIncomplete,
}

/// Settings rejected before they reach the estimator
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = core::result::Result<T, EstimatorError>;
