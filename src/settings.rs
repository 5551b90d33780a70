//! Settings distribution between the configuration owner and the estimator task
//!
//! Whoever owns the configuration publishes a complete [`AttitudeSettings`]
//! value through a [`SettingsHandle`]. The task takes the newest published
//! value at the start of its next iteration, so a half-updated set of gains
//! is never observed.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SettingsError;
use crate::types::AttitudeSettings;

impl AttitudeSettings {
    /// Parse settings from TOML; missing keys keep their defaults
    ///
    /// ```
    /// use fusion_nav::AttitudeSettings;
    ///
    /// let text = "accel_kp = 0.2\n[board_rotation]\nyaw = 90.0";
    /// let settings = AttitudeSettings::from_toml_str(text).unwrap();
    /// assert_eq!(settings.accel_kp, 0.2);
    /// assert_eq!(settings.board_rotation.yaw, 90.0);
    /// assert_eq!(settings.accel_ki, AttitudeSettings::default().accel_ki);
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SettingsError::Invalid(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the filters cannot work with
    pub fn validate(&self) -> Result<(), SettingsError> {
        let gains = [
            ("accel_kp", self.accel_kp),
            ("accel_ki", self.accel_ki),
            ("yaw_bias_rate", self.yaw_bias_rate),
            ("mag_kp", self.mag_kp),
            ("mag_ki", self.mag_ki),
        ];
        for (name, value) in gains {
            if !value.is_finite() || value < 0.0 {
                return Err(SettingsError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }

        let rotation = &self.board_rotation;
        let vectors = [
            ("board_rotation", [rotation.roll, rotation.pitch, rotation.yaw]),
            ("gyro_bias", self.gyro_bias),
            ("accel_bias", self.accel_bias),
        ];
        for (name, values) in vectors {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(SettingsError::Invalid(format!("{name} must be finite")));
            }
        }

        Ok(())
    }
}

/// Publisher side of the settings slot
///
/// Cheap to clone; every clone writes to the same slot.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    pending: Arc<Mutex<Option<AttitudeSettings>>>,
}

impl SettingsHandle {
    /// Validate and publish a complete settings value
    ///
    /// Invalid settings are logged and dropped; the estimator keeps the
    /// last good value.
    pub fn publish(&self, settings: AttitudeSettings) -> Result<(), SettingsError> {
        if let Err(e) = settings.validate() {
            log::warn!("Rejected attitude settings update: {e}");
            return Err(e);
        }

        *self.pending.lock() = Some(settings);
        Ok(())
    }
}

/// Estimator-side view of the settings slot
#[derive(Debug, Default)]
pub struct SettingsReactor {
    pending: Arc<Mutex<Option<AttitudeSettings>>>,
    current: AttitudeSettings,
}

impl SettingsReactor {
    /// Create a reactor whose first `take` yields `initial`
    pub fn new(initial: AttitudeSettings) -> Self {
        Self {
            pending: Arc::new(Mutex::new(Some(initial))),
            current: initial,
        }
    }

    pub fn handle(&self) -> SettingsHandle {
        SettingsHandle {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Take the newest published value, if any arrived since the last call
    pub fn take(&mut self) -> Option<AttitudeSettings> {
        let settings = self.pending.lock().take()?;
        self.current = settings;
        Some(settings)
    }

    /// Settings in force
    pub fn current(&self) -> &AttitudeSettings {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoardRotation;

    #[test]
    fn test_first_take_yields_initial() {
        let initial = AttitudeSettings {
            accel_kp: 0.3,
            ..Default::default()
        };
        let mut reactor = SettingsReactor::new(initial);
        assert_eq!(reactor.take(), Some(initial));
        assert_eq!(reactor.take(), None);
        assert_eq!(reactor.current().accel_kp, 0.3);
    }

    #[test]
    fn test_latest_publish_wins() {
        let mut reactor = SettingsReactor::new(AttitudeSettings::default());
        reactor.take();

        let handle = reactor.handle();
        let first = AttitudeSettings {
            accel_kp: 0.1,
            ..Default::default()
        };
        let second = AttitudeSettings {
            accel_kp: 0.2,
            accel_ki: 0.01,
            ..Default::default()
        };
        handle.publish(first).unwrap();
        handle.clone().publish(second).unwrap();

        // Whole value swapped, never a mix of the two
        assert_eq!(reactor.take(), Some(second));
        assert_eq!(reactor.take(), None);
    }

    #[test]
    fn test_invalid_settings_are_dropped() {
        let mut reactor = SettingsReactor::new(AttitudeSettings::default());
        reactor.take();

        let handle = reactor.handle();
        let bad = AttitudeSettings {
            accel_ki: -1.0,
            ..Default::default()
        };
        assert!(matches!(handle.publish(bad), Err(SettingsError::Invalid(_))));

        let nan = AttitudeSettings {
            board_rotation: BoardRotation {
                roll: f32::NAN,
                pitch: 0.0,
                yaw: 0.0,
            },
            ..Default::default()
        };
        assert!(handle.publish(nan).is_err());
        assert_eq!(reactor.take(), None);
    }

    #[test]
    fn test_default_settings_round_trip_through_toml() {
        let text = toml::to_string(&AttitudeSettings::default()).unwrap();
        assert_eq!(AttitudeSettings::from_toml_str(&text).unwrap(), AttitudeSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let name = format!("fusion-nav-settings-{}.toml", std::process::id());
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, "mag_kp = 0.002\n[board_rotation]\npitch = -90.0\n").unwrap();

        let loaded = AttitudeSettings::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let settings = loaded.unwrap();
        assert_eq!(settings.mag_kp, 0.002);
        assert_eq!(settings.board_rotation.pitch, -90.0);
        assert_eq!(settings.accel_kp, AttitudeSettings::default().accel_kp);

        assert!(matches!(
            AttitudeSettings::from_file(&path),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn test_toml_parse() {
        let settings = AttitudeSettings::from_toml_str(
            r#"
            accel_kp = 0.1
            zero_during_arming = true
            gyro_bias = [0.5, -0.5, 0.0]
            "#,
        )
        .unwrap();
        assert_eq!(settings.accel_kp, 0.1);
        assert!(settings.zero_during_arming);
        assert_eq!(settings.gyro_bias, [0.5, -0.5, 0.0]);
        assert_eq!(settings.mag_kp, AttitudeSettings::default().mag_kp);

        assert!(matches!(
            AttitudeSettings::from_toml_str("accel_kp = \"fast\""),
            Err(SettingsError::Parse(_))
        ));
        assert!(matches!(
            AttitudeSettings::from_toml_str("mag_ki = -0.5"),
            Err(SettingsError::Invalid(_))
        ));
    }
}
