use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{ClockBounds, ClockModel, ClockPolicy, ClockSyncError};
use crate::io::{DeviceIoConfig, ReplayConfig};
use crate::measurement::{BodyPart, BodySide};
use crate::peripheral::{
    Channel, MotionPeripheral, PeripheralInfo, RemotePeripheral, DEFAULT_TICK_HZ,
    DEFAULT_UPDATE_INTERVAL, REMOTE_KIND,
};

/// Returns the path to the settings file: `~/.config/motion-capture/settings.json`
pub fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("motion-capture");
    path.push("settings.json");
    path
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid clock model: {0}")]
    Clock(#[from] ClockSyncError),
}

/// Persisted capture settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Audio I/O
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Send command frames to the peripheral on the output
    pub render_commands: bool,
    /// Interleaved channel carrying frame words
    pub carrier_channel: u16,

    // Replay
    pub replay_period_frames: usize,
    pub replay_loop: bool,

    // Remote peripheral
    pub peripheral_id: Option<uuid::Uuid>,
    pub peripheral_name: String,
    pub body_side: BodySide,
    pub body_part: BodyPart,
    pub update_interval: f64,
    pub autoconnect: bool,
    pub enabled_channels: Vec<Channel>,
    pub tick_rate_hz: f64,

    // Clock
    /// Fixed device clock; `None` syncs on the first sample after connect
    pub clock: Option<ClockModel>,
    pub clock_bounds: ClockBounds,
    pub clock_policy: ClockPolicy,

    // Persistence
    pub queue_capacity: usize,
    pub drain_poll_ms: u64,
    /// JSON-lines output; `None` writes next to the settings file
    pub output_path: Option<PathBuf>,
    pub capture_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            render_commands: true,
            carrier_channel: 0,

            replay_period_frames: 512,
            replay_loop: false,

            peripheral_id: None,
            peripheral_name: "Audio sensor".to_string(),
            body_side: BodySide::Unknown,
            body_part: BodyPart::Unknown,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            autoconnect: true,
            enabled_channels: vec![Channel::DeviceMotion],
            tick_rate_hz: DEFAULT_TICK_HZ,

            clock: None,
            clock_bounds: ClockBounds::default(),
            clock_policy: ClockPolicy::default(),

            queue_capacity: 4096,
            drain_poll_ms: 50,
            output_path: None,
            capture_seconds: 60.0,
        }
    }
}

impl Settings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = settings_path();
        match Self::load_from(&path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(SettingsError::Io(e)) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
            Err(e) => {
                log::warn!("Failed to parse settings ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        let path = settings_path();
        if let Err(e) = self.save_to(&path) {
            log::warn!("Failed to write settings: {}", e);
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks serde cannot express
    fn validate(&self) -> Result<(), SettingsError> {
        if let Some(ClockModel::DriftCorrected {
            offset,
            reference,
            drift_ppm,
        }) = self.clock
        {
            ClockModel::drift_corrected(offset, reference, drift_ppm)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn device_config(&self) -> DeviceIoConfig {
        DeviceIoConfig {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            enable_output: self.render_commands,
        }
    }

    pub fn replay_config(&self, path: impl Into<PathBuf>) -> ReplayConfig {
        ReplayConfig {
            path: path.into(),
            period_frames: self.replay_period_frames,
            loop_playback: self.replay_loop,
        }
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }

    pub fn capture_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.capture_seconds).unwrap_or(Duration::ZERO)
    }

    /// Where the JSON-lines sink writes
    pub fn resolved_output_path(&self) -> PathBuf {
        match &self.output_path {
            Some(path) => path.clone(),
            None => settings_path().with_file_name("measurements.jsonl"),
        }
    }

    /// Build the remote peripheral described by these settings. Channel
    /// intent is applied later with `apply_enabled_channels`, once the
    /// device has announced what it has.
    pub fn build_peripheral(&self) -> RemotePeripheral {
        let mut info = PeripheralInfo::new(REMOTE_KIND, self.peripheral_name.clone())
            .with_clock_bounds(self.clock_bounds)
            .with_clock_policy(self.clock_policy);
        if let Some(id) = self.peripheral_id {
            info = info.with_uuid(id);
        }

        let mut peripheral = RemotePeripheral::with_info(info, self.tick_rate_hz);
        if let Some(model) = self.clock {
            peripheral = peripheral.with_clock(model);
        }

        peripheral.set_body_side(self.body_side);
        peripheral.set_body_part(self.body_part);
        peripheral.set_autoconnect(self.autoconnect);
        if let Err(e) = peripheral.set_update_interval(self.update_interval) {
            log::warn!("Ignoring saved update interval: {}", e);
        }
        peripheral
    }

    /// Enable every saved channel the peripheral now offers. Returns how
    /// many were newly enabled.
    pub fn apply_enabled_channels<P>(&self, peripheral: &P) -> usize
    where
        P: MotionPeripheral + ?Sized,
    {
        self.enabled_channels
            .iter()
            .filter(|ch| peripheral.is_available(**ch) && !peripheral.is_enabled(**ch))
            .map(|ch| peripheral.set_enabled(*ch, true))
            .filter(Result::is_ok)
            .count()
    }

    /// Capture the peripheral's current configuration
    pub fn update_from<P>(&mut self, peripheral: &P)
    where
        P: MotionPeripheral + ?Sized,
    {
        self.peripheral_id = Some(peripheral.uuid());
        self.peripheral_name = peripheral.name();
        self.body_side = peripheral.body_side();
        self.body_part = peripheral.body_part();
        self.update_interval = peripheral.update_interval();
        self.autoconnect = peripheral.autoconnect();
        let available = peripheral.info().channels().available_mask();
        if available != 0 {
            self.enabled_channels = Channel::ALL
                .iter()
                .copied()
                .filter(|ch| peripheral.is_enabled(*ch))
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg/settings.json");

        let mut settings = Settings::default();
        settings.peripheral_name = "Left ankle".to_string();
        settings.body_side = BodySide::Left;
        settings.enabled_channels = vec![Channel::Accelerometer, Channel::Gyroscope];
        settings.clock = Some(ClockModel::fixed(12.5));
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "queue_capacity": 16, "clock_policy": "drop" }"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.queue_capacity, 16);
        assert_eq!(settings.clock_policy, ClockPolicy::Drop);
        assert_eq!(settings.drain_poll_ms, Settings::default().drain_poll_ms);
        assert!(settings.clock.is_none());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::Json(_))
        ));
        assert!(matches!(
            Settings::load_from(dir.path().join("absent.json")),
            Err(SettingsError::Io(_))
        ));
    }

    #[test]
    fn test_backwards_clock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "clock": { "model": "drift_corrected", "offset": 0.0, "reference": 0.0, "drift_ppm": -2000000.0 } }"#,
        )
        .unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::Clock(ClockSyncError::InvalidDrift { .. }))
        ));

        fs::write(
            &path,
            r#"{ "clock": { "model": "drift_corrected", "offset": 5.0, "reference": 1.0, "drift_ppm": 40.0 } }"#,
        )
        .unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(
            settings.clock,
            Some(ClockModel::drift_corrected(5.0, 1.0, 40.0).unwrap())
        );
    }

    #[test]
    fn test_peripheral_from_settings() {
        let mut settings = Settings::default();
        settings.body_side = BodySide::Right;
        settings.body_part = BodyPart::Wrist;
        settings.update_interval = 0.02;
        settings.enabled_channels = vec![Channel::Gyroscope, Channel::Magnetometer];

        let peripheral = settings.build_peripheral();
        assert_eq!(peripheral.body_side(), BodySide::Right);
        assert_eq!(peripheral.update_interval(), 0.02);
        assert_eq!(settings.apply_enabled_channels(&peripheral), 0);

        peripheral.apply_capabilities(Channel::Gyroscope.mask());
        assert_eq!(settings.apply_enabled_channels(&peripheral), 1);
        assert!(peripheral.is_enabled(Channel::Gyroscope));
        assert!(!peripheral.is_enabled(Channel::Magnetometer));
        assert_eq!(settings.apply_enabled_channels(&peripheral), 0);

        let mut saved = Settings::default();
        saved.update_from(&peripheral);
        assert_eq!(saved.peripheral_id, Some(peripheral.uuid()));
        assert_eq!(saved.body_part, BodyPart::Wrist);
        assert_eq!(saved.enabled_channels, vec![Channel::Gyroscope]);
    }
}
