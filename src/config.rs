// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::camera::v4l2_utils::split_driver_path;
use crate::constants::{
    AFE_TEMP_SENSOR_I2C_ADDR, DEFAULT_BUFFER_COUNT, DEFAULT_CAPTURE_DEVICE,
    DEFAULT_CONTROL_DEVICE, EEPROM_DEV_PATH, EXPECTED_CARD_NAME, FRAME_WAIT_TIMEOUT,
    LASER_TEMP_SENSOR_I2C_ADDR, TEMP_SENSOR_DEV_PATH,
};
use crate::errors::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Application directory under the user's config directory
const CONFIG_DIR_NAME: &str = "tof-capture";
const CONFIG_FILE_NAME: &str = "config.json";

/// Device and board settings
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture node (e.g. /dev/video0)
    pub capture_device: String,
    /// AFE control subdevice (e.g. /dev/v4l-subdev1)
    pub control_device: String,
    /// Card name the capture node must report
    pub expected_card: String,
    /// Kernel buffers requested per frame type
    pub buffer_count: u32,
    /// How long to wait for a frame, in milliseconds
    pub frame_timeout_ms: u64,
    /// sysfs EEPROM node
    pub eeprom_path: String,
    /// I2C bus of the temperature sensors
    pub temp_sensor_bus: String,
    pub afe_temp_sensor_addr: u8,
    pub laser_temp_sensor_addr: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_device: DEFAULT_CAPTURE_DEVICE.to_string(),
            control_device: DEFAULT_CONTROL_DEVICE.to_string(),
            expected_card: EXPECTED_CARD_NAME.to_string(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_timeout_ms: FRAME_WAIT_TIMEOUT.as_millis() as u64,
            eeprom_path: EEPROM_DEV_PATH.to_string(),
            temp_sensor_bus: TEMP_SENSOR_DEV_PATH.to_string(),
            afe_temp_sensor_addr: AFE_TEMP_SENSOR_I2C_ADDR,
            laser_temp_sensor_addr: LASER_TEMP_SENSOR_I2C_ADDR,
        }
    }
}

impl Config {
    /// Default config file location (`~/.config/tof-capture/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the config at `path`, falling back to defaults if it is missing
    pub fn load(path: &Path) -> CaptureResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)?;

        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load from the default location, or defaults when there is none
    pub fn load_default() -> CaptureResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaptureError::Config(format!("{}: {}", parent.display(), e)))?;
        }

        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .map_err(|e| CaptureError::Config(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Default config with devices taken from a `capture;control` driver path
    pub fn from_driver_path(driver_path: &str) -> CaptureResult<Self> {
        let (capture, control) = split_driver_path(driver_path).ok_or_else(|| {
            CaptureError::Config(format!("invalid driver path '{}'", driver_path))
        })?;

        let mut config = Self {
            capture_device: capture,
            ..Self::default()
        };
        if let Some(control) = control {
            config.control_device = control;
        }
        Ok(config)
    }

    /// Frame wait timeout
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}
