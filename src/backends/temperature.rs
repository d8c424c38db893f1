// SPDX-License-Identifier: GPL-3.0-only

//! Board temperature sensors on the I2C bus
//!
//! Both sensors report a 13-bit two's complement reading, left aligned in a
//! big-endian 16-bit register, at 0.0625 °C per LSB.

use crate::config::Config;
use crate::errors::{CaptureError, CaptureResult};
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Temperature value register
const TEMPERATURE_REGISTER: u8 = 0x00;

const CELSIUS_PER_LSB: f32 = 0.0625;

/// Decode a raw temperature register into degrees Celsius
pub fn decode_temperature(raw: [u8; 2]) -> f32 {
    let value = i16::from_be_bytes(raw) >> 3;
    f32::from(value) * CELSIUS_PER_LSB
}

/// Temperature sensor at one 7-bit I2C address
#[derive(Debug, Clone)]
pub struct TemperatureSensor {
    bus: PathBuf,
    address: u8,
}

impl TemperatureSensor {
    pub fn new(bus: impl Into<PathBuf>, address: u8) -> Self {
        Self {
            bus: bus.into(),
            address,
        }
    }

    /// Sensor next to the AFE
    pub fn afe(config: &Config) -> Self {
        Self::new(&config.temp_sensor_bus, config.afe_temp_sensor_addr)
    }

    /// Sensor next to the laser
    pub fn laser(config: &Config) -> Self {
        Self::new(&config.temp_sensor_bus, config.laser_temp_sensor_addr)
    }

    pub fn bus(&self) -> &Path {
        &self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn error(&self, action: &str, e: impl Display) -> CaptureError {
        warn!(
            bus = %self.bus.display(),
            address = format_args!("{:#04x}", self.address),
            error = %e,
            "Temp sensor {} error",
            action
        );
        CaptureError::Peripheral(format!(
            "temperature sensor {:#04x} {}: {}",
            self.address, action, e
        ))
    }

    /// Read the current temperature in degrees Celsius
    ///
    /// The bus is opened for this read only and closed on return.
    pub fn read(&self) -> CaptureResult<f32> {
        let mut bus = I2cdev::new(&self.bus).map_err(|e| self.error("open", e))?;

        let mut raw = [0u8; 2];
        bus.write_read(self.address, &[TEMPERATURE_REGISTER], &mut raw)
            .map_err(|e| self.error("read", e))?;

        let celsius = decode_temperature(raw);
        debug!(address = format_args!("{:#04x}", self.address), celsius, "Temperature read");
        Ok(celsius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_positive() {
        assert_eq!(decode_temperature([0x00, 0x00]), 0.0);
        // 25 °C = 400 LSB = 0x0C80 << 3
        assert_eq!(decode_temperature([0x0C, 0x80]), 25.0);
        assert_eq!(decode_temperature([0x00, 0x08]), 0.0625);
        // Low 3 status bits are ignored
        assert_eq!(decode_temperature([0x0C, 0x87]), 25.0);
    }

    #[test]
    fn test_decode_negative() {
        // -0.0625 °C = 0x1FFF (13 bit) << 3
        assert_eq!(decode_temperature([0xFF, 0xF8]), -0.0625);
        // -40 °C = -640 LSB
        assert_eq!(decode_temperature([0xEC, 0x00]), -40.0);
    }

    #[test]
    fn test_sensor_addresses_from_config() {
        let config = Config::default();
        assert_eq!(TemperatureSensor::afe(&config).address(), 0x4b);
        assert_eq!(TemperatureSensor::laser(&config).address(), 0x49);
    }

    #[test]
    fn test_missing_bus() {
        let sensor = TemperatureSensor::new("/nonexistent/i2c-9", 0x49);
        assert!(matches!(sensor.read(), Err(CaptureError::Peripheral(_))));
    }

    #[test]
    fn test_non_i2c_bus_fails_transfer() {
        // Opens fine but rejects the slave address selection
        let file = tempfile::NamedTempFile::new().unwrap();
        let sensor = TemperatureSensor::new(file.path(), 0x4b);

        match sensor.read() {
            Err(CaptureError::Peripheral(msg)) => assert!(msg.contains("read"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
