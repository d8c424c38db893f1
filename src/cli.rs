// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for capture and board operations
//!
//! This module provides command-line functionality for:
//! - Listing frame types and capturing frames
//! - Programming and inspecting the AFE
//! - Calibration EEPROM and temperature sensor access

use chrono::Local;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tof_capture::backends::camera::virtual_device::{RecordingControlChannel, VirtualDevice};
use tof_capture::backends::camera::{
    ControlChannel, StreamingDevice, available_frame_types, frame_type_by_name,
};
use tof_capture::backends::eeprom::Eeprom;
use tof_capture::backends::temperature::TemperatureSensor;
use tof_capture::{CaptureSession, Config, FrameGeometry};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Resolve the config from an explicit file, the default location and an
/// optional driver path override
pub fn load_config(
    path: Option<&Path>,
    driver_path: Option<&str>,
) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(driver_path) = driver_path {
        let devices = Config::from_driver_path(driver_path)?;
        config.capture_device = devices.capture_device;
        config.control_device = devices.control_device;
    }

    Ok(config)
}

/// List the frame types the sensor supports
pub fn list_frame_types() -> CliResult {
    println!("Supported frame types:");
    println!();
    for geometry in available_frame_types() {
        println!(
            "  {:<10} {}x{} ({} samples, {} packed bytes)",
            geometry.kind.as_str(),
            geometry.width,
            geometry.height,
            geometry.pixel_count(),
            geometry.packed_len()
        );
    }
    Ok(())
}

/// Capture `count` frames into a raw sample file
pub fn capture(
    config: &Config,
    frame_type: &str,
    count: u32,
    output: Option<PathBuf>,
    virtual_device: bool,
) -> CliResult {
    let geometry = frame_type_by_name(frame_type)
        .ok_or_else(|| format!("Unknown frame type '{}' (see 'frame-types')", frame_type))?;

    let output_path = output.unwrap_or_else(default_output_path);
    let mut writer = BufWriter::new(File::create(&output_path)?);

    if virtual_device {
        println!("Using simulated device");
        let mut session = CaptureSession::new(VirtualDevice::new(), RecordingControlChannel::new())
            .with_buffer_count(config.buffer_count)
            .with_frame_timeout(config.frame_timeout());
        capture_frames(&mut session, &geometry, count, &mut writer)?;
    } else {
        println!("Using device: {}", config.capture_device);
        let mut session = CaptureSession::open(config)?;
        capture_frames(&mut session, &geometry, count, &mut writer)?;
    }

    writer.flush()?;
    println!("Frames saved: {}", output_path.display());
    Ok(())
}

fn capture_frames<D: StreamingDevice, C: ControlChannel>(
    session: &mut CaptureSession<D, C>,
    geometry: &FrameGeometry,
    count: u32,
    writer: &mut impl Write,
) -> CliResult {
    session.set_frame_type(geometry)?;
    println!("Capture format: {}", geometry);

    session.start()?;
    let mut frame = vec![0u16; geometry.pixel_count()];

    for n in 0..count {
        let info = session.get_frame(&mut frame)?;
        if let Some(errno) = info.transient_errno {
            println!(
                "  frame {}: buffer {} (driver reported errno {}, data may be stale)",
                n, info.buffer_index, errno
            );
        } else {
            println!("  frame {}: buffer {}", n, info.buffer_index);
        }
        write_samples(writer, &frame)?;
    }

    session.stop()?;
    Ok(())
}

/// Write samples as little-endian 16-bit values
fn write_samples(writer: &mut impl Write, samples: &[u16]) -> std::io::Result<()> {
    if cfg!(target_endian = "little") {
        writer.write_all(bytemuck::cast_slice(samples))
    } else {
        samples
            .iter()
            .try_for_each(|sample| writer.write_all(&sample.to_le_bytes()))
    }
}

fn default_output_path() -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("frames_{}.bin", timestamp))
}

/// Program the AFE with a firmware file
pub fn program(config: &Config, firmware: &Path) -> CliResult {
    let bytes = std::fs::read(firmware)?;
    let mut session = CaptureSession::open(config)?;

    let packets = session.program(&bytes)?;
    println!(
        "Programmed {} bytes in {} packet(s) from {}",
        bytes.len(),
        packets,
        firmware.display()
    );
    Ok(())
}

/// Read AFE registers
pub fn read_registers(config: &Config, addresses: &[String]) -> CliResult {
    let addresses = addresses
        .iter()
        .map(|a| parse_hex_u16(a))
        .collect::<Result<Vec<_>, _>>()?;

    let mut session = CaptureSession::open(config)?;
    let values = session.read_afe_registers(&addresses)?;

    for (address, value) in addresses.iter().zip(values) {
        println!("  {:#06x} = {:#06x}", address, value);
    }
    Ok(())
}

/// Write AFE registers given as ADDR=VALUE
pub fn write_registers(config: &Config, writes: &[String]) -> CliResult {
    let mut addresses = Vec::with_capacity(writes.len());
    let mut values = Vec::with_capacity(writes.len());
    for write in writes {
        let (address, value) = parse_register_write(write)?;
        addresses.push(address);
        values.push(value);
    }

    let mut session = CaptureSession::open(config)?;
    session.write_afe_registers(&addresses, &values)?;
    println!("Wrote {} register(s)", addresses.len());
    Ok(())
}

/// Dump EEPROM bytes as hex
pub fn eeprom_read(config: &Config, address: &str, length: usize) -> CliResult {
    let address = parse_u32(address)?;
    let data = Eeprom::new(&config.eeprom_path).read(address, length)?;

    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:08x}: {}", address as usize + row * 16, hex.join(" "));
    }
    Ok(())
}

/// Write hex bytes to the EEPROM
pub fn eeprom_write(config: &Config, address: &str, data: &str) -> CliResult {
    let address = parse_u32(address)?;
    let bytes = parse_hex_bytes(data)?;

    Eeprom::new(&config.eeprom_path).write(address, &bytes)?;
    println!("Wrote {} byte(s) at {:#x}", bytes.len(), address);
    Ok(())
}

/// Print both board temperatures
pub fn temperature(config: &Config) -> CliResult {
    let afe = TemperatureSensor::afe(config).read()?;
    let laser = TemperatureSensor::laser(config).read()?;

    println!("AFE temperature:   {:.2} °C", afe);
    println!("Laser temperature: {:.2} °C", laser);
    Ok(())
}

fn parse_u32(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("Invalid address '{}': {}", text, e))
}

fn parse_hex_u16(text: &str) -> Result<u16, String> {
    let text = text.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid register '{}': {}", text, e))
}

fn parse_register_write(text: &str) -> Result<(u16, u16), String> {
    let (address, value) = text
        .split_once('=')
        .ok_or_else(|| format!("Expected ADDR=VALUE, got '{}'", text))?;
    Ok((parse_hex_u16(address)?, parse_hex_u16(value)?))
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);

    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("Expected an even number of hex digits, got '{}'", text));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u32("0x10"), Ok(16));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("zz").is_err());
        assert_eq!(parse_hex_u16("c34a"), Ok(0xc34a));
        assert_eq!(parse_hex_u16("0x4001"), Ok(0x4001));
    }

    #[test]
    fn test_parse_register_write() {
        assert_eq!(parse_register_write("0x4001=0x7"), Ok((0x4001, 0x0007)));
        assert!(parse_register_write("4001").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("de ad be ef"), Ok(vec![0xde, 0xad, 0xbe, 0xef]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("").is_err());
    }

    #[test]
    fn test_virtual_capture_writes_frames() {
        let mut session = CaptureSession::new(VirtualDevice::new(), RecordingControlChannel::new());
        let geometry = FrameGeometry::raw();
        let mut out = Vec::new();

        capture_frames(&mut session, &geometry, 2, &mut out).unwrap();

        assert_eq!(out.len(), 2 * geometry.pixel_count() * 2);
        let expected = session.device().expected_frame(&geometry, 0);
        assert_eq!(u16::from_le_bytes([out[2], out[3]]), expected[1]);
        assert!(!session.is_streaming());
    }
}
