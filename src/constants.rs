// SPDX-License-Identifier: GPL-3.0-only

//! Capture-wide constants

use std::time::Duration;

/// Number of kernel buffers requested per geometry
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// How long `get_frame` waits for the driver to complete a buffer
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Card name reported by the capture node on the reference board
pub const EXPECTED_CARD_NAME: &str = "Qualcomm Camera Subsystem";

/// Default capture device node
pub const DEFAULT_CAPTURE_DEVICE: &str = "/dev/video0";

/// Default AFE control subdevice node
pub const DEFAULT_CONTROL_DEVICE: &str = "/dev/v4l-subdev1";

// ===== Packed frame layout =====

/// Bytes per packed pixel pair (two 12-bit samples)
pub const PACKED_BYTES_PER_PAIR: usize = 3;

/// Width of the raw sensor geometry that needs row realignment
pub const REALIGNED_WIDTH: u32 = 668;

/// Pixel pairs per packed row in the realigned layout
pub const REALIGN_PAIRS_PER_ROW: usize = 336;

/// Output positions rewound at each packed row boundary
pub const REALIGN_REWIND: usize = 4;

// ===== AFE control channel =====

/// Size of one AFE control packet in bytes
pub const CTRL_PACKET_SIZE: usize = 4096;

/// Size of one AFE control packet in 16-bit words
pub const CTRL_PACKET_WORDS: usize = CTRL_PACKET_SIZE / 2;

/// Register (address, value) pairs per AFE packet
pub const CTRL_PAIRS_PER_PACKET: usize = CTRL_PACKET_WORDS / 2;

/// Pause between consecutive AFE packets
pub const CTRL_PACKET_DELAY: Duration = Duration::from_micros(100);

/// Extended control used to push chip configuration to the AFE
pub const V4L2_CID_AD_DEV_SET_CHIP_CONFIG: u32 = 0x00A0_0A00;

/// Extended control used to read back an AFE register
pub const V4L2_CID_AD_DEV_READ_REG: u32 = 0x00A0_0A01;

// ===== Board peripherals =====

/// sysfs node of the calibration EEPROM
pub const EEPROM_DEV_PATH: &str = "/sys/bus/i2c/devices/0-0056/eeprom";

/// I2C bus hosting the temperature sensors
pub const TEMP_SENSOR_DEV_PATH: &str = "/dev/i2c-1";

/// I2C address of the laser temperature sensor
pub const LASER_TEMP_SENSOR_I2C_ADDR: u8 = 0x49;

/// I2C address of the AFE temperature sensor
pub const AFE_TEMP_SENSOR_I2C_ADDR: u8 = 0x4b;
