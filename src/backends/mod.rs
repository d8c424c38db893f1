// SPDX-License-Identifier: GPL-3.0-only

//! Hardware access for the time-of-flight camera board
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Callers (CLI, SDK)              │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │               Backend Layer                  │
//! │  ┌──────────────────┐   ┌───────────────┐   │
//! │  │     Camera       │   │    EEPROM     │   │
//! │  │ (V4L2 + AFE)     │   │   (sysfs)     │   │
//! │  └──────────────────┘   └───────────────┘   │
//! │                         ┌───────────────┐   │
//! │                         │  Temperature  │   │
//! │                         │    (I2C)      │   │
//! │                         └───────────────┘   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: Capture session, buffer pool, frame unpacking and AFE control
//! - [`eeprom`]: Calibration EEPROM reads and writes
//! - [`temperature`]: AFE and laser temperature sensors

pub mod camera;
pub mod eeprom;
pub mod temperature;
