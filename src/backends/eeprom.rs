// SPDX-License-Identifier: GPL-3.0-only

//! Calibration EEPROM access through its sysfs node
//!
//! The node is opened for each call and closed again before returning.

use crate::errors::{CaptureError, CaptureResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Byte-addressed EEPROM
#[derive(Debug, Clone)]
pub struct Eeprom {
    path: PathBuf,
}

impl Eeprom {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, action: &str, e: std::io::Error) -> CaptureError {
        warn!(path = %self.path.display(), errno = e.raw_os_error(), error = %e, "EEPROM {} error", action);
        CaptureError::Peripheral(format!("EEPROM {} {}: {}", action, self.path.display(), e))
    }

    fn seek_to(&self, file: &mut File, address: u32, action: &str) -> CaptureResult<()> {
        file.seek(SeekFrom::Start(u64::from(address)))
            .map(|_| ())
            .map_err(|e| self.error(action, e))
    }

    /// Read `length` bytes starting at `address`
    pub fn read(&self, address: u32, length: usize) -> CaptureResult<Vec<u8>> {
        let mut file = File::open(&self.path).map_err(|e| self.error("open", e))?;
        self.seek_to(&mut file, address, "read")?;

        let mut data = vec![0u8; length];
        file.read_exact(&mut data)
            .map_err(|e| self.error("read", e))?;

        debug!(path = %self.path.display(), address, length, "EEPROM read");
        Ok(data)
    }

    /// Write `data` starting at `address`
    pub fn write(&self, address: u32, data: &[u8]) -> CaptureResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| self.error("open", e))?;
        self.seek_to(&mut file, address, "write")?;

        file.write_all(data).map_err(|e| self.error("write", e))?;
        file.flush().map_err(|e| self.error("write", e))?;

        debug!(path = %self.path.display(), address, length = data.len(), "EEPROM write");
        Ok(())
    }
}
