// SPDX-License-Identifier: GPL-3.0-only

//! Shared V4L2 utility functions
//!
//! Opening and validating device nodes before the capture session takes
//! them over.

use crate::errors::{CaptureError, CaptureResult};
use std::os::unix::fs::FileTypeExt;
use tracing::{debug, info, warn};
use v4l::Device;
use v4l::capability::Flags as CapFlags;

/// Check that `path` exists and is a character device
pub fn validate_char_device(path: &str) -> CaptureResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        warn!(path, errno = e.raw_os_error(), error = %e, "Cannot identify device");
        CaptureError::DeviceUnavailable(format!("cannot identify '{}': {}", path, e))
    })?;

    if !metadata.file_type().is_char_device() {
        warn!(path, "Not a character device");
        return Err(CaptureError::DeviceUnavailable(format!(
            "'{}' is not a character device",
            path
        )));
    }

    Ok(())
}

/// Capabilities the capture node must report
///
/// Returns a description of the first missing capability.
pub fn missing_capability(card: &str, expected_card: &str, flags: CapFlags) -> Option<String> {
    if card != expected_card {
        return Some(format!("card '{}' is not '{}'", card, expected_card));
    }
    if !flags.intersects(CapFlags::VIDEO_CAPTURE | CapFlags::VIDEO_CAPTURE_MPLANE) {
        return Some("not a video capture device".to_string());
    }
    if !flags.contains(CapFlags::STREAMING) {
        return Some("does not support streaming i/o".to_string());
    }
    None
}

/// Open a capture node non-blocking and validate its capabilities
pub fn open_capture_device(path: &str, expected_card: &str) -> CaptureResult<Device> {
    validate_char_device(path)?;

    let device = Device::with_path(path).map_err(|e| {
        warn!(path, errno = e.raw_os_error(), error = %e, "Cannot open device");
        CaptureError::DeviceUnavailable(format!("cannot open '{}': {}", path, e))
    })?;

    let caps = device.query_caps().map_err(|e| {
        warn!(path, errno = e.raw_os_error(), error = %e, "VIDIOC_QUERYCAP error");
        CaptureError::DeviceUnavailable(format!("'{}' is not a V4L2 device: {}", path, e))
    })?;

    if let Some(reason) = missing_capability(&caps.card, expected_card, caps.capabilities) {
        warn!(path, card = %caps.card, driver = %caps.driver, %reason, "Device rejected");
        return Err(CaptureError::DeviceUnavailable(format!("'{}': {}", path, reason)));
    }

    info!(
        path,
        card = %caps.card,
        driver = %caps.driver,
        bus = %caps.bus,
        "Opened capture device"
    );
    Ok(device)
}

/// Split a `capture;control` driver path
///
/// The first token names the capture node and the last one the control
/// subdevice. A path without a separator names only the capture node.
pub fn split_driver_path(driver_path: &str) -> Option<(String, Option<String>)> {
    let mut tokens = driver_path.split(';').map(str::trim).filter(|t| !t.is_empty());
    let capture = tokens.next()?.to_string();
    let control = tokens.last().map(str::to_string);

    debug!(driver_path, capture = %capture, control = ?control, "Parsed driver path");
    Some((capture, control))
}
