// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture layer
//!
//! Driver call failures are translated one level up into [`CaptureError`]
//! at each boundary. Only the two transient dequeue conditions are ever
//! absorbed by the capture session; everything else propagates to the caller.

use std::fmt;
use std::io;

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Main capture error type
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Device node missing, not a character device, or failed capability checks
    DeviceUnavailable(String),
    /// `start()` called while already streaming
    AlreadyStreaming,
    /// Operation requires a streaming device (or `stop()` while idle)
    NotStreaming,
    /// The device did not signal a completed buffer within the wait window
    IoTimeout,
    /// Dequeue reported `EAGAIN` or `EIO`; the session continues with the
    /// index the driver reported
    TransientIo {
        /// errno reported by the driver
        errno: i32,
    },
    /// Unexpected ioctl failure or driver/pool desynchronization
    DriverProtocol {
        /// Driver operation that failed (e.g. "VIDIOC_DQBUF")
        operation: &'static str,
        /// errno reported by the driver, 0 when not an OS error
        errno: i32,
        /// Human readable description
        message: String,
    },
    /// mmap/munmap failure
    MappingFailure(String),
    /// Caller supplied an invalid argument
    InvalidArgument(String),
    /// Operation not supported in the current camera mode
    Unsupported(String),
    /// EEPROM or temperature sensor access failed
    Peripheral(String),
    /// Configuration could not be loaded or saved
    Config(String),
}

impl CaptureError {
    /// Translate an OS error from a driver call into a protocol error
    pub fn driver(operation: &'static str, err: &io::Error) -> Self {
        CaptureError::DriverProtocol {
            operation,
            errno: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }

    /// Protocol error that did not originate from an errno
    pub fn protocol(operation: &'static str, message: impl Into<String>) -> Self {
        CaptureError::DriverProtocol {
            operation,
            errno: 0,
            message: message.into(),
        }
    }

    /// Classify a dequeue failure: `EAGAIN` and `EIO` are tolerated
    pub fn from_dequeue(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) if errno == libc::EAGAIN || errno == libc::EIO => {
                CaptureError::TransientIo { errno }
            }
            _ => CaptureError::driver("VIDIOC_DQBUF", err),
        }
    }

    /// Whether the error is one of the tolerated dequeue conditions
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::TransientIo { .. })
    }

    /// Whether the error is a busy-state violation (caller error)
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            CaptureError::AlreadyStreaming | CaptureError::NotStreaming
        )
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            CaptureError::AlreadyStreaming => write!(f, "Device already streaming"),
            CaptureError::NotStreaming => write!(f, "Device not streaming"),
            CaptureError::IoTimeout => write!(f, "Timed out waiting for a frame"),
            CaptureError::TransientIo { errno } => write!(
                f,
                "Transient dequeue error: {}",
                io::Error::from_raw_os_error(*errno)
            ),
            CaptureError::DriverProtocol {
                operation,
                errno,
                message,
            } => write!(f, "{} failed (errno {}): {}", operation, errno, message),
            CaptureError::MappingFailure(msg) => write!(f, "Mapping failure: {}", msg),
            CaptureError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CaptureError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            CaptureError::Peripheral(msg) => write!(f, "Peripheral error: {}", msg),
            CaptureError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequeue_classification() {
        let again = io::Error::from_raw_os_error(libc::EAGAIN);
        let eio = io::Error::from_raw_os_error(libc::EIO);
        let inval = io::Error::from_raw_os_error(libc::EINVAL);

        assert!(CaptureError::from_dequeue(&again).is_transient());
        assert!(CaptureError::from_dequeue(&eio).is_transient());

        match CaptureError::from_dequeue(&inval) {
            CaptureError::DriverProtocol {
                operation, errno, ..
            } => {
                assert_eq!(operation, "VIDIOC_DQBUF");
                assert_eq!(errno, libc::EINVAL);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_busy_errors() {
        assert!(CaptureError::AlreadyStreaming.is_busy());
        assert!(CaptureError::NotStreaming.is_busy());
        assert!(!CaptureError::IoTimeout.is_busy());
    }

    #[test]
    fn test_driver_error_display() {
        let err = CaptureError::driver(
            "VIDIOC_STREAMON",
            &io::Error::from_raw_os_error(libc::EBUSY),
        );
        let text = err.to_string();
        assert!(text.starts_with("VIDIOC_STREAMON failed (errno"));
    }
}
