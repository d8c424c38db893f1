// SPDX-License-Identifier: GPL-3.0-only

//! Capture backend for time-of-flight sensors on V4L2 multiplanar drivers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   SessionManager    │  ← Shared access, one lock per operation
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐       ┌───────────────────┐
//! │   CaptureSession    │──────▶│ format_converters │  ← 12-bit unpacking
//! └──────────┬──────────┘       └───────────────────┘
//!            │ owns
//!            ▼
//! ┌─────────────────────┐
//! │     BufferPool      │  ← Mapped kernel buffers
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐       ┌───────────────────┐
//! │ StreamingDevice     │       │  ControlChannel   │  ← AFE packets
//! │ (V4L2 / virtual)    │       │ (subdev / record) │
//! └─────────────────────┘       └───────────────────┘
//! ```

pub mod afe;
pub mod buffer_pool;
pub mod capture_session;
pub mod format_converters;
pub mod manager;
pub mod specifics;
pub mod types;
pub mod v4l2_controls;
pub mod v4l2_device;
pub mod v4l2_utils;
pub mod virtual_device;

pub use afe::AfeController;
pub use buffer_pool::{BufferPool, MappedBuffer};
pub use capture_session::CaptureSession;
pub use manager::SessionManager;
pub use specifics::{CameraMode, DeviceSpecifics, Revision};
pub use types::*;
pub use v4l2_device::{V4l2ControlChannel, V4l2Device};
pub use virtual_device::{DeviceCounters, RecordingControlChannel, VirtualDevice};

use crate::constants::CTRL_PACKET_WORDS;
use std::io;
use std::time::Duration;

/// One AFE control packet (4096 bytes)
pub type ControlPacket = [u16; CTRL_PACKET_WORDS];

/// A failed dequeue, carrying the index the driver left in the descriptor
#[derive(Debug)]
pub struct DequeueError {
    pub reported_index: u32,
    pub source: io::Error,
}

impl std::fmt::Display for DequeueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dequeue failed (reported index {}): {}",
            self.reported_index, self.source
        )
    }
}

impl std::error::Error for DequeueError {}

/// Memory region backing one capture buffer
///
/// The region belongs to the buffer pool; the driver only writes into it
/// while the buffer is queued.
pub trait MappedRegion: Send {
    /// Bytes of the mapped plane
    fn as_bytes(&self) -> &[u8];

    /// Release the mapping
    ///
    /// Must be idempotent: after the first call the region is considered
    /// released even if the call failed.
    fn unmap(&mut self) -> io::Result<()>;

    /// Address of the mapping, for diagnostics
    fn address(&self) -> usize {
        self.as_bytes().as_ptr() as usize
    }
}

/// Streaming capture device
///
/// All calls return immediately except [`StreamingDevice::wait_ready`].
/// Errors are raw OS errors; the session translates them.
pub trait StreamingDevice: Send {
    /// Device node path, for diagnostics
    fn path(&self) -> &str;

    /// Apply the frame size to the driver
    fn set_format(&mut self, geometry: &FrameGeometry) -> io::Result<()>;

    /// Ask the driver for `count` mmap buffers, returning the number granted
    ///
    /// A count of zero frees the driver's buffers.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Query the plane length and mmap offset of one buffer
    fn query_buffer(&mut self, index: u32) -> io::Result<PlaneInfo>;

    /// Map a buffer plane into memory
    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn MappedRegion>>;

    /// Hand a buffer to the driver
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Take a completed buffer back from the driver
    fn dequeue_buffer(&mut self) -> Result<u32, DequeueError>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Block until a completed buffer is ready or `timeout` elapses
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Extended-control channel to the AFE
pub trait ControlChannel: Send {
    /// Device node path, for diagnostics
    fn path(&self) -> &str;

    /// Apply one extended control carrying a full packet
    ///
    /// The driver may write back into `packet` (register reads).
    fn apply(&mut self, control_id: u32, packet: &mut ControlPacket) -> io::Result<()>;
}
