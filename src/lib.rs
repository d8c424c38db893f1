// SPDX-License-Identifier: GPL-3.0-only

//! Capture layer for time-of-flight depth cameras
//!
//! Opens a V4L2 multiplanar capture node, negotiates the frame geometry,
//! streams through a pool of memory-mapped kernel buffers and unpacks the
//! sensor's packed 12-bit planes into 16-bit samples. The analog front-end
//! is programmed over the extended-control channel of a V4L2 subdevice.
//!
//! # Architecture
//!
//! - [`backends`]: Capture session, AFE control and board peripherals
//! - [`config`]: Device and board settings
//! - [`constants`]: Protocol and layout constants
//! - [`errors`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use tof_capture::{CaptureSession, Config, FrameGeometry};
//!
//! let config = Config::load_default()?;
//! let mut session = CaptureSession::open(&config)?;
//! let geometry = FrameGeometry::depth_ir();
//! session.set_frame_type(&geometry)?;
//! session.start()?;
//!
//! let mut frame = vec![0u16; geometry.pixel_count()];
//! session.get_frame(&mut frame)?;
//! session.stop()?;
//! # Ok::<(), tof_capture::CaptureError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types
pub use backends::camera::{
    CaptureSession, FrameGeometry, FrameInfo, FrameKind, SessionManager, StreamState,
};
pub use config::Config;
pub use errors::{CaptureError, CaptureResult};
