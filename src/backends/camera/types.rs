// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the capture backend

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Kind of frame produced for a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Depth and infrared sub-frames stacked in one buffer
    DepthIr,
    /// Unprocessed sensor output
    Raw,
}

impl FrameKind {
    /// Name used by the camera SDK for this frame kind
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::DepthIr => "depth_ir",
            FrameKind::Raw => "raw",
        }
    }

    /// Parse a frame kind name ("depth_ir" or "raw")
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "depth_ir" => Some(FrameKind::DepthIr),
            "raw" => Some(FrameKind::Raw),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear calibration applied downstream of the capture layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub offset: f32,
    pub gain: f32,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gain: 1.0,
        }
    }
}

/// Negotiated frame geometry
///
/// Changing the geometry of a session invalidates its buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub calibration: CalibrationData,
    pub kind: FrameKind,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, kind: FrameKind) -> Self {
        Self {
            width,
            height,
            calibration: CalibrationData::default(),
            kind,
        }
    }

    /// 640x960 depth + IR geometry
    pub fn depth_ir() -> Self {
        Self::new(640, 960, FrameKind::DepthIr)
    }

    /// 668x750 raw sensor geometry
    pub fn raw() -> Self {
        Self::new(668, 750, FrameKind::Raw)
    }

    /// Number of 16-bit samples a caller must provide for `get_frame`
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of packed bytes covering the whole frame (12 bits per pixel)
    pub fn packed_len(&self) -> usize {
        self.pixel_count() * 3 / 2
    }
}

impl std::fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.kind)
    }
}

/// Static catalog of frame types supported by the sensor
pub fn available_frame_types() -> Vec<FrameGeometry> {
    vec![FrameGeometry::depth_ir(), FrameGeometry::raw()]
}

/// Look up a catalog entry by kind name
pub fn frame_type_by_name(name: &str) -> Option<FrameGeometry> {
    let kind = FrameKind::parse(name)?;
    available_frame_types().into_iter().find(|g| g.kind == kind)
}

/// Plane description returned by the driver for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Buffer ordinal assigned by the driver
    pub index: u32,
    /// Plane length in bytes
    pub length: usize,
    /// Offset to pass to mmap
    pub mem_offset: u32,
}

/// Streaming state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Streaming => write!(f, "streaming"),
        }
    }
}

/// Summary of one completed `get_frame` call
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Buffer ordinal the frame was read from
    pub buffer_index: u32,
    /// Pixel pairs decoded into the output
    pub pairs_decoded: usize,
    /// Set when the dequeue reported a tolerated error and the buffer
    /// may be stale
    pub transient_errno: Option<i32>,
    pub captured_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_contents() {
        let types = available_frame_types();
        assert_eq!(types.len(), 2);
        assert_eq!((types[0].width, types[0].height), (640, 960));
        assert_eq!(types[0].kind, FrameKind::DepthIr);
        assert_eq!((types[1].width, types[1].height), (668, 750));
        assert_eq!(types[1].kind, FrameKind::Raw);
        for t in &types {
            assert_eq!(t.calibration.offset, 0.0);
            assert_eq!(t.calibration.gain, 1.0);
        }
    }

    #[test]
    fn test_frame_kind_names() {
        assert_eq!(FrameKind::parse("depth_ir"), Some(FrameKind::DepthIr));
        assert_eq!(FrameKind::parse("raw"), Some(FrameKind::Raw));
        assert_eq!(FrameKind::parse("ir"), None);
        assert_eq!(FrameKind::Raw.to_string(), "raw");
    }

    #[test]
    fn test_geometry_equality_includes_calibration() {
        let a = FrameGeometry::depth_ir();
        let mut b = a;
        assert_eq!(a, b);
        b.calibration.gain = 2.0;
        assert_ne!(a, b);
    }

    #[test]
    fn test_packed_len() {
        assert_eq!(FrameGeometry::depth_ir().packed_len(), 640 * 960 * 3 / 2);
        assert_eq!(frame_type_by_name("raw"), Some(FrameGeometry::raw()));
    }
}
