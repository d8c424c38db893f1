// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 multiplanar capture device and AFE control subdevice
//!
//! The capture node is opened and validated through the `v4l` crate; the
//! streaming calls themselves are raw multiplanar ioctls since the sensor
//! delivers a packed format the crate's single-planar stream cannot map.

use super::v4l2_controls::{
    V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, V4l2Buffer, V4l2ExtControl, V4l2ExtControls, V4l2Format,
    V4l2Plane, V4l2RequestBuffers, VIDEO_MAX_PLANES, VIDIOC_DQBUF, VIDIOC_QBUF, VIDIOC_QUERYBUF,
    VIDIOC_REQBUFS, VIDIOC_S_EXT_CTRLS, VIDIOC_S_FMT, VIDIOC_STREAMOFF, VIDIOC_STREAMON, xioctl,
};
use super::v4l2_utils::{open_capture_device, validate_char_device};
use super::{
    ControlChannel, ControlPacket, DequeueError, FrameGeometry, MappedRegion, PlaneInfo,
    StreamingDevice,
};
use crate::constants::CTRL_PACKET_SIZE;
use crate::errors::{CaptureError, CaptureResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, warn};

/// Memory-mapped buffer plane
struct MmapRegion {
    ptr: *mut libc::c_void,
    len: usize,
    mapped: bool,
}

// SAFETY: the mapping is plain shared memory owned by this region; nothing
// else holds the pointer.
unsafe impl Send for MmapRegion {}

impl MappedRegion for MmapRegion {
    fn as_bytes(&self) -> &[u8] {
        if !self.mapped {
            return &[];
        }
        // SAFETY: ptr/len describe a live mapping until unmap()
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    fn unmap(&mut self) -> io::Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;

        // SAFETY: ptr/len come from a successful mmap and are unmapped once
        if unsafe { libc::munmap(self.ptr, self.len) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn address(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!(address = self.ptr as usize, error = %e, "munmap error");
        }
    }
}

/// Multiplanar V4L2 capture node
pub struct V4l2Device {
    path: String,
    fd: RawFd,
    /// Owns the file descriptor
    _device: v4l::Device,
}

impl V4l2Device {
    /// Open `path` non-blocking and check it is the expected capture node
    pub fn open(path: &str, expected_card: &str) -> CaptureResult<Self> {
        let device = open_capture_device(path, expected_card)?;
        let fd = device.handle().fd();

        Ok(Self {
            path: path.to_string(),
            fd,
            _device: device,
        })
    }
}

impl StreamingDevice for V4l2Device {
    fn path(&self) -> &str {
        &self.path
    }

    fn set_format(&mut self, geometry: &FrameGeometry) -> io::Result<()> {
        let mut fmt = V4l2Format::capture_mplane(geometry.width, geometry.height);
        // SAFETY: fmt is a v4l2_format
        unsafe { xioctl(self.fd, VIDIOC_S_FMT, &mut fmt) }?;

        debug!(path = %self.path, width = geometry.width, height = geometry.height, "VIDIOC_S_FMT");
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = V4l2RequestBuffers::mmap_capture(count);
        // SAFETY: req is a v4l2_requestbuffers
        unsafe { xioctl(self.fd, VIDIOC_REQBUFS, &mut req) }?;

        debug!(path = %self.path, requested = count, granted = req.count, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<PlaneInfo> {
        let mut planes = [V4l2Plane::zeroed(); VIDEO_MAX_PLANES];
        let mut buf = V4l2Buffer::mmap_capture(index, &mut planes);
        // SAFETY: buf is a v4l2_buffer whose plane array outlives the call
        unsafe { xioctl(self.fd, VIDIOC_QUERYBUF, &mut buf) }?;

        let plane = planes[0];
        Ok(PlaneInfo {
            index,
            length: plane.length as usize,
            // SAFETY: the driver fills mem_offset for MMAP buffers
            mem_offset: unsafe { plane.m.mem_offset },
        })
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn MappedRegion>> {
        // SAFETY: maps a driver buffer at the offset it reported
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                plane.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                plane.mem_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Box::new(MmapRegion {
            ptr,
            len: plane.length,
            mapped: true,
        }))
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut planes = [V4l2Plane::zeroed(); VIDEO_MAX_PLANES];
        let mut buf = V4l2Buffer::mmap_capture(index, &mut planes);
        // SAFETY: buf is a v4l2_buffer whose plane array outlives the call
        unsafe { xioctl(self.fd, VIDIOC_QBUF, &mut buf) }
    }

    fn dequeue_buffer(&mut self) -> Result<u32, DequeueError> {
        let mut planes = [V4l2Plane::zeroed(); VIDEO_MAX_PLANES];
        let mut buf = V4l2Buffer::mmap_capture(0, &mut planes);
        // SAFETY: buf is a v4l2_buffer whose plane array outlives the call
        match unsafe { xioctl(self.fd, VIDIOC_DQBUF, &mut buf) } {
            Ok(()) => Ok(buf.index),
            Err(source) => Err(DequeueError {
                reported_index: buf.index,
                source,
            }),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        // SAFETY: STREAMON takes a buffer type int
        unsafe { xioctl(self.fd, VIDIOC_STREAMON, &mut buf_type) }
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        // SAFETY: STREAMOFF takes a buffer type int
        unsafe { xioctl(self.fd, VIDIOC_STREAMOFF, &mut buf_type) }
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: one valid pollfd
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match ready {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        debug!(path = %self.path, "Closing capture device");
    }
}

/// AFE control subdevice
pub struct V4l2ControlChannel {
    path: String,
    file: File,
}

impl V4l2ControlChannel {
    /// Open the subdevice read/write, non-blocking
    pub fn open(path: &str) -> CaptureResult<Self> {
        validate_char_device(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                warn!(path, errno = e.raw_os_error(), error = %e, "Cannot open subdevice");
                CaptureError::DeviceUnavailable(format!("cannot open '{}': {}", path, e))
            })?;

        debug!(path, "Opened control subdevice");
        Ok(Self {
            path: path.to_string(),
            file,
        })
    }
}

impl ControlChannel for V4l2ControlChannel {
    fn path(&self) -> &str {
        &self.path
    }

    fn apply(&mut self, control_id: u32, packet: &mut ControlPacket) -> io::Result<()> {
        let mut control = V4l2ExtControl {
            id: control_id,
            size: CTRL_PACKET_SIZE as u32,
            reserved2: [0],
            value_or_ptr: packet.as_mut_ptr() as usize as u64,
        };
        let mut controls = V4l2ExtControls {
            which: 0,
            count: 1,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: &mut control,
        };

        // SAFETY: controls points at one control whose payload is the
        // 4096-byte packet, all alive for the call
        unsafe { xioctl(self.file.as_raw_fd(), VIDIOC_S_EXT_CTRLS, &mut controls) }
    }
}
