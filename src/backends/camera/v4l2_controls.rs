// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 multiplanar streaming and extended-control ioctl definitions
//!
//! Mirrors the structures from `include/uapi/linux/videodev2.h` that the
//! capture session needs. ioctl numbers are derived from the structure sizes
//! so they stay correct on both 32-bit and 64-bit targets.

use std::io;
use std::os::unix::io::RawFd;

// ===== ioctl number encoding =====
// (dir << 30) | (size << 16) | ('V' << 8) | nr, dir: 1=WRITE, 2=READ

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;
const V4L2_IOC_TYPE: libc::c_ulong = b'V' as libc::c_ulong;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (V4L2_IOC_TYPE << 8) | nr
}

const fn iow<T>(nr: libc::c_ulong) -> libc::c_ulong {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: libc::c_ulong) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

pub const VIDIOC_S_FMT: libc::c_ulong = iowr::<V4l2Format>(5);
pub const VIDIOC_REQBUFS: libc::c_ulong = iowr::<V4l2RequestBuffers>(8);
pub const VIDIOC_QUERYBUF: libc::c_ulong = iowr::<V4l2Buffer>(9);
pub const VIDIOC_QBUF: libc::c_ulong = iowr::<V4l2Buffer>(15);
pub const VIDIOC_DQBUF: libc::c_ulong = iowr::<V4l2Buffer>(17);
pub const VIDIOC_STREAMON: libc::c_ulong = iow::<libc::c_int>(18);
pub const VIDIOC_STREAMOFF: libc::c_ulong = iow::<libc::c_int>(19);
pub const VIDIOC_S_EXT_CTRLS: libc::c_ulong = iowr::<V4l2ExtControls>(72);

// ===== Enumerations =====

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const VIDEO_MAX_PLANES: usize = 8;

// ===== Structures =====

/// Per-plane format (`struct v4l2_plane_pix_format`)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

/// Multiplanar pixel format (`struct v4l2_pix_format_mplane`)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// Format union; `_align` gives it the pointer alignment of the kernel union
#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix_mp: V4l2PixFormatMplane,
    pub raw_data: [u8; 200],
    _align: [libc::c_ulong; 0],
}

/// `struct v4l2_format`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

/// `struct v4l2_requestbuffers`
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2PlaneM {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

/// `struct v4l2_plane`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: V4l2PlaneM,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut V4l2Plane,
    pub fd: i32,
}

/// `struct v4l2_buffer`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

/// `struct v4l2_ext_control` (packed in the kernel header)
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    /// Union: value (i32/i64) or payload pointer
    pub value_or_ptr: u64,
}

/// `struct v4l2_ext_controls`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut V4l2ExtControl,
}

// ===== Constructors =====

impl V4l2Format {
    /// Multiplanar capture format request for the given frame size
    ///
    /// The pixel format stays zero so the driver keeps its packed sensor
    /// format and only the frame size changes.
    pub fn capture_mplane(width: u32, height: u32) -> Self {
        // SAFETY: all-zero is a valid bit pattern for these plain C structs
        let (mut fmt, mut pix_mp): (V4l2Format, V4l2PixFormatMplane) =
            unsafe { (std::mem::zeroed(), std::mem::zeroed()) };
        pix_mp.width = width;
        pix_mp.height = height;
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        fmt.fmt.pix_mp = pix_mp;
        fmt
    }
}

impl V4l2RequestBuffers {
    pub fn mmap_capture(count: u32) -> Self {
        Self {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        }
    }
}

impl V4l2Plane {
    pub fn zeroed() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct
        unsafe { std::mem::zeroed() }
    }
}

impl V4l2Buffer {
    /// Single-plane mmap capture buffer descriptor pointing at `planes`
    ///
    /// The caller keeps `planes` alive for as long as the descriptor is
    /// passed to the driver.
    pub fn mmap_capture(index: u32, planes: &mut [V4l2Plane; VIDEO_MAX_PLANES]) -> Self {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf.m = V4l2BufferM {
            planes: planes.as_mut_ptr(),
        };
        buf.length = 1;
        buf
    }
}

/// Issue an ioctl, retrying only when interrupted by a signal
///
/// # Safety
/// `arg` must point to a value of the type the request expects.
pub unsafe fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    loop {
        // SAFETY: forwarded from the caller's contract
        let result = unsafe { libc::ioctl(fd, request as _, arg) };
        if result != -1 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}
