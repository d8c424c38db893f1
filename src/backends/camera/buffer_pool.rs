// SPDX-License-Identifier: GPL-3.0-only

//! Pool of memory-mapped capture buffers
//!
//! The pool exclusively owns every mapping. While a buffer is queued the
//! driver may write into it, but the mapping itself never leaves the pool.
//! Buffers are kept in driver index order so `buffers[i].index() == i`.

use super::{FrameGeometry, MappedRegion, StreamingDevice};
use crate::errors::{CaptureError, CaptureResult};
use tracing::{debug, info, warn};

/// One mapped capture buffer
pub struct MappedBuffer {
    index: u32,
    length: usize,
    region: Box<dyn MappedRegion>,
}

impl MappedBuffer {
    /// Buffer ordinal assigned by the driver
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Plane length in bytes
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Packed plane bytes
    pub fn bytes(&self) -> &[u8] {
        self.region.as_bytes()
    }

    /// Address of the mapping
    pub fn address(&self) -> usize {
        self.region.address()
    }
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MappedBuffer(index {}, {} bytes @ {:#x})",
            self.index,
            self.length,
            self.address()
        )
    }
}

/// Fixed set of mapped buffers for one geometry
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<MappedBuffer>,
    geometry: Option<FrameGeometry>,
    buffer_length: usize,
    /// Buffers the driver granted, mapped or not
    driver_buffers: u32,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Geometry the pool was allocated for
    pub fn geometry(&self) -> Option<&FrameGeometry> {
        self.geometry.as_ref()
    }

    /// Per-buffer byte length shared by every buffer in the pool
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    pub fn buffer(&self, index: u32) -> Option<&MappedBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.buffers.iter()
    }

    /// Whether the pool already holds buffers for `geometry`
    pub fn is_allocated_for(&self, geometry: &FrameGeometry) -> bool {
        !self.buffers.is_empty() && self.geometry.as_ref() == Some(geometry)
    }

    /// Request, query and map `count` buffers for `geometry`
    ///
    /// A no-op when the pool already holds buffers for the same geometry.
    /// On a per-buffer failure the buffers mapped so far stay in the pool;
    /// the caller tears them down with [`BufferPool::release`].
    pub fn allocate<D>(
        &mut self,
        device: &mut D,
        geometry: &FrameGeometry,
        count: u32,
    ) -> CaptureResult<usize>
    where
        D: StreamingDevice + ?Sized,
    {
        if self.is_allocated_for(geometry) {
            debug!(%geometry, buffers = self.len(), "Buffer pool already allocated");
            return Ok(self.len());
        }

        if !self.is_empty() || self.driver_buffers > 0 {
            return Err(CaptureError::InvalidArgument(
                "buffer pool must be released before reallocation".to_string(),
            ));
        }

        let granted = device.request_buffers(count).map_err(|e| {
            warn!(path = device.path(), errno = e.raw_os_error(), error = %e, "VIDIOC_REQBUFS error");
            CaptureError::driver("VIDIOC_REQBUFS", &e)
        })?;
        self.driver_buffers = granted;

        if granted == 0 {
            return Err(CaptureError::protocol(
                "VIDIOC_REQBUFS",
                "driver granted no buffers",
            ));
        }

        for index in 0..granted {
            let plane = device.query_buffer(index).map_err(|e| {
                warn!(path = device.path(), index, errno = e.raw_os_error(), error = %e, "VIDIOC_QUERYBUF error");
                CaptureError::driver("VIDIOC_QUERYBUF", &e)
            })?;

            if index == 0 {
                self.buffer_length = plane.length;
            } else if plane.length != self.buffer_length {
                return Err(CaptureError::protocol(
                    "VIDIOC_QUERYBUF",
                    format!(
                        "buffer {} has length {}, expected {}",
                        index, plane.length, self.buffer_length
                    ),
                ));
            }

            let region = device.map_plane(&plane).map_err(|e| {
                warn!(path = device.path(), index, errno = e.raw_os_error(), error = %e, "mmap error");
                CaptureError::MappingFailure(format!("buffer {}: {}", index, e))
            })?;

            debug!(index, length = plane.length, address = region.address(), "Mapped capture buffer");

            self.buffers.push(MappedBuffer {
                index,
                length: plane.length,
                region,
            });
        }

        self.geometry = Some(*geometry);

        info!(
            %geometry,
            buffers = self.len(),
            buffer_length = self.buffer_length,
            "Buffer pool allocated"
        );
        Ok(self.len())
    }

    /// Unmap every buffer and return the driver's buffers
    ///
    /// Failures are logged and never abort the teardown: the pool is always
    /// empty afterwards. Returns the number of buffers that were mapped.
    pub fn release<D>(&mut self, device: &mut D) -> usize
    where
        D: StreamingDevice + ?Sized,
    {
        let released = self.buffers.len();

        for mut buffer in self.buffers.drain(..) {
            if let Err(e) = buffer.region.unmap() {
                warn!(
                    path = device.path(),
                    index = buffer.index,
                    errno = e.raw_os_error(),
                    error = %e,
                    "munmap error"
                );
            }
        }

        if self.driver_buffers > 0 {
            if let Err(e) = device.request_buffers(0) {
                warn!(path = device.path(), errno = e.raw_os_error(), error = %e, "Failed to free driver buffers");
            }
            self.driver_buffers = 0;
        }

        self.geometry = None;
        self.buffer_length = 0;

        if released > 0 {
            debug!(released, "Buffer pool released");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_device::{Fault, VirtualDevice};
    use std::sync::{Arc, Mutex};

    fn formatted(geometry: &FrameGeometry) -> VirtualDevice {
        let mut device = VirtualDevice::new();
        device.set_format(geometry).unwrap();
        device
    }

    #[test]
    fn test_allocate_and_release() {
        let geometry = FrameGeometry::depth_ir();
        let mut device = formatted(&geometry);
        let counters = device.counters();
        let mut pool = BufferPool::new();

        let count = pool.allocate(&mut device, &geometry, 4).unwrap();
        assert_eq!(count, 4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.buffer_length(), geometry.packed_len());
        for (i, buffer) in pool.buffers().enumerate() {
            assert_eq!(buffer.index() as usize, i);
            assert_eq!(buffer.len(), geometry.packed_len());
        }

        assert_eq!(pool.release(&mut device), 4);
        assert_eq!(pool.len(), 0);
        assert!(pool.geometry().is_none());
        assert_eq!(counters.maps(), 4);
        assert_eq!(counters.unmaps(), 4);
    }

    #[test]
    fn test_same_geometry_is_noop() {
        let geometry = FrameGeometry::raw();
        let mut device = formatted(&geometry);
        let counters = device.counters();
        let mut pool = BufferPool::new();

        pool.allocate(&mut device, &geometry, 4).unwrap();
        let addresses: Vec<usize> = pool.buffers().map(|b| b.address()).collect();

        assert_eq!(pool.allocate(&mut device, &geometry, 4).unwrap(), 4);
        let again: Vec<usize> = pool.buffers().map(|b| b.address()).collect();

        assert_eq!(addresses, again);
        assert_eq!(counters.maps(), 4);
        assert_eq!(counters.buffer_requests(), 1);
    }

    #[test]
    fn test_reallocate_requires_release() {
        let mut device = formatted(&FrameGeometry::raw());
        let mut pool = BufferPool::new();

        pool.allocate(&mut device, &FrameGeometry::raw(), 4).unwrap();
        let err = pool
            .allocate(&mut device, &FrameGeometry::depth_ir(), 4)
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument(_)));
        assert_eq!(pool.geometry(), Some(&FrameGeometry::raw()));
    }

    #[test]
    fn test_partial_mapping_failure() {
        let mut device = formatted(&FrameGeometry::depth_ir());
        device.inject(Fault::MapFailsAt(2, libc::ENOMEM));
        let counters = device.counters();
        let mut pool = BufferPool::new();

        let err = pool
            .allocate(&mut device, &FrameGeometry::depth_ir(), 4)
            .unwrap_err();
        assert!(matches!(err, CaptureError::MappingFailure(_)));
        assert_eq!(pool.len(), 2);
        assert!(pool.geometry().is_none());

        assert_eq!(pool.release(&mut device), 2);
        assert_eq!(counters.unmaps(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_survives_unmap_failure() {
        let mut device = formatted(&FrameGeometry::depth_ir());
        device.inject(Fault::UnmapFails(libc::EINVAL));
        let counters = device.counters();
        let mut pool = BufferPool::new();

        pool.allocate(&mut device, &FrameGeometry::depth_ir(), 4).unwrap();
        assert_eq!(pool.release(&mut device), 4);
        assert_eq!(counters.unmaps(), 4);
        assert!(pool.is_empty());
        assert_eq!(pool.buffer_length(), 0);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unmap_failure_logs_device_path() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut device = formatted(&FrameGeometry::raw());
        device.inject(Fault::UnmapFails(libc::EINVAL));
        let mut pool = BufferPool::new();
        pool.allocate(&mut device, &FrameGeometry::raw(), 2).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            pool.release(&mut device);
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warnings: Vec<&str> = output.lines().filter(|l| l.contains("munmap error")).collect();
        assert_eq!(warnings.len(), 2, "{output}");
        assert!(warnings.iter().all(|l| l.contains("virtual:0")), "{output}");
    }

    #[test]
    fn test_driver_grants_fewer_buffers() {
        let mut device = VirtualDevice::with_max_buffers(2);
        device.set_format(&FrameGeometry::depth_ir()).unwrap();
        let mut pool = BufferPool::new();

        assert_eq!(
            pool.allocate(&mut device, &FrameGeometry::depth_ir(), 4).unwrap(),
            2
        );
    }
}
