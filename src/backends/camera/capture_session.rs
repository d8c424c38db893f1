// SPDX-License-Identifier: GPL-3.0-only

//! Capture session state machine
//!
//! A session drives one streaming device through `Idle -> Streaming -> Idle`
//! and each buffer through the queued/dequeued cycle:
//!
//! ```text
//!   set_frame_type ──▶ [pool allocated] ──start──▶ all buffers queued
//!                                                       │
//!                 ┌──────────── get_frame ◀─────────────┘
//!                 │  wait ─▶ dequeue ─▶ unpack ─▶ requeue
//!                 └──────────────────────────────────────┘
//! ```
//!
//! The session is single-threaded. Wrap it in a
//! [`SessionManager`](super::SessionManager) to share it across threads.

use super::afe::AfeController;
use super::buffer_pool::BufferPool;
use super::format_converters::unpack_12bit;
use super::specifics::{CameraMode, DeviceSpecifics};
use super::v4l2_device::{V4l2ControlChannel, V4l2Device};
use super::{
    ControlChannel, DequeueError, FrameGeometry, FrameInfo, StreamState, StreamingDevice,
    available_frame_types, frame_type_by_name,
};
use crate::config::Config;
use crate::constants::{DEFAULT_BUFFER_COUNT, FRAME_WAIT_TIMEOUT};
use crate::errors::{CaptureError, CaptureResult};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Puts a dequeued buffer back in the driver's queue
///
/// [`RequeueGuard::finish`] requeues and reports the result. If the guard is
/// dropped without finishing (unwinding out of the unpacker) it requeues
/// anyway, logging any failure.
struct RequeueGuard<'a, D: StreamingDevice + ?Sized> {
    device: &'a mut D,
    index: u32,
    armed: bool,
}

impl<'a, D: StreamingDevice + ?Sized> RequeueGuard<'a, D> {
    fn new(device: &'a mut D, index: u32) -> Self {
        Self {
            device,
            index,
            armed: true,
        }
    }

    fn finish(mut self) -> io::Result<()> {
        self.armed = false;
        self.device.queue_buffer(self.index)
    }
}

impl<D: StreamingDevice + ?Sized> Drop for RequeueGuard<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.device.queue_buffer(self.index) {
            warn!(
                path = self.device.path(),
                index = self.index,
                errno = e.raw_os_error(),
                error = %e,
                "VIDIOC_QBUF error"
            );
        }
    }
}

/// Streaming capture session over a device and its AFE control channel
pub struct CaptureSession<D: StreamingDevice, C: ControlChannel> {
    device: D,
    control: C,
    pool: BufferPool,
    geometry: Option<FrameGeometry>,
    state: StreamState,
    buffer_count: u32,
    frame_timeout: Duration,
    specifics: DeviceSpecifics,
}

impl CaptureSession<V4l2Device, V4l2ControlChannel> {
    /// Open and validate the capture node and control subdevice named in
    /// `config`
    pub fn open(config: &Config) -> CaptureResult<Self> {
        let device = V4l2Device::open(&config.capture_device, &config.expected_card)?;
        let control = V4l2ControlChannel::open(&config.control_device)?;

        info!(
            capture = %config.capture_device,
            control = %config.control_device,
            "Capture session opened"
        );

        Ok(Self::new(device, control)
            .with_buffer_count(config.buffer_count)
            .with_frame_timeout(config.frame_timeout()))
    }
}

impl<D: StreamingDevice, C: ControlChannel> CaptureSession<D, C> {
    pub fn new(device: D, control: C) -> Self {
        Self {
            device,
            control,
            pool: BufferPool::new(),
            geometry: None,
            state: StreamState::Idle,
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_timeout: FRAME_WAIT_TIMEOUT,
            specifics: DeviceSpecifics::new(),
        }
    }

    /// Number of buffers requested per geometry
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    /// How long `get_frame` waits for a completed buffer
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Capture and control device paths joined as `capture;control`
    pub fn driver_path(&self) -> String {
        format!("{};{}", self.device.path(), self.control.path())
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }

    /// Active frame geometry, if one has been negotiated
    pub fn geometry(&self) -> Option<&FrameGeometry> {
        self.geometry.as_ref()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    /// Frame types the sensor supports
    pub fn available_frame_types(&self) -> Vec<FrameGeometry> {
        available_frame_types()
    }

    /// Queue every buffer and turn streaming on
    ///
    /// On failure the session stays idle; buffers queued before the failure
    /// are left with the driver.
    pub fn start(&mut self) -> CaptureResult<()> {
        if self.is_streaming() {
            warn!(path = self.device.path(), "Device already started");
            return Err(CaptureError::AlreadyStreaming);
        }
        if self.pool.is_empty() {
            return Err(CaptureError::InvalidArgument(
                "a frame type must be set before starting".to_string(),
            ));
        }

        for index in self.pool.buffers().map(|b| b.index()) {
            self.device.queue_buffer(index).map_err(|e| {
                warn!(path = self.device.path(), index, errno = e.raw_os_error(), error = %e, "VIDIOC_QBUF error");
                CaptureError::driver("VIDIOC_QBUF", &e)
            })?;
        }

        self.device.stream_on().map_err(|e| {
            warn!(path = self.device.path(), errno = e.raw_os_error(), error = %e, "VIDIOC_STREAMON error");
            CaptureError::driver("VIDIOC_STREAMON", &e)
        })?;

        self.state = StreamState::Streaming;
        info!(path = self.device.path(), buffers = self.pool.len(), "Streaming started");
        Ok(())
    }

    /// Turn streaming off
    pub fn stop(&mut self) -> CaptureResult<()> {
        if !self.is_streaming() {
            warn!(path = self.device.path(), "Device already stopped");
            return Err(CaptureError::NotStreaming);
        }

        self.device.stream_off().map_err(|e| {
            warn!(path = self.device.path(), errno = e.raw_os_error(), error = %e, "VIDIOC_STREAMOFF error");
            CaptureError::driver("VIDIOC_STREAMOFF", &e)
        })?;

        self.state = StreamState::Idle;
        info!(path = self.device.path(), "Streaming stopped");
        Ok(())
    }

    /// Negotiate a new frame geometry
    ///
    /// A no-op when `geometry` is already active. Otherwise the current pool
    /// is released, the format applied and a new pool allocated. Rejected
    /// while streaming. On failure the session is left with no pool and no
    /// geometry.
    pub fn set_frame_type(&mut self, geometry: &FrameGeometry) -> CaptureResult<()> {
        if self.is_streaming() {
            warn!(path = self.device.path(), %geometry, "Frame type change rejected while streaming");
            return Err(CaptureError::AlreadyStreaming);
        }
        if geometry.width == 0 || geometry.height == 0 {
            return Err(CaptureError::InvalidArgument(format!(
                "invalid frame size {}x{}",
                geometry.width, geometry.height
            )));
        }

        if self.pool.is_allocated_for(geometry) {
            debug!(%geometry, "Frame type unchanged");
            return Ok(());
        }

        self.pool.release(&mut self.device);
        self.geometry = None;

        self.device.set_format(geometry).map_err(|e| {
            warn!(
                path = self.device.path(),
                width = geometry.width,
                height = geometry.height,
                errno = e.raw_os_error(),
                error = %e,
                "Setting pixel format error"
            );
            CaptureError::driver("VIDIOC_S_FMT", &e)
        })?;

        if let Err(e) = self
            .pool
            .allocate(&mut self.device, geometry, self.buffer_count)
        {
            self.pool.release(&mut self.device);
            return Err(e);
        }

        self.geometry = Some(*geometry);
        info!(path = self.device.path(), %geometry, "Frame type set");
        Ok(())
    }

    /// Set the catalog frame type with the given name ("depth_ir" or "raw")
    pub fn set_frame_type_by_name(&mut self, name: &str) -> CaptureResult<FrameGeometry> {
        let geometry = frame_type_by_name(name)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("unknown frame type '{}'", name)))?;
        self.set_frame_type(&geometry)?;
        Ok(geometry)
    }

    /// Wait for the next frame and unpack it into `output`
    ///
    /// `output` must hold at least `width * height` samples. The dequeued
    /// buffer goes back to the driver exactly once whatever happens while
    /// unpacking.
    ///
    /// When the driver reports `EAGAIN` or `EIO` on dequeue, the frame is
    /// still read from the index it reported and
    /// [`FrameInfo::transient_errno`] is set: the buffer contents may be
    /// stale or partially written.
    pub fn get_frame(&mut self, output: &mut [u16]) -> CaptureResult<FrameInfo> {
        if !self.is_streaming() {
            return Err(CaptureError::NotStreaming);
        }
        let Some(geometry) = self.geometry else {
            return Err(CaptureError::protocol(
                "get_frame",
                "streaming without a negotiated geometry",
            ));
        };
        if output.len() < geometry.pixel_count() {
            return Err(CaptureError::InvalidArgument(format!(
                "output holds {} samples, frame needs {}",
                output.len(),
                geometry.pixel_count()
            )));
        }

        match self.device.wait_ready(self.frame_timeout) {
            Ok(true) => {}
            Ok(false) => {
                warn!(path = self.device.path(), timeout = ?self.frame_timeout, "select timeout");
                return Err(CaptureError::IoTimeout);
            }
            Err(e) => {
                warn!(path = self.device.path(), errno = e.raw_os_error(), error = %e, "select error");
                return Err(CaptureError::driver("select", &e));
            }
        }

        let (index, transient_errno) = match self.device.dequeue_buffer() {
            Ok(index) => (index, None),
            Err(DequeueError {
                reported_index,
                source,
            }) => {
                warn!(
                    path = self.device.path(),
                    errno = source.raw_os_error(),
                    error = %source,
                    "VIDIOC_DQBUF error"
                );
                match CaptureError::from_dequeue(&source) {
                    CaptureError::TransientIo { errno } => (reported_index, Some(errno)),
                    fatal => return Err(fatal),
                }
            }
        };

        let Some(buffer) = self.pool.buffer(index) else {
            warn!(path = self.device.path(), index, buffers = self.pool.len(), "Not enough buffers available");
            return Err(CaptureError::protocol(
                "VIDIOC_DQBUF",
                format!("buffer index {} outside pool of {}", index, self.pool.len()),
            ));
        };

        let guard = RequeueGuard::new(&mut self.device, index);
        let pairs_decoded = unpack_12bit(&geometry, buffer.bytes(), output);
        guard.finish().map_err(|e| {
            warn!(index, errno = e.raw_os_error(), error = %e, "VIDIOC_QBUF error");
            CaptureError::driver("VIDIOC_QBUF", &e)
        })?;

        Ok(FrameInfo {
            buffer_index: index,
            pairs_decoded,
            transient_errno,
            captured_at: Instant::now(),
        })
    }

    /// AFE register access through this session's control channel
    pub fn afe(&mut self) -> AfeController<'_, C> {
        AfeController::new(&mut self.control)
    }

    /// Push firmware bytes to the AFE
    pub fn program(&mut self, firmware: &[u8]) -> CaptureResult<usize> {
        self.afe().program(firmware)
    }

    pub fn read_afe_registers(&mut self, addresses: &[u16]) -> CaptureResult<Vec<u16>> {
        self.afe().read_registers(addresses)
    }

    pub fn write_afe_registers(&mut self, addresses: &[u16], values: &[u16]) -> CaptureResult<()> {
        self.afe().write_registers(addresses, values).map(|_| ())
    }

    /// Sensor tuning state
    pub fn specifics(&self) -> &DeviceSpecifics {
        &self.specifics
    }

    pub fn set_camera_mode(&mut self, mode: CameraMode) {
        self.specifics.set_mode(mode);
    }

    pub fn enable_noise_reduction(&mut self, enabled: bool) -> CaptureResult<()> {
        let mut afe = AfeController::new(&mut self.control);
        self.specifics.enable_noise_reduction(&mut afe, enabled)
    }

    pub fn set_noise_reduction_threshold(&mut self, threshold: u16) -> CaptureResult<()> {
        let mut afe = AfeController::new(&mut self.control);
        self.specifics.set_noise_reduction_threshold(&mut afe, threshold)
    }

    pub fn set_ir_gamma_correction(&mut self, gamma: f32) -> CaptureResult<()> {
        let mut afe = AfeController::new(&mut self.control);
        self.specifics.set_ir_gamma_correction(&mut afe, gamma)
    }
}

impl<D: StreamingDevice, C: ControlChannel> Drop for CaptureSession<D, C> {
    fn drop(&mut self) {
        if self.is_streaming()
            && let Err(e) = self.stop()
        {
            warn!(error = %e, "Failed to stop streaming on close");
        }

        self.pool.release(&mut self.device);
        debug!(driver_path = %self.driver_path(), "Closing capture session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_device::{Fault, RecordingControlChannel, VirtualDevice};

    fn session() -> CaptureSession<VirtualDevice, RecordingControlChannel> {
        CaptureSession::new(VirtualDevice::new(), RecordingControlChannel::new())
    }

    #[test]
    fn test_start_requires_frame_type() {
        let mut session = session();
        assert!(matches!(
            session.start(),
            Err(CaptureError::InvalidArgument(_))
        ));
        assert_eq!(session.state(), StreamState::Idle);
    }

    #[test]
    fn test_start_failure_stays_idle() {
        let mut session = session();
        session.set_frame_type(&FrameGeometry::raw()).unwrap();
        session.device_mut().inject(Fault::StreamOnFails(libc::EIO));

        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DriverProtocol { operation: "VIDIOC_STREAMON", .. }
        ));
        assert_eq!(session.state(), StreamState::Idle);
        // Queued buffers stay with the driver
        assert_eq!(session.device().queued_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_stop_failure_stays_streaming() {
        let mut session = session();
        session.set_frame_type(&FrameGeometry::raw()).unwrap();
        session.start().unwrap();
        session.device_mut().inject(Fault::StreamOffFails(libc::EIO));

        assert!(session.stop().is_err());
        assert!(session.is_streaming());

        session.device_mut().clear_faults();
        session.stop().unwrap();
    }

    #[test]
    fn test_format_failure_leaves_no_pool() {
        let mut session = session();
        session.set_frame_type(&FrameGeometry::raw()).unwrap();
        session.device_mut().inject(Fault::FormatFails(libc::EINVAL));

        let err = session.set_frame_type(&FrameGeometry::depth_ir()).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DriverProtocol { operation: "VIDIOC_S_FMT", .. }
        ));
        assert!(session.pool().is_empty());
        assert!(session.geometry().is_none());
    }

    #[test]
    fn test_allocation_failure_releases_partial_pool() {
        let mut session = session();
        let counters = session.device().counters();
        session.device_mut().inject(Fault::MapFailsAt(3, libc::ENOMEM));

        let err = session.set_frame_type(&FrameGeometry::depth_ir()).unwrap_err();
        assert!(matches!(err, CaptureError::MappingFailure(_)));
        assert!(session.pool().is_empty());
        assert_eq!(counters.maps(), 3);
        assert_eq!(counters.unmaps(), 3);
        assert_eq!(session.device().allocated(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut session = session();
        let geometry = FrameGeometry::new(0, 960, crate::backends::camera::FrameKind::DepthIr);
        assert!(matches!(
            session.set_frame_type(&geometry),
            Err(CaptureError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_short_output_rejected_before_wait() {
        let mut session = session();
        let counters = session.device().counters();
        session.set_frame_type(&FrameGeometry::raw()).unwrap();
        session.start().unwrap();

        let mut output = vec![0u16; 10];
        assert!(matches!(
            session.get_frame(&mut output),
            Err(CaptureError::InvalidArgument(_))
        ));
        assert_eq!(counters.waits(), 0);
    }

    #[test]
    fn test_requeue_failure_reported() {
        let mut session = session();
        session.set_frame_type(&FrameGeometry::raw()).unwrap();
        session.start().unwrap();
        session.device_mut().inject(Fault::QueueFails(libc::EINVAL));

        let mut output = vec![0u16; FrameGeometry::raw().pixel_count()];
        let err = session.get_frame(&mut output).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DriverProtocol { operation: "VIDIOC_QBUF", .. }
        ));
    }

    #[test]
    fn test_noise_reduction_through_session() {
        let channel = RecordingControlChannel::new();
        let log = channel.log();
        let mut session = CaptureSession::new(VirtualDevice::new(), channel);

        session.enable_noise_reduction(true).unwrap();
        assert!(session.specifics().noise_reduction_enabled());
        assert_eq!(log.lock().unwrap().len(), 1);

        session.set_camera_mode(CameraMode::Far);
        assert!(matches!(
            session.set_noise_reduction_threshold(10),
            Err(CaptureError::Unsupported(_))
        ));
    }

    #[test]
    fn test_driver_path() {
        let session = session();
        assert_eq!(session.driver_path(), "virtual:0;virtual:subdev");
    }

    #[test]
    fn test_drop_stops_and_unmaps() {
        let mut session = session();
        let counters = session.device().counters();
        session.set_frame_type(&FrameGeometry::depth_ir()).unwrap();
        session.start().unwrap();

        drop(session);

        assert_eq!(counters.stream_offs(), 1);
        assert_eq!(counters.unmaps(), 4);
    }
}
