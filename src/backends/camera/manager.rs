// SPDX-License-Identifier: GPL-3.0-only

//! Shared capture session
//!
//! The manager provides:
//! - One lock held for the whole of each session operation
//! - Cheap cloning so several threads can drive the same session

use super::capture_session::CaptureSession;
use super::{ControlChannel, FrameGeometry, FrameInfo, StreamState, StreamingDevice};
use crate::errors::CaptureResult;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Thread-safe handle on a [`CaptureSession`]
///
/// A frame wait blocks every other caller for up to the frame timeout.
pub struct SessionManager<D: StreamingDevice, C: ControlChannel> {
    session: Arc<Mutex<CaptureSession<D, C>>>,
}

impl<D: StreamingDevice, C: ControlChannel> Clone for SessionManager<D, C> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<D: StreamingDevice, C: ControlChannel> SessionManager<D, C> {
    pub fn new(session: CaptureSession<D, C>) -> Self {
        info!(driver_path = %session.driver_path(), "Creating capture session manager");
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the session
    ///
    /// A panic in another holder does not leave the session unusable: its
    /// state is only changed after each driver call succeeded.
    pub fn lock(&self) -> MutexGuard<'_, CaptureSession<D, C>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> CaptureResult<()> {
        self.lock().start()
    }

    pub fn stop(&self) -> CaptureResult<()> {
        self.lock().stop()
    }

    pub fn state(&self) -> StreamState {
        self.lock().state()
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.lock().geometry().copied()
    }

    pub fn available_frame_types(&self) -> Vec<FrameGeometry> {
        self.lock().available_frame_types()
    }

    pub fn set_frame_type(&self, geometry: &FrameGeometry) -> CaptureResult<()> {
        self.lock().set_frame_type(geometry)
    }

    pub fn get_frame(&self, output: &mut [u16]) -> CaptureResult<FrameInfo> {
        self.lock().get_frame(output)
    }

    pub fn program(&self, firmware: &[u8]) -> CaptureResult<usize> {
        self.lock().program(firmware)
    }

    pub fn read_afe_registers(&self, addresses: &[u16]) -> CaptureResult<Vec<u16>> {
        self.lock().read_afe_registers(addresses)
    }

    pub fn write_afe_registers(&self, addresses: &[u16], values: &[u16]) -> CaptureResult<()> {
        self.lock().write_afe_registers(addresses, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_device::{RecordingControlChannel, VirtualDevice};
    use std::thread;

    #[test]
    fn test_frames_from_several_threads() {
        let device = VirtualDevice::new();
        let counters = device.counters();
        let manager = SessionManager::new(CaptureSession::new(
            device,
            RecordingControlChannel::new(),
        ));
        let geometry = FrameGeometry::depth_ir();

        manager.set_frame_type(&geometry).unwrap();
        manager.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let mut output = vec![0u16; geometry.pixel_count()];
                    for _ in 0..5 {
                        manager.get_frame(&mut output).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.dequeued(), 20);
        // Initial queue of 4 plus one requeue per frame
        assert_eq!(counters.queued(), 24);
        assert_eq!(manager.lock().device().queued_indices().len(), 4);

        manager.stop().unwrap();
        assert_eq!(manager.state(), StreamState::Idle);
    }

    #[test]
    fn test_geometry_snapshot() {
        let manager = SessionManager::new(CaptureSession::new(
            VirtualDevice::new(),
            RecordingControlChannel::new(),
        ));
        assert_eq!(manager.geometry(), None);
        manager.set_frame_type(&FrameGeometry::raw()).unwrap();
        assert_eq!(manager.geometry(), Some(FrameGeometry::raw()));
        assert_eq!(manager.available_frame_types().len(), 2);
    }
}
