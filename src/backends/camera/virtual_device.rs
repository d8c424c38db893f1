// SPDX-License-Identifier: GPL-3.0-only

//! In-memory capture device and control channel
//!
//! `VirtualDevice` behaves like a multiplanar V4L2 driver closely enough to
//! drive a [`CaptureSession`](super::CaptureSession) without hardware: it
//! rejects format changes while buffers exist, tracks which buffers are
//! queued, and empties its queue on stream off. Every call is counted in a
//! shared [`DeviceCounters`] and most calls can be made to fail with a
//! chosen errno.
//!
//! Buffer contents are synthesized at map time by packing a sample pattern
//! with [`pack_12bit`], so unpacking a dequeued buffer reproduces
//! [`VirtualDevice::expected_frame`].

use super::format_converters::pack_12bit;
use super::{
    ControlChannel, ControlPacket, DequeueError, FrameGeometry, MappedRegion, PlaneInfo,
    StreamingDevice,
};
use crate::constants::{V4L2_CID_AD_DEV_READ_REG, V4L2_CID_AD_DEV_SET_CHIP_CONFIG};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

const PAGE_SIZE: u32 = 4096;

/// Call counters shared between a virtual device, its regions and tests
#[derive(Debug, Default)]
pub struct DeviceCounters {
    formats: AtomicUsize,
    buffer_requests: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    queued: AtomicUsize,
    dequeued: AtomicUsize,
    stream_ons: AtomicUsize,
    stream_offs: AtomicUsize,
    waits: AtomicUsize,
}

impl DeviceCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Accepted format changes
    pub fn formats(&self) -> usize {
        self.formats.load(Ordering::SeqCst)
    }

    /// Non-zero buffer requests
    pub fn buffer_requests(&self) -> usize {
        self.buffer_requests.load(Ordering::SeqCst)
    }

    pub fn maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }

    /// Successful queue calls
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Dequeue calls, successful or not
    pub fn dequeued(&self) -> usize {
        self.dequeued.load(Ordering::SeqCst)
    }

    pub fn stream_ons(&self) -> usize {
        self.stream_ons.load(Ordering::SeqCst)
    }

    pub fn stream_offs(&self) -> usize {
        self.stream_offs.load(Ordering::SeqCst)
    }

    /// Readiness waits
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

/// Failure to inject into a [`VirtualDevice`]
///
/// Dequeue faults fire once; all others persist until
/// [`VirtualDevice::clear_faults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    FormatFails(i32),
    RequestFails(i32),
    QueryFails(i32),
    /// Mapping the buffer with this index fails
    MapFailsAt(u32, i32),
    /// Every unmap reports an error (the region is still released)
    UnmapFails(i32),
    QueueFails(i32),
    StreamOnFails(i32),
    StreamOffFails(i32),
    /// The next dequeue takes a buffer but reports this errno
    DequeueErrno(i32),
    /// The next dequeue takes a buffer but reports this index
    DequeueIndex(u32),
    /// Readiness waits always time out
    NeverReady,
    WaitFails(i32),
}

/// Samples written into synthesized frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// Values depend on the sample position and buffer index
    #[default]
    Gradient,
    /// Every sample has the same value
    Constant(u16),
}

impl Pattern {
    fn sample(&self, position: usize, buffer: u32) -> u16 {
        match self {
            Pattern::Gradient => ((position * 7 + buffer as usize * 131) % 4096) as u16,
            Pattern::Constant(value) => value & 0x0FFF,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    format: Option<i32>,
    request: Option<i32>,
    query: Option<i32>,
    map_at: Option<(u32, i32)>,
    unmap: Option<i32>,
    queue: Option<i32>,
    stream_on: Option<i32>,
    stream_off: Option<i32>,
    dequeue: VecDeque<Fault>,
    never_ready: bool,
    wait: Option<i32>,
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Simulated multiplanar capture driver
#[derive(Debug)]
pub struct VirtualDevice {
    path: String,
    max_buffers: u32,
    geometry: Option<FrameGeometry>,
    allocated: u32,
    queue: VecDeque<u32>,
    streaming: bool,
    pattern: Pattern,
    faults: Faults,
    counters: Arc<DeviceCounters>,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::with_max_buffers(32)
    }

    /// Device that grants at most `max_buffers` buffers per request
    pub fn with_max_buffers(max_buffers: u32) -> Self {
        Self {
            path: "virtual:0".to_string(),
            max_buffers,
            geometry: None,
            allocated: 0,
            queue: VecDeque::new(),
            streaming: false,
            pattern: Pattern::default(),
            faults: Faults::default(),
            counters: Arc::new(DeviceCounters::default()),
        }
    }

    /// Shared handle on the call counters
    pub fn counters(&self) -> Arc<DeviceCounters> {
        Arc::clone(&self.counters)
    }

    pub fn set_pattern(&mut self, pattern: Pattern) {
        self.pattern = pattern;
    }

    pub fn inject(&mut self, fault: Fault) {
        let faults = &mut self.faults;
        match fault {
            Fault::FormatFails(e) => faults.format = Some(e),
            Fault::RequestFails(e) => faults.request = Some(e),
            Fault::QueryFails(e) => faults.query = Some(e),
            Fault::MapFailsAt(index, e) => faults.map_at = Some((index, e)),
            Fault::UnmapFails(e) => faults.unmap = Some(e),
            Fault::QueueFails(e) => faults.queue = Some(e),
            Fault::StreamOnFails(e) => faults.stream_on = Some(e),
            Fault::StreamOffFails(e) => faults.stream_off = Some(e),
            Fault::DequeueErrno(_) | Fault::DequeueIndex(_) => faults.dequeue.push_back(fault),
            Fault::NeverReady => faults.never_ready = true,
            Fault::WaitFails(e) => faults.wait = Some(e),
        }
    }

    pub fn clear_faults(&mut self) {
        self.faults = Faults::default();
    }

    /// Indices currently held by the driver, in completion order
    pub fn queued_indices(&self) -> Vec<u32> {
        self.queue.iter().copied().collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Buffers currently held by the driver side
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Frame that unpacking buffer `index` yields for `geometry`
    pub fn expected_frame(&self, geometry: &FrameGeometry, index: u32) -> Vec<u16> {
        (0..geometry.pixel_count())
            .map(|position| self.pattern.sample(position, index))
            .collect()
    }

    fn plane_length(&self) -> usize {
        self.geometry.map(|g| g.packed_len()).unwrap_or(0)
    }
}

impl StreamingDevice for VirtualDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn set_format(&mut self, geometry: &FrameGeometry) -> io::Result<()> {
        if let Some(e) = self.faults.format {
            return Err(os_error(e));
        }
        if self.allocated > 0 || self.streaming {
            return Err(os_error(libc::EBUSY));
        }
        self.geometry = Some(*geometry);
        DeviceCounters::bump(&self.counters.formats);
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if let Some(e) = self.faults.request {
            return Err(os_error(e));
        }
        if self.streaming {
            return Err(os_error(libc::EBUSY));
        }

        self.queue.clear();
        if count == 0 {
            self.allocated = 0;
            return Ok(0);
        }

        DeviceCounters::bump(&self.counters.buffer_requests);
        self.allocated = count.min(self.max_buffers);
        Ok(self.allocated)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<PlaneInfo> {
        if let Some(e) = self.faults.query {
            return Err(os_error(e));
        }
        if index >= self.allocated {
            return Err(os_error(libc::EINVAL));
        }

        let length = self.plane_length();
        let stride = (length as u32).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        Ok(PlaneInfo {
            index,
            length,
            mem_offset: index * stride,
        })
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> io::Result<Box<dyn MappedRegion>> {
        if let Some((index, e)) = self.faults.map_at
            && index == plane.index
        {
            return Err(os_error(e));
        }
        let Some(geometry) = self.geometry else {
            return Err(os_error(libc::EINVAL));
        };

        let samples = self.expected_frame(&geometry, plane.index);
        let mut bytes = pack_12bit(&geometry, &samples);
        bytes.resize(plane.length, 0);

        DeviceCounters::bump(&self.counters.maps);
        Ok(Box::new(VirtualRegion {
            bytes,
            mapped: true,
            unmap_errno: self.faults.unmap,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        if let Some(e) = self.faults.queue {
            return Err(os_error(e));
        }
        if index >= self.allocated || self.queue.contains(&index) {
            return Err(os_error(libc::EINVAL));
        }
        self.queue.push_back(index);
        DeviceCounters::bump(&self.counters.queued);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<u32, DequeueError> {
        DeviceCounters::bump(&self.counters.dequeued);

        if !self.streaming {
            return Err(DequeueError {
                reported_index: 0,
                source: os_error(libc::EINVAL),
            });
        }
        let Some(index) = self.queue.pop_front() else {
            return Err(DequeueError {
                reported_index: 0,
                source: os_error(libc::EAGAIN),
            });
        };

        match self.faults.dequeue.pop_front() {
            Some(Fault::DequeueErrno(e)) => Err(DequeueError {
                reported_index: index,
                source: os_error(e),
            }),
            Some(Fault::DequeueIndex(reported)) => Ok(reported),
            _ => Ok(index),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if let Some(e) = self.faults.stream_on {
            return Err(os_error(e));
        }
        if self.allocated == 0 {
            return Err(os_error(libc::EINVAL));
        }
        self.streaming = true;
        DeviceCounters::bump(&self.counters.stream_ons);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        if let Some(e) = self.faults.stream_off {
            return Err(os_error(e));
        }
        self.streaming = false;
        self.queue.clear();
        DeviceCounters::bump(&self.counters.stream_offs);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        DeviceCounters::bump(&self.counters.waits);

        if let Some(e) = self.faults.wait {
            return Err(os_error(e));
        }
        if self.faults.never_ready || !self.streaming || self.queue.is_empty() {
            debug!(?timeout, "Virtual device not ready");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Heap-backed stand-in for a mapped plane
struct VirtualRegion {
    bytes: Vec<u8>,
    mapped: bool,
    unmap_errno: Option<i32>,
    counters: Arc<DeviceCounters>,
}

impl MappedRegion for VirtualRegion {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn unmap(&mut self) -> io::Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        DeviceCounters::bump(&self.counters.unmaps);

        match self.unmap_errno {
            Some(e) => Err(os_error(e)),
            None => Ok(()),
        }
    }
}

/// One packet sent through a [`RecordingControlChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPacket {
    pub control_id: u32,
    pub words: Vec<u16>,
    pub sent_at: Instant,
}

impl RecordedPacket {
    /// Interpret the packet as (address, value) register pairs, dropping
    /// zero padding
    pub fn register_pairs(&self) -> Vec<(u16, u16)> {
        self.words
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .filter(|&(address, value)| address != 0 || value != 0)
            .collect()
    }
}

/// Shared log of packets sent through a [`RecordingControlChannel`]
pub type ControlLog = Arc<Mutex<Vec<RecordedPacket>>>;

/// Control channel that records every packet and answers register reads
#[derive(Debug, Default)]
pub struct RecordingControlChannel {
    log: ControlLog,
    registers: HashMap<u16, u16>,
    /// (packet ordinal, errno): the nth apply call fails
    fail_at: Option<(usize, i32)>,
    calls: usize,
}

impl RecordingControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value returned when `address` is read
    pub fn with_register(mut self, address: u16, value: u16) -> Self {
        self.registers.insert(address, value);
        self
    }

    /// Fail the apply call with ordinal `call` (0-based)
    pub fn fail_at(mut self, call: usize, errno: i32) -> Self {
        self.fail_at = Some((call, errno));
        self
    }

    pub fn log(&self) -> ControlLog {
        Arc::clone(&self.log)
    }

    /// Snapshot of the packets recorded so far
    pub fn packets(&self) -> Vec<RecordedPacket> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ControlChannel for RecordingControlChannel {
    fn path(&self) -> &str {
        "virtual:subdev"
    }

    fn apply(&mut self, control_id: u32, packet: &mut ControlPacket) -> io::Result<()> {
        let call = self.calls;
        self.calls += 1;

        if let Some((at, e)) = self.fail_at
            && at == call
        {
            return Err(os_error(e));
        }

        let words = packet.to_vec();
        match control_id {
            V4L2_CID_AD_DEV_READ_REG => {
                packet[0] = self.registers.get(&packet[0]).copied().unwrap_or(0);
            }
            V4L2_CID_AD_DEV_SET_CHIP_CONFIG => {}
            _ => return Err(os_error(libc::EINVAL)),
        }

        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedPacket {
                control_id,
                words,
                sent_at: Instant::now(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rejected_while_buffers_exist() {
        let mut device = VirtualDevice::new();
        device.set_format(&FrameGeometry::raw()).unwrap();
        device.request_buffers(4).unwrap();

        let err = device.set_format(&FrameGeometry::depth_ir()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        device.request_buffers(0).unwrap();
        device.set_format(&FrameGeometry::depth_ir()).unwrap();
        assert_eq!(device.counters().formats(), 2);
    }

    #[test]
    fn test_double_queue_rejected() {
        let mut device = VirtualDevice::new();
        device.set_format(&FrameGeometry::raw()).unwrap();
        device.request_buffers(2).unwrap();

        device.queue_buffer(1).unwrap();
        assert!(device.queue_buffer(1).is_err());
        assert!(device.queue_buffer(2).is_err());
        assert_eq!(device.queued_indices(), vec![1]);
    }

    #[test]
    fn test_stream_off_drains_queue() {
        let mut device = VirtualDevice::new();
        device.set_format(&FrameGeometry::raw()).unwrap();
        device.request_buffers(2).unwrap();
        device.queue_buffer(0).unwrap();
        device.stream_on().unwrap();
        assert!(device.wait_ready(Duration::from_millis(1)).unwrap());

        device.stream_off().unwrap();
        assert!(device.queued_indices().is_empty());
        assert!(!device.wait_ready(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_dequeue_faults_fire_once() {
        let mut device = VirtualDevice::new();
        device.set_format(&FrameGeometry::raw()).unwrap();
        device.request_buffers(3).unwrap();
        for i in 0..3 {
            device.queue_buffer(i).unwrap();
        }
        device.stream_on().unwrap();
        device.inject(Fault::DequeueErrno(libc::EIO));

        let err = device.dequeue_buffer().unwrap_err();
        assert_eq!(err.reported_index, 0);
        assert_eq!(err.source.raw_os_error(), Some(libc::EIO));
        assert_eq!(device.dequeue_buffer().unwrap(), 1);
    }

    #[test]
    fn test_recording_channel_reads() {
        let mut channel = RecordingControlChannel::new().with_register(0x4001, 0x0007);
        let mut packet: ControlPacket = [0; 2048];
        packet[0] = 0x4001;

        channel.apply(V4L2_CID_AD_DEV_READ_REG, &mut packet).unwrap();
        assert_eq!(packet[0], 0x0007);

        let packets = channel.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].words[0], 0x4001);
    }

    #[test]
    fn test_register_pairs_skip_padding() {
        let mut words = vec![0u16; 2048];
        words[..4].copy_from_slice(&[0x4001, 0x0006, 0x7c22, 0x0004]);
        let packet = RecordedPacket {
            control_id: V4L2_CID_AD_DEV_SET_CHIP_CONFIG,
            words,
            sent_at: Instant::now(),
        };
        assert_eq!(
            packet.register_pairs(),
            vec![(0x4001, 0x0006), (0x7c22, 0x0004)]
        );
    }
}
