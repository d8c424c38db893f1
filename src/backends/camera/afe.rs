// SPDX-License-Identifier: GPL-3.0-only

//! AFE programming over the extended-control channel
//!
//! Every transfer is one 4096-byte packet applied with `VIDIOC_S_EXT_CTRLS`.
//! Packets are built per call; nothing is shared between calls.

use super::{ControlChannel, ControlPacket};
use crate::constants::{
    CTRL_PACKET_DELAY, CTRL_PACKET_SIZE, CTRL_PACKET_WORDS, CTRL_PAIRS_PER_PACKET,
    V4L2_CID_AD_DEV_READ_REG, V4L2_CID_AD_DEV_SET_CHIP_CONFIG,
};
use crate::errors::{CaptureError, CaptureResult};
use std::time::Duration;
use tracing::{debug, warn};

fn empty_packet() -> ControlPacket {
    [0u16; CTRL_PACKET_WORDS]
}

/// Fill a packet from up to 4096 firmware bytes, zero padding the rest
///
/// Bytes are taken as native-endian 16-bit words, the layout the driver
/// reads from its payload.
fn firmware_packet(chunk: &[u8]) -> ControlPacket {
    let mut packet = empty_packet();
    for (word, bytes) in packet.iter_mut().zip(chunk.chunks(2)) {
        let low = bytes[0];
        let high = bytes.get(1).copied().unwrap_or(0);
        *word = u16::from_ne_bytes([low, high]);
    }
    packet
}

/// Register-level access to the analog front-end
pub struct AfeController<'a, C: ControlChannel + ?Sized> {
    channel: &'a mut C,
    packet_delay: Duration,
}

impl<'a, C: ControlChannel + ?Sized> AfeController<'a, C> {
    pub fn new(channel: &'a mut C) -> Self {
        Self {
            channel,
            packet_delay: CTRL_PACKET_DELAY,
        }
    }

    /// Override the pause between consecutive firmware packets
    pub fn with_packet_delay(mut self, delay: Duration) -> Self {
        self.packet_delay = delay;
        self
    }

    fn send(&mut self, control_id: u32, packet: &mut ControlPacket) -> CaptureResult<()> {
        self.channel.apply(control_id, packet).map_err(|e| {
            warn!(
                path = self.channel.path(),
                control_id = format_args!("{:#x}", control_id),
                errno = e.raw_os_error(),
                error = %e,
                "Programming AFE error"
            );
            CaptureError::driver("VIDIOC_S_EXT_CTRLS", &e)
        })
    }

    /// Push firmware or configuration bytes to the AFE
    ///
    /// Payloads that fit in one packet go out in a single zero-padded
    /// packet. Larger payloads are split into 4096-byte packets with a short
    /// pause between consecutive packets. Returns the number of packets sent.
    pub fn program(&mut self, firmware: &[u8]) -> CaptureResult<usize> {
        if firmware.is_empty() {
            return Err(CaptureError::InvalidArgument(
                "firmware payload is empty".to_string(),
            ));
        }

        let mut sent = 0;
        for chunk in firmware.chunks(CTRL_PACKET_SIZE) {
            if sent > 0 {
                std::thread::sleep(self.packet_delay);
            }
            let mut packet = firmware_packet(chunk);
            self.send(V4L2_CID_AD_DEV_SET_CHIP_CONFIG, &mut packet)?;
            sent += 1;
        }

        debug!(bytes = firmware.len(), packets = sent, "AFE programmed");
        Ok(sent)
    }

    /// Write `values[i]` to `addresses[i]`
    ///
    /// Pairs are packed as interleaved (address, value) words, 1024 pairs per
    /// packet, sent back to back. Returns the number of packets sent.
    pub fn write_registers(&mut self, addresses: &[u16], values: &[u16]) -> CaptureResult<usize> {
        if addresses.len() != values.len() {
            return Err(CaptureError::InvalidArgument(format!(
                "{} register addresses but {} values",
                addresses.len(),
                values.len()
            )));
        }

        let mut sent = 0;
        for (address_chunk, value_chunk) in addresses
            .chunks(CTRL_PAIRS_PER_PACKET)
            .zip(values.chunks(CTRL_PAIRS_PER_PACKET))
        {
            let mut packet = empty_packet();
            for (slot, (&address, &value)) in packet
                .chunks_exact_mut(2)
                .zip(address_chunk.iter().zip(value_chunk))
            {
                slot[0] = address;
                slot[1] = value;
            }
            self.send(V4L2_CID_AD_DEV_SET_CHIP_CONFIG, &mut packet)?;
            sent += 1;
        }

        debug!(registers = addresses.len(), packets = sent, "AFE registers written");
        Ok(sent)
    }

    /// Read the value of each register in `addresses`
    pub fn read_registers(&mut self, addresses: &[u16]) -> CaptureResult<Vec<u16>> {
        let mut values = Vec::with_capacity(addresses.len());

        for &address in addresses {
            let mut packet = empty_packet();
            packet[0] = address;
            self.send(V4L2_CID_AD_DEV_READ_REG, &mut packet)?;
            values.push(packet[0]);
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_device::RecordingControlChannel;

    #[test]
    fn test_program_single_packet() {
        let mut channel = RecordingControlChannel::new();
        let firmware = [0x01u8, 0x02, 0x03];

        let sent = AfeController::new(&mut channel).program(&firmware).unwrap();
        assert_eq!(sent, 1);

        let packets = channel.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].control_id, V4L2_CID_AD_DEV_SET_CHIP_CONFIG);
        assert_eq!(packets[0].words[0], u16::from_ne_bytes([0x01, 0x02]));
        assert_eq!(packets[0].words[1], u16::from_ne_bytes([0x03, 0x00]));
        assert!(packets[0].words[2..].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_program_exact_packet_is_single() {
        let mut channel = RecordingControlChannel::new();
        let firmware = vec![0xAAu8; CTRL_PACKET_SIZE];

        assert_eq!(AfeController::new(&mut channel).program(&firmware).unwrap(), 1);
    }

    #[test]
    fn test_program_chunks_with_delay() {
        let mut channel = RecordingControlChannel::new();
        let firmware = vec![0x55u8; CTRL_PACKET_SIZE * 2 + 10];
        let delay = Duration::from_millis(2);

        let sent = AfeController::new(&mut channel)
            .with_packet_delay(delay)
            .program(&firmware)
            .unwrap();
        assert_eq!(sent, 3);

        let packets = channel.packets();
        // Tail packet carries 10 bytes, zero padded
        assert_eq!(packets[2].words[4], 0x5555);
        assert_eq!(packets[2].words[5], 0);
        for pair in packets.windows(2) {
            assert!(pair[1].sent_at.duration_since(pair[0].sent_at) >= delay);
        }
    }

    #[test]
    fn test_program_rejects_empty() {
        let mut channel = RecordingControlChannel::new();
        let err = AfeController::new(&mut channel).program(&[]).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument(_)));
        assert!(channel.packets().is_empty());
    }

    #[test]
    fn test_program_stops_on_failure() {
        let mut channel = RecordingControlChannel::new().fail_at(1, libc::EIO);
        let firmware = vec![0u8; CTRL_PACKET_SIZE * 3];

        let err = AfeController::new(&mut channel)
            .with_packet_delay(Duration::ZERO)
            .program(&firmware)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DriverProtocol { errno, .. } if errno == libc::EIO
        ));
        assert_eq!(channel.packets().len(), 1);
    }

    #[test]
    fn test_write_registers_packs_pairs() {
        let mut channel = RecordingControlChannel::new();
        let addresses: Vec<u16> = (0..1500).map(|i| 0x1000 + i as u16).collect();
        let values: Vec<u16> = (0..1500).map(|i| i as u16 + 1).collect();

        let sent = AfeController::new(&mut channel)
            .write_registers(&addresses, &values)
            .unwrap();
        assert_eq!(sent, 2);

        let packets = channel.packets();
        let first = packets[0].register_pairs();
        assert_eq!(first.len(), CTRL_PAIRS_PER_PACKET);
        assert_eq!(first[0], (0x1000, 1));
        let second = packets[1].register_pairs();
        assert_eq!(second.len(), 1500 - CTRL_PAIRS_PER_PACKET);
        assert_eq!(second[0], (0x1000 + 1024, 1025));
    }

    #[test]
    fn test_write_registers_not_throttled() {
        let mut channel = RecordingControlChannel::new();
        let addresses = vec![0x4001u16; CTRL_PAIRS_PER_PACKET * 3];
        let values = vec![0x0006u16; CTRL_PAIRS_PER_PACKET * 3];
        let delay = Duration::from_secs(1);

        let sent = AfeController::new(&mut channel)
            .with_packet_delay(delay)
            .write_registers(&addresses, &values)
            .unwrap();
        assert_eq!(sent, 3);

        let packets = channel.packets();
        let elapsed = packets[2].sent_at.duration_since(packets[0].sent_at);
        assert!(elapsed < delay, "register packets paused for {elapsed:?}");
    }

    #[test]
    fn test_write_registers_length_mismatch() {
        let mut channel = RecordingControlChannel::new();
        let err = AfeController::new(&mut channel)
            .write_registers(&[0x4001, 0x7c22], &[6])
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument(_)));
    }

    #[test]
    fn test_read_registers() {
        let mut channel = RecordingControlChannel::new()
            .with_register(0x0112, 0x5931)
            .with_register(0x0113, 0x0002);

        let values = AfeController::new(&mut channel)
            .read_registers(&[0x0112, 0x0113, 0x0114])
            .unwrap();
        assert_eq!(values, vec![0x5931, 0x0002, 0x0000]);

        let packets = channel.packets();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.control_id == V4L2_CID_AD_DEV_READ_REG));
    }
}
