// SPDX-License-Identifier: GPL-3.0-only

//! Packed 12-bit frame unpacking
//!
//! The driver delivers two 12-bit samples in every 3 bytes:
//! ```text
//! [E11:E4][O11:O4][O3:O0,E3:E0]
//! ```
//! Each sample is widened to 16 bits with the high byte shifted left by 4 and
//! the low nibble taken from the third byte.
//!
//! Where the decoded pairs land in the output depends on the geometry:
//!
//! - **Realigned** (width 668): pairs are written sequentially, but every
//!   336 pairs the write cursor is rewound by 4 samples. Packed rows carry
//!   672 samples of which only 668 are image data, so the rewind drops the
//!   padding and keeps rows at a 668-sample stride.
//! - **Split fields** (every other width): packed rows alternate between two
//!   sub-frames. Even rows go to the first half of the output, odd rows to
//!   the second half starting at `height * width / 2` (depth then IR).

use super::types::FrameGeometry;
use crate::constants::{
    PACKED_BYTES_PER_PAIR, REALIGN_PAIRS_PER_ROW, REALIGN_REWIND, REALIGNED_WIDTH,
};

/// Decode one packed triplet into its (even, odd) samples
#[inline]
pub fn decode_pair(triplet: &[u8]) -> (u16, u16) {
    let b0 = triplet[0] as u16;
    let b1 = triplet[1] as u16;
    let b2 = triplet[2] as u16;

    let even = (b0 << 4) | (b2 & 0x0F);
    let odd = (b1 << 4) | ((b2 & 0xF0) >> 4);
    (even, odd)
}

/// Encode an (even, odd) pair of 12-bit samples into a packed triplet
///
/// Inverse of [`decode_pair`]; used to synthesize planes.
#[inline]
pub fn encode_pair(even: u16, odd: u16) -> [u8; 3] {
    [
        (even >> 4) as u8,
        (odd >> 4) as u8,
        ((odd as u8 & 0x0F) << 4) | (even as u8 & 0x0F),
    ]
}

/// Row addressing strategy for a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAddressing {
    /// Sequential output with a rewind at every packed row boundary
    Realigned,
    /// Alternating rows split into two stacked sub-frames
    SplitFields,
}

impl RowAddressing {
    pub fn for_geometry(geometry: &FrameGeometry) -> Self {
        if geometry.width == REALIGNED_WIDTH {
            RowAddressing::Realigned
        } else {
            RowAddressing::SplitFields
        }
    }
}

/// Output cursor yielding, for each packed pair, the index of its even sample
///
/// The odd sample always lands at the following index.
#[derive(Debug, Clone)]
pub struct PairCursor {
    addressing: RowAddressing,
    width: usize,
    /// Pairs consumed so far
    pair: usize,
    /// Realigned write position
    position: usize,
    /// Split-field write positions (first field, second field)
    fields: [usize; 2],
}

impl PairCursor {
    pub fn new(geometry: &FrameGeometry) -> Self {
        Self {
            addressing: RowAddressing::for_geometry(geometry),
            width: geometry.width as usize,
            pair: 0,
            position: 0,
            fields: [0, geometry.pixel_count() / 2],
        }
    }

    /// Addressing strategy chosen for the geometry
    pub fn addressing(&self) -> RowAddressing {
        self.addressing
    }
}

impl Iterator for PairCursor {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = match self.addressing {
            RowAddressing::Realigned => {
                if self.pair != 0 && self.pair % REALIGN_PAIRS_PER_ROW == 0 {
                    self.position -= REALIGN_REWIND;
                }
                let index = self.position;
                self.position += 2;
                index
            }
            RowAddressing::SplitFields => {
                if self.width == 0 {
                    return None;
                }
                // Samples consumed so far decide which row, and so which field
                let samples = self.pair * 2;
                let field = (samples / self.width) % 2;
                let index = self.fields[field];
                self.fields[field] += 2;
                index
            }
        };

        self.pair += 1;
        Some(index)
    }
}

/// Number of packed pairs covering a geometry
pub fn pair_count(geometry: &FrameGeometry) -> usize {
    geometry.packed_len().div_ceil(PACKED_BYTES_PER_PAIR)
}

/// Unpack a packed 12-bit plane into `output`
///
/// `output` should hold `geometry.pixel_count()` samples. Malformed input is
/// not an error: decoding stops when the plane runs out of whole triplets,
/// and samples whose computed position falls outside `output` are skipped.
///
/// Returns the number of pairs decoded.
pub fn unpack_12bit(geometry: &FrameGeometry, packed: &[u8], output: &mut [u16]) -> usize {
    let mut cursor = PairCursor::new(geometry);
    let mut decoded = 0;

    for triplet in packed
        .chunks_exact(PACKED_BYTES_PER_PAIR)
        .take(pair_count(geometry))
    {
        let Some(index) = cursor.next() else {
            break;
        };

        let (even, odd) = decode_pair(triplet);
        if let Some(slot) = output.get_mut(index) {
            *slot = even;
        }
        if let Some(slot) = output.get_mut(index + 1) {
            *slot = odd;
        }
        decoded += 1;
    }

    decoded
}

/// Pack 12-bit samples into a plane laid out for `geometry`
///
/// Inverse of [`unpack_12bit`] for the positions the cursor visits. Used by
/// the virtual device to synthesize driver output.
pub fn pack_12bit(geometry: &FrameGeometry, samples: &[u16]) -> Vec<u8> {
    let pairs = pair_count(geometry);
    let mut packed = Vec::with_capacity(pairs * PACKED_BYTES_PER_PAIR);

    for index in PairCursor::new(geometry).take(pairs) {
        let even = samples.get(index).copied().unwrap_or(0);
        let odd = samples.get(index + 1).copied().unwrap_or(0);
        packed.extend_from_slice(&encode_pair(even, odd));
    }

    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::FrameKind;

    #[test]
    fn test_decode_pair() {
        // even = 0xABC, odd = 0x123
        let (even, odd) = decode_pair(&[0xAB, 0x12, 0x3C]);
        assert_eq!(even, 0xABC);
        assert_eq!(odd, 0x123);
    }

    #[test]
    fn test_decode_pair_nibbles() {
        let (even, odd) = decode_pair(&[0x00, 0x00, 0xF0]);
        assert_eq!(even, 0x000);
        assert_eq!(odd, 0x00F);

        let (even, odd) = decode_pair(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(even, 0xFFF);
        assert_eq!(odd, 0xFFF);
    }

    #[test]
    fn test_encode_matches_decode() {
        for (even, odd) in [(0u16, 0u16), (0xFFF, 0x001), (0x5A5, 0xA5A), (0x800, 0x7FF)] {
            assert_eq!(decode_pair(&encode_pair(even, odd)), (even, odd));
        }
    }

    #[test]
    fn test_addressing_selection() {
        assert_eq!(
            RowAddressing::for_geometry(&FrameGeometry::raw()),
            RowAddressing::Realigned
        );
        assert_eq!(
            RowAddressing::for_geometry(&FrameGeometry::depth_ir()),
            RowAddressing::SplitFields
        );
        // Width decides, not kind
        let odd_raw = FrameGeometry::new(640, 4, FrameKind::Raw);
        assert_eq!(RowAddressing::for_geometry(&odd_raw), RowAddressing::SplitFields);
    }

    #[test]
    fn test_cursor_reports_addressing() {
        assert_eq!(
            PairCursor::new(&FrameGeometry::raw()).addressing(),
            RowAddressing::Realigned
        );
        let mut cursor = PairCursor::new(&FrameGeometry::depth_ir());
        assert_eq!(cursor.addressing(), RowAddressing::SplitFields);
        // Advancing does not change the strategy
        cursor.nth(400);
        assert_eq!(cursor.addressing(), RowAddressing::SplitFields);
    }

    #[test]
    fn test_realigned_cursor_rewinds() {
        let geometry = FrameGeometry::raw();
        let indices: Vec<usize> = PairCursor::new(&geometry).take(700).collect();

        assert_eq!(indices[0], 0);
        assert_eq!(indices[335], 670);
        // Row boundary: 672 - 4
        assert_eq!(indices[336], 668);
        assert_eq!(indices[671], 668 + 335 * 2);
        assert_eq!(indices[672], 1336);
    }

    #[test]
    fn test_split_cursor_alternates_rows() {
        let geometry = FrameGeometry::new(4, 4, FrameKind::DepthIr);
        let indices: Vec<usize> = PairCursor::new(&geometry).take(8).collect();
        // Row 0 -> field 0, row 1 -> field 1 (starts at 8), ...
        assert_eq!(indices, vec![0, 2, 8, 10, 4, 6, 12, 14]);
    }

    #[test]
    fn test_unpack_zero_plane() {
        let geometry = FrameGeometry::new(8, 4, FrameKind::DepthIr);
        let packed = vec![0u8; geometry.packed_len()];
        let mut output = vec![0xFFFFu16; geometry.pixel_count()];

        let decoded = unpack_12bit(&geometry, &packed, &mut output);

        assert_eq!(decoded, 16);
        assert!(output.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_unpack_short_plane_stops() {
        let geometry = FrameGeometry::new(8, 4, FrameKind::DepthIr);
        let packed = vec![0x11u8; 7];
        let mut output = vec![0u16; geometry.pixel_count()];

        assert_eq!(unpack_12bit(&geometry, &packed, &mut output), 2);
        assert_eq!(output[0], 0x111);
        assert_eq!(output[3], 0x111);
        assert_eq!(output[4], 0);
    }

    #[test]
    fn test_unpack_small_output_does_not_panic() {
        let geometry = FrameGeometry::depth_ir();
        let packed = vec![0x22u8; geometry.packed_len()];
        let mut output = vec![0u16; 16];

        let decoded = unpack_12bit(&geometry, &packed, &mut output);
        assert_eq!(decoded, pair_count(&geometry));
        assert!(output.iter().all(|&v| v == 0x222));
    }

    #[test]
    fn test_pack_unpack_split_fields() {
        let geometry = FrameGeometry::new(6, 4, FrameKind::DepthIr);
        let samples: Vec<u16> = (0..geometry.pixel_count() as u16).map(|v| v * 37 % 4096).collect();

        let packed = pack_12bit(&geometry, &samples);
        assert_eq!(packed.len(), geometry.packed_len());

        let mut output = vec![0u16; geometry.pixel_count()];
        unpack_12bit(&geometry, &packed, &mut output);
        assert_eq!(output, samples);
    }
}
