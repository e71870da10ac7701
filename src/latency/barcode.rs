//! Visual frame tag.
//!
//! The sequence id is drawn as a grid of black/white cells in the top-left
//! corner of the frame, row-major, wrapping at the frame width:
//!
//! ```text
//! [W][B][d47][d46] ... [d0][c7] ... [c0]
//!  guard  48 data bits MSB first, CRC-8
//! ```
//!
//! The two guard cells give the decoder a local white and black reference, so
//! thresholding survives the brightness shifts and ringing of a lossy codec.
//! Decoding only samples the centre of each cell for the same reason.

use std::sync::Arc;

use crate::error::LatencyFault;
use crate::metrics::LatencyMetrics;
use crate::video::{PixelFormat, RawFrame};

pub const GUARD_CELLS: u32 = 2;
pub const DATA_BITS: u32 = 48;
pub const CRC_BITS: u32 = 8;
pub const TOTAL_CELLS: u32 = GUARD_CELLS + DATA_BITS + CRC_BITS;

/// Largest id the barcode can carry; higher ids are truncated to 48 bits.
pub const MAX_SEQUENCE: u64 = (1 << DATA_BITS) - 1;

/// Minimum white-minus-black luma of the guard cells for a frame to count as
/// tagged at all.
pub const MIN_GUARD_CONTRAST: u8 = 64;

const WHITE: u8 = 255;
const BLACK: u8 = 0;

/// Cell placement for a given frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarcodeLayout {
    pub cell_size: u32,
    pub cells_per_row: u32,
    pub rows: u32,
}

impl BarcodeLayout {
    /// `None` when the barcode cannot fit into a `width`×`height` frame.
    pub fn new(width: u32, height: u32, cell_size: u32) -> Option<Self> {
        if cell_size == 0 {
            return None;
        }
        let cells_per_row = (width / cell_size).min(TOTAL_CELLS);
        if cells_per_row == 0 {
            return None;
        }
        let rows = TOTAL_CELLS.div_ceil(cells_per_row);
        if rows * cell_size > height {
            return None;
        }
        Some(Self { cell_size, cells_per_row, rows })
    }

    /// Top-left pixel of cell `n`.
    pub fn cell_origin(&self, n: u32) -> (u32, u32) {
        let col = n % self.cells_per_row;
        let row = n / self.cells_per_row;
        (col * self.cell_size, row * self.cell_size)
    }
}

/// CRC-8, polynomial 0x07, initial value 0.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

fn payload_bytes(id: u64) -> [u8; 6] {
    let be = (id & MAX_SEQUENCE).to_be_bytes();
    [be[2], be[3], be[4], be[5], be[6], be[7]]
}

/// Bits in cell order: guard, data, checksum.
fn cell_bits(id: u64) -> Vec<bool> {
    let payload = payload_bytes(id);
    let crc = crc8(&payload);
    let mut bits = Vec::with_capacity(TOTAL_CELLS as usize);
    bits.push(true);
    bits.push(false);
    for byte in payload.iter().chain(std::iter::once(&crc)) {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1 == 1);
        }
    }
    bits
}

/// Draw the tag for `id` into `frame`. Returns `false` if it does not fit.
pub fn stamp(frame: &mut RawFrame, id: u64, cell_size: u32) -> bool {
    let Some(layout) = BarcodeLayout::new(frame.width, frame.height, cell_size) else {
        return false;
    };
    if !frame.is_valid() {
        return false;
    }
    for (n, bit) in cell_bits(id).into_iter().enumerate() {
        let (x, y) = layout.cell_origin(n as u32);
        frame.fill_rect(x, y, cell_size, cell_size, if bit { WHITE } else { BLACK });
    }
    true
}

/// Result of reading a frame's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Tag(u64),
    /// No guard pattern: the frame was never tagged, or is too small
    Absent,
    /// Guard pattern present but the bits fail the checksum
    Corrupt,
}

impl DecodeOutcome {
    pub fn sequence_id(self) -> Option<u64> {
        match self {
            DecodeOutcome::Tag(id) => Some(id),
            _ => None,
        }
    }
}

/// Mean luma of the centre of cell `n`.
fn cell_luma(
    pixels: &[u8],
    width: u32,
    format: PixelFormat,
    layout: &BarcodeLayout,
    n: u32,
) -> u8 {
    let (x0, y0) = layout.cell_origin(n);
    let margin = layout.cell_size / 4;
    let span = (layout.cell_size - 2 * margin).max(1);
    let bpp = format.bytes_per_pixel();
    let (r, g, b) = format.rgb_offsets();

    let mut sum = 0u64;
    let mut count = 0u64;
    for y in y0 + margin..y0 + margin + span {
        for x in x0 + margin..x0 + margin + span {
            let idx = (y as usize * width as usize + x as usize) * bpp;
            let px = &pixels[idx..idx + bpp];
            sum += (77 * px[r] as u64 + 150 * px[g] as u64 + 29 * px[b] as u64) >> 8;
            count += 1;
        }
    }
    (sum / count) as u8
}

/// Read the tag out of raw pixels.
pub fn inspect(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    cell_size: u32,
) -> DecodeOutcome {
    let Some(layout) = BarcodeLayout::new(width, height, cell_size) else {
        return DecodeOutcome::Absent;
    };
    if pixels.len() < format.frame_size(width, height) {
        return DecodeOutcome::Absent;
    }

    let white = cell_luma(pixels, width, format, &layout, 0);
    let black = cell_luma(pixels, width, format, &layout, 1);
    if white < black || white - black < MIN_GUARD_CONTRAST {
        return DecodeOutcome::Absent;
    }
    let threshold = black + (white - black) / 2;

    let mut value = 0u64;
    for n in GUARD_CELLS..GUARD_CELLS + DATA_BITS + CRC_BITS {
        let bit = cell_luma(pixels, width, format, &layout, n) > threshold;
        value = (value << 1) | bit as u64;
    }
    let id = value >> CRC_BITS;
    let crc = (value & 0xff) as u8;

    if crc8(&payload_bytes(id)) == crc {
        DecodeOutcome::Tag(id)
    } else {
        DecodeOutcome::Corrupt
    }
}

/// Pure decode: the embedded sequence id, or `None` if absent or unreadable.
pub fn decode(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    cell_size: u32,
) -> Option<u64> {
    inspect(pixels, width, height, format, cell_size).sequence_id()
}

/// Frame-level decoder that counts what it could not read.
#[derive(Debug, Clone)]
pub struct TagDecoder {
    cell_size: u32,
    metrics: Arc<LatencyMetrics>,
}

impl TagDecoder {
    pub fn new(cell_size: u32, metrics: Arc<LatencyMetrics>) -> Self {
        Self { cell_size, metrics }
    }

    pub fn decode(&self, frame: &RawFrame) -> DecodeOutcome {
        let outcome = inspect(&frame.data, frame.width, frame.height, frame.format, self.cell_size);
        match outcome {
            DecodeOutcome::Tag(_) => {}
            DecodeOutcome::Absent => self.metrics.record_tag_absent(),
            DecodeOutcome::Corrupt => self.metrics.record_fault(LatencyFault::TagDecodeFailure),
        }
        outcome
    }
}
