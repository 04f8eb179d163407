//! Lossy 16-bit coordinate codec.
//!
//! Coordinates are quantized to 0.001 Å steps and stored channel-major:
//! the X channel for all residues, then Y, then Z (never interleaved, so
//! the typically-correlated values of one axis sit next to each other).
//! Each channel holds a 4-byte little-endian `i32` anchor (the quantized
//! coordinate of residue 0) followed by `N-1` little-endian `i16` deltas
//! between consecutive quantized coordinates. Decoding accumulates the
//! integer deltas exactly, so quantization error never compounds: every
//! decoded coordinate is within [`MAX_QUANT_ERROR`] of the original.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{FoldscanError, Result};

/// Quantization step is 1/QUANT_SCALE Å.
const QUANT_SCALE: f32 = 1000.0;

/// Worst-case per-axis round-trip error: half a quantization step.
pub const MAX_QUANT_ERROR: f32 = 0.5 / QUANT_SCALE;

/// Exact byte length of an encoded block for `residue_count` residues.
pub fn encoded_len(residue_count: usize) -> usize {
    3 * (4 + 2 * residue_count.saturating_sub(1))
}

fn quantize(v: f32) -> i32 {
    (v * QUANT_SCALE).round() as i32
}

/// Encode CA coordinates into the channel-major 16-bit delta format.
///
/// Consecutive residues more than ~32.7 Å apart on any axis do not fit in
/// an `i16` delta and yield `Capacity` (CA-CA distances in real chains are
/// ~3.8 Å, so this only triggers on broken input).
pub fn encode(coords: &[[f32; 3]]) -> Result<Vec<u8>> {
    if coords.is_empty() {
        return Err(FoldscanError::LengthMismatch(
            "cannot encode an empty coordinate sequence".to_string(),
        ));
    }
    let mut block = Vec::with_capacity(encoded_len(coords.len()));
    for axis in 0..3 {
        let anchor = quantize(coords[0][axis]);
        block.extend_from_slice(&anchor.to_le_bytes());
        let mut prev = anchor;
        for point in &coords[1..] {
            let q = quantize(point[axis]);
            let delta = i64::from(q) - i64::from(prev);
            let delta = i16::try_from(delta).map_err(|_| {
                FoldscanError::Capacity(format!(
                    "consecutive coordinate step of {:.3} A exceeds the 16-bit delta range",
                    delta as f32 / QUANT_SCALE
                ))
            })?;
            block.extend_from_slice(&delta.to_le_bytes());
            prev = q;
        }
    }
    Ok(block)
}

/// Decode a block produced by [`encode`] back into coordinates.
///
/// The byte length must match `encoded_len(residue_count)` exactly;
/// anything else is a `Format` error rather than an out-of-bounds read.
pub fn decode(block: &[u8], residue_count: usize) -> Result<Vec<[f32; 3]>> {
    if residue_count == 0 {
        return Err(FoldscanError::LengthMismatch(
            "declared residue count is 0".to_string(),
        ));
    }
    let expected = encoded_len(residue_count);
    if block.len() != expected {
        return Err(FoldscanError::Format(format!(
            "encoded block is {} bytes, expected {} for {} residues",
            block.len(),
            expected,
            residue_count
        )));
    }

    let mut cursor = Cursor::new(block);
    let mut coords = vec![[0.0f32; 3]; residue_count];
    for axis in 0..3 {
        let mut q = cursor
            .read_i32::<LittleEndian>()
            .map_err(|e| FoldscanError::Format(format!("truncated channel anchor: {e}")))?;
        coords[0][axis] = q as f32 / QUANT_SCALE;
        for coord in coords.iter_mut().take(residue_count).skip(1) {
            let delta = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| FoldscanError::Format(format!("truncated channel delta: {e}")))?;
            q += i32::from(delta);
            coord[axis] = q as f32 / QUANT_SCALE;
        }
    }
    Ok(coords)
}
