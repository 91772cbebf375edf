//! Final-file encodings: line points, delta codes, parks, checkpoints.
//!
//! Once back-propagation has eliminated dead entries, a table's two
//! back-pointers `(x, y)` are folded into a single **line point** — the
//! unordered-pair index `C(max(x,y), 2) + min(x,y)` — and the table is
//! re-sorted by it. Consecutive line points are then close together, and a
//! **park** of [`ENTRIES_PER_PARK`](crate::entry_sizes::ENTRIES_PER_PARK)
//! entries stores one full line point plus per-entry deltas split into
//! fixed-width *stubs* (the low `k - 2` delta bits) and a variable-length
//! code for the high bits.
//!
//! The variable-length code is Rice coding: quotient in unary, remainder
//! in `r` fixed bits. Parks use `r = 2`; the C3 checkpoint parks, whose f7
//! deltas are mostly 0 and 1, use plain unary (`r = 0`). Each park's
//! encoded deltas must fit the fixed budget from
//! [`entry_sizes`](crate::entry_sizes), so parks stay random-accessible by
//! index.
//!
//! # Wire details
//!
//! Every multi-byte integer in the file is big-endian **except** the
//! two-byte park deltas length, which is little-endian. The C3 length
//! prefix is big-endian. Both are load-bearing format facts.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::bits::BitWriter;
use crate::entry_sizes::{
    c3_size, line_point_size, max_deltas_size, park_size, stubs_size, STUB_MINUS_BITS,
};
use crate::util::{slice_u128, slice_u64_full};

/// Rice remainder width for park deltas.
pub const PARK_RICE_BITS: u32 = 2;

/// Rice remainder width for C3 f7 deltas (plain unary).
pub const C3_RICE_BITS: u32 = 0;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors from the final-file encoders and decoders.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The encoded deltas do not fit the fixed budget. Indicates a
    /// pathological delta distribution (or corrupt input on decode).
    #[error("encoded deltas ({got} B) exceed the fixed budget ({budget} B)")]
    DeltasOverflow { got: usize, budget: usize },

    /// A delta stream ended before yielding the expected value count.
    #[error("delta stream ended after {decoded} of {expected} values")]
    UnexpectedEnd { decoded: usize, expected: usize },
}

// ------------------------------------------------------------------------------------------------
// Line points
// ------------------------------------------------------------------------------------------------

/// Number of unordered pairs strictly below `x`: `C(x, 2)`.
#[inline]
fn x_enc(x: u64) -> u128 {
    u128::from(x) * u128::from(x.wrapping_sub(1)) / 2
}

/// Fold an unordered pair of k-bit values into its line point:
/// `C(max, 2) + min`. A bijection from unordered pairs onto the
/// non-negative integers.
#[inline]
pub fn square_to_line_point(x: u64, y: u64) -> u128 {
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    x_enc(hi) + u128::from(lo)
}

/// Invert [`square_to_line_point`]; returns `(max, min)`.
pub fn line_point_to_square(line_point: u128) -> (u64, u64) {
    // binary-search the largest x with C(x, 2) <= line_point
    let mut x = 0u64;
    for i in (0..64).rev() {
        let candidate = x + (1u64 << i);
        if x_enc(candidate) <= line_point {
            x = candidate;
        }
    }
    (x, (line_point - x_enc(x)) as u64)
}

// ------------------------------------------------------------------------------------------------
// Rice coding
// ------------------------------------------------------------------------------------------------

/// Append `value` as a unary quotient (`q` ones, one zero) plus `r`
/// remainder bits.
fn rice_push(out: &mut BitWriter, value: u64, r: u32) {
    let mut q = value >> r;
    while q >= 32 {
        out.push(u64::from(u32::MAX), 32);
        q -= 32;
    }
    // remaining one-bits and the terminating zero
    out.push(((1u64 << q) - 1) << 1, q as u32 + 1);
    if r > 0 {
        out.push(value & ((1u64 << r) - 1), r);
    }
}

/// Encode a delta sequence into packed bytes.
pub fn rice_encode(deltas: &[u64], r: u32) -> Vec<u8> {
    let mut out = BitWriter::with_capacity(deltas.len());
    for &d in deltas {
        rice_push(&mut out, d, r);
    }
    out.finish()
}

/// Decode `count` deltas from `bytes`.
pub fn rice_decode(bytes: &[u8], r: u32, count: usize) -> Result<Vec<u64>, EncodingError> {
    let total_bits = bytes.len() * 8;
    let mut out = Vec::with_capacity(count);
    let mut bit = 0usize;
    for i in 0..count {
        let mut q = 0u64;
        loop {
            if bit >= total_bits {
                return Err(EncodingError::UnexpectedEnd {
                    decoded: i,
                    expected: count,
                });
            }
            let one = bytes[bit / 8] >> (7 - bit % 8) & 1;
            bit += 1;
            if one == 0 {
                break;
            }
            q += 1;
        }
        let mut rem = 0u64;
        if r > 0 {
            if bit + r as usize > total_bits {
                return Err(EncodingError::UnexpectedEnd {
                    decoded: i,
                    expected: count,
                });
            }
            for _ in 0..r {
                rem = rem << 1 | u64::from(bytes[bit / 8] >> (7 - bit % 8) & 1);
                bit += 1;
            }
        }
        out.push(q << r | rem);
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Parks
// ------------------------------------------------------------------------------------------------

/// Serialize one park. `stubs` and `deltas` run in parallel: entry `i + 1`
/// reconstructs as `previous + (deltas[i] << (k - 2) | stubs[i])`. Both
/// may be shorter than `ENTRIES_PER_PARK - 1` for the final, partial park.
///
/// Returns exactly [`park_size`]`(k, table)` bytes.
pub fn encode_park(
    k: u32,
    table: u8,
    first_line_point: u128,
    stubs: &[u64],
    deltas: &[u64],
) -> Result<Vec<u8>, EncodingError> {
    debug_assert_eq!(stubs.len(), deltas.len());
    let lp_bytes = line_point_size(k) as usize;
    let stub_bytes = stubs_size(k) as usize;
    let budget = max_deltas_size(k, table) as usize - 2;
    let total = park_size(k, table) as usize;

    let mut park = Vec::with_capacity(total);

    let mut lp = BitWriter::with_capacity(lp_bytes);
    lp.push_u128(first_line_point, 2 * k);
    park.extend_from_slice(&lp.finish_padded(lp_bytes));

    let stub_bits = k - STUB_MINUS_BITS;
    let mut packed = BitWriter::with_capacity(stub_bytes);
    for &stub in stubs {
        debug_assert!(stub < 1u64 << stub_bits);
        packed.push(stub, stub_bits);
    }
    park.extend_from_slice(&packed.finish_padded(stub_bytes));

    let encoded = rice_encode(deltas, PARK_RICE_BITS);
    if encoded.len() > budget {
        return Err(EncodingError::DeltasOverflow {
            got: encoded.len(),
            budget,
        });
    }
    park.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
    park.extend_from_slice(&encoded);
    park.resize(total, 0);
    Ok(park)
}

/// Recover `entries` line points from one park.
pub fn decode_park(
    k: u32,
    table: u8,
    park: &[u8],
    entries: usize,
) -> Result<Vec<u128>, EncodingError> {
    debug_assert_eq!(park.len(), park_size(k, table) as usize);
    debug_assert!(entries >= 1);
    // padded copy so bit slicing may overrun freely
    let mut buf = Vec::with_capacity(park.len() + 7);
    buf.extend_from_slice(park);
    buf.resize(park.len() + 7, 0);

    let lp_bytes = line_point_size(k) as usize;
    let stub_bytes = stubs_size(k) as usize;
    let stub_bits = k - STUB_MINUS_BITS;

    let mut out = Vec::with_capacity(entries);
    let mut lp = slice_u128(&buf, 0, 2 * k);
    out.push(lp);

    let deltas_off = lp_bytes + stub_bytes;
    let deltas_len = usize::from(u16::from_le_bytes([park[deltas_off], park[deltas_off + 1]]));
    let deltas = rice_decode(
        &park[deltas_off + 2..deltas_off + 2 + deltas_len],
        PARK_RICE_BITS,
        entries - 1,
    )?;

    for (i, &delta) in deltas.iter().enumerate() {
        let stub = slice_u64_full(&buf, (lp_bytes * 8) as u32 + i as u32 * stub_bits, stub_bits);
        lp += u128::from(delta << stub_bits | stub);
        out.push(lp);
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// C3 checkpoint parks
// ------------------------------------------------------------------------------------------------

/// Serialize one C3 park: `[2 B big-endian length][unary-coded f7 deltas]`
/// padded to [`c3_size`]`(k)` bytes.
pub fn encode_c3(k: u32, deltas: &[u64]) -> Result<Vec<u8>, EncodingError> {
    let total = c3_size(k) as usize;
    let encoded = rice_encode(deltas, C3_RICE_BITS);
    if encoded.len() + 2 > total {
        return Err(EncodingError::DeltasOverflow {
            got: encoded.len() + 2,
            budget: total,
        });
    }
    let mut park = Vec::with_capacity(total);
    park.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    park.extend_from_slice(&encoded);
    park.resize(total, 0);
    Ok(park)
}

/// Recover `count` f7 deltas from one C3 park.
pub fn decode_c3(park: &[u8], count: usize) -> Result<Vec<u64>, EncodingError> {
    let len = usize::from(u16::from_be_bytes([park[0], park[1]]));
    rice_decode(&park[2..2 + len], C3_RICE_BITS, count)
}
