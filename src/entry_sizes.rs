//! Per-table, per-phase record widths and final-file geometry.
//!
//! Every table entry is bit-packed; the byte width an entry occupies
//! depends on which table it belongs to and whether the pipeline is still
//! in forward propagation (metadata attached) or past it (metadata
//! dropped). Sizing the *maximum* width a table ever needs lets tables be
//! rewritten over themselves without running out of room.
//!
//! Park geometry is fixed per `(k, table)` so the final file is random-
//! accessible by park index.

use crate::pos::{EXTRA_BITS, OFFSET_SIZE, VECTOR_LENS};
use crate::util::{byte_align, cdiv};

/// Entries per park in the final file.
pub const ENTRIES_PER_PARK: u32 = 2048;

/// Stub width is `k - STUB_MINUS_BITS` bits.
pub const STUB_MINUS_BITS: u32 = 2;

/// Delta-budget ceilings, in average bits per park entry.
pub const MAX_AVERAGE_DELTA_TABLE1: f64 = 5.6;
pub const MAX_AVERAGE_DELTA: f64 = 4.4;

/// C3 budget in average bits per f7 delta.
pub const C3_BITS_PER_ENTRY: f64 = 2.4;

/// f7 values per C1 checkpoint, and C1 values per C2 checkpoint.
pub const CHECKPOINT_1_INTERVAL: u32 = 10_000;
pub const CHECKPOINT_2_INTERVAL: u32 = 10_000;

/// Largest byte width an entry of `table` takes during (`phase_1` = true)
/// or after forward propagation.
pub fn max_entry_size(k: u32, table: u8, phase_1: bool) -> u32 {
    match table {
        1 => {
            if phase_1 {
                // f1, x
                byte_align(k + EXTRA_BITS + k) / 8
            } else {
                // x alone; f1 is spent once matching is done
                byte_align(k) / 8
            }
        }
        2..=6 => {
            if phase_1 {
                // f, pos, offset, metadata
                byte_align(k + EXTRA_BITS + k + OFFSET_SIZE + k * VECTOR_LENS[table as usize + 1])
                    / 8
            } else {
                // either (sort_key, pos, offset) or (line_point, sort_key)
                byte_align((2 * k + OFFSET_SIZE).max(3 * k - 1)) / 8
            }
        }
        _ => {
            // f7, pos, offset; later (line_point, f7)
            byte_align(3 * k - 1) / 8
        }
    }
}

/// Width of a `(sort_key, pos, offset)` record.
pub fn key_pos_offset_size(k: u32) -> u32 {
    cdiv(2 * k + OFFSET_SIZE, 8)
}

/// Bytes of the park's leading full line point.
pub fn line_point_size(k: u32) -> u32 {
    byte_align(2 * k) / 8
}

/// Bytes of the park's stub section.
pub fn stubs_size(k: u32) -> u32 {
    byte_align((ENTRIES_PER_PARK - 1) * (k - STUB_MINUS_BITS)) / 8
}

/// Bytes reserved for the park's encoded deltas (the budget depends only
/// on the table, not on k).
pub fn max_deltas_size(_k: u32, table: u8) -> u32 {
    let budget = if table == 1 {
        MAX_AVERAGE_DELTA_TABLE1
    } else {
        MAX_AVERAGE_DELTA
    };
    byte_align((f64::from(ENTRIES_PER_PARK - 1) * budget) as u32) / 8
}

/// Fixed park width for `(k, table)`.
pub fn park_size(k: u32, table: u8) -> u32 {
    line_point_size(k) + stubs_size(k) + max_deltas_size(k, table)
}

/// Fixed C3 park width.
pub fn c3_size(k: u32) -> u32 {
    if k < 20 {
        byte_align(8 * CHECKPOINT_1_INTERVAL) / 8
    } else {
        byte_align((C3_BITS_PER_ENTRY * f64::from(CHECKPOINT_1_INTERVAL)) as u32) / 8
    }
}

/// Fixed width of a final table-7 park: `ENTRIES_PER_PARK` packed
/// `(k + 1)`-bit positions.
pub fn p7_park_size(k: u32) -> u32 {
    byte_align((k + 1) * ENTRIES_PER_PARK) / 8
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
