//! Phase 4 — checkpoint tables.
//!
//! Streams the `(f7, pos)` pairs phase 3 left sorted by f7 and writes the
//! final table 7 plus the three-level checkpoint structure:
//!
//! * **P7 parks** — the positions, packed `k + 1` bits each, park by park;
//! * **C1** — every 10 000th f7 value, so a verifier can binary-search a
//!   challenge to the right C3 park;
//! * **C2** — every 10 000th C1 value, small enough to keep in memory
//!   while proving;
//! * **C3** — per C1 interval, the unary-coded deltas of consecutive f7
//!   values (f7 is dense, so deltas are mostly 0 and 1).
//!
//! Both C1 and C2 end with a zero sentinel entry. Pointer slots 7..10 and
//! the end-of-file offset complete the header.

use tracing::info;

use crate::bits::BitWriter;
use crate::disk::{Disk, FileDisk};
use crate::encoding::encode_c3;
use crate::entry_sizes::{
    c3_size, p7_park_size, CHECKPOINT_1_INTERVAL, CHECKPOINT_2_INTERVAL, ENTRIES_PER_PARK,
};
use crate::plotter::{write_table_pointer, PlotterParams};
use crate::util::{byte_align, cdiv, slice_u64_full};

use super::{PhaseError, ProgressFn, MAX_PHASE4_PROGRESS_UPDATES};

/// Returns the final file size in bytes.
pub fn run(
    params: &PlotterParams,
    tmp2_disk: &mut FileDisk,
    res3: super::phase3::Phase3Output,
    progress: &ProgressFn,
) -> Result<u64, PhaseError> {
    let k = params.k;
    let count = res3.final_entries_written;
    let mut table7_sm = res3.table7_sm;
    let mut pointers = res3.final_table_begin_pointers;
    let header_size = res3.header_size;

    let entry_size = u64::from(cdiv(2 * k + 1, 8));
    let f7_bytes = u64::from(byte_align(k) / 8);
    let p7_size = u64::from(p7_park_size(k));
    let c3_bytes = u64::from(c3_size(k));

    let p7_parks = count.div_ceil(u64::from(ENTRIES_PER_PARK)).max(1);
    let c1_entries = count.div_ceil(u64::from(CHECKPOINT_1_INTERVAL));
    let c2_entries = c1_entries.div_ceil(u64::from(CHECKPOINT_2_INTERVAL));

    let begin_c1 = pointers[7] + p7_parks * p7_size;
    let begin_c2 = begin_c1 + (c1_entries + 1) * f7_bytes;
    let begin_c3 = begin_c2 + (c2_entries + 1) * f7_bytes;
    let end_byte = begin_c3 + c1_entries * c3_bytes;
    pointers[8] = begin_c1;
    pointers[9] = begin_c2;
    pointers[10] = begin_c3;
    pointers[11] = end_byte;

    let progress_interval = (count / MAX_PHASE4_PROGRESS_UPDATES).max(1);
    let mut c2_values: Vec<u64> = Vec::new();
    let mut park = BitWriter::with_capacity(p7_size as usize);
    let mut parks_written = 0u64;
    let mut c1_written = 0u64;
    let mut c3_written = 0u64;
    let mut deltas: Vec<u64> = Vec::with_capacity(CHECKPOINT_1_INTERVAL as usize);
    let mut prev_f7 = 0u64;

    for i in 0..count {
        let view = table7_sm.read(i * entry_size, entry_size)?;
        let f7 = slice_u64_full(view, 0, k);
        let pos = slice_u64_full(view, k, k + 1);

        // P7 parks
        park.push(pos, k + 1);
        if (i + 1) % u64::from(ENTRIES_PER_PARK) == 0 {
            let bytes = std::mem::take(&mut park).finish_padded(p7_size as usize);
            tmp2_disk.write(pointers[7] + parks_written * p7_size, &bytes);
            parks_written += 1;
            park = BitWriter::with_capacity(p7_size as usize);
        }

        // checkpoints
        if i % u64::from(CHECKPOINT_1_INTERVAL) == 0 {
            if i > 0 {
                let c3 = encode_c3(k, &deltas)?;
                tmp2_disk.write(begin_c3 + c3_written * c3_bytes, &c3);
                c3_written += 1;
                deltas.clear();
            }
            write_f7(tmp2_disk, begin_c1 + c1_written * f7_bytes, f7, k);
            c1_written += 1;
            if (i / u64::from(CHECKPOINT_1_INTERVAL)) % u64::from(CHECKPOINT_2_INTERVAL) == 0 {
                c2_values.push(f7);
            }
        } else {
            deltas.push(f7 - prev_f7);
        }
        prev_f7 = f7;

        if i % progress_interval == 0 {
            progress(4, i / progress_interval, MAX_PHASE4_PROGRESS_UPDATES);
        }
    }

    // flush the partial P7 park and the final C3 interval
    if park.bit_len() > 0 || parks_written == 0 {
        let bytes = park.finish_padded(p7_size as usize);
        tmp2_disk.write(pointers[7] + parks_written * p7_size, &bytes);
        parks_written += 1;
    }
    if !deltas.is_empty() || (count > 0 && c3_written < c1_entries) {
        let c3 = encode_c3(k, &deltas)?;
        tmp2_disk.write(begin_c3 + c3_written * c3_bytes, &c3);
        c3_written += 1;
    }

    // sentinels and the in-memory C2 list
    write_f7(tmp2_disk, begin_c1 + c1_written * f7_bytes, 0, k);
    for (j, &value) in c2_values.iter().enumerate() {
        write_f7(tmp2_disk, begin_c2 + j as u64 * f7_bytes, value, k);
    }
    write_f7(tmp2_disk, begin_c2 + c2_values.len() as u64 * f7_bytes, 0, k);

    for slot in 7..=10 {
        write_table_pointer(tmp2_disk, header_size, slot, pointers[slot]);
    }

    drop(table7_sm);
    info!(
        p7_parks = parks_written,
        c1 = c1_written,
        c2 = c2_values.len(),
        c3 = c3_written,
        final_size = end_byte,
        "checkpoint tables written"
    );
    progress(4, MAX_PHASE4_PROGRESS_UPDATES, MAX_PHASE4_PROGRESS_UPDATES);
    Ok(end_byte)
}

/// Write one f7 checkpoint value: k bits, MSB-aligned in `ceil(k/8)`
/// bytes.
fn write_f7(disk: &mut FileDisk, offset: u64, f7: u64, k: u32) {
    let mut w = BitWriter::with_capacity(8);
    w.push(f7, k);
    disk.write(offset, &w.finish_padded((byte_align(k) / 8) as usize));
}
