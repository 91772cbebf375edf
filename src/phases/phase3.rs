//! Phase 3 — compression to line-point order.
//!
//! For each table pair `(t, t+1)`, two passes:
//!
//! 1. **Join.** Stream table t+1 in `(pos, offset)` order while streaming
//!    the values of table t in the order its positions are numbered
//!    (table 1: filtered x's; later: the previous iteration's
//!    `(sort_key, new_pos)` stream, whose index *is* the sort key the
//!    positions reference). A small ring of recent left values suffices
//!    because offsets are bounded by the 10-bit field. Each right entry
//!    folds its two resolved values into a line point, emitted with its
//!    sort key into a line-point-keyed sort.
//! 2. **Park writing.** Drain that sort; the stream index becomes the
//!    entry's final position. Consecutive line points are grouped into
//!    parks and written to the plot file; `(sort_key, new_pos)` pairs are
//!    emitted for the next iteration, sorted back into f order.
//!
//! Table 7 is special twice: it first needs a transient re-sort by `pos`
//! (its file is in f7 order), and its `(f7, new_pos)` stream is not
//! consumed here but handed to phase 4.

use tracing::{debug, info};

use crate::bits::BitWriter;
use crate::disk::{Disk, DiskError, FileDisk};
use crate::encoding::{encode_park, square_to_line_point};
use crate::entry_sizes::{key_pos_offset_size, max_entry_size, park_size, ENTRIES_PER_PARK,
    STUB_MINUS_BITS};
use crate::plotter::{write_table_pointer, PlotterParams};
use crate::pos::OFFSET_SIZE;
use crate::sort::{SortConfig, SortManager, SortStrategy};
use crate::util::{cdiv, slice_u128, slice_u64_full};

use super::{PhaseError, ProgressFn};

/// Ring capacity for resolved left values. Offsets are < 2^10, so this
/// look-back is ample.
const CACHED_POSITIONS: usize = 4096;

/// What phase 4 needs to build the checkpoint tables.
pub struct Phase3Output {
    /// Slots 1..7 are table starts, 8..10 the C tables, 11 end-of-file;
    /// 8..11 are filled by phase 4.
    pub final_table_begin_pointers: [u64; 12],
    /// Entries in table 7.
    pub final_entries_written: u64,
    /// `(f7, new_pos)` sorted by f7.
    pub table7_sm: SortManager,
    pub header_size: u64,
}

pub fn run(
    params: &PlotterParams,
    tmp2_disk: &mut FileDisk,
    res2: super::phase2::Phase2Output,
    header_size: u64,
    progress: &ProgressFn,
) -> Result<Phase3Output, PhaseError> {
    let k = params.k;
    let p2_entry_size = u64::from(key_pos_offset_size(k));
    let t7_entry_size = u64::from(max_entry_size(k, 7, false));
    // [line_point: 2k-1][sort_key: k]
    let lp_entry_size = u64::from(max_entry_size(k, 7, false));
    // [sort_key: k][new_pos: k+1]
    let idx_entry_size = u64::from(cdiv(2 * k + 1, 8));
    let stub_bits = k - STUB_MINUS_BITS;

    let table_sizes = res2.table_sizes;
    let mut table1 = Some(res2.table1);
    let mut table7 = res2.table7;
    let mut right_tables = res2.tables;
    let mut left_idx: Option<SortManager> = None;

    let mut pointers = [0u64; 12];
    pointers[1] = header_size;
    write_table_pointer(tmp2_disk, header_size, 1, pointers[1]);

    for t in 1..=6u8 {
        let left_size = table_sizes[t as usize];
        let right_size = table_sizes[t as usize + 1];
        let right_entry_size = if t == 6 { t7_entry_size } else { p2_entry_size };
        debug!(table = t, left_size, right_size, "compressing table pair");

        // ---- obtain the right table in (pos, offset) order ---------------------------------

        let mut right: SortManager = if t < 6 {
            right_tables.remove(0)
        } else {
            // table 7 sits in f7 order; re-sort it by pos for the join
            let config = SortConfig::new(
                params.sort_memory(),
                params.log_num_buckets,
                t7_entry_size as usize,
                k,
            )
            .producer_cache(params.cache_memory())
            .strategy(SortStrategy::QuicksortLast)
            .retry(params.retry);
            let mut pos_sort = SortManager::new(
                config,
                &params.tmp_dir,
                &params.sort_stem("p3.t7pos"),
            )?;
            for i in 0..right_size {
                let view = table7.read(i * t7_entry_size, t7_entry_size)?;
                pos_sort.add(&view[..t7_entry_size as usize])?;
            }
            pos_sort.flush_cache()?;
            table7.truncate(0)?;
            pos_sort
        };

        // ---- pass 1: join and fold into line points ----------------------------------------

        let mut lp_sort = SortManager::new(
            SortConfig::new(
                params.sort_memory(),
                params.log_num_buckets,
                lp_entry_size as usize,
                0,
            )
            .producer_cache(params.cache_memory())
            .strategy(SortStrategy::QuicksortLast)
            .retry(params.retry),
            &params.tmp_dir,
            &params.sort_stem(&format!("p3.t{}", t + 1)),
        )?;

        {
            let (left, left_entry_size, value_offset, value_bits): (&mut dyn Disk, u64, u32, u32) =
                match (&mut table1, &mut left_idx) {
                    (Some(t1), _) if t == 1 => (t1, u64::from(max_entry_size(k, 1, false)), 0, k),
                    (_, Some(sm)) => (sm, idx_entry_size, k, k + 1),
                    _ => unreachable!("left stream exists for every iteration"),
                };

            let mut ring = vec![0u64; CACHED_POSITIONS];
            let mut left_read = 0u64;
            for r_idx in 0..right_size {
                let view = right.read(r_idx * right_entry_size, right_entry_size)?;
                let sort_key = slice_u64_full(view, 0, k);
                let pos = slice_u64_full(view, k, k);
                let offset = slice_u64_full(view, 2 * k, OFFSET_SIZE);

                while left_read <= pos + offset {
                    debug_assert!(left_read < left_size);
                    ring[(left_read as usize) % CACHED_POSITIONS] =
                        read_value(left, left_read, left_entry_size, value_offset, value_bits)?;
                    left_read += 1;
                }
                let e1 = ring[(pos as usize) % CACHED_POSITIONS];
                let e2 = ring[((pos + offset) as usize) % CACHED_POSITIONS];

                let mut out = BitWriter::with_capacity(lp_entry_size as usize);
                out.push_u128(square_to_line_point(e1, e2), 2 * k - 1);
                out.push(sort_key, k);
                lp_sort.add(&out.finish_padded(lp_entry_size as usize))?;
            }
        }
        lp_sort.flush_cache()?;
        drop(right);
        if t == 1 {
            if let Some(mut t1) = table1.take() {
                t1.truncate(0)?;
            }
        } else {
            left_idx = None;
        }

        // ---- pass 2: write parks, renumber by line-point order -----------------------------

        let mut next_idx = SortManager::new(
            SortConfig::new(
                params.sort_memory(),
                params.log_num_buckets,
                idx_entry_size as usize,
                0,
            )
            .producer_cache(params.cache_memory())
            .strategy(SortStrategy::QuicksortLast)
            .retry(params.retry),
            &params.tmp_dir,
            &params.sort_stem(&format!("p3s.t{}", t + 1)),
        )?;

        let this_park_size = u64::from(park_size(k, t));
        let table_start = pointers[t as usize];
        let mut first_line_point = 0u128;
        let mut prev_line_point = 0u128;
        let mut stubs: Vec<u64> = Vec::with_capacity(ENTRIES_PER_PARK as usize);
        let mut deltas: Vec<u64> = Vec::with_capacity(ENTRIES_PER_PARK as usize);
        let mut parks_written = 0u64;

        for idx in 0..right_size {
            let byte_pos = idx * lp_entry_size;
            if lp_sort.close_to_new_bucket(byte_pos) {
                lp_sort.trigger_new_bucket(byte_pos)?;
            }
            let view = lp_sort.read(byte_pos, lp_entry_size)?;
            let line_point = slice_u128(view, 0, 2 * k - 1);
            let sort_key = slice_u64_full(view, 2 * k - 1, k);

            if idx % u64::from(ENTRIES_PER_PARK) == 0 {
                if idx > 0 {
                    let park = encode_park(k, t, first_line_point, &stubs, &deltas)?;
                    tmp2_disk.write(table_start + parks_written * this_park_size, &park);
                    parks_written += 1;
                    stubs.clear();
                    deltas.clear();
                }
                first_line_point = line_point;
            } else {
                let gap = line_point - prev_line_point;
                stubs.push((gap & ((1u128 << stub_bits) - 1)) as u64);
                deltas.push((gap >> stub_bits) as u64);
            }
            prev_line_point = line_point;

            let mut out = BitWriter::with_capacity(idx_entry_size as usize);
            out.push(sort_key, k);
            out.push(idx, k + 1);
            next_idx.add(&out.finish_padded(idx_entry_size as usize))?;
        }
        if right_size > 0 {
            let park = encode_park(k, t, first_line_point, &stubs, &deltas)?;
            tmp2_disk.write(table_start + parks_written * this_park_size, &park);
            parks_written += 1;
        }
        drop(lp_sort);
        next_idx.flush_cache()?;
        left_idx = Some(next_idx);

        pointers[t as usize + 1] = table_start + parks_written * this_park_size;
        write_table_pointer(tmp2_disk, header_size, t as usize + 1, pointers[t as usize + 1]);
        info!(table = t, parks = parks_written, "park table written");
        progress(3, u64::from(t), 6);
    }

    let table7_sm = match left_idx.take() {
        Some(sm) => sm,
        None => unreachable!("iteration 6 always produces the f7 index"),
    };

    Ok(Phase3Output {
        final_table_begin_pointers: pointers,
        final_entries_written: table_sizes[7],
        table7_sm,
        header_size,
    })
}

fn read_value(
    disk: &mut dyn Disk,
    index: u64,
    entry_size: u64,
    bit_offset: u32,
    bits: u32,
) -> Result<u64, DiskError> {
    let view = disk.read(index * entry_size, entry_size)?;
    Ok(slice_u64_full(view, bit_offset, bits))
}
