//! Phase 2 — back-propagation.
//!
//! Walks tables 7 down to 2. For each table it marks, in a bitfield over
//! the table below, every entry still referenced by a live entry above;
//! the table itself is then rewritten compacted:
//!
//! * **table 7** is remapped in place — nothing above filters it, its f7
//!   order is already final, only its `(pos, offset)` references move to
//!   the compacted table-6 numbering;
//! * **tables 6..2** are rewritten through a [`SortManager`] keyed on the
//!   `(pos, offset)` field (sort bits begin at k), which is exactly the
//!   order phase 3's join consumes; each surviving entry gets its
//!   post-compaction f-order index as `sort_key`;
//! * **table 1** is never rewritten — it is exposed as a
//!   [`FilteredDisk`] over its phase-1 stream and the final bitfield.

use tracing::{debug, info};

use crate::bitfield::{Bitfield, BitfieldIndex};
use crate::bits::BitWriter;
use crate::disk::{BufferedDisk, Disk, FileDisk, FilteredDisk};
use crate::entry_sizes::{key_pos_offset_size, max_entry_size};
use crate::plotter::PlotterParams;
use crate::pos::OFFSET_SIZE;
use crate::sort::{SortConfig, SortManager, SortStrategy};
use crate::util::slice_u64_full;

use super::{PhaseError, ProgressFn};

/// Compacted tables handed to phase 3.
pub struct Phase2Output {
    /// Table 1: x values in compacted f1 order.
    pub table1: FilteredDisk,
    /// Table 7: `(f7, pos, offset)` in f7 order, references renumbered.
    pub table7: BufferedDisk,
    /// Tables 2..6 (index `t - 2`): `(sort_key, pos, offset)` sorted by
    /// `(pos, offset)`.
    pub tables: Vec<SortManager>,
    /// Post-compaction entry counts (index 0 unused).
    pub table_sizes: [u64; 8],
}

pub fn run(
    params: &PlotterParams,
    table_sizes: &[u64; 8],
    progress: &ProgressFn,
) -> Result<Phase2Output, PhaseError> {
    let k = params.k;
    let p2_entry_size = key_pos_offset_size(k) as u64;
    let t7_entry_size = u64::from(max_entry_size(k, 7, false));

    let mut new_sizes = *table_sizes;
    let mut next_bitfield: Option<Bitfield> = None;
    // built walking 6..2; reversed into table order at the end
    let mut rewritten: Vec<SortManager> = Vec::with_capacity(5);
    let mut table7: Option<BufferedDisk> = None;

    for t in (2..=7u8).rev() {
        let entry_size = if t == 7 { t7_entry_size } else { p2_entry_size };
        let table_size = table_sizes[t as usize];
        let mut disk = BufferedDisk::new(
            FileDisk::with_retry(params.table_path(t), false, params.retry)?,
            table_size * entry_size,
        );

        // pass 1: mark everything this table still references
        let mut current = Bitfield::new(table_sizes[t as usize - 1]);
        for i in 0..table_size {
            let view = disk.read(i * entry_size, entry_size)?;
            if t != 7 {
                match &next_bitfield {
                    Some(live) if !live.get(i) => continue,
                    _ => {}
                }
            }
            let pos_offset = slice_u64_full(view, k, k + OFFSET_SIZE);
            let pos = pos_offset >> OFFSET_SIZE;
            let offset = pos_offset & ((1 << OFFSET_SIZE) - 1);
            current.set(pos);
            current.set(pos + offset);
        }

        // pass 2: rewrite with references renumbered to the compacted
        // table below
        let index = BitfieldIndex::new(&current);
        if t == 7 {
            for i in 0..table_size {
                let view = disk.read(i * entry_size, entry_size)?;
                let f7 = slice_u64_full(view, 0, k);
                let pos_offset = slice_u64_full(view, k, k + OFFSET_SIZE);
                let (new_pos, new_offset) =
                    index.lookup(pos_offset >> OFFSET_SIZE, pos_offset & ((1 << OFFSET_SIZE) - 1));
                let mut out = BitWriter::with_capacity(entry_size as usize);
                out.push(f7, k);
                out.push(new_pos, k);
                out.push(new_offset, OFFSET_SIZE);
                disk.write(i * entry_size, &out.finish_padded(entry_size as usize))?;
            }
            disk.flush_cache()?;
            table7 = Some(disk);
        } else {
            let config = SortConfig::new(
                params.sort_memory(),
                params.log_num_buckets,
                p2_entry_size as usize,
                k,
            )
            .producer_cache(params.cache_memory())
            .strategy(SortStrategy::QuicksortLast)
            .retry(params.retry);
            let mut sort_manager = SortManager::new(
                config,
                &params.tmp_dir,
                &params.sort_stem(&format!("p2.t{t}")),
            )?;

            let live = match &next_bitfield {
                Some(live) => live,
                None => unreachable!("tables below 7 always have a liveness bitfield"),
            };
            let mut survivor = 0u64;
            for i in 0..table_size {
                let view = disk.read(i * entry_size, entry_size)?;
                if !live.get(i) {
                    continue;
                }
                let pos_offset = slice_u64_full(view, k, k + OFFSET_SIZE);
                let (new_pos, new_offset) =
                    index.lookup(pos_offset >> OFFSET_SIZE, pos_offset & ((1 << OFFSET_SIZE) - 1));
                let mut out = BitWriter::with_capacity(p2_entry_size as usize);
                out.push(survivor, k);
                out.push(new_pos, k);
                out.push(new_offset, OFFSET_SIZE);
                sort_manager.add(&out.finish_padded(p2_entry_size as usize))?;
                survivor += 1;
            }
            sort_manager.flush_cache()?;
            new_sizes[t as usize] = survivor;
            debug!(
                table = t,
                survivors = survivor,
                dropped = table_size - survivor,
                "table compacted"
            );
            rewritten.push(sort_manager);
            // the rewritten table supersedes the phase-1 stream
            disk.truncate(0)?;
        }

        next_bitfield = Some(current);
        progress(2, u64::from(8 - t), 7);
    }

    // table 1 is filtered, not rewritten
    let filter = match next_bitfield {
        Some(f) => f,
        None => unreachable!("the loop always runs"),
    };
    new_sizes[1] = filter.count(0, filter.len());
    let t1_entry_size = u64::from(max_entry_size(k, 1, false));
    let table1 = FilteredDisk::new(
        BufferedDisk::new(
            FileDisk::with_retry(params.table_path(1), false, params.retry)?,
            table_sizes[1] * t1_entry_size,
        ),
        filter,
        t1_entry_size,
    );
    progress(2, 7, 7);

    rewritten.reverse();
    let table7 = match table7 {
        Some(d) => d,
        None => unreachable!("t = 7 is always processed"),
    };
    info!(
        t1 = new_sizes[1],
        t2 = new_sizes[2],
        t3 = new_sizes[3],
        t4 = new_sizes[4],
        t5 = new_sizes[5],
        t6 = new_sizes[6],
        t7 = new_sizes[7],
        "back-propagation complete"
    );

    Ok(Phase2Output {
        table1,
        table7,
        tables: rewritten,
        table_sizes: new_sizes,
    })
}
