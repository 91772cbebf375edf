//! Phase 1 — forward propagation.
//!
//! Evaluates all seven tables. F1 seeds table 1 straight from the ChaCha8
//! keystream; each later table is produced by streaming the previous one
//! in f-sorted order, finding matches between adjacent BC-groups, and
//! mixing every matched pair through Fx. Each table's entries go through
//! a [`SortManager`] keyed on the f output, so the next iteration (and
//! phase 2) consumes it sorted.
//!
//! While table t+1 is being produced, table t is also *condensed* to its
//! `<name>.table{t}.tmp` stream: the f value and metadata are dropped and
//! the entry's position in f order becomes its `sort_key`. Dead entries
//! are not known yet — phase 2 eliminates them.
//!
//! Fx evaluation of each stripe's matches fans out across the configured
//! worker threads; all sort-manager mutation stays on the driver thread
//! between stripes.

use std::thread;

use tracing::{debug, info, warn};

use crate::bits::BitWriter;
use crate::disk::{BufferedDisk, Disk, FileDisk};
use crate::entry_sizes::{key_pos_offset_size, max_entry_size};
use crate::plotter::PlotterParams;
use crate::pos::f1::F1;
use crate::pos::fx::{Fx, Matcher, Metadata};
use crate::pos::{bucket_id, EXTRA_BITS, OFFSET_SIZE, VECTOR_LENS};
use crate::sort::{SortConfig, SortManager};
use crate::util::slice_u64_full;

use super::{PhaseError, ProgressFn};

/// Phase-1 output: entry counts per table (index 0 unused).
pub struct Phase1Output {
    pub table_sizes: [u64; 8],
}

/// One match pending Fx evaluation.
#[derive(Clone, Copy)]
struct MatchJob {
    y: u64,
    meta_left: Metadata,
    meta_right: Metadata,
    pos: u64,
    offset: u64,
}

/// One BC-group of the left stream, buffered for matching.
#[derive(Default)]
struct Group {
    id: u64,
    first_index: u64,
    ys: Vec<u64>,
    metas: Vec<Metadata>,
}

impl Group {
    fn reset(&mut self, id: u64, first_index: u64) {
        self.id = id;
        self.first_index = first_index;
        self.ys.clear();
        self.metas.clear();
    }
}

pub fn run(params: &PlotterParams, progress: &ProgressFn) -> Result<Phase1Output, PhaseError> {
    let k = params.k;
    let mut table_sizes = [0u64; 8];

    // ---- table 1: f1 over all x ----------------------------------------------------------------

    let t1_entry_size = max_entry_size(k, 1, true) as usize;
    let mut l_sort = SortManager::new(
        sort_config(params, t1_entry_size),
        &params.tmp_dir,
        &params.sort_stem("p1.t1"),
    )?;

    let f1 = F1::new(k, &params.id);
    for (x, y) in f1.iter(0, 1u64 << k) {
        let mut entry = BitWriter::with_capacity(t1_entry_size);
        entry.push(y, k + EXTRA_BITS);
        entry.push(x, k);
        l_sort.add(&entry.finish_padded(t1_entry_size))?;
    }
    l_sort.flush_cache()?;
    table_sizes[1] = 1u64 << k;
    info!(entries = table_sizes[1], "table 1 computed");
    progress(1, 0, 6);

    // ---- tables 2..7: match and mix ------------------------------------------------------------

    for t in 1..=6u8 {
        let left_count = table_sizes[t as usize];
        let left_entry_size = max_entry_size(k, t, true) as usize;
        let right_table = t + 1;
        let right_entry_size = max_entry_size(k, right_table, true) as usize;
        let left_meta_bits = k * VECTOR_LENS[right_table as usize];
        let left_meta_offset = if t == 1 {
            k + EXTRA_BITS
        } else {
            k + EXTRA_BITS + k + OFFSET_SIZE
        };

        let fx = Fx::new(k, right_table);
        let mut matcher = Matcher::new();
        let mut r_sort = SortManager::new(
            sort_config(params, right_entry_size),
            &params.tmp_dir,
            &params.sort_stem(&format!("p1.t{right_table}")),
        )?;

        // condensed left stream, rewritten in f-sorted order; tables 2..6
        // shrink to (sort_key, pos, offset)
        let left_out_size = if t == 1 {
            u64::from(max_entry_size(k, 1, false))
        } else {
            u64::from(key_pos_offset_size(k))
        };
        let mut left_out = BufferedDisk::new(
            FileDisk::with_retry(params.table_path(t), true, params.retry)?,
            0,
        );

        let mut prev = Group::default();
        let mut cur = Group::default();
        let mut jobs: Vec<MatchJob> = Vec::with_capacity(params.stripe_size as usize + 1024);
        let mut right_count = 0u64;
        let mut dropped_offsets = 0u64;
        let mut dropped_overflow = 0u64;

        for index in 0..left_count {
            let view = l_sort.read(index * left_entry_size as u64, left_entry_size as u64)?;
            let y = slice_u64_full(view, 0, k + EXTRA_BITS);

            // condensed rewrite
            let mut out = BitWriter::with_capacity(left_out_size as usize);
            if t == 1 {
                let x = slice_u64_full(view, k + EXTRA_BITS, k);
                out.push(x, k);
            } else {
                let pos = slice_u64_full(view, k + EXTRA_BITS, k);
                let offset = slice_u64_full(view, k + EXTRA_BITS + k, OFFSET_SIZE);
                out.push(index, k);
                out.push(pos, k);
                out.push(offset, OFFSET_SIZE);
            }
            left_out.write(
                index * left_out_size,
                &out.finish_padded(left_out_size as usize),
            )?;

            let meta = Metadata::from_bits(view, left_meta_offset, left_meta_bits);
            let group = bucket_id(y);

            if cur.ys.is_empty() && prev.ys.is_empty() {
                cur.reset(group, index);
            } else if group != cur.id {
                // close the current group; match it against its predecessor
                if !prev.ys.is_empty() && cur.id == prev.id + 1 {
                    collect_matches(&mut matcher, &prev, &cur, &mut jobs, &mut dropped_offsets);
                }
                std::mem::swap(&mut prev, &mut cur);
                cur.reset(group, index);

                if jobs.len() as u64 >= params.stripe_size {
                    right_count += emit_batch(
                        &fx,
                        &jobs,
                        &mut r_sort,
                        params,
                        right_table,
                        right_count,
                        &mut dropped_overflow,
                    )?;
                    jobs.clear();
                }
            }
            cur.ys.push(y);
            cur.metas.push(meta);
        }

        // final pair of groups
        if !prev.ys.is_empty() && !cur.ys.is_empty() && cur.id == prev.id + 1 {
            collect_matches(&mut matcher, &prev, &cur, &mut jobs, &mut dropped_offsets);
        }
        right_count += emit_batch(
            &fx,
            &jobs,
            &mut r_sort,
            params,
            right_table,
            right_count,
            &mut dropped_overflow,
        )?;

        left_out.free_memory()?;
        drop(left_out);
        drop(l_sort); // removes the consumed table's bucket files
        r_sort.flush_cache()?;

        if dropped_offsets > 0 {
            warn!(table = right_table, dropped_offsets, "matches dropped: offset field overflow");
        }
        if dropped_overflow > 0 {
            warn!(table = right_table, dropped_overflow, "matches dropped: table full at 2^k");
        }
        table_sizes[right_table as usize] = right_count;
        info!(table = right_table, entries = right_count, "table computed");
        progress(1, u64::from(t), 6);

        l_sort = r_sort;
    }

    // ---- drain table 7 to its condensed stream -------------------------------------------------

    let t7_entry_size = max_entry_size(k, 7, false) as u64;
    let mut t7_out = BufferedDisk::new(
        FileDisk::with_retry(params.table_path(7), true, params.retry)?,
        0,
    );
    for index in 0..table_sizes[7] {
        let view = l_sort.read(index * t7_entry_size, t7_entry_size)?;
        t7_out.write(index * t7_entry_size, &view[..t7_entry_size as usize])?;
    }
    t7_out.free_memory()?;
    drop(l_sort);
    debug!(entries = table_sizes[7], "table 7 drained");

    Ok(Phase1Output { table_sizes })
}

fn sort_config(params: &PlotterParams, entry_size: usize) -> SortConfig {
    SortConfig::new(params.sort_memory(), params.log_num_buckets, entry_size, 0)
        .producer_cache(params.cache_memory())
        .retry(params.retry)
}

/// Run the matcher over one adjacent group pair and queue the pairs for
/// Fx evaluation.
fn collect_matches(
    matcher: &mut Matcher,
    left: &Group,
    right: &Group,
    jobs: &mut Vec<MatchJob>,
    dropped_offsets: &mut u64,
) {
    let mut pairs = Vec::new();
    matcher.find_matches(&left.ys, &right.ys, &mut pairs);
    for (il, ir) in pairs {
        let pos = left.first_index + u64::from(il);
        let right_pos = right.first_index + u64::from(ir);
        let offset = right_pos - pos;
        if offset >= 1 << OFFSET_SIZE {
            *dropped_offsets += 1;
            continue;
        }
        jobs.push(MatchJob {
            y: left.ys[il as usize],
            meta_left: left.metas[il as usize],
            meta_right: right.metas[ir as usize],
            pos,
            offset,
        });
    }
}

/// Evaluate a stripe's matches (fanning out across worker threads) and
/// append the resulting right-table entries in deterministic order.
fn emit_batch(
    fx: &Fx,
    jobs: &[MatchJob],
    r_sort: &mut SortManager,
    params: &PlotterParams,
    right_table: u8,
    right_count: u64,
    dropped_overflow: &mut u64,
) -> Result<u64, PhaseError> {
    if jobs.is_empty() {
        return Ok(0);
    }
    let k = params.k;
    let results: Vec<(u64, Metadata)> = if params.num_threads <= 1 || jobs.len() < 2048 {
        jobs.iter()
            .map(|j| fx.calculate(j.y, &j.meta_left, &j.meta_right))
            .collect()
    } else {
        let chunk = jobs.len().div_ceil(params.num_threads);
        let mut results = Vec::with_capacity(jobs.len());
        thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|j| fx.calculate(j.y, &j.meta_left, &j.meta_right))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                results.extend(handle.join().expect("fx worker thread panicked"));
            }
        });
        results
    };

    let entry_size = max_entry_size(k, right_table, true) as usize;
    let capacity = 1u64 << k;
    let mut written = 0u64;
    for (job, (f, meta)) in jobs.iter().zip(&results) {
        if right_count + written >= capacity {
            *dropped_overflow += jobs.len() as u64 - written;
            break;
        }
        let mut out = BitWriter::with_capacity(entry_size);
        out.push(*f, fx.f_bits());
        out.push(job.pos, k);
        out.push(job.offset, OFFSET_SIZE);
        if meta.bits() > 0 {
            out.push_slice_bits(meta.as_bytes(), 0, meta.bits());
        }
        r_sort.add(&out.finish_padded(entry_size))?;
        written += 1;
    }
    Ok(written)
}
