//! Bucketed on-disk sort with a streaming consumer cursor.
//!
//! [`SortManager`] is the engine the whole pipeline leans on. Its life has
//! two phases:
//!
//! 1. **Producer.** [`add`](SortManager::add) routes each fixed-size entry
//!    to one of `2^log_num_buckets` bucket files by the key bits at
//!    `begin_bits`, staging entries in an in-memory slice per bucket and
//!    appending the slice to the bucket's file whenever it fills.
//!    [`flush_cache`](SortManager::flush_cache) drains every slice and
//!    seals the producer phase.
//! 2. **Consumer.** The manager then behaves like a read-only [`Disk`]
//!    whose logical offset runs over the *sorted* stream: the first read
//!    past the sorted frontier loads the next bucket file into the scratch
//!    buffer, sorts it in memory, and serves views out of it. One entry of
//!    the previous bucket is retained in a small look-back tail; reading
//!    behind even that is a consumer bug and panics.
//!
//! ```text
//!  add() ──route by key bits──► [slice 0][slice 1]…[slice N-1]   (memory)
//!                                   │flush on fill    │
//!                                   ▼                 ▼
//!                               bucket_000.tmp … bucket_NNN.tmp  (disk)
//!                                   │  sort one bucket at a time
//!                                   ▼
//!  read() ◄──────────────── scratch buffer (sorted frontier)
//! ```
//!
//! Sorted order is `mem_cmp_bits(_, _, entry_size, begin_bits)`: the bucket
//! number supplies the top key bits, the in-bucket sort the rest.
//!
//! # Sort strategies
//!
//! * [`Uniform`](SortStrategy::Uniform) — expected-linear scatter sort; the
//!   default. Falls back to quicksort per bucket when the key distribution
//!   looks non-uniform.
//! * [`Quicksort`](SortStrategy::Quicksort) — always quicksort.
//! * [`QuicksortLast`](SortStrategy::QuicksortLast) — quicksort for the
//!   final bucket, whose high key bits alias, uniform elsewhere.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

pub mod quicksort;
pub mod uniform;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::disk::{BufferedDisk, Disk, DiskError, FileDisk, RetryPolicy, READ_TAIL};
use crate::util::{extract_num, round_size};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the sort engine.
#[derive(Debug, Error)]
pub enum SortError {
    /// Underlying disk failure.
    #[error(transparent)]
    Disk(#[from] DiskError),

    /// A bucket outgrew the sort memory; the caller's bucket count or
    /// memory budget is too small for this input.
    #[error(
        "bucket of {entries} entries needs {needed} B of sort memory, only {available} B available"
    )]
    InsufficientMemory {
        entries: u64,
        needed: u64,
        available: u64,
    },

    /// The scatter sort's probe chain overran its bound — the key bits are
    /// not uniformly distributed. Handled internally by falling back to
    /// quicksort; only [`uniform::sort_to_memory`] returns it.
    #[error("probe chain overran the scratch area; keys not uniformly distributed")]
    NonUniformSuspicion,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// In-memory sort kernel selection, fixed per manager at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    /// Scatter sort everywhere (with per-bucket quicksort fallback).
    Uniform,
    /// Quicksort everywhere.
    Quicksort,
    /// Quicksort for the last bucket, scatter sort elsewhere.
    QuicksortLast,
}

/// Construction parameters for a [`SortManager`].
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Consumer-side budget in bytes: bounds the scratch buffer a single
    /// bucket is sorted in.
    pub memory_size: u64,
    /// Producer-side budget in bytes: total size of the staging slices.
    /// Defaults to `memory_size`; drivers running a producer and a
    /// consumer manager concurrently split one budget across the two.
    pub producer_cache_size: u64,
    /// log2 of the bucket count.
    pub log_num_buckets: u32,
    /// Entry width in bytes.
    pub entry_size: usize,
    /// First bit of the sort key; the top `log_num_buckets` key bits route
    /// entries to buckets.
    pub begin_bits: u32,
    pub strategy: SortStrategy,
    pub retry: RetryPolicy,
    /// `close_to_new_bucket` margin, in entries.
    pub boundary_margin_entries: u64,
}

impl SortConfig {
    pub fn new(memory_size: u64, log_num_buckets: u32, entry_size: usize, begin_bits: u32) -> Self {
        Self {
            memory_size,
            producer_cache_size: memory_size,
            log_num_buckets,
            entry_size,
            begin_bits,
            strategy: SortStrategy::Uniform,
            retry: RetryPolicy::default(),
            boundary_margin_entries: 1,
        }
    }

    pub fn producer_cache(mut self, bytes: u64) -> Self {
        self.producer_cache_size = bytes;
        self
    }

    pub fn strategy(mut self, strategy: SortStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ------------------------------------------------------------------------------------------------
// SortManager
// ------------------------------------------------------------------------------------------------

struct Bucket {
    /// Bytes flushed to the bucket file so far.
    write_pointer: u64,
    /// Bytes staged in this bucket's cache slice.
    cache_used: usize,
    file: BufferedDisk,
}

/// Bucketed external sorter; see the module docs.
pub struct SortManager {
    name: PathBuf,
    memory_size: u64,
    entry_size: usize,
    begin_bits: u32,
    log_num_buckets: u32,
    strategy: SortStrategy,
    boundary_margin: u64,

    buckets: Vec<Bucket>,
    /// Producer cache: one `slice_quota`-byte slice per bucket, plus tail.
    cache: Vec<u8>,
    slice_quota: usize,
    /// Staging copy of the entry being routed (7-byte tail for slicing).
    entry_buf: Vec<u8>,
    done: bool,

    /// Scratch holding the currently sorted bucket, plus tail.
    scratch: Vec<u8>,
    scratch_bytes: usize,
    /// Look-back tail: the final entry of the previous bucket.
    prev_bucket_buf: Vec<u8>,
    prev_bucket_position_start: u64,
    final_position_start: u64,
    final_position_end: u64,
    next_bucket_to_sort: usize,
}

impl SortManager {
    /// Create a manager whose bucket files live in `tmp_dir` and are named
    /// `<file_stem>.sort_bucket_NNN.tmp`.
    pub fn new(config: SortConfig, tmp_dir: &Path, file_stem: &str) -> Result<Self, SortError> {
        assert!(config.entry_size > 0);
        let num_buckets = 1usize << config.log_num_buckets;
        let mut buckets = Vec::with_capacity(num_buckets);
        for i in 0..num_buckets {
            let path = tmp_dir.join(format!("{file_stem}.sort_bucket_{i:03}.tmp"));
            let file = FileDisk::with_retry(&path, true, config.retry)?;
            buckets.push(Bucket {
                write_pointer: 0,
                cache_used: 0,
                file: BufferedDisk::new(file, 0),
            });
        }
        let slice_quota = ((config.producer_cache_size / num_buckets as u64) as usize
            / config.entry_size)
            .max(1)
            * config.entry_size;
        Ok(Self {
            name: tmp_dir.join(file_stem),
            memory_size: config.memory_size,
            entry_size: config.entry_size,
            begin_bits: config.begin_bits,
            log_num_buckets: config.log_num_buckets,
            strategy: config.strategy,
            boundary_margin: config.boundary_margin_entries * config.entry_size as u64,
            buckets,
            cache: Vec::new(),
            slice_quota,
            entry_buf: vec![0u8; config.entry_size + READ_TAIL],
            done: false,
            scratch: Vec::new(),
            scratch_bytes: 0,
            prev_bucket_buf: vec![0u8; config.entry_size + READ_TAIL],
            prev_bucket_position_start: 0,
            final_position_start: 0,
            final_position_end: 0,
            next_bucket_to_sort: 0,
        })
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Total entries across all buckets. Stable only after `flush_cache`.
    pub fn total_entries(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.write_pointer / self.entry_size as u64)
            .sum()
    }

    // --------------------------------------------------------------------------------------------
    // Producer phase
    // --------------------------------------------------------------------------------------------

    /// Route one entry to its bucket.
    pub fn add(&mut self, entry: &[u8]) -> Result<(), SortError> {
        assert!(!self.done, "add after flush_cache on {}", self.name.display());
        debug_assert_eq!(entry.len(), self.entry_size);
        self.need_cache();

        self.entry_buf[..self.entry_size].copy_from_slice(entry);
        let b = extract_num(
            &self.entry_buf,
            self.entry_size as u32,
            self.begin_bits,
            self.log_num_buckets,
        ) as usize;
        debug_assert!(b < self.buckets.len());

        if self.buckets[b].cache_used + self.entry_size > self.slice_quota {
            self.flush_bucket_slice(b)?;
        }
        let start = b * self.slice_quota + self.buckets[b].cache_used;
        self.cache[start..start + self.entry_size].copy_from_slice(entry);
        self.buckets[b].cache_used += self.entry_size;
        Ok(())
    }

    /// Drain every staged slice, seal the producer phase, and verify the
    /// largest bucket fits the sort memory.
    pub fn flush_cache(&mut self) -> Result<(), SortError> {
        for b in 0..self.buckets.len() {
            self.flush_bucket_slice(b)?;
        }
        for bucket in &mut self.buckets {
            bucket.file.flush_cache()?;
        }
        self.cache = Vec::new();

        let max_entries = self
            .buckets
            .iter()
            .map(|b| b.write_pointer / self.entry_size as u64)
            .max()
            .unwrap_or(0);
        let needed = round_size(max_entries) * self.entry_size as u64;
        if needed > self.memory_size {
            return Err(SortError::InsufficientMemory {
                entries: max_entries,
                needed,
                available: self.memory_size,
            });
        }
        self.scratch_bytes = needed as usize;
        self.done = true;
        debug!(
            manager = %self.name.display(),
            entries = self.total_entries(),
            max_bucket_entries = max_entries,
            "sort cache flushed"
        );
        Ok(())
    }

    fn need_cache(&mut self) {
        if self.cache.is_empty() {
            self.cache = vec![0u8; self.buckets.len() * self.slice_quota + READ_TAIL];
        }
    }

    fn flush_bucket_slice(&mut self, b: usize) -> Result<(), SortError> {
        let used = self.buckets[b].cache_used;
        if used == 0 {
            return Ok(());
        }
        let start = b * self.slice_quota;
        let write_pointer = self.buckets[b].write_pointer;
        self.buckets[b]
            .file
            .write(write_pointer, &self.cache[start..start + used])?;
        self.buckets[b].write_pointer += used as u64;
        self.buckets[b].cache_used = 0;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Consumer phase
    // --------------------------------------------------------------------------------------------

    /// Read one entry at byte `position` of the sorted stream.
    pub fn read_entry(&mut self, position: u64) -> Result<&[u8], DiskError> {
        let entry_size = self.entry_size as u64;
        self.view(position, entry_size)
    }

    /// True when `position` is within the boundary margin of the current
    /// bucket's end and another bucket remains. Consumers use this to
    /// flush state that must not straddle a bucket transition.
    pub fn close_to_new_bucket(&self, position: u64) -> bool {
        if position > self.final_position_end {
            return self.next_bucket_to_sort < self.buckets.len();
        }
        position + self.boundary_margin >= self.final_position_end
            && self.next_bucket_to_sort < self.buckets.len()
    }

    /// Force the cursor into the next bucket. Everything at or above
    /// `position` (at most one entry under the default margin) is retained
    /// in the look-back tail.
    pub fn trigger_new_bucket(&mut self, position: u64) -> Result<(), DiskError> {
        assert!(
            position <= self.final_position_end,
            "triggering bucket too late on {}",
            self.name.display()
        );
        assert!(
            position >= self.final_position_start,
            "triggering bucket too early on {}",
            self.name.display()
        );
        self.advance_bucket(position)
    }

    fn view(&mut self, position: u64, length: u64) -> Result<&[u8], DiskError> {
        assert!(self.done, "consumer read before flush_cache on {}", self.name.display());

        if position < self.final_position_start {
            // look-back into the retained tail of the previous bucket
            assert!(
                position >= self.prev_bucket_position_start,
                "sorted-stream consumer regressed to {} (tail starts at {}) on {}",
                position,
                self.prev_bucket_position_start,
                self.name.display()
            );
            let off = (position - self.prev_bucket_position_start) as usize;
            return Ok(&self.prev_bucket_buf[off..off + length as usize + READ_TAIL]);
        }

        while position >= self.final_position_end {
            let keep_from = self
                .final_position_end
                .saturating_sub(self.entry_size as u64)
                .max(self.final_position_start);
            self.advance_bucket(keep_from)?;
        }
        assert!(
            position >= self.final_position_start,
            "position {} fell out of the sorted window on {}",
            position,
            self.name.display()
        );
        let off = (position - self.final_position_start) as usize;
        Ok(&self.scratch[off..off + length as usize + READ_TAIL])
    }

    /// Stash `[keep_from, end)` of the current bucket in the look-back
    /// tail, then sort the next bucket into the scratch buffer.
    fn advance_bucket(&mut self, keep_from: u64) -> Result<(), DiskError> {
        let keep = (self.final_position_end - keep_from) as usize;
        assert!(keep <= self.entry_size, "look-back tail overflow");
        if keep > 0 && !self.scratch.is_empty() {
            let off = (keep_from - self.final_position_start) as usize;
            self.prev_bucket_buf[..keep].copy_from_slice(&self.scratch[off..off + keep]);
            self.prev_bucket_buf[keep..].fill(0);
        }
        self.prev_bucket_position_start = keep_from;
        self.sort_bucket()
    }

    fn sort_bucket(&mut self) -> Result<(), DiskError> {
        assert!(
            self.next_bucket_to_sort < self.buckets.len(),
            "no bucket left to sort on {}",
            self.name.display()
        );
        self.need_scratch();
        let b = self.next_bucket_to_sort;
        let is_last = b + 1 == self.buckets.len();
        let bucket_bytes = self.buckets[b].write_pointer as usize;
        let bucket_entries = (bucket_bytes / self.entry_size) as u64;
        let subkey_bits = self.begin_bits + self.log_num_buckets;

        let force_quicksort = self.strategy == SortStrategy::Quicksort
            || (self.strategy == SortStrategy::QuicksortLast && is_last);

        if bucket_entries > 0 {
            if force_quicksort {
                self.buckets[b]
                    .file
                    .file_mut()
                    .read(0, &mut self.scratch[..bucket_bytes]);
                quicksort::sort(
                    &mut self.scratch[..bucket_bytes],
                    self.entry_size,
                    bucket_entries,
                    subkey_bits,
                );
            } else if uniform::sort_to_memory(
                self.buckets[b].file.file_mut(),
                0,
                &mut self.scratch,
                self.entry_size,
                bucket_entries,
                subkey_bits,
            )
            .is_err()
            {
                warn!(
                    manager = %self.name.display(),
                    bucket = b,
                    entries = bucket_entries,
                    "keys not uniformly distributed, retrying bucket with quicksort"
                );
                self.buckets[b]
                    .file
                    .file_mut()
                    .read(0, &mut self.scratch[..bucket_bytes]);
                quicksort::sort(
                    &mut self.scratch[..bucket_bytes],
                    self.entry_size,
                    bucket_entries,
                    subkey_bits,
                );
            }
        }

        // the bucket is in memory now; release its file space
        self.buckets[b].file.truncate(0)?;

        self.final_position_start = self.final_position_end;
        self.final_position_end += bucket_bytes as u64;
        self.next_bucket_to_sort += 1;
        debug!(
            manager = %self.name.display(),
            bucket = b,
            entries = bucket_entries,
            "bucket sorted"
        );
        Ok(())
    }

    fn need_scratch(&mut self) {
        if self.scratch.is_empty() {
            self.scratch = vec![0u8; self.scratch_bytes + READ_TAIL];
        }
    }
}

impl Disk for SortManager {
    fn read(&mut self, begin: u64, length: u64) -> Result<&[u8], DiskError> {
        debug_assert!(length as usize <= self.entry_size);
        self.view(begin, length)
    }

    fn write(&mut self, _begin: u64, _buf: &[u8]) -> Result<(), DiskError> {
        Err(DiskError::ReadOnly(self.name.clone()))
    }

    fn truncate(&mut self, new_size: u64) -> Result<(), DiskError> {
        if new_size != 0 {
            return Err(DiskError::UnsupportedTruncate {
                path: self.name.clone(),
                requested: new_size,
            });
        }
        for bucket in &mut self.buckets {
            bucket.file.truncate(0)?;
        }
        self.free_memory()
    }

    fn file_name(&self) -> &Path {
        &self.name
    }

    fn free_memory(&mut self) -> Result<(), DiskError> {
        self.cache = Vec::new();
        self.scratch = Vec::new();
        Ok(())
    }
}

impl Drop for SortManager {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            let path = bucket.file.file_name();
            if let Err(e) = std::fs::remove_file(path) {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "could not remove sort bucket file"
                );
            }
        }
    }
}
