//! Plot construction: validation, orchestration, and the final file.
//!
//! [`DiskPlotter`] validates a [`PlotConfig`] into [`PlotterParams`]
//! (derived memory budget, bucket count, descriptor head-room), then runs
//! the four phases in sequence and moves the finished file into place.
//!
//! # Temporary file layout
//!
//! ```text
//! <tmp_dir>/<name>.sort.tmp            sort spare slot
//! <tmp_dir>/<name>.table{1..7}.tmp     per-table condensed streams
//! <tmp_dir>/<name>.*.sort_bucket_NNN.tmp   per-manager bucket files
//! <tmp2_dir>/<name>.2.tmp              becomes the final file by rename
//! ```
//!
//! Stale files from an earlier run with the same name are removed before
//! phase 1; every temporary is deleted on completion.
//!
//! # Final file header
//!
//! ```text
//! [19 B "Proof of Space Plot"][32 B id][1 B k]
//! [2 B BE len]["v1.0"][2 B BE len][memo][80 B table pointers]
//! ```
//!
//! The ten 8-byte big-endian pointer slots (tables 1..7, C1, C2, C3) are
//! back-filled by phases 3 and 4.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use crate::disk::{DiskError, FileDisk, RetryPolicy};
use crate::entry_sizes::max_entry_size;
use crate::phases::{phase1, phase2, phase3, phase4, PhaseError, ProgressFn};
use crate::pos::{ID_LEN, MAX_PLOT_SIZE, MIN_PLOT_SIZE};
use crate::util::round_pow2;

/// ASCII magic opening every plot file.
pub const HEADER_MAGIC: &[u8; 19] = b"Proof of Space Plot";

/// Format description embedded in the header.
pub const FORMAT_DESCRIPTION: &str = "v1.0";

/// Pointer slots in the header (tables 1..7, C1, C2, C3).
pub const HEADER_POINTERS: usize = 10;

/// Bucket count bounds.
pub const MIN_BUCKETS: u32 = 16;
pub const MAX_BUCKETS: u32 = 128;

/// Share of the memory budget given to the consumer-side bucket sort; the
/// rest covers producer staging caches.
pub const MEM_SORT_PROPORTION: f64 = 0.75;

/// Default buffer size in MiB when the caller passes 0.
const DEFAULT_BUF_MIB: u32 = 4608;

/// Soft target for the file-descriptor limit.
const FD_SOFT_TARGET: u64 = 600;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors from plot configuration and execution.
#[derive(Debug, Error)]
pub enum PlotError {
    #[error("plot size k = {0} is invalid; supported range is {MIN_PLOT_SIZE}..={MAX_PLOT_SIZE}")]
    InvalidK(u32),

    #[error("bucket count {requested} out of range [{MIN_BUCKETS}, {MAX_BUCKETS}]")]
    InvalidBuckets { requested: u32 },

    #[error("insufficient memory: need at least {needed_mib} MiB, have {provided_mib} MiB")]
    InsufficientMemory { needed_mib: u64, provided_mib: u64 },

    #[error("stripe size {stripe_size} too large for {num_buckets} buckets at this k")]
    StripeTooLarge { stripe_size: u64, num_buckets: u32 },

    #[error("directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error(
        "file-descriptor limit {limit} too low (need {required}); raise the hard limit \
         (e.g. `ulimit -n` or limits.conf) and retry"
    )]
    ResourceExhausted { required: u64, limit: u64 },

    #[error("the legacy non-bitfield pipeline is not available; drop --nobitfield")]
    BitfieldRequired,

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Caller-facing plot request. Zero means "use the default" for
/// `memory_mib`, `num_buckets`, `stripe_size` and `num_threads`.
#[derive(Debug, Clone)]
pub struct PlotConfig {
    pub k: u32,
    pub id: [u8; ID_LEN],
    pub memo: Vec<u8>,
    pub tmp_dir: PathBuf,
    pub tmp2_dir: PathBuf,
    pub final_dir: PathBuf,
    pub filename: String,
    pub memory_mib: u32,
    pub num_buckets: u32,
    pub stripe_size: u64,
    pub num_threads: usize,
    pub disable_bitfield: bool,
    /// Transient-I/O retry policy, injectable for tests.
    pub retry: RetryPolicy,
}

/// Validated, derived parameters shared by the phase drivers.
#[derive(Debug, Clone)]
pub struct PlotterParams {
    pub k: u32,
    pub id: [u8; ID_LEN],
    pub memo: Vec<u8>,
    pub tmp_dir: PathBuf,
    pub tmp2_dir: PathBuf,
    pub final_dir: PathBuf,
    pub filename: String,
    /// Working memory in bytes, overheads already subtracted.
    pub memory_size: u64,
    pub num_buckets: u32,
    pub log_num_buckets: u32,
    pub stripe_size: u64,
    pub num_threads: usize,
    pub retry: RetryPolicy,
}

impl PlotterParams {
    /// Path of the condensed stream for `table`.
    pub fn table_path(&self, table: u8) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.table{}.tmp", self.filename, table))
    }

    /// Path of the sort spare slot.
    pub fn sort_spare_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("{}.sort.tmp", self.filename))
    }

    /// Path of the in-progress final file.
    pub fn tmp2_path(&self) -> PathBuf {
        self.tmp2_dir.join(format!("{}.2.tmp", self.filename))
    }

    /// Stem for a sort manager's bucket files, e.g. `p1.t3`.
    pub fn sort_stem(&self, suffix: &str) -> String {
        format!("{}.{}", self.filename, suffix)
    }

    /// Consumer-side sort memory.
    pub fn sort_memory(&self) -> u64 {
        (self.memory_size as f64 * MEM_SORT_PROPORTION) as u64
    }

    /// Producer-side staging memory.
    pub fn cache_memory(&self) -> u64 {
        self.memory_size - self.sort_memory()
    }
}

// ------------------------------------------------------------------------------------------------
// Summary
// ------------------------------------------------------------------------------------------------

/// What a finished build produced.
#[derive(Debug)]
pub struct PlotSummary {
    pub final_path: PathBuf,
    pub final_size: u64,
    /// Entry counts per table after phase 1 (index 0 unused).
    pub table_sizes: [u64; 8],
}

// ------------------------------------------------------------------------------------------------
// DiskPlotter
// ------------------------------------------------------------------------------------------------

/// Validates a request and drives the four phases.
pub struct DiskPlotter {
    params: PlotterParams,
}

impl DiskPlotter {
    /// Validate `config` and derive the working parameters.
    pub fn new(config: PlotConfig) -> Result<Self, PlotError> {
        if config.disable_bitfield {
            return Err(PlotError::BitfieldRequired);
        }
        if !(MIN_PLOT_SIZE..=MAX_PLOT_SIZE).contains(&config.k) {
            return Err(PlotError::InvalidK(config.k));
        }
        for dir in [&config.tmp_dir, &config.tmp2_dir, &config.final_dir] {
            if !dir.is_dir() {
                return Err(PlotError::MissingDirectory(dir.clone()));
            }
        }

        let k = config.k;
        let stripe_size = if config.stripe_size != 0 {
            config.stripe_size
        } else {
            65_536
        };
        let num_threads = if config.num_threads != 0 {
            config.num_threads
        } else {
            2
        };
        let buf_mib = u64::from(if config.memory_mib != 0 {
            config.memory_mib
        } else {
            DEFAULT_BUF_MIB
        });
        if buf_mib < 10 {
            return Err(PlotError::InsufficientMemory {
                needed_mib: 10,
                provided_mib: buf_mib,
            });
        }

        // overheads: fixed slack, 5% (capped) for allocator churn, and the
        // per-thread stripe windows of the matching pass
        let thread_memory_mib = (num_threads as u64
            * 2
            * (stripe_size + 5000)
            * u64::from(max_entry_size(k, 4, true)))
            >> 20;
        let sub_mib = 5 + (buf_mib / 20).min(50) + thread_memory_mib;
        if sub_mib >= buf_mib {
            return Err(PlotError::InsufficientMemory {
                needed_mib: sub_mib + 1,
                provided_mib: buf_mib,
            });
        }
        let memory_size = (buf_mib - sub_mib) << 20;

        let max_table_size = (1..=7)
            .map(|t| (1u64 << k) * u64::from(max_entry_size(k, t, true)))
            .max()
            .unwrap_or(0)
            * 13
            / 10;

        let num_buckets = if config.num_buckets != 0 {
            round_pow2(u64::from(config.num_buckets)) as u32
        } else {
            let sort_share = (memory_size as f64 * MEM_SORT_PROPORTION) as u64;
            let per_bucket_target = max_table_size.div_ceil(sort_share.max(1));
            2 * round_pow2(per_bucket_target.max(1)) as u32
        };
        let num_buckets = if num_buckets < MIN_BUCKETS {
            if config.num_buckets != 0 {
                return Err(PlotError::InvalidBuckets {
                    requested: config.num_buckets,
                });
            }
            MIN_BUCKETS
        } else if num_buckets > MAX_BUCKETS {
            if config.num_buckets != 0 {
                return Err(PlotError::InvalidBuckets {
                    requested: config.num_buckets,
                });
            }
            let required_mib =
                (max_table_size / u64::from(MAX_BUCKETS)) * 4 / 3 / (1 << 20) + sub_mib;
            return Err(PlotError::InsufficientMemory {
                needed_mib: required_mib,
                provided_mib: buf_mib,
            });
        } else {
            num_buckets
        };
        let log_num_buckets = num_buckets.trailing_zeros();

        if max_table_size / u64::from(num_buckets) < stripe_size * 30 {
            return Err(PlotError::StripeTooLarge {
                stripe_size,
                num_buckets,
            });
        }

        raise_fd_limit(u64::from(num_buckets) + 8)?;

        Ok(Self {
            params: PlotterParams {
                k,
                id: config.id,
                memo: config.memo,
                tmp_dir: config.tmp_dir,
                tmp2_dir: config.tmp2_dir,
                final_dir: config.final_dir,
                filename: config.filename,
                memory_size,
                num_buckets,
                log_num_buckets,
                stripe_size,
                num_threads,
                retry: config.retry,
            },
        })
    }

    pub fn params(&self) -> &PlotterParams {
        &self.params
    }

    /// Run all four phases and move the finished plot into the final
    /// directory. On failure every temporary file is removed before the
    /// error propagates.
    pub fn create_plot(&self, progress: &ProgressFn) -> Result<PlotSummary, PlotError> {
        let result = self.build(progress);
        if result.is_err() {
            self.remove_stale_files();
        }
        result
    }

    fn build(&self, progress: &ProgressFn) -> Result<PlotSummary, PlotError> {
        let p = &self.params;
        info!(
            k = p.k,
            id = %hex::encode(p.id),
            memory_mib = p.memory_size >> 20,
            buckets = p.num_buckets,
            threads = p.num_threads,
            stripe = p.stripe_size,
            tmp_dir = %p.tmp_dir.display(),
            tmp2_dir = %p.tmp2_dir.display(),
            "starting plot"
        );

        self.remove_stale_files();
        // reserve the whole temp layout up front so a missing or read-only
        // directory fails before hours of work
        FileDisk::with_retry(p.sort_spare_path(), true, p.retry)?;
        for t in 1..=7 {
            FileDisk::with_retry(p.table_path(t), true, p.retry)?;
        }

        info!("phase 1/4: forward propagation");
        let res1 = phase1::run(p, progress)?;
        let table_sizes = res1.table_sizes;

        info!("phase 2/4: back-propagation");
        let res2 = phase2::run(p, &res1.table_sizes, progress)?;

        let mut tmp2_disk = FileDisk::with_retry(p.tmp2_path(), true, p.retry)?;
        let header_size = write_header(&mut tmp2_disk, p.k, &p.id, &p.memo);

        info!("phase 3/4: compression to line points");
        let res3 = phase3::run(p, &mut tmp2_disk, res2, header_size, progress)?;

        info!("phase 4/4: checkpoint tables");
        let final_size = phase4::run(p, &mut tmp2_disk, res3, progress)?;
        drop(tmp2_disk);

        let working_space: u64 = (1..=7u8)
            .map(|t| table_sizes[t as usize] * u64::from(max_entry_size(p.k, t, false)))
            .sum();
        info!(
            final_size,
            working_space_gib = working_space as f64 / (1u64 << 30) as f64,
            "plot data complete"
        );

        self.remove_temp1_files();
        let final_path = self.move_into_place()?;
        info!(path = %final_path.display(), "plot complete");

        Ok(PlotSummary {
            final_path,
            final_size,
            table_sizes,
        })
    }

    /// Delete every temp-layout file for this plot name, including a stale
    /// in-progress final file. Best effort.
    fn remove_stale_files(&self) {
        self.remove_temp1_files();
        remove_if_present(&self.params.tmp2_path());
    }

    /// Delete the first-temp-directory files (the finished `.2.tmp` is
    /// left alone).
    fn remove_temp1_files(&self) {
        let p = &self.params;
        remove_if_present(&p.sort_spare_path());
        for t in 1..=7 {
            remove_if_present(&p.table_path(t));
        }
    }

    /// Rename (same filesystem) or copy-then-rename the finished file into
    /// the final directory, retrying transient failures indefinitely.
    fn move_into_place(&self) -> Result<PathBuf, PlotError> {
        let p = &self.params;
        let tmp2 = p.tmp2_path();
        let final_path = p.final_dir.join(&p.filename);

        if p.tmp2_dir == p.final_dir {
            loop {
                match fs::rename(&tmp2, &final_path) {
                    Ok(()) => return Ok(final_path),
                    Err(e) => {
                        warn!(
                            from = %tmp2.display(),
                            to = %final_path.display(),
                            error = %e,
                            "could not rename final file, retrying in {:?}",
                            p.retry.delay
                        );
                        thread::sleep(p.retry.delay);
                    }
                }
            }
        }

        let staged = p.final_dir.join(format!("{}.2.tmp", p.filename));
        let mut copied = false;
        loop {
            if !copied {
                match fs::copy(&tmp2, &staged) {
                    Ok(_) => {
                        copied = true;
                        if let Err(e) = fs::remove_file(&tmp2) {
                            warn!(path = %tmp2.display(), error = %e, "could not remove staging file");
                        }
                    }
                    Err(e) => {
                        warn!(
                            from = %tmp2.display(),
                            to = %staged.display(),
                            error = %e,
                            "could not copy final file, retrying in {:?}",
                            p.retry.delay
                        );
                        thread::sleep(p.retry.delay);
                        continue;
                    }
                }
            }
            match fs::rename(&staged, &final_path) {
                Ok(()) => return Ok(final_path),
                Err(e) => {
                    warn!(
                        from = %staged.display(),
                        to = %final_path.display(),
                        error = %e,
                        "could not rename final file, retrying in {:?}",
                        p.retry.delay
                    );
                    thread::sleep(p.retry.delay);
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Write the byte-exact plot header; returns its size (the offset table 1
/// begins at).
pub fn write_header(disk: &mut FileDisk, k: u32, id: &[u8; ID_LEN], memo: &[u8]) -> u64 {
    let mut pos = 0u64;
    disk.write(pos, HEADER_MAGIC);
    pos += HEADER_MAGIC.len() as u64;
    disk.write(pos, id);
    pos += ID_LEN as u64;
    disk.write(pos, &[k as u8]);
    pos += 1;

    let desc = FORMAT_DESCRIPTION.as_bytes();
    disk.write(pos, &(desc.len() as u16).to_be_bytes());
    pos += 2;
    disk.write(pos, desc);
    pos += desc.len() as u64;

    disk.write(pos, &(memo.len() as u16).to_be_bytes());
    pos += 2;
    disk.write(pos, memo);
    pos += memo.len() as u64;

    disk.write(pos, &[0u8; HEADER_POINTERS * 8]);
    pos + (HEADER_POINTERS * 8) as u64
}

/// Overwrite one big-endian pointer slot (1-based: tables 1..7, then C1,
/// C2, C3).
pub fn write_table_pointer(disk: &mut FileDisk, header_size: u64, slot: usize, value: u64) {
    debug_assert!((1..=HEADER_POINTERS).contains(&slot));
    let offset = header_size - (HEADER_POINTERS * 8) as u64 + (slot as u64 - 1) * 8;
    disk.write(offset, &value.to_be_bytes());
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove temp file"),
    }
}

/// Raise `RLIMIT_NOFILE` towards the soft target; a phase-1 table keeps a
/// descriptor per bucket open.
fn raise_fd_limit(required: u64) -> Result<(), PlotError> {
    match rlimit::increase_nofile_limit(FD_SOFT_TARGET) {
        Ok(limit) if limit < required => Err(PlotError::ResourceExhausted { required, limit }),
        Ok(limit) => {
            info!(limit, "file-descriptor limit");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "could not query or raise the file-descriptor limit");
            Ok(())
        }
    }
}
