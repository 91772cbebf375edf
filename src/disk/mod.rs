//! Disk abstractions: positioned file I/O, buffering, and filtered views.
//!
//! The plotter moves hundreds of gigabytes through a handful of access
//! patterns, all forward-sequential. This module provides the layered disks
//! the rest of the engine is written against:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Disk (trait)        borrowed-view read / write / trunc  │
//! │   ├── BufferedDisk  1 MiB read-ahead + write coalescing │
//! │   │     └── FileDisk   positioned I/O, retry-forever    │
//! │   ├── FilteredDisk  bitfield-compacted logical view     │
//! │   └── SortManager   (in `sort`) sorted streaming view   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Borrowed-view reads
//!
//! `read` returns a slice into the disk's internal buffer, valid until the
//! next call on the same disk — the borrow checker enforces what the
//! original pointer-returning design documented. Every returned slice
//! carries **at least 7 bytes past the requested length** so bit-slicing may
//! load its full 8-byte window (see [`util`](crate::util)).
//!
//! # Transient-error policy
//!
//! Plots run for hours on commodity drives; aborting on a transient short
//! read or write wastes all of it. [`FileDisk`] therefore logs, sleeps the
//! [`RetryPolicy`] delay (default five minutes), and retries indefinitely.
//! Only a failure to *open* a file without retry requested surfaces as
//! [`DiskError::Open`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{trace, warn};

use crate::bitfield::Bitfield;

/// Read-ahead buffer capacity.
pub const READ_AHEAD: u64 = 1024 * 1024;

/// Write-coalescing buffer capacity.
pub const WRITE_CACHE: u64 = 1024 * 1024;

/// Valid tail bytes past every returned read view.
pub const READ_TAIL: usize = 7;

/// Small buffer servicing reads behind the read-ahead window.
const BYPASS_BUF: usize = 128;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the disk layer.
///
/// Transient read/write failures never appear here — they are retried
/// indefinitely inside [`FileDisk`].
#[derive(Debug, Error)]
pub enum DiskError {
    /// A file could not be opened and the caller did not request retry.
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Non-retryable I/O failure (truncate, metadata).
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Write attempted on a read-only view.
    #[error("write attempted on read-only disk view {0}")]
    ReadOnly(PathBuf),

    /// Truncation size the implementation cannot honour.
    #[error("unsupported truncate to {requested} bytes on {path}")]
    UnsupportedTruncate { path: PathBuf, requested: u64 },
}

// ------------------------------------------------------------------------------------------------
// Disk trait
// ------------------------------------------------------------------------------------------------

/// Capability interface shared by every disk-shaped object in the pipeline.
pub trait Disk {
    /// Read `length` bytes at `begin`, returning a view of at least
    /// `length + 7` bytes valid until the next call on this disk.
    fn read(&mut self, begin: u64, length: u64) -> Result<&[u8], DiskError>;

    /// Write `buf` at `begin`.
    fn write(&mut self, begin: u64, buf: &[u8]) -> Result<(), DiskError>;

    /// Resize the underlying storage.
    fn truncate(&mut self, new_size: u64) -> Result<(), DiskError>;

    /// Path of the backing file (diagnostics only).
    fn file_name(&self) -> &Path;

    /// Flush pending writes and release internal buffers.
    fn free_memory(&mut self) -> Result<(), DiskError>;
}

// ------------------------------------------------------------------------------------------------
// RetryPolicy
// ------------------------------------------------------------------------------------------------

/// How long to sleep between attempts on transient I/O failures.
///
/// Injectable so tests can exercise the retry loop without sleeping.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately — for tests.
    pub const fn no_delay() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FileDisk
// ------------------------------------------------------------------------------------------------

/// Positioned read/write on a single file.
///
/// Tracks the last read and write positions so forward-sequential access
/// skips redundant seeks. Short reads and writes are logged and retried
/// after the policy delay, indefinitely.
#[derive(Debug)]
pub struct FileDisk {
    path: PathBuf,
    file: Option<File>,
    read_pos: u64,
    write_pos: u64,
    write_max: u64,
    reading: bool,
    retry: RetryPolicy,
}

impl FileDisk {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, DiskError> {
        Self::with_retry(path, true, RetryPolicy::default())
    }

    /// Open the file at `path` without truncating, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DiskError> {
        Self::with_retry(path, false, RetryPolicy::default())
    }

    /// Open with an explicit retry policy.
    pub fn with_retry<P: AsRef<Path>>(
        path: P,
        truncate: bool,
        retry: RetryPolicy,
    ) -> Result<Self, DiskError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)
            .map_err(|source| DiskError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Some(file),
            read_pos: 0,
            write_pos: 0,
            write_max: 0,
            reading: true,
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest byte offset ever written.
    pub fn write_max(&self) -> u64 {
        self.write_max
    }

    /// Close the handle; the next read or write reopens it.
    pub fn close(&mut self) {
        self.file = None;
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Reopen after a `close`, retrying forever — a vanished temp directory
    /// mid-run is the transient case the retry contract exists for.
    fn ensure_open(&mut self) {
        while self.file.is_none() {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
            {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "could not open file, retrying in {:?}",
                        self.retry.delay
                    );
                    thread::sleep(self.retry.delay);
                }
            }
        }
    }

    /// Fill `buf` from `begin`. Short reads retry indefinitely.
    pub fn read(&mut self, begin: u64, buf: &mut [u8]) {
        trace!(
            target: "plotforge::io",
            file = %self.path.display(),
            op = "read",
            offset = begin,
            len = buf.len() as u64
        );
        loop {
            self.ensure_open();
            match self.try_read(begin, buf) {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        offset = begin,
                        len = buf.len(),
                        error = %e,
                        "short read, retrying in {:?}",
                        self.retry.delay
                    );
                    thread::sleep(self.retry.delay);
                }
            }
        }
    }

    fn try_read(&mut self, begin: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Err(io::Error::new(io::ErrorKind::Other, "file handle closed")),
        };
        if !self.reading || begin != self.read_pos {
            file.seek(SeekFrom::Start(begin))?;
            self.reading = true;
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                self.read_pos = begin + filled as u64;
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read {filled} of {} bytes", buf.len()),
                ));
            }
            filled += n;
        }
        self.read_pos = begin + buf.len() as u64;
        Ok(())
    }

    /// Write `buf` at `begin`. Short writes retry indefinitely.
    pub fn write(&mut self, begin: u64, buf: &[u8]) {
        trace!(
            target: "plotforge::io",
            file = %self.path.display(),
            op = "write",
            offset = begin,
            len = buf.len() as u64
        );
        loop {
            self.ensure_open();
            match self.try_write(begin, buf) {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        offset = begin,
                        len = buf.len(),
                        error = %e,
                        "short write, retrying in {:?}",
                        self.retry.delay
                    );
                    thread::sleep(self.retry.delay);
                }
            }
        }
    }

    fn try_write(&mut self, begin: u64, buf: &[u8]) -> io::Result<()> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Err(io::Error::new(io::ErrorKind::Other, "file handle closed")),
        };
        if self.reading || begin != self.write_pos {
            file.seek(SeekFrom::Start(begin))?;
            self.reading = false;
        }
        let mut written = 0;
        while written < buf.len() {
            let n = file.write(&buf[written..])?;
            self.write_pos = begin + written as u64 + n as u64;
            self.write_max = self.write_max.max(self.write_pos);
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("wrote {written} of {} bytes", buf.len()),
                ));
            }
            written += n;
        }
        Ok(())
    }

    /// Close the handle and resize the file on the filesystem; the next
    /// access reopens it.
    pub fn truncate(&mut self, new_size: u64) -> Result<(), DiskError> {
        self.close();
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|source| DiskError::Open {
                path: self.path.clone(),
                source,
            })?;
        file.set_len(new_size).map_err(|source| DiskError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.write_max = self.write_max.min(new_size);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// BufferedDisk
// ------------------------------------------------------------------------------------------------

/// Sequential read-ahead and write-coalescing over a [`FileDisk`].
///
/// Reads inside the 1 MiB read-ahead window return views into it; a read
/// past the window slides it forward. A read *behind* the window is
/// serviced by a small bypass buffer and logged — the design assumes
/// forward scans. Writes coalesce only while strictly contiguous.
#[derive(Debug)]
pub struct BufferedDisk {
    disk: FileDisk,
    file_size: u64,

    read_buffer: Vec<u8>,
    /// File offset the read buffer starts at; `u64::MAX` = unset.
    read_buffer_start: u64,
    read_buffer_size: u64,
    bypass: [u8; BYPASS_BUF],

    write_buffer: Vec<u8>,
    /// File offset the write buffer flushes to; `u64::MAX` = unset.
    write_buffer_start: u64,
}

impl BufferedDisk {
    pub fn new(disk: FileDisk, file_size: u64) -> Self {
        Self {
            disk,
            file_size,
            read_buffer: Vec::new(),
            read_buffer_start: u64::MAX,
            read_buffer_size: 0,
            bypass: [0u8; BYPASS_BUF],
            write_buffer: Vec::new(),
            write_buffer_start: u64::MAX,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Flush the write buffer and hand back the underlying file.
    pub fn into_inner(mut self) -> Result<FileDisk, DiskError> {
        self.flush_cache()?;
        Ok(self.disk)
    }

    /// Direct access to the underlying file. Callers must `flush_cache`
    /// first if they intend to read back coalesced writes.
    pub fn file_mut(&mut self) -> &mut FileDisk {
        &mut self.disk
    }

    /// Flush coalesced writes to the underlying file.
    pub fn flush_cache(&mut self) -> Result<(), DiskError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        self.disk.write(self.write_buffer_start, &self.write_buffer);
        self.write_buffer_start += self.write_buffer.len() as u64;
        self.write_buffer.clear();
        Ok(())
    }

    fn need_read_cache(&mut self) {
        if self.read_buffer.is_empty() {
            self.read_buffer = vec![0u8; READ_AHEAD as usize + READ_TAIL];
            self.read_buffer_start = u64::MAX;
            self.read_buffer_size = 0;
        }
    }

    fn need_write_cache(&mut self) {
        if self.write_buffer.capacity() == 0 {
            self.write_buffer.reserve_exact(WRITE_CACHE as usize);
            self.write_buffer_start = u64::MAX;
        }
    }

    fn note_write_end(&mut self, end: u64) {
        self.file_size = self.file_size.max(end);
    }
}

impl Disk for BufferedDisk {
    fn read(&mut self, begin: u64, length: u64) -> Result<&[u8], DiskError> {
        debug_assert!(length < READ_AHEAD);
        debug_assert!(begin + length <= self.file_size, "read past end of data");
        self.need_read_cache();

        if self.read_buffer_start <= begin
            && begin + length <= self.read_buffer_start + self.read_buffer_size
            && begin + length + READ_TAIL as u64 <= self.read_buffer_start + READ_AHEAD
        {
            // entirely inside the buffer
            let off = (begin - self.read_buffer_start) as usize;
            return Ok(&self.read_buffer[off..off + length as usize + READ_TAIL]);
        }

        if begin >= self.read_buffer_start || begin == 0 || self.read_buffer_start == u64::MAX {
            // forward-sequential (or first) read: slide the window to `begin`
            self.read_buffer_start = begin;
            let amount = READ_AHEAD.min(self.file_size - begin);
            self.disk.read(begin, &mut self.read_buffer[..amount as usize]);
            self.read_buffer_size = amount;
            let end = amount as usize;
            self.read_buffer[end..end + READ_TAIL].fill(0);
            return Ok(&self.read_buffer[..length as usize + READ_TAIL]);
        }

        // Regressed read: service it without wiping the forward window.
        warn!(
            file = %self.disk.path().display(),
            offset = begin,
            len = length,
            window_start = self.read_buffer_start,
            "read position regressed; this disk is optimized for forward scans"
        );
        debug_assert!(length as usize + READ_TAIL <= BYPASS_BUF);
        let len = length as usize;
        self.disk.read(begin, &mut self.bypass[..len]);
        self.bypass[len..len + READ_TAIL].fill(0);
        Ok(&self.bypass[..len + READ_TAIL])
    }

    fn write(&mut self, begin: u64, buf: &[u8]) -> Result<(), DiskError> {
        self.need_write_cache();
        let length = buf.len() as u64;

        if self.write_buffer_start != u64::MAX
            && begin == self.write_buffer_start + self.write_buffer.len() as u64
        {
            if self.write_buffer.len() as u64 + length <= WRITE_CACHE {
                self.write_buffer.extend_from_slice(buf);
                self.note_write_end(begin + length);
                return Ok(());
            }
            // contiguous but over capacity: flush, restart below
            self.flush_cache()?;
        } else if !self.write_buffer.is_empty() {
            // non-contiguous: flush the pending run, restart below
            self.flush_cache()?;
        }

        if length <= WRITE_CACHE {
            self.write_buffer_start = begin;
            self.write_buffer.extend_from_slice(buf);
        } else {
            self.disk.write(begin, buf);
        }
        self.note_write_end(begin + length);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> Result<(), DiskError> {
        self.flush_cache()?;
        self.disk.truncate(new_size)?;
        self.file_size = new_size;
        self.free_memory()
    }

    fn file_name(&self) -> &Path {
        self.disk.path()
    }

    fn free_memory(&mut self) -> Result<(), DiskError> {
        self.flush_cache()?;
        self.read_buffer = Vec::new();
        self.write_buffer = Vec::new();
        self.read_buffer_start = u64::MAX;
        self.read_buffer_size = 0;
        self.write_buffer_start = u64::MAX;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FilteredDisk
// ------------------------------------------------------------------------------------------------

/// Read-only compacted view: only entries whose filter bit is set exist at
/// logical offsets.
///
/// Maintains a cursor `(logical, physical, idx)` where `idx` always rests
/// on a set bit; a read at logical offset `L` advances the cursor over
/// cleared bits so that logical offset = (survivor rank) × entry size.
/// Reads must never regress and must be entry-aligned.
#[derive(Debug)]
pub struct FilteredDisk {
    filter: Bitfield,
    underlying: BufferedDisk,
    entry_size: u64,
    last_physical: u64,
    last_logical: u64,
    last_idx: u64,
}

impl FilteredDisk {
    pub fn new(underlying: BufferedDisk, filter: Bitfield, entry_size: u64) -> Self {
        assert!(entry_size > 0);
        let mut last_physical = 0;
        let mut last_idx = 0;
        while last_idx < filter.len() && !filter.get(last_idx) {
            last_physical += entry_size;
            last_idx += 1;
        }
        assert!(
            last_idx < filter.len(),
            "filter of {} has no surviving entries",
            underlying.file_name().display()
        );
        Self {
            filter,
            underlying,
            entry_size,
            last_physical,
            last_logical: 0,
            last_idx,
        }
    }
}

impl Disk for FilteredDisk {
    fn read(&mut self, begin: u64, length: u64) -> Result<&[u8], DiskError> {
        // single forward pass, entry-aligned
        assert!(
            begin >= self.last_logical,
            "filtered read regressed: {} < {} on {}",
            begin,
            self.last_logical,
            self.underlying.file_name().display()
        );
        debug_assert_eq!(begin % self.entry_size, 0);
        debug_assert!(self.filter.get(self.last_idx));

        if begin > self.last_logical {
            // the cursor rests on a survivor, so every counter takes at
            // least one step
            self.last_logical += self.entry_size;
            self.last_physical += self.entry_size;
            self.last_idx += 1;

            while begin > self.last_logical {
                if self.filter.get(self.last_idx) {
                    self.last_logical += self.entry_size;
                }
                self.last_physical += self.entry_size;
                self.last_idx += 1;
            }
            while !self.filter.get(self.last_idx) {
                self.last_physical += self.entry_size;
                self.last_idx += 1;
            }
        }

        debug_assert_eq!(begin, self.last_logical);
        self.underlying.read(self.last_physical, length)
    }

    fn write(&mut self, _begin: u64, _buf: &[u8]) -> Result<(), DiskError> {
        Err(DiskError::ReadOnly(self.underlying.file_name().to_path_buf()))
    }

    fn truncate(&mut self, new_size: u64) -> Result<(), DiskError> {
        self.underlying.truncate(new_size)?;
        if new_size == 0 {
            self.filter.free();
        }
        Ok(())
    }

    fn file_name(&self) -> &Path {
        self.underlying.file_name()
    }

    fn free_memory(&mut self) -> Result<(), DiskError> {
        self.filter.free();
        self.underlying.free_memory()
    }
}
