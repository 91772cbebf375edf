//! The four pipeline phases.
//!
//! | Phase | Direction | Work |
//! |-------|-----------|------|
//! | [`phase1`] | tables 1 → 7 | evaluate F1..F7, match adjacent groups, emit bucketed tables |
//! | [`phase2`] | tables 7 → 2 | mark live entries in bitfields, compact and renumber |
//! | [`phase3`] | tables 1 → 6 | fold back-pointers into line points, write parks |
//! | [`phase4`] | table 7      | P7 parks and the C1/C2/C3 checkpoint tables |
//!
//! Phases run strictly in sequence; each hands the next its outputs by
//! move. All heavy lifting inside a phase goes through the
//! [`SortManager`](crate::sort::SortManager).

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod phase4;

use thiserror::Error;

use crate::disk::DiskError;
use crate::encoding::EncodingError;
use crate::sort::SortError;

/// Progress observer: `(phase, n, max_n)`.
pub type ProgressFn = dyn Fn(u8, u64, u64) + Send + Sync;

/// No-op progress observer.
pub fn progress_none(_phase: u8, _n: u64, _max_n: u64) {}

/// Phase 4 emits at most this many progress events.
pub const MAX_PHASE4_PROGRESS_UPDATES: u64 = 16;

/// Errors escaping a phase driver. Configuration problems are caught
/// before phase 1 starts; what remains is I/O, sort-memory exhaustion,
/// and encoding-budget overflows.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Sort(#[from] SortError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}
