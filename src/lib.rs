//! # plotforge
//!
//! A disk-based **proof-of-space plot builder**: from a 32-byte seed it
//! materialises a file of seven cryptographically derived tables,
//! organised so a verifier can turn a challenge into a proof with a
//! handful of reads. Intermediate data outgrows RAM by one to two orders
//! of magnitude, so everything is built around bucketed disk I/O and an
//! external-memory sort engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       DiskPlotter                          │
//! │  phase1 ─► phase2 ─► phase3 ─► phase4      (strict order)  │
//! │    │          │         │         │                        │
//! │    ▼          ▼         ▼         ▼                        │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ SortManager   bucketed on-disk sort, streaming reads │  │
//! │  ├──────────────────────────────────────────────────────┤  │
//! │  │ BufferedDisk / FilteredDisk / FileDisk               │  │
//! │  │ read-ahead · write coalescing · bitfield compaction  │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │   pos: F1 (ChaCha8) · F2..F7 (BLAKE3) · BC matching        │
//! │   encoding: line points · parks · checkpoints              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`plotter`] | Configuration, validation, phase orchestration, final file |
//! | [`phases`] | Forward propagation, back-propagation, compression, checkpoints |
//! | [`sort`] | Bucketed external sort with a streaming consumer cursor |
//! | [`disk`] | Positioned file I/O, read-ahead, write coalescing, filtered views |
//! | [`bitfield`] | Dense bit arrays with rank acceleration |
//! | [`pos`] | The F1..F7 function family and the matching relation |
//! | [`encoding`] | Line points, Rice-coded deltas, parks, C1/C2/C3 |
//! | [`entry_sizes`] | Bit-packed record widths per table and phase |
//! | [`bits`], [`util`] | Bit-string assembly and slicing primitives |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use plotforge::disk::RetryPolicy;
//! use plotforge::phases::progress_none;
//! use plotforge::plotter::{DiskPlotter, PlotConfig};
//!
//! let config = PlotConfig {
//!     k: 26,
//!     id: [0x42; 32],
//!     memo: vec![],
//!     tmp_dir: "/mnt/scratch".into(),
//!     tmp2_dir: "/mnt/scratch".into(),
//!     final_dir: "/mnt/plots".into(),
//!     filename: "plot-k26.dat".into(),
//!     memory_mib: 0,
//!     num_buckets: 0,
//!     stripe_size: 0,
//!     num_threads: 0,
//!     disable_bitfield: false,
//!     retry: RetryPolicy::default(),
//! };
//!
//! let summary = DiskPlotter::new(config)
//!     .and_then(|p| p.create_plot(&progress_none))
//!     .expect("plotting failed");
//! println!("{} ({} bytes)", summary.final_path.display(), summary.final_size);
//! ```

pub mod bitfield;
pub mod bits;
pub mod disk;
pub mod encoding;
pub mod entry_sizes;
pub mod phases;
pub mod plotter;
pub mod pos;
pub mod sort;
pub mod util;
