//! End-to-end plotting scenarios.
//!
//! Builds real (small) plots on disk and verifies the observable
//! contracts: the byte-exact header, a consistent table-pointer array,
//! decodable parks, checkpoint geometry, full determinism across runs,
//! and temp-file cleanup.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use plotforge::disk::RetryPolicy;
use plotforge::encoding::{decode_park, line_point_to_square};
use plotforge::entry_sizes::{c3_size, park_size, ENTRIES_PER_PARK};
use plotforge::phases::progress_none;
use plotforge::plotter::{DiskPlotter, PlotConfig, PlotSummary, HEADER_MAGIC};

const K: u32 = 18;

fn init_tracing() {
    let _ = Subscriber::builder().with_max_level(Level::WARN).try_init();
}

fn build_plot(dir: &Path, name: &str, id: [u8; 32]) -> PlotSummary {
    let config = PlotConfig {
        k: K,
        id,
        memo: vec![0xbe, 0xef],
        tmp_dir: dir.to_path_buf(),
        tmp2_dir: dir.to_path_buf(),
        final_dir: dir.to_path_buf(),
        filename: name.to_string(),
        memory_mib: 64,
        num_buckets: 64,
        stripe_size: 2000,
        num_threads: 1,
        disable_bitfield: false,
        retry: RetryPolicy::no_delay(),
    };
    DiskPlotter::new(config)
        .expect("config rejected")
        .create_plot(&progress_none)
        .expect("plotting failed")
}

fn read_pointers(bytes: &[u8], header_size: usize) -> Vec<u64> {
    (0..10)
        .map(|slot| {
            let at = header_size - 80 + slot * 8;
            u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap())
        })
        .collect()
}

#[test]
fn zero_id_plot_is_well_formed_and_deterministic() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let summary = build_plot(tmp.path(), "k18-zero.dat", [0u8; 32]);

    let bytes = fs::read(&summary.final_path).expect("final file missing");
    assert_eq!(bytes.len() as u64, summary.final_size);

    // ---- header ----------------------------------------------------------------------------

    assert_eq!(&bytes[..19], HEADER_MAGIC);
    assert_eq!(&bytes[19..51], &[0u8; 32]);
    assert_eq!(bytes[51], K as u8);
    let desc_len = u16::from_be_bytes([bytes[52], bytes[53]]) as usize;
    let memo_off = 54 + desc_len;
    let memo_len = u16::from_be_bytes([bytes[memo_off], bytes[memo_off + 1]]) as usize;
    assert_eq!(memo_len, 2);
    assert_eq!(&bytes[memo_off + 2..memo_off + 4], &[0xbe, 0xef]);
    let header_size = memo_off + 2 + memo_len + 80;

    // ---- pointer array ---------------------------------------------------------------------

    let pointers = read_pointers(&bytes, header_size);
    assert_eq!(pointers[0], header_size as u64, "table 1 begins after the header");
    for w in pointers.windows(2) {
        assert!(w[0] < w[1], "table pointers must ascend: {pointers:?}");
    }
    assert!(pointers[9] < bytes.len() as u64);

    // park regions are whole multiples of their fixed park size
    for t in 1..=6u8 {
        let extent = pointers[t as usize] - pointers[t as usize - 1];
        assert_eq!(
            extent % u64::from(park_size(K, t)),
            0,
            "table {t} region is not park-aligned"
        );
    }
    // the C3 region is whole parks too
    assert_eq!((bytes.len() as u64 - pointers[9]) % u64::from(c3_size(K)), 0);

    // ---- table 1 parks hold valid x pairs --------------------------------------------------

    let park0 = &bytes[pointers[0] as usize..pointers[0] as usize + park_size(K, 1) as usize];
    let line_points = decode_park(K, 1, park0, ENTRIES_PER_PARK as usize).expect("park decode");
    let mut prev = 0u128;
    for &lp in &line_points {
        assert!(lp >= prev, "line points must be sorted");
        prev = lp;
        let (x1, x2) = line_point_to_square(lp);
        assert!(x1 < 1 << K && x2 < 1 << K, "x values out of range");
    }

    // ---- every table was populated ---------------------------------------------------------

    assert_eq!(summary.table_sizes[1], 1 << K);
    for t in 2..=7 {
        let entries = summary.table_sizes[t];
        assert!(
            entries > (1 << K) / 4 && entries <= 1 << K,
            "table {t} has an implausible entry count: {entries}"
        );
    }

    // ---- determinism: an identical run produces identical bytes ----------------------------

    let tmp2 = TempDir::new().unwrap();
    let again = build_plot(tmp2.path(), "k18-zero.dat", [0u8; 32]);
    assert_eq!(again.final_size, summary.final_size);
    let bytes2 = fs::read(&again.final_path).unwrap();
    assert_eq!(bytes, bytes2, "two identical runs must be byte-identical");

    // a different id produces a different file
    let tmp3 = TempDir::new().unwrap();
    let other = build_plot(tmp3.path(), "k18-one.dat", [1u8; 32]);
    let bytes3 = fs::read(&other.final_path).unwrap();
    assert_ne!(bytes[..1024], bytes3[..1024]);
}

#[test]
fn temp_files_are_cleaned_up() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let summary = build_plot(tmp.path(), "cleanup.dat", [7u8; 32]);
    assert!(summary.final_path.exists());

    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}
