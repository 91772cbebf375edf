//! Configuration validation.
//!
//! Coverage:
//! - k range enforcement
//! - missing directories rejected up front
//! - memory floor and bucket-range rejections
//! - stripe-size sanity check
//! - the legacy non-bitfield path is refused, not silently ignored

#[cfg(test)]
mod tests {
    use crate::disk::RetryPolicy;
    use crate::plotter::{DiskPlotter, PlotConfig, PlotError};
    use tempfile::TempDir;

    fn base_config(tmp: &TempDir) -> PlotConfig {
        PlotConfig {
            k: 22,
            id: [0x11; 32],
            memo: vec![],
            tmp_dir: tmp.path().to_path_buf(),
            tmp2_dir: tmp.path().to_path_buf(),
            final_dir: tmp.path().to_path_buf(),
            filename: "test.plot".to_string(),
            memory_mib: 64,
            num_buckets: 0,
            stripe_size: 2000,
            num_threads: 1,
            disable_bitfield: false,
            retry: RetryPolicy::no_delay(),
        }
    }

    #[test]
    fn k_out_of_range_is_rejected() {
        let tmp = TempDir::new().unwrap();
        for k in [17, 51] {
            let config = PlotConfig {
                k,
                ..base_config(&tmp)
            };
            match DiskPlotter::new(config) {
                Err(PlotError::InvalidK(bad)) => assert_eq!(bad, k),
                other => panic!("k = {k}: expected InvalidK, got {:?}", other.err()),
            }
        }
        assert!(DiskPlotter::new(base_config(&tmp)).is_ok());
    }

    #[test]
    fn missing_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = PlotConfig {
            final_dir: tmp.path().join("not_here"),
            ..base_config(&tmp)
        };
        match DiskPlotter::new(config) {
            Err(PlotError::MissingDirectory(dir)) => {
                assert!(dir.ends_with("not_here"));
            }
            other => panic!("expected MissingDirectory, got {:?}", other.err()),
        }
    }

    #[test]
    fn memory_floor_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let config = PlotConfig {
            memory_mib: 9,
            ..base_config(&tmp)
        };
        match DiskPlotter::new(config) {
            Err(PlotError::InsufficientMemory { provided_mib, .. }) => {
                assert_eq!(provided_mib, 9);
            }
            other => panic!("expected InsufficientMemory, got {:?}", other.err()),
        }
    }

    #[test]
    fn explicit_bucket_count_out_of_range_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = PlotConfig {
            num_buckets: 8,
            ..base_config(&tmp)
        };
        match DiskPlotter::new(config) {
            Err(PlotError::InvalidBuckets { requested }) => assert_eq!(requested, 8),
            other => panic!("expected InvalidBuckets, got {:?}", other.err()),
        }
    }

    #[test]
    fn oversized_stripe_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = PlotConfig {
            k: 22,
            num_buckets: 128,
            stripe_size: 1 << 20,
            ..base_config(&tmp)
        };
        match DiskPlotter::new(config) {
            Err(PlotError::StripeTooLarge { num_buckets, .. }) => assert_eq!(num_buckets, 128),
            other => panic!("expected StripeTooLarge, got {:?}", other.err()),
        }
    }

    #[test]
    fn legacy_path_is_refused() {
        let tmp = TempDir::new().unwrap();
        let config = PlotConfig {
            disable_bitfield: true,
            ..base_config(&tmp)
        };
        match DiskPlotter::new(config) {
            Err(PlotError::BitfieldRequired) => {}
            other => panic!("expected BitfieldRequired, got {:?}", other.err()),
        }
    }

    #[test]
    fn derived_parameters_are_sane() {
        let tmp = TempDir::new().unwrap();
        let plotter = DiskPlotter::new(base_config(&tmp)).unwrap();
        let p = plotter.params();
        assert!(p.num_buckets.is_power_of_two());
        assert!((16..=128).contains(&p.num_buckets));
        assert_eq!(1u32 << p.log_num_buckets, p.num_buckets);
        assert!(p.memory_size < 64 << 20);
        assert!(p.sort_memory() + p.cache_memory() == p.memory_size);
        assert_eq!(p.num_threads, 1);
        assert_eq!(p.stripe_size, 2000);
    }
}
