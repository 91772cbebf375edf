//! In-memory sort kernels.
//!
//! Coverage:
//! - quicksort orders by the bit-offset comparator, not whole bytes
//! - uniform scatter sort agrees with quicksort on uniform keys
//! - uniform sort reports `NonUniformSuspicion` on aliased keys

#[cfg(test)]
mod tests {
    use crate::disk::FileDisk;
    use crate::sort::{quicksort, uniform, SortError};
    use crate::util::{mem_cmp_bits, round_size};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cmp::Ordering;
    use tempfile::TempDir;

    const ENTRY: usize = 16;

    fn random_entries(n: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; n * ENTRY];
        rng.fill(&mut data[..]);
        data
    }

    fn assert_sorted(memory: &[u8], n: usize, bits_begin: u32) {
        for i in 1..n {
            let prev = &memory[(i - 1) * ENTRY..i * ENTRY];
            let cur = &memory[i * ENTRY..(i + 1) * ENTRY];
            assert_ne!(
                mem_cmp_bits(prev, cur, ENTRY, bits_begin),
                Ordering::Greater,
                "entries {} and {} out of order",
                i - 1,
                i
            );
        }
    }

    #[test]
    fn quicksort_orders_from_bit_offset() {
        let n = 5000;
        let mut data = random_entries(n, 1);
        quicksort::sort(&mut data, ENTRY, n as u64, 5);
        assert_sorted(&data, n, 5);
    }

    #[test]
    fn quicksort_handles_duplicates_and_tiny_ranges() {
        let mut rng = StdRng::seed_from_u64(2);
        let n = 2000;
        let mut data = vec![0u8; n * ENTRY];
        // keys drawn from a tiny alphabet: plenty of duplicates
        for e in 0..n {
            let key: u8 = rng.gen_range(0..4);
            data[e * ENTRY] = key;
        }
        quicksort::sort(&mut data, ENTRY, n as u64, 0);
        assert_sorted(&data, n, 0);

        // ranges at or below the insertion cutoff
        for n in 0..=5usize {
            let mut small = random_entries(n.max(1), 3 + n as u64);
            quicksort::sort(&mut small, ENTRY, n as u64, 0);
            if n > 0 {
                assert_sorted(&small, n, 0);
            }
        }
    }

    #[test]
    fn uniform_agrees_with_quicksort() {
        let tmp = TempDir::new().unwrap();
        let n = 10_000u64;
        let data = random_entries(n as usize, 4);

        let mut disk = FileDisk::create(tmp.path().join("input.tmp")).unwrap();
        disk.write(0, &data);

        let mut scatter = vec![0u8; round_size(n) as usize * ENTRY + 7];
        uniform::sort_to_memory(&mut disk, 0, &mut scatter, ENTRY, n, 0).unwrap();

        let mut reference = data;
        quicksort::sort(&mut reference, ENTRY, n, 0);

        assert_eq!(&scatter[..n as usize * ENTRY], &reference[..]);
    }

    #[test]
    fn uniform_rejects_aliased_keys() {
        let tmp = TempDir::new().unwrap();
        let n = 6000u64;
        let mut data = random_entries(n as usize, 5);
        // all entries share their first 8 key bytes: every probe lands in
        // the same slot and the chain overruns the bound
        for e in 0..n as usize {
            data[e * ENTRY..e * ENTRY + 8].copy_from_slice(&[0x42; 8]);
        }
        let mut disk = FileDisk::create(tmp.path().join("aliased.tmp")).unwrap();
        disk.write(0, &data);

        let mut scatter = vec![0u8; round_size(n) as usize * ENTRY + 7];
        match uniform::sort_to_memory(&mut disk, 0, &mut scatter, ENTRY, n, 0) {
            Err(SortError::NonUniformSuspicion) => {}
            other => panic!("expected NonUniformSuspicion, got {other:?}"),
        }
    }
}
