//! Back-propagation on synthetic tables.
//!
//! Coverage:
//! - already-compacted input is a fixed point: no entry is dropped, every
//!   bitfield ends up all-ones, and the rewritten tables carry identical
//!   `(sort_key, pos, offset)` triples
//! - dead entries are dropped and the surviving references renumbered

#[cfg(test)]
mod tests {
    use crate::bits::BitWriter;
    use crate::disk::{Disk, FileDisk, RetryPolicy};
    use crate::entry_sizes::{key_pos_offset_size, max_entry_size};
    use crate::phases::{phase2, progress_none};
    use crate::plotter::PlotterParams;
    use crate::pos::OFFSET_SIZE;
    use crate::util::slice_u64_full;
    use tempfile::TempDir;

    const K: u32 = 18;
    const N: u64 = 500;

    fn params(tmp: &TempDir) -> PlotterParams {
        PlotterParams {
            k: K,
            id: [0u8; 32],
            memo: vec![],
            tmp_dir: tmp.path().to_path_buf(),
            tmp2_dir: tmp.path().to_path_buf(),
            final_dir: tmp.path().to_path_buf(),
            filename: "mini".to_string(),
            memory_size: 16 << 20,
            num_buckets: 16,
            log_num_buckets: 4,
            stripe_size: 2000,
            num_threads: 1,
            retry: RetryPolicy::no_delay(),
        }
    }

    /// Write a table-1 stream of `N` x values and tables 2..7 where entry
    /// `i` references `(i, i + 1)` — the final entry doubles up on its
    /// predecessor so every index below stays referenced.
    fn write_compact_tables(p: &PlotterParams) {
        let t1_size = u64::from(max_entry_size(K, 1, false));
        let mut t1 = FileDisk::with_retry(p.table_path(1), true, p.retry).unwrap();
        for i in 0..N {
            let mut out = BitWriter::new();
            out.push(i, K);
            t1.write(i * t1_size, &out.finish_padded(t1_size as usize));
        }

        for t in 2..=7u8 {
            let entry_size = if t == 7 {
                u64::from(max_entry_size(K, 7, false))
            } else {
                u64::from(key_pos_offset_size(K))
            };
            let mut disk = FileDisk::with_retry(p.table_path(t), true, p.retry).unwrap();
            for i in 0..N {
                let pos = if i + 1 < N { i } else { N - 2 };
                let mut out = BitWriter::new();
                out.push(i, K); // sort_key (f7 for table 7)
                out.push(pos, K);
                out.push(1, OFFSET_SIZE);
                disk.write(i * entry_size, &out.finish_padded(entry_size as usize));
            }
        }
    }

    #[test]
    fn compacted_input_is_a_fixed_point() {
        let tmp = TempDir::new().unwrap();
        let p = params(&tmp);
        write_compact_tables(&p);

        let mut sizes = [0u64; 8];
        for t in 1..=7 {
            sizes[t] = N;
        }
        let mut out = phase2::run(&p, &sizes, &progress_none).expect("phase 2 failed");

        // nothing dropped anywhere
        for t in 1..=7 {
            assert_eq!(out.table_sizes[t], N, "table {t} changed size");
        }

        // rewritten tables carry the identical triples, still in pos order
        let entry_size = u64::from(key_pos_offset_size(K));
        for (slot, table) in (2..=6u8).enumerate() {
            let sm = &mut out.tables[slot];
            for i in 0..N {
                let view = sm.read(i * entry_size, entry_size).unwrap();
                let sort_key = slice_u64_full(view, 0, K);
                let pos = slice_u64_full(view, K, K);
                let offset = slice_u64_full(view, 2 * K, OFFSET_SIZE);
                assert_eq!(sort_key, i, "table {table}");
                assert_eq!(pos, if i + 1 < N { i } else { N - 2 });
                assert_eq!(offset, 1);
            }
        }

        // table 7 in place, references untouched by the identity remap
        let t7_size = u64::from(max_entry_size(K, 7, false));
        for i in 0..N {
            let view = out.table7.read(i * t7_size, t7_size).unwrap();
            assert_eq!(slice_u64_full(view, 0, K), i);
            assert_eq!(slice_u64_full(view, K, K), if i + 1 < N { i } else { N - 2 });
        }

        // table 1 filter is all-ones: logical order equals physical order
        let t1_size = u64::from(max_entry_size(K, 1, false));
        for i in 0..N {
            let view = out.table1.read(i * t1_size, t1_size).unwrap();
            assert_eq!(slice_u64_full(view, 0, K), i);
        }
    }

    #[test]
    fn dead_entries_are_dropped_and_renumbered() {
        let tmp = TempDir::new().unwrap();
        let p = params(&tmp);

        let t1_size = u64::from(max_entry_size(K, 1, false));
        let mut t1 = FileDisk::with_retry(p.table_path(1), true, p.retry).unwrap();
        for i in 0..N {
            let mut out = BitWriter::new();
            out.push(i, K);
            t1.write(i * t1_size, &out.finish_padded(t1_size as usize));
        }
        for t in 2..=6u8 {
            let entry_size = u64::from(key_pos_offset_size(K));
            let mut disk = FileDisk::with_retry(p.table_path(t), true, p.retry).unwrap();
            for i in 0..N {
                let pos = if i + 1 < N { i } else { N - 2 };
                let mut out = BitWriter::new();
                out.push(i, K);
                out.push(pos, K);
                out.push(1, OFFSET_SIZE);
                disk.write(i * entry_size, &out.finish_padded(entry_size as usize));
            }
        }
        // table 7 references only even table-6 entries (offset 2), so the
        // odd half of table 6 is dead
        let t7_size = u64::from(max_entry_size(K, 7, false));
        let mut t7 = FileDisk::with_retry(p.table_path(7), true, p.retry).unwrap();
        for i in 0..N / 2 {
            let pos = if 2 * i + 2 < N { 2 * i } else { N - 4 };
            let mut out = BitWriter::new();
            out.push(i, K);
            out.push(pos, K);
            out.push(2, OFFSET_SIZE);
            t7.write(i * t7_size, &out.finish_padded(t7_size as usize));
        }

        let mut sizes = [0u64; 8];
        for t in 1..=6 {
            sizes[t] = N;
        }
        sizes[7] = N / 2;
        let mut out = phase2::run(&p, &sizes, &progress_none).expect("phase 2 failed");

        // the odd half of table 6 died; its survivors still reference all
        // of table 5, so nothing below is dropped
        assert_eq!(out.table_sizes[6], N / 2);
        assert_eq!(out.table_sizes[5], N);
        assert_eq!(out.table_sizes[7], N / 2);

        // table 7's references were renumbered to the compacted table 6:
        // old (2i, 2i+2) becomes (i, i+1)
        for i in 0..4u64 {
            let view = out.table7.read(i * t7_size, t7_size).unwrap();
            assert_eq!(slice_u64_full(view, K, K), i, "entry {i}");
            assert_eq!(slice_u64_full(view, 2 * K, OFFSET_SIZE), 1);
        }

        // surviving table-6 entries got dense sort keys in f order and
        // kept their (identity-remapped) references
        let entry_size = u64::from(key_pos_offset_size(K));
        let t6 = &mut out.tables[4];
        for j in 0..out.table_sizes[6] {
            let view = t6.read(j * entry_size, entry_size).unwrap();
            assert_eq!(slice_u64_full(view, 0, K), j, "sort key");
            let expect_pos = if 2 * j + 1 < N { 2 * j } else { N - 2 };
            assert_eq!(slice_u64_full(view, K, K), expect_pos);
        }
    }
}
