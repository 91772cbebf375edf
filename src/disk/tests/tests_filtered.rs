//! FilteredDisk compacted-view projection.
//!
//! Coverage:
//! - the alternating-filter scenario: logical offsets map to survivors only
//! - repeated reads at the same logical offset
//! - leading cleared bits skipped at construction
//! - writes rejected as read-only

#[cfg(test)]
mod tests {
    use crate::bitfield::Bitfield;
    use crate::disk::{BufferedDisk, Disk, DiskError, FileDisk, FilteredDisk};
    use tempfile::TempDir;

    const ENTRY: u64 = 8;

    /// Ten 8-byte entries, entry i filled with byte i.
    fn underlying(tmp: &TempDir, name: &str) -> BufferedDisk {
        let file = FileDisk::create(tmp.path().join(name)).unwrap();
        let mut disk = BufferedDisk::new(file, 0);
        for i in 0u8..10 {
            disk.write(u64::from(i) * ENTRY, &[i; ENTRY as usize]).unwrap();
        }
        disk.flush_cache().unwrap();
        disk
    }

    /// Filter pattern `0101010101` read MSB-first: odd indices survive.
    fn odd_filter() -> Bitfield {
        let mut f = Bitfield::new(10);
        for i in [1u64, 3, 5, 7, 9] {
            f.set(i);
        }
        f
    }

    #[test]
    fn logical_offsets_map_to_survivors() {
        let tmp = TempDir::new().unwrap();
        let mut disk = FilteredDisk::new(underlying(&tmp, "odd.tmp"), odd_filter(), ENTRY);

        for (logical, expect) in [(0u64, 1u8), (8, 3), (16, 5), (24, 7), (32, 9)] {
            let view = disk.read(logical, ENTRY).unwrap();
            assert_eq!(&view[..ENTRY as usize], &[expect; 8], "logical {logical}");
        }
    }

    #[test]
    fn repeated_read_returns_same_entry() {
        let tmp = TempDir::new().unwrap();
        let mut disk = FilteredDisk::new(underlying(&tmp, "rep.tmp"), odd_filter(), ENTRY);

        let first = disk.read(8, ENTRY).unwrap().to_vec();
        let again = disk.read(8, ENTRY).unwrap().to_vec();
        assert_eq!(first, again);
        assert_eq!(&first[..8], &[3u8; 8]);
    }

    #[test]
    fn leading_dead_entries_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let mut filter = Bitfield::new(10);
        filter.set(4);
        filter.set(6);
        let mut disk = FilteredDisk::new(underlying(&tmp, "lead.tmp"), filter, ENTRY);

        assert_eq!(&disk.read(0, ENTRY).unwrap()[..8], &[4u8; 8]);
        assert_eq!(&disk.read(8, ENTRY).unwrap()[..8], &[6u8; 8]);
    }

    #[test]
    fn writes_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut disk = FilteredDisk::new(underlying(&tmp, "ro.tmp"), odd_filter(), ENTRY);
        match disk.write(0, b"nope") {
            Err(DiskError::ReadOnly(_)) => {}
            other => panic!("expected ReadOnly, got {other:?}"),
        }
    }
}
