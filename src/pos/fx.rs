//! F2..F7 mixing and the BC-group matching relation.

use crate::bits::BitWriter;
use crate::util::slice_u64_full;

use super::{B_GROUPS, BC_GROUP, C_GROUPS, EXTRA_BITS, MATCH_TARGETS, VECTOR_LENS};

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Maximum metadata width: 4k bits at k = 50.
const META_MAX_BITS: u32 = 200;

/// A table entry's collation metadata: an MSB-aligned bit string of up to
/// 200 bits (4k at the largest supported k), stored inline so the phase-1
/// hot loop never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Bit string from bit 0; sized so both the 8-byte append window and
    /// the 7-byte slicing tail stay in bounds.
    buf: [u8; 40],
    bits: u32,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            buf: [0u8; 40],
            bits: 0,
        }
    }
}

impl Metadata {
    /// Copy `num_bits` starting at `start_bit` out of `src` (which must
    /// carry the 7-byte tail).
    pub fn from_bits(src: &[u8], start_bit: u32, num_bits: u32) -> Self {
        let mut meta = Self::default();
        meta.append(src, start_bit, num_bits);
        meta
    }

    /// `left ‖ right`.
    pub fn concat(left: &Metadata, right: &Metadata) -> Self {
        let mut meta = Self::default();
        meta.append(&left.buf, 0, left.bits);
        meta.append(&right.buf, 0, right.bits);
        meta
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Backing bytes, tail included; valid for bit slicing.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn append(&mut self, src: &[u8], start_bit: u32, num_bits: u32) {
        debug_assert!(self.bits + num_bits <= META_MAX_BITS);
        let mut done = 0;
        while done < num_bits {
            let take = (num_bits - done).min(32);
            let v = slice_u64_full(src, start_bit + done, take);
            self.append_value(v, take);
            done += take;
        }
    }

    fn append_value(&mut self, v: u64, take: u32) {
        let byte = (self.bits / 8) as usize;
        let shift_in = self.bits % 8;
        let mut window = [0u8; 8];
        window.copy_from_slice(&self.buf[byte..byte + 8]);
        let word = u64::from_be_bytes(window) | ((v << (64 - take)) >> shift_in);
        self.buf[byte..byte + 8].copy_from_slice(&word.to_be_bytes());
        self.bits += take;
    }
}

// ------------------------------------------------------------------------------------------------
// Fx
// ------------------------------------------------------------------------------------------------

/// Mixing function producing table `table` (2..=7) from matched pairs of
/// the table below.
pub struct Fx {
    k: u32,
    table: u8,
    input_meta_bits: u32,
    output_meta_bits: u32,
}

impl Fx {
    pub fn new(k: u32, table: u8) -> Self {
        debug_assert!((2..=7).contains(&table));
        let input_meta_bits = k * VECTOR_LENS[table as usize];
        let output_meta_bits = if table == 7 {
            0
        } else {
            k * VECTOR_LENS[table as usize + 1]
        };
        Self {
            k,
            table,
            input_meta_bits,
            output_meta_bits,
        }
    }

    /// Output f width: `k + 6`, or plain `k` at table 7.
    pub fn f_bits(&self) -> u32 {
        if self.table == 7 {
            self.k
        } else {
            self.k + EXTRA_BITS
        }
    }

    /// Mix one matched pair: BLAKE3 over the packed `(y, c_l, c_r)`.
    pub fn calculate(&self, y: u64, left: &Metadata, right: &Metadata) -> (u64, Metadata) {
        debug_assert_eq!(left.bits(), self.input_meta_bits);
        debug_assert_eq!(right.bits(), self.input_meta_bits);

        let mut input = BitWriter::with_capacity(64);
        input.push(y, self.k + EXTRA_BITS);
        input.push_slice_bits(left.as_bytes(), 0, self.input_meta_bits);
        input.push_slice_bits(right.as_bytes(), 0, self.input_meta_bits);
        let hash = blake3::hash(&input.finish());

        let mut digest = [0u8; 39]; // 32 hash bytes + slicing tail
        digest[..32].copy_from_slice(hash.as_bytes());

        let f = slice_u64_full(&digest, 0, self.f_bits());
        let meta = match self.table {
            2 | 3 => Metadata::concat(left, right),
            4 | 5 | 6 => Metadata::from_bits(&digest, self.k + EXTRA_BITS, self.output_meta_bits),
            _ => Metadata::default(),
        };
        (f, meta)
    }
}

// ------------------------------------------------------------------------------------------------
// Matching
// ------------------------------------------------------------------------------------------------

/// Evaluates the matching relation between two adjacent BC-groups.
///
/// A left entry with residues `(b_l, c_l)` matches a right entry with
/// residues `(b_r, c_r)` iff, for some shift `m < 64`,
///
/// ```text
///   b_r = (b_l + m) mod B
///   c_r = (c_l + (2m + parity)²) mod C      parity = group(left) mod 2
/// ```
///
/// The right group is indexed once into a residue map; each left entry
/// then probes its 64 targets. Entries sharing a residue cell share a `y`
/// value and sit adjacently in the sorted group, so a cell is just
/// `(first position, count)`.
pub struct Matcher {
    /// Per-cell entry count in the current right group.
    rmap_count: Vec<u8>,
    /// Per-cell first position in the current right group.
    rmap_first: Vec<u16>,
    /// Cells touched by the current right group, for O(group) reset.
    clean: Vec<usize>,
    /// `target_c[parity][c][m]`, flattened.
    targets: Vec<u16>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        let mut targets = vec![0u16; 2 * C_GROUPS as usize * MATCH_TARGETS];
        for parity in 0..2u64 {
            for c in 0..C_GROUPS {
                for m in 0..MATCH_TARGETS as u64 {
                    let shift = (2 * m + parity) * (2 * m + parity);
                    let idx = ((parity * C_GROUPS + c) as usize) * MATCH_TARGETS + m as usize;
                    targets[idx] = ((c + shift) % C_GROUPS) as u16;
                }
            }
        }
        Self {
            rmap_count: vec![0u8; BC_GROUP as usize],
            rmap_first: vec![0u16; BC_GROUP as usize],
            clean: Vec::new(),
            targets,
        }
    }

    /// Find all matches between `left` (every y in BC-group g) and `right`
    /// (every y in group g+1), both sorted ascending. Pushes
    /// `(left_index, right_index)` pairs, ordered by left index then shift.
    pub fn find_matches(&mut self, left: &[u64], right: &[u64], out: &mut Vec<(u16, u16)>) {
        for &cell in &self.clean {
            self.rmap_count[cell] = 0;
        }
        self.clean.clear();
        if left.is_empty() || right.is_empty() {
            return;
        }

        let group = left[0] / BC_GROUP;
        let parity = (group % 2) as usize;
        let left_base = group * BC_GROUP;
        let right_base = (group + 1) * BC_GROUP;

        for (i, &y) in right.iter().enumerate() {
            debug_assert_eq!(y / BC_GROUP, group + 1);
            let cell = (y - right_base) as usize;
            if self.rmap_count[cell] == 0 {
                self.rmap_first[cell] = i as u16;
                self.clean.push(cell);
            }
            // the count caps at 255 duplicates per y; degenerate inputs
            // beyond that lose matches rather than corrupt the map
            self.rmap_count[cell] = self.rmap_count[cell].saturating_add(1);
        }

        for (i, &y) in left.iter().enumerate() {
            debug_assert_eq!(y / BC_GROUP, group);
            let local = y - left_base;
            let (bl, cl) = (local / C_GROUPS, local % C_GROUPS);
            let target_row = (parity as u64 * C_GROUPS + cl) as usize * MATCH_TARGETS;
            for m in 0..MATCH_TARGETS {
                let tb = (bl + m as u64) % B_GROUPS;
                let tc = u64::from(self.targets[target_row + m]);
                let cell = (tb * C_GROUPS + tc) as usize;
                let first = self.rmap_first[cell];
                for j in 0..self.rmap_count[cell] {
                    out.push((i as u16, first + u16::from(j)));
                }
            }
        }
    }
}
