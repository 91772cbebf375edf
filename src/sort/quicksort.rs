//! In-place quicksort over fixed-size bit-packed records.
//!
//! Records are compared bit-wise from `bits_begin` to the end of the entry
//! via [`mem_cmp_bits`]. The pivot lives in a single scratch slot outside
//! the array; partitioning fills the hole it leaves from alternating ends.
//! Recursion always descends into the smaller side, so stack depth stays
//! logarithmic even on skewed input — which is exactly the input this sort
//! exists for (the last bucket's high key bits alias, defeating the
//! uniform scatter sort).

use std::cmp::Ordering;

use crate::util::mem_cmp_bits;

/// Ranges at or below this size use insertion sort.
const INSERTION_CUTOFF: usize = 5;

/// Sort `num_entries` records of `entry_len` bytes in place, ordered by
/// `mem_cmp_bits(_, _, entry_len, bits_begin)`.
pub fn sort(memory: &mut [u8], entry_len: usize, num_entries: u64, bits_begin: u32) {
    if num_entries < 2 {
        return;
    }
    let mut pivot = vec![0u8; entry_len];
    sort_range(memory, entry_len, bits_begin, 0, num_entries as usize, &mut pivot);
}

fn cmp_at(memory: &[u8], entry_len: usize, bits_begin: u32, i: usize, other: &[u8]) -> Ordering {
    mem_cmp_bits(
        &memory[i * entry_len..(i + 1) * entry_len],
        other,
        entry_len,
        bits_begin,
    )
}

fn sort_range(
    memory: &mut [u8],
    entry_len: usize,
    bits_begin: u32,
    mut begin: usize,
    mut end: usize,
    pivot: &mut [u8],
) {
    loop {
        if end - begin <= INSERTION_CUTOFF {
            insertion_sort(memory, entry_len, bits_begin, begin, end, pivot);
            return;
        }

        let mut lo = begin;
        let mut hi = end - 1;
        pivot.copy_from_slice(&memory[hi * entry_len..(hi + 1) * entry_len]);
        let mut left_side = true;

        // `pivot` owns the hole; fill it from whichever side the scan is on.
        while lo < hi {
            if left_side {
                if cmp_at(memory, entry_len, bits_begin, lo, pivot) == Ordering::Less {
                    lo += 1;
                } else {
                    memory.copy_within(lo * entry_len..(lo + 1) * entry_len, hi * entry_len);
                    hi -= 1;
                    left_side = false;
                }
            } else if cmp_at(memory, entry_len, bits_begin, hi, pivot) == Ordering::Greater {
                hi -= 1;
            } else {
                memory.copy_within(hi * entry_len..(hi + 1) * entry_len, lo * entry_len);
                lo += 1;
                left_side = true;
            }
        }
        memory[lo * entry_len..(lo + 1) * entry_len].copy_from_slice(pivot);

        // recurse into the smaller partition, iterate on the larger
        if lo - begin <= end - lo {
            sort_range(memory, entry_len, bits_begin, begin, lo, pivot);
            begin = lo + 1;
        } else {
            sort_range(memory, entry_len, bits_begin, lo + 1, end, pivot);
            end = lo;
        }
    }
}

fn insertion_sort(
    memory: &mut [u8],
    entry_len: usize,
    bits_begin: u32,
    begin: usize,
    end: usize,
    scratch: &mut [u8],
) {
    for i in begin + 1..end {
        scratch.copy_from_slice(&memory[i * entry_len..(i + 1) * entry_len]);
        let mut j = i;
        while j > begin
            && cmp_at(memory, entry_len, bits_begin, j - 1, scratch) == Ordering::Greater
        {
            memory.copy_within((j - 1) * entry_len..j * entry_len, j * entry_len);
            j -= 1;
        }
        memory[j * entry_len..(j + 1) * entry_len].copy_from_slice(scratch);
    }
}
