//! F1: the seeded table-1 function.
//!
//! The plot id keys a ChaCha8 keystream; `f1(x)` is the k-bit slice of
//! that stream starting at bit `x·k`, widened with the top 6 bits of `x`
//! so that matched pairs can be filtered more sharply in later tables.
//!
//! Table-1 generation walks x in order, so [`F1::iter`] streams the
//! keystream without seeking; [`F1::f`] gives random access for spot
//! checks and proofs-of-concept at small k.

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use crate::util::slice_u64_full;

use super::EXTRA_BITS;

/// Keystream bytes buffered per refill while streaming.
const STREAM_CHUNK: usize = 65_536;

/// ChaCha8-keyed f1 evaluator.
pub struct F1 {
    k: u32,
    id: [u8; 32],
}

impl F1 {
    pub fn new(k: u32, id: &[u8; 32]) -> Self {
        Self { k, id: *id }
    }

    /// `f1(x)` with the x-widening applied: a `k + 6` bit value.
    pub fn f(&self, x: u64) -> u64 {
        let bit = x * u64::from(self.k);
        let mut rng = ChaCha8Rng::from_seed(self.id);
        // seek to the 32-bit keystream word containing the slice
        rng.set_word_pos(u128::from(bit / 32));
        let mut buf = [0u8; 24];
        rng.fill_bytes(&mut buf[..16]);
        let f1 = slice_u64_full(&buf, (bit % 32) as u32, self.k);
        (f1 << EXTRA_BITS) | (x >> (self.k - EXTRA_BITS))
    }

    /// Stream `(x, y)` for `x` in `[first_x, first_x + count)`.
    pub fn iter(&self, first_x: u64, count: u64) -> F1Stream {
        let first_bit = first_x * u64::from(self.k);
        let aligned_word = first_bit / 32;
        let mut rng = ChaCha8Rng::from_seed(self.id);
        rng.set_word_pos(u128::from(aligned_word));
        let mut buf = vec![0u8; STREAM_CHUNK + 7];
        rng.fill_bytes(&mut buf[..STREAM_CHUNK]);
        F1Stream {
            k: self.k,
            rng,
            buf,
            valid: STREAM_CHUNK,
            buf_start_bit: aligned_word * 32,
            next_x: first_x,
            end_x: first_x + count,
        }
    }
}

/// Sequential f1 evaluation; see [`F1::iter`].
pub struct F1Stream {
    k: u32,
    rng: ChaCha8Rng,
    buf: Vec<u8>,
    valid: usize,
    buf_start_bit: u64,
    next_x: u64,
    end_x: u64,
}

impl F1Stream {
    fn refill(&mut self) {
        let rel_byte = ((self.next_x * u64::from(self.k) - self.buf_start_bit) / 8) as usize;
        let tail = self.valid - rel_byte;
        self.buf.copy_within(rel_byte..self.valid, 0);
        self.buf_start_bit += rel_byte as u64 * 8;
        self.rng.fill_bytes(&mut self.buf[tail..STREAM_CHUNK]);
        self.valid = STREAM_CHUNK;
    }
}

impl Iterator for F1Stream {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.next_x >= self.end_x {
            return None;
        }
        let x = self.next_x;
        let bit = x * u64::from(self.k);
        if ((bit - self.buf_start_bit) / 8) as usize + 16 > self.valid {
            self.refill();
        }
        let rel = (bit - self.buf_start_bit) as u32;
        let f1 = slice_u64_full(&self.buf, rel, self.k);
        let y = (f1 << EXTRA_BITS) | (x >> (self.k - EXTRA_BITS));
        self.next_x += 1;
        Some((x, y))
    }
}
