//! Park and C3 serialization.
//!
//! Coverage:
//! - 2048 line points `i·3` at k = 20 round-trip and the park is exactly
//!   `park_size(20, 3)` bytes
//! - random monotone line points round-trip, including a partial park
//! - delta-budget overflow is reported
//! - C3 parks round-trip at their fixed width

#[cfg(test)]
mod tests {
    use crate::encoding::{
        decode_c3, decode_park, encode_c3, encode_park, EncodingError,
    };
    use crate::entry_sizes::{c3_size, park_size, ENTRIES_PER_PARK, STUB_MINUS_BITS};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Split a sorted line-point run into (first, stubs, deltas) the way
    /// the park writer does.
    fn split(k: u32, points: &[u128]) -> (u128, Vec<u64>, Vec<u64>) {
        let stub_bits = k - STUB_MINUS_BITS;
        let mut stubs = Vec::new();
        let mut deltas = Vec::new();
        for pair in points.windows(2) {
            let gap = (pair[1] - pair[0]) as u64;
            stubs.push(gap & ((1u64 << stub_bits) - 1));
            deltas.push(gap >> stub_bits);
        }
        (points[0], stubs, deltas)
    }

    #[test]
    fn full_park_roundtrip_at_fixed_size() {
        let k = 20;
        let points: Vec<u128> = (0..u128::from(ENTRIES_PER_PARK)).map(|i| i * 3).collect();
        let (first, stubs, deltas) = split(k, &points);

        let park = encode_park(k, 3, first, &stubs, &deltas).unwrap();
        assert_eq!(park.len(), park_size(k, 3) as usize);

        let decoded = decode_park(k, 3, &park, points.len()).unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn random_gaps_roundtrip() {
        let k = 24;
        let mut rng = StdRng::seed_from_u64(31);
        let mut lp = 0u128;
        let mut points = Vec::new();
        // gaps around 2^k: the distribution parks are sized for
        for _ in 0..ENTRIES_PER_PARK {
            lp += u128::from(rng.gen_range(0..(1u64 << k) * 2));
            points.push(lp);
        }
        let (first, stubs, deltas) = split(k, &points);
        let park = encode_park(k, 2, first, &stubs, &deltas).unwrap();
        assert_eq!(park.len(), park_size(k, 2) as usize);
        assert_eq!(decode_park(k, 2, &park, points.len()).unwrap(), points);
    }

    #[test]
    fn partial_final_park_roundtrips() {
        let k = 20;
        let points: Vec<u128> = (0..777u128).map(|i| i * i).collect();
        let (first, stubs, deltas) = split(k, &points);
        let park = encode_park(k, 1, first, &stubs, &deltas).unwrap();
        assert_eq!(park.len(), park_size(k, 1) as usize);
        assert_eq!(decode_park(k, 1, &park, points.len()).unwrap(), points);
    }

    #[test]
    fn delta_budget_overflow_is_reported() {
        let k = 20;
        // every delta enormous: the unary quotients blow the budget
        let stubs = vec![0u64; (ENTRIES_PER_PARK - 1) as usize];
        let deltas = vec![1u64 << 20; (ENTRIES_PER_PARK - 1) as usize];
        match encode_park(k, 3, 0, &stubs, &deltas) {
            Err(EncodingError::DeltasOverflow { got, budget }) => assert!(got > budget),
            other => panic!("expected DeltasOverflow, got {other:?}"),
        }
    }

    #[test]
    fn c3_roundtrip_at_fixed_size() {
        let k = 22;
        let mut rng = StdRng::seed_from_u64(32);
        // f7 deltas are dense: mostly 0 and 1, occasionally larger
        let deltas: Vec<u64> = (0..10_000)
            .map(|_| match rng.gen_range(0..100) {
                0..=49 => 0,
                50..=89 => 1,
                90..=98 => 2,
                _ => rng.gen_range(3..10),
            })
            .collect();
        let park = encode_c3(k, &deltas).unwrap();
        assert_eq!(park.len(), c3_size(k) as usize);
        assert_eq!(decode_c3(&park, deltas.len()).unwrap(), deltas);
    }
}
