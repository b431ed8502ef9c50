// Seeded random stream for the destruction simulation.
//
// xoshiro256++ (Blackman & Vigna) expanded from a single `u64` seed through
// SplitMix64. Written out by hand so that a replay recorded on one machine
// produces the same collapse on every other machine: no `rand`, no OS
// entropy, no platform-dependent float paths in the core generator.
//
// The simulation draws from exactly three places: the randomized delay
// between overload damage steps, the choice of which live voxel a stressed
// member loses, and the keep/discard roll for crumble debris. Every draw goes
// through `SimRng`, and the generator state is serialized with the rest of the
// structure so a reloaded save continues the same stream.
//
// **Critical constraint: determinism.** Output depends only on the seed and the
// number of prior draws. Never add a method that reads the clock or mixes in
// addresses.

use serde::{Deserialize, Serialize};

/// The simulation's only source of randomness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRng {
    state: [u64; 4],
}

impl SimRng {
    /// Expand `seed` into the 256-bit generator state.
    pub fn new(seed: u64) -> Self {
        let mut mix = seed;
        let state = [
            splitmix64(&mut mix),
            splitmix64(&mut mix),
            splitmix64(&mut mix),
            splitmix64(&mut mix),
        ];
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let s = &mut self.state;
        let out = s[0].wrapping_add(s[3]).rotate_left(23).wrapping_add(s[0]);
        let shifted = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= shifted;
        s[3] = s[3].rotate_left(45);

        out
    }

    /// Uniform `f64` in `[0, 1)` built from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `[low, high)`. Returns `low` for an empty range.
    ///
    /// Uses rejection sampling, so the distribution has no modulo bias even
    /// for awkward range sizes.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let span = high - low;
        if span.is_power_of_two() {
            return low + (self.next_u64() & (span - 1));
        }
        let zone = span.wrapping_neg() % span;
        loop {
            let r = self.next_u64();
            if r >= zone {
                return low + r % span;
            }
        }
    }

    /// Uniform integer in `[low, high]`. Used for tick delays where both
    /// configured bounds must be reachable.
    pub fn range_inclusive_u64(&mut self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        if high == u64::MAX {
            // span would overflow; fall back to the half-open draw and let the
            // top value be unreachable.
            return self.range_u64(low, high);
        }
        self.range_u64(low, high + 1)
    }

    /// Uniform index into a collection of `len` elements, `None` when empty.
    pub fn pick_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(self.range_u64(0, len as u64) as usize)
        }
    }

    /// `true` with probability `p`. Values at or below 0 never hit, values
    /// at or above 1 always do.
    pub fn chance(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.next_f64() < p
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_replays_the_same_stream() {
        let mut a = SimRng::new(7);
        let mut b = SimRng::new(7);
        for _ in 0..500 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn neighbouring_seeds_diverge() {
        let mut a = SimRng::new(7);
        let mut b = SimRng::new(8);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn delay_draw_reaches_both_bounds() {
        let mut rng = SimRng::new(2024);
        let mut saw_low = false;
        let mut saw_high = false;
        for _ in 0..5_000 {
            let d = rng.range_inclusive_u64(50, 53);
            assert!((50..=53).contains(&d));
            saw_low |= d == 50;
            saw_high |= d == 53;
        }
        assert!(saw_low && saw_high);
    }

    #[test]
    fn degenerate_ranges_return_low() {
        let mut rng = SimRng::new(1);
        assert_eq!(rng.range_u64(9, 9), 9);
        assert_eq!(rng.range_u64(9, 3), 9);
        assert_eq!(rng.range_inclusive_u64(4, 4), 4);
    }

    #[test]
    fn pick_index_stays_in_bounds() {
        let mut rng = SimRng::new(99);
        assert_eq!(rng.pick_index(0), None);
        for _ in 0..2_000 {
            let i = rng.pick_index(5).unwrap();
            assert!(i < 5);
        }
    }

    #[test]
    fn chance_extremes_are_exact() {
        let mut rng = SimRng::new(3);
        for _ in 0..200 {
            assert!(!rng.chance(0.0));
            assert!(rng.chance(1.0));
        }
    }

    #[test]
    fn chance_tracks_probability() {
        let mut rng = SimRng::new(31337);
        let hits = (0..20_000).filter(|_| rng.chance(0.25)).count();
        // 25% of 20k = 5000; allow a generous band.
        assert!((4_500..5_500).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn unit_float_never_reaches_one() {
        let mut rng = SimRng::new(11);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn serialized_state_resumes_stream() {
        let mut rng = SimRng::new(55);
        for _ in 0..17 {
            rng.next_u64();
        }
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: SimRng = serde_json::from_str(&json).unwrap();
        for _ in 0..100 {
            assert_eq!(rng.next_u64(), restored.next_u64());
        }
    }
}
