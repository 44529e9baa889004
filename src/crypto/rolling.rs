//! Adler-style 32-bit rolling checksum with O(1) window slide.
//!
//! `a` is the sum of the window's bytes; `b` is the sum of the bytes each
//! weighted by their distance from the end of the window. Both are kept
//! mod 2^16 and combined as `(b << 16) | a`. Sliding the window by one byte
//! updates both sums in constant time without rescanning the window —
//! this is what makes an O(n) scan over the whole file for every candidate
//! block size affordable.
//!
//! This checksum is a *filter*, not an identity: two different windows can
//! collide on it. Every match must be confirmed with the strong hash
//! ([`super::hash::strong_hash`]) before it is trusted.

const MODULUS: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct RollingChecksum {
    window_size: u32,
    a: u32,
    b: u32,
}

impl RollingChecksum {
    /// Compute the checksum of an initial window from scratch. `O(window
    /// length)`; only ever called once per window size, then maintained
    /// incrementally via [`Self::roll`].
    pub fn new(window: &[u8]) -> Self {
        let n = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((n - i as u32).wrapping_mul(byte as u32));
        }
        Self {
            window_size: n,
            a: a % MODULUS,
            b: b % MODULUS,
        }
    }

    /// Current checksum value over the live window.
    #[inline]
    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Slide the window forward by one byte: `out_byte` leaves at the
    /// front, `in_byte` joins at the back. The window size is unchanged.
    /// Constant time, independent of window size.
    pub fn roll(&mut self, out_byte: u8, in_byte: u8) {
        self.a = self
            .a
            .wrapping_sub(out_byte as u32)
            .wrapping_add(in_byte as u32)
            % MODULUS;
        self.b = self
            .b
            .wrapping_sub(self.window_size.wrapping_mul(out_byte as u32))
            .wrapping_add(self.a)
            % MODULUS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_fresh_computation_after_roll() {
        let data = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let window = 8usize;
        let mut rc = RollingChecksum::new(&data[0..window]);
        for start in 1..=(data.len() - window) {
            rc.roll(data[start - 1], data[start + window - 1]);
            let fresh = RollingChecksum::new(&data[start..start + window]);
            assert_eq!(
                rc.value(),
                fresh.value(),
                "mismatch rolling to offset {start}"
            );
        }
    }

    #[test]
    fn identical_windows_match() {
        let a = RollingChecksum::new(b"identical");
        let b = RollingChecksum::new(b"identical");
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn different_windows_usually_differ() {
        let a = RollingChecksum::new(b"aaaaaaaa");
        let b = RollingChecksum::new(b"aaaaaaab");
        assert_ne!(a.value(), b.value());
    }

    proptest::proptest! {
        /// Rolling to any offset must agree with recomputing the checksum
        /// from scratch over the same window, for arbitrary data and
        /// window sizes (not just the fixed alphabet in the test above).
        #[test]
        fn rolls_match_fresh_computation_for_arbitrary_input(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 9..300),
            window in 1usize..8,
        ) {
            let mut rc = RollingChecksum::new(&data[0..window]);
            for start in 1..=(data.len() - window) {
                rc.roll(data[start - 1], data[start + window - 1]);
                let fresh = RollingChecksum::new(&data[start..start + window]);
                proptest::prop_assert_eq!(rc.value(), fresh.value());
            }
        }
    }
}
