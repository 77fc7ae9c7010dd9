//! Time bases and timestamp conversion.
//!
//! Streams carry timestamps in their own fractional time base. The host works
//! in 100 ns units ("hns"). All rescaling goes through i128 so large
//! timestamps in fine time bases cannot overflow.

use serde::{Deserialize, Serialize};

/// 100 ns host ticks per second.
pub const HNS_PER_SECOND: i64 = 10_000_000;

/// Container-level time base (microseconds).
pub const CONTAINER_TIME_BASE: Rational = Rational { num: 1, den: 1_000_000 };

/// Host time base (100 ns).
pub const HOST_TIME_BASE: Rational = Rational { num: 1, den: HNS_PER_SECOND };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Both terms positive. Zero or negative terms mean "unset".
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn reduced(&self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()) as i64;
        if g <= 1 {
            return *self;
        }
        Self::new(self.num / g, self.den / g)
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Nearest,
    Down,
}

/// Rescale `value` from time base `from` to time base `to`.
pub fn rescale(value: i64, from: Rational, to: Rational, rounding: Rounding) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let out = match rounding {
        Rounding::Down => num.div_euclid(den),
        Rounding::Nearest => {
            let half = den / 2;
            if num >= 0 {
                (num + half) / den
            } else {
                -((-num + half) / den)
            }
        }
    };
    out.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Stream ticks to host 100 ns units.
pub fn to_hns(ticks: i64, time_base: Rational) -> i64 {
    rescale(ticks, time_base, HOST_TIME_BASE, Rounding::Nearest)
}

/// Host 100 ns units to stream ticks, rounding towards the earlier tick so a
/// seek never lands after the requested position.
pub fn from_hns(hns: i64, time_base: Rational) -> i64 {
    rescale(hns, HOST_TIME_BASE, time_base, Rounding::Down)
}

/// Container duration (microseconds) to host units.
pub fn container_to_hns(us: i64) -> i64 {
    rescale(us, CONTAINER_TIME_BASE, HOST_TIME_BASE, Rounding::Nearest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hns_millisecond_base() {
        let ms = Rational::new(1, 1000);
        assert_eq!(to_hns(33, ms), 330_000);
        assert_eq!(to_hns(0, ms), 0);
    }

    #[test]
    fn test_from_hns_rounds_down() {
        let tb = Rational::new(1, 90_000);
        // 1/3 s = 30000 ticks exactly
        assert_eq!(from_hns(3_333_333, tb), 29_999);
        assert_eq!(from_hns(HNS_PER_SECOND, tb), 90_000);
    }

    #[test]
    fn test_negative_values() {
        let ms = Rational::new(1, 1000);
        assert_eq!(to_hns(-40, ms), -400_000);
        assert_eq!(rescale(-1, HOST_TIME_BASE, ms, Rounding::Down), -1);
    }

    #[test]
    fn test_container_duration() {
        assert_eq!(container_to_hns(2_500_000), 25_000_000);
    }

    #[test]
    fn test_large_timestamps_do_not_overflow() {
        let tb = Rational::new(1, 1_000_000_000);
        let ticks = 9_000_000_000_000_000; // ~104 days in ns
        assert_eq!(to_hns(ticks, tb), 90_000_000_000_000);
    }

    #[test]
    fn test_reduced_and_valid() {
        assert_eq!(Rational::new(1_000_000, 1_000_000_000).reduced(), Rational::new(1, 1000));
        assert!(!Rational::new(0, 1).is_valid());
        assert!(!Rational::new(30, 0).is_valid());
        assert!(Rational::new(30000, 1001).is_valid());
    }
}
