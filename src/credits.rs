//! Fixed-point credit arithmetic.
//!
//! Credits are the canonical internal accounting unit. One credit is stored
//! as 10,000 integer units, exact to four decimal places. Balances, rates and
//! journal amounts never touch binary floating point; USD exists only at the
//! edges via a configured conversion rate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Integer units per whole credit.
pub const SCALE: i64 = 10_000;

/// A credit amount at fixed scale 10^-4.
///
/// Serializes as the raw unit count so journal entries round-trip exactly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub const fn from_units(units: i64) -> Self {
        Credits(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    pub const fn from_whole(credits: i64) -> Self {
        Credits(credits * SCALE)
    }

    /// Convert a decimal credit amount (config files, admin input) to fixed
    /// point, rounding half away from zero.
    pub fn from_decimal(value: f64) -> Self {
        let scaled = value * SCALE as f64;
        let rounded = if scaled >= 0.0 {
            (scaled + 0.5).floor()
        } else {
            (scaled - 0.5).ceil()
        };
        Credits(rounded as i64)
    }

    /// Decimal view for wire responses and logs. Never used in accounting.
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub fn to_usd(self, usd_per_credit: f64) -> f64 {
        self.to_decimal() * usd_per_credit
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn min(self, other: Self) -> Self {
        Credits(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Credits(self.0.max(other.0))
    }

    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        Credits(self.0.clamp(lo.0, hi.0))
    }

    /// Charge for `tokens` at a per-1K-token rate, rounded half away from
    /// zero to the credit scale.
    pub fn per_thousand(rate: Credits, tokens: u64) -> Self {
        let numerator = rate.0 as i128 * tokens as i128;
        Credits(div_round_half_away(numerator, 1_000) as i64)
    }

    /// Basis-point fraction of an amount (overdraft allowances, rollover
    /// percentages), rounded half away from zero.
    pub fn bps(self, basis_points: u32) -> Self {
        let numerator = self.0 as i128 * basis_points as i128;
        Credits(div_round_half_away(numerator, 10_000) as i64)
    }
}

/// Integer division rounding half away from zero. `den` must be positive.
fn div_round_half_away(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);
    if num >= 0 {
        (num + den / 2) / den
    } else {
        -((-num + den / 2) / den)
    }
}

impl Add for Credits {
    type Output = Credits;
    fn add(self, rhs: Self) -> Self {
        Credits(self.0 + rhs.0)
    }
}

impl AddAssign for Credits {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Credits {
    type Output = Credits;
    fn sub(self, rhs: Self) -> Self {
        Credits(self.0 - rhs.0)
    }
}

impl SubAssign for Credits {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Credits {
    type Output = Credits;
    fn neg(self) -> Self {
        Credits(-self.0)
    }
}

impl Sum for Credits {
    fn sum<I: Iterator<Item = Credits>>(iter: I) -> Self {
        Credits(iter.map(|c| c.0).sum())
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:04}", sign, abs / SCALE as u64, abs % SCALE as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_round_trip() {
        assert_eq!(Credits::from_decimal(0.8).units(), 8_000);
        assert_eq!(Credits::from_decimal(-0.00005).units(), -1);
        assert_eq!(Credits::from_decimal(1.23456).units(), 12_346);
    }

    #[test]
    fn test_per_thousand_pricing() {
        // 400 prompt tokens at 0.5 credits / 1K == 0.2 credits
        let in_rate = Credits::from_decimal(0.5);
        assert_eq!(Credits::per_thousand(in_rate, 400).units(), 2_000);
        // 600 completion tokens at 1.0 credits / 1K == 0.6 credits
        let out_rate = Credits::from_decimal(1.0);
        assert_eq!(Credits::per_thousand(out_rate, 600).units(), 6_000);
    }

    #[test]
    fn test_half_away_from_zero() {
        // 1 token at 0.0005/1K == 0.0000005 credits: rounds to one unit at
        // the midpoint, away from zero on both sides.
        assert_eq!(div_round_half_away(5, 10), 1);
        assert_eq!(div_round_half_away(-5, 10), -1);
        assert_eq!(div_round_half_away(4, 10), 0);
        assert_eq!(div_round_half_away(-4, 10), 0);
    }

    #[test]
    fn test_bps() {
        let limit = Credits::from_whole(100);
        assert_eq!(limit.bps(500), Credits::from_decimal(5.0));
        assert_eq!(limit.bps(0), Credits::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(Credits::from_decimal(0.8).to_string(), "0.8000");
        assert_eq!(Credits::from_decimal(-12.3456).to_string(), "-12.3456");
    }
}
