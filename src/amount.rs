use std::fmt;

/// Fixed-point money value with 4 decimal places, stored as a scaled integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 10_000;

    pub const ZERO: Amount = Amount(0);

    pub fn from_float(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Whole currency units, e.g. `Amount::units(500)` is `500.0000`.
    pub fn units(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Subtract, returning `None` if the result would be negative or overflow.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0
            .checked_sub(rhs.0)
            .filter(|v| *v >= 0)
            .map(Amount)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// One of `parts` equal shares, rounded down to the smallest unit.
    ///
    /// The remainder (at most `parts - 1` scaled units) stays unallocated.
    pub fn split(self, parts: u32) -> Option<Self> {
        if parts == 0 {
            return None;
        }
        Some(Amount(self.0 / i64::from(parts)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_float_converts_correctly() {
        assert_eq!(Amount::from_float(100.0), Amount::from_scaled(1_000_000));
        assert_eq!(Amount::from_float(1.5), Amount::from_scaled(15_000));
        assert_eq!(Amount::from_float(0.0001), Amount::from_scaled(1));
    }

    #[test]
    fn from_float_rounds_correctly() {
        assert_eq!(Amount::from_float(1.23456), Amount::from_scaled(12346));
        assert_eq!(Amount::from_float(1.23454), Amount::from_scaled(12345));
    }

    #[test]
    fn units_scale_whole_values() {
        assert_eq!(Amount::units(500), Amount::from_float(500.0));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Amount::from_scaled(1_000_000).to_string(), "100.0000");
        assert_eq!(Amount::from_scaled(1).to_string(), "0.0001");
        assert_eq!(Amount::from_scaled(0).to_string(), "0.0000");
        assert_eq!(Amount::from_scaled(-502_500).to_string(), "-50.2500");
    }

    #[test]
    fn checked_sub_refuses_negative_result() {
        let a = Amount::from_scaled(100);
        assert_eq!(a.checked_sub(Amount::from_scaled(30)), Some(Amount::from_scaled(70)));
        assert_eq!(a.checked_sub(a), Some(Amount::ZERO));
        assert_eq!(a.checked_sub(Amount::from_scaled(101)), None);
    }

    #[test]
    fn split_rounds_down() {
        assert_eq!(Amount::units(1000).split(2), Some(Amount::units(500)));
        assert_eq!(Amount::from_scaled(10).split(3), Some(Amount::from_scaled(3)));
        assert_eq!(Amount::units(1).split(0), None);
    }

    #[test]
    fn sum_of_amounts() {
        let total: Amount = [1, 2, 3].into_iter().map(Amount::from_scaled).sum();
        assert_eq!(total, Amount::from_scaled(6));
    }

    #[test]
    fn ordering() {
        let negative = Amount::from_scaled(-100);
        let positive = Amount::from_scaled(100);
        assert!(negative < Amount::ZERO);
        assert!(Amount::ZERO < positive);
        assert!(negative.is_negative());
        assert!(positive.is_positive());
    }
}
