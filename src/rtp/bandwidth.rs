use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::time::Duration;

/// A data rate expressed as bits per second (bps).
///
/// Internally the value is tracked as a floating point number for accuracy in
/// the presence of repeated calculations that yield decimal values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bitrate(f64);

impl Bitrate {
    pub const ZERO: Self = Self::bps(0);

    pub const fn bps(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    pub const fn kbps(kbps: u64) -> Self {
        Self::bps(kbps * 10_u64.pow(3))
    }

    pub const fn mbps(mbps: u64) -> Self {
        Self::bps(mbps * 10_u64.pow(6))
    }

    pub const fn gbps(gbps: u64) -> Self {
        Self::bps(gbps * 10_u64.pow(9))
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    pub fn clamp(&self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::bps(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bits = self.0 * rhs.as_secs_f64();

        DataSize::bytes((bits / 8.0).round() as i64)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl Add<Bitrate> for Bitrate {
    type Output = Bitrate;

    fn add(self, rhs: Bitrate) -> Self::Output {
        Bitrate(self.0 + rhs.0)
    }
}

impl Sub<Bitrate> for Bitrate {
    type Output = Bitrate;

    fn sub(self, rhs: Bitrate) -> Self::Output {
        Bitrate(self.0 - rhs.0)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0;
        if rate <= 0.0 {
            return write!(f, "{rate}bit/s");
        }
        let log = rate.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{rate}bit/s"),
            3..=5 => write!(f, "{:.3}kbit/s", rate / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}Mbit/s", rate / 10.0_f64.powf(6.0)),
            9..=11 => write!(f, "{:.3}Gbit/s", rate / 10.0_f64.powf(9.0)),
            12.. => write!(f, "{:.3}Tbit/s", rate / 10.0_f64.powf(12.0)),
        }
    }
}

/// An amount of data in bytes.
///
/// Signed: the pacer budgets track debt as negative sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataSize(i64);

impl DataSize {
    pub const ZERO: Self = DataSize::bytes(0);

    pub const fn bytes(bytes: i64) -> DataSize {
        Self(bytes)
    }

    pub fn as_bytes_i64(&self) -> i64 {
        self.0
    }

    pub fn as_bytes_usize(&self) -> usize {
        self.0.max(0) as usize
    }

    pub fn as_bytes_f64(&self) -> f64 {
        self.0 as f64
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl From<usize> for DataSize {
    fn from(value: usize) -> Self {
        Self(value as i64)
    }
}

impl From<u16> for DataSize {
    fn from(value: u16) -> Self {
        Self(value as i64)
    }
}

impl Neg for DataSize {
    type Output = DataSize;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub<DataSize> for DataSize {
    type Output = DataSize;

    fn sub(self, rhs: DataSize) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl SubAssign<DataSize> for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        self.0 -= rhs.0;
    }
}

impl Mul<i64> for DataSize {
    type Output = DataSize;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        if rhs.is_zero() {
            return Bitrate::ZERO;
        }
        let bps = (self.as_bytes_f64() * 8.0) / rhs.as_secs_f64();

        bps.into()
    }
}

impl Div<Bitrate> for DataSize {
    type Output = Duration;

    fn div(self, rhs: Bitrate) -> Self::Output {
        if rhs.as_f64() <= 0.0 || self.0 <= 0 {
            return Duration::ZERO;
        }
        let bits = self.as_bytes_f64() * 8.0;
        let seconds = bits / rhs.as_f64();

        Duration::from_secs_f64(seconds)
    }
}

impl Sum<DataSize> for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0 as f64;
        if size <= 0.0 {
            return write!(f, "{size}B");
        }
        let log = size.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{size}B"),
            3..=5 => write!(f, "{:.3}kB", size / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}MB", size / 10.0_f64.powf(6.0)),
            9.. => write!(f, "{:.3}GB", size / 10.0_f64.powf(9.0)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bitrate_times_duration_is_size() {
        let size = Bitrate::kbps(1000) * Duration::from_secs(1);
        assert_eq!(size, DataSize::bytes(125_000));
    }

    #[test]
    fn size_over_duration_is_rate() {
        let rate = DataSize::bytes(2_500_000) / Duration::from_secs(1);
        assert_eq!(rate.as_u64(), 20_000_000);
    }

    #[test]
    fn size_over_rate_is_duration() {
        let duration = DataSize::bytes(12_500) / Bitrate::bps(2_500_000);
        assert_eq!(duration.as_millis(), 40);
    }

    #[test]
    fn negative_size_yields_zero_duration() {
        let duration = DataSize::bytes(-100) / Bitrate::kbps(100);
        assert_eq!(duration, Duration::ZERO);
    }

    #[test]
    fn size_debt_arithmetic() {
        let mut v = DataSize::ZERO;
        v -= DataSize::bytes(500);
        assert_eq!(v.as_bytes_i64(), -500);
        assert_eq!(v.as_bytes_usize(), 0);
        v += DataSize::bytes(700);
        assert_eq!(v.as_bytes_i64(), 200);
    }

    #[test]
    fn bitrate_display() {
        assert_eq!(Bitrate::bps(123).to_string(), "123bit/s");
        assert_eq!(Bitrate::bps(1_234).to_string(), "1.234kbit/s");
        assert_eq!(Bitrate::bps(1_234_567).to_string(), "1.235Mbit/s");
        assert_eq!(Bitrate::gbps(2).to_string(), "2.000Gbit/s");
    }
}
