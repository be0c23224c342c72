use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg as _, Sub};
use std::time::{Duration, Instant};

/// Wrapper for [`Instant`] that also represents points in the distant past
/// or future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timestamp {
    /// A time that already happened.
    #[allow(dead_code)]
    DistantPast,

    /// An exact instant.
    Exact(Instant),

    /// A time that will never happen.
    #[allow(dead_code)]
    DistantFuture,
}

/// Wrapper for [`Duration`] that can be negative.
///
/// Delay variations are differences of arrival and departure deltas and are
/// routinely negative; `std::time::Duration` cannot express that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeDelta {
    NegativeInfinity,
    Negative(Duration),
    Positive(Duration),
    PositiveInfinity,
}

impl TimeDelta {
    pub(crate) const ZERO: Self = Self::Positive(Duration::ZERO);

    /// Seconds as `f64`, negative for negative deltas.
    pub(crate) fn as_secs_f64(&self) -> f64 {
        match self {
            Self::NegativeInfinity => f64::NEG_INFINITY,
            Self::Negative(d) => d.as_secs_f64().neg(),
            Self::Positive(d) => d.as_secs_f64(),
            Self::PositiveInfinity => f64::INFINITY,
        }
    }

    /// Milliseconds as `f64`, negative for negative deltas.
    pub(crate) fn as_millis_f64(&self) -> f64 {
        self.as_secs_f64() * 1000.0
    }

    #[cfg(test)]
    pub(crate) const fn from_millis(millis: i64) -> Self {
        if millis >= 0 {
            Self::Positive(Duration::from_millis(millis as u64))
        } else {
            Self::Negative(Duration::from_millis(-millis as u64))
        }
    }
}

impl Sub<Self> for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::DistantFuture, _) | (_, Self::DistantPast) => TimeDelta::PositiveInfinity,
            (Self::DistantPast, _) | (_, Self::DistantFuture) => TimeDelta::NegativeInfinity,
            (Self::Exact(this), Self::Exact(that)) => match this.cmp(&that) {
                Ordering::Less => TimeDelta::Negative(that - this),
                Ordering::Equal => TimeDelta::ZERO,
                Ordering::Greater => TimeDelta::Positive(this - that),
            },
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Self::cmp(self, other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::DistantPast, Self::DistantPast) => Ordering::Equal,
            (Self::DistantPast, _) => Ordering::Less,
            (_, Self::DistantPast) => Ordering::Greater,
            (Self::DistantFuture, Self::DistantFuture) => Ordering::Equal,
            (Self::DistantFuture, _) => Ordering::Greater,
            (_, Self::DistantFuture) => Ordering::Less,
            (Self::Exact(v1), Self::Exact(v2)) => v1.cmp(v2),
        }
    }
}

impl From<Instant> for Timestamp {
    fn from(value: Instant) -> Self {
        Self::Exact(value)
    }
}

impl Add<Self> for TimeDelta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::PositiveInfinity, _) | (_, Self::PositiveInfinity) => Self::PositiveInfinity,
            (Self::NegativeInfinity, _) | (_, Self::NegativeInfinity) => Self::NegativeInfinity,
            (Self::Negative(this), Self::Negative(that)) => Self::Negative(this + that),
            (Self::Positive(this), Self::Positive(that)) => Self::Positive(this + that),
            (Self::Positive(this), Self::Negative(that)) => match this.cmp(&that) {
                Ordering::Less => Self::Negative(that - this),
                Ordering::Equal => Self::ZERO,
                Ordering::Greater => Self::Positive(this - that),
            },
            (Self::Negative(this), Self::Positive(that)) => match this.cmp(&that) {
                Ordering::Less => Self::Positive(that - this),
                Ordering::Equal => Self::ZERO,
                Ordering::Greater => Self::Negative(this - that),
            },
        }
    }
}

impl Sub<Self> for TimeDelta {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        let negated = match rhs {
            Self::NegativeInfinity => Self::PositiveInfinity,
            Self::Negative(d) => Self::Positive(d),
            Self::Positive(d) => Self::Negative(d),
            Self::PositiveInfinity => Self::NegativeInfinity,
        };

        self + negated
    }
}

impl PartialOrd for TimeDelta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Self::cmp(self, other))
    }
}

impl Ord for TimeDelta {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::NegativeInfinity, Self::NegativeInfinity) => Ordering::Equal,
            (Self::NegativeInfinity, _) => Ordering::Less,
            (_, Self::NegativeInfinity) => Ordering::Greater,
            (Self::PositiveInfinity, Self::PositiveInfinity) => Ordering::Equal,
            (Self::PositiveInfinity, _) => Ordering::Greater,
            (_, Self::PositiveInfinity) => Ordering::Less,
            (Self::Negative(_), Self::Positive(_)) => Ordering::Less,
            (Self::Positive(_), Self::Negative(_)) => Ordering::Greater,
            (Self::Positive(this), Self::Positive(that)) => this.cmp(that),
            (Self::Negative(this), Self::Negative(that)) => that.cmp(this),
        }
    }
}

impl PartialEq<Duration> for TimeDelta {
    fn eq(&self, other: &Duration) -> bool {
        *self == Self::from(*other)
    }
}

impl PartialOrd<Duration> for TimeDelta {
    fn partial_cmp(&self, other: &Duration) -> Option<Ordering> {
        Some(Self::cmp(self, &Self::from(*other)))
    }
}

impl From<Duration> for TimeDelta {
    fn from(value: Duration) -> Self {
        Self::Positive(value)
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeDelta::NegativeInfinity => write!(f, "-Inf"),
            TimeDelta::Negative(v) => write!(f, "-{:.03}", v.as_secs_f32()),
            TimeDelta::Positive(v) => write!(f, "{:.03}", v.as_secs_f32()),
            TimeDelta::PositiveInfinity => write!(f, "+Inf"),
        }
    }
}
