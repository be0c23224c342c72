use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// A time in the future that will, for all practical purposes, never happen.
///
/// Used as a sentinel for "no timeout scheduled". Stable across calls so
/// values compare equal.
pub(crate) fn not_happening() -> Instant {
    const YEARS_100: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);
    static FUTURE: Lazy<Instant> = Lazy::new(|| Instant::now() + YEARS_100);
    *FUTURE
}

/// A time that has already passed when the process started.
///
/// Used as a sentinel for "due immediately".
pub(crate) fn already_happened() -> Instant {
    const HOURS_1: Duration = Duration::from_secs(60 * 60);
    static PAST: Lazy<Instant> =
        Lazy::new(|| Instant::now().checked_sub(HOURS_1).unwrap_or_else(Instant::now));
    *PAST
}

/// Pick the earlier of two optional deadlines, keeping a label for tracing.
pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for (Option<Instant>, &'static str) {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            ((Some(v1), s1), (Some(v2), s2)) => {
                if v1 < v2 {
                    (Some(v1), s1)
                } else {
                    (Some(v2), s2)
                }
            }
            ((None, _), (None, _)) => (None, ""),
            ((None, _), (v, s)) => (v, s),
            ((v, s), (None, _)) => (v, s),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_happening_is_stable_and_in_future() {
        assert_eq!(not_happening(), not_happening());
        assert!(Instant::now() < not_happening());
    }

    #[test]
    fn already_happened_is_stable_and_in_past() {
        assert_eq!(already_happened(), already_happened());
        assert!(Instant::now() > already_happened());
    }

    #[test]
    fn sentinels_differ() {
        assert_ne!(not_happening(), already_happened());
    }

    #[test]
    fn soonest_picks_earlier() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        assert_eq!(
            (Some(now), "a").soonest((Some(later), "b")),
            (Some(now), "a")
        );
        assert_eq!((None, "a").soonest((Some(later), "b")), (Some(later), "b"));
        assert_eq!((None, "a").soonest((None, "b")), (None, ""));
    }
}
