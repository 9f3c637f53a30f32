//! Monotonic time types used for connection deadlines and backoff scheduling.
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A monotonic instant, expressed as microseconds since an arbitrary epoch.
///
/// Connections schedule deadlines in absolute microseconds (see
/// [`crate::connection::Connection::get_timeout_date`]); this type is what
/// those deadlines are compared against.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct MonoTime {
    micros: u128,
}

impl MonoTime {
    /// Read the current monotonic time.
    pub fn now() -> Self {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(Instant::now);

        Self {
            micros: Instant::now().duration_since(start).as_micros(),
        }
    }

    /// Construct a time from a microsecond count. Used by tests and by
    /// callers that persist a deadline computed elsewhere.
    pub const fn from_micros(micros: u128) -> Self {
        Self { micros }
    }

    /// Whole microseconds since the epoch this clock was started at.
    pub const fn as_micros(&self) -> u128 {
        self.micros
    }

    /// Saturating duration until `other`, zero if `other` is not later.
    pub fn until(&self, other: MonoTime) -> Duration {
        Duration::from_micros(other.micros.saturating_sub(self.micros))
    }
}

impl std::ops::Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime {
            micros: self.micros + rhs.0,
        }
    }
}

impl std::ops::Sub<MonoTime> for MonoTime {
    type Output = Duration;

    fn sub(self, rhs: MonoTime) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(rhs.micros))
    }
}

/// A duration measured in microseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub struct Duration(u128);

impl Duration {
    /// The zero duration.
    pub const ZERO: Duration = Duration(0);

    /// Construct from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1_000_000)
    }

    /// Construct from whole milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis as u128 * 1_000)
    }

    /// Construct from whole microseconds.
    pub const fn from_micros(micros: u128) -> Self {
        Self(micros)
    }

    /// Number of whole microseconds.
    pub const fn as_micros(&self) -> u128 {
        self.0
    }

    /// Number of whole milliseconds, rounded down.
    pub const fn as_millis(&self) -> u128 {
        self.0 / 1_000
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.0 as u64)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Duration::from_micros(d.as_micros())
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch.
///
/// Used only where the wire format or a handler needs a human-meaningful
/// timestamp (e.g. the `ALIVE` built-in reply's `timestamp` parameter);
/// the reactor's own scheduling always uses [`MonoTime`].
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

/// Tracks a set of keyed deadlines and reports which have elapsed.
///
/// The reactor calls [`TimeoutManager::wake`] once per loop iteration
/// irrespective of whether `poll` returned readiness or timed out, so a
/// fully-saturated reader can never starve an elapsed timer.
#[derive(Debug, Default)]
pub struct TimeoutManager<K> {
    timeouts: Vec<(K, MonoTime)>,
}

impl<K: Clone> TimeoutManager<K> {
    /// Create an empty timeout manager.
    pub fn new() -> Self {
        Self {
            timeouts: Vec::new(),
        }
    }

    /// Track a new deadline for `key`, replacing any previous deadline for
    /// an equal key is the caller's responsibility (the manager does not
    /// deduplicate by key identity, since keys here are connection handles
    /// that may be compared by pointer).
    pub fn register(&mut self, key: K, at: MonoTime) {
        self.timeouts.push((key, at));
    }

    /// Remove every deadline for which `matches` returns true. Used when a
    /// connection is removed from the reactor mid-iteration.
    pub fn retain(&mut self, mut matches: impl FnMut(&K) -> bool) {
        self.timeouts.retain(|(k, _)| matches(k));
    }

    /// Whole count of deadlines currently tracked.
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// True if no deadlines are tracked.
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// The earliest tracked deadline, if any.
    pub fn next_deadline(&self) -> Option<MonoTime> {
        self.timeouts.iter().map(|(_, t)| *t).min()
    }

    /// Duration to wait before the earliest deadline elapses, `None` if
    /// there are no deadlines to wait for.
    pub fn wait_duration(&self, now: MonoTime) -> Option<Duration> {
        self.next_deadline().map(|deadline| now.until(deadline))
    }

    /// Drain every key whose deadline has elapsed as of `now` into `woken`,
    /// returning how many were added. Elapsed entries are removed; the rest
    /// remain tracked.
    pub fn wake(&mut self, now: MonoTime, woken: &mut Vec<K>) -> usize {
        let before = woken.len();
        let (elapsed, pending): (Vec<_>, Vec<_>) =
            self.timeouts.drain(..).partition(|(_, t)| *t <= now);

        self.timeouts = pending;
        woken.extend(elapsed.into_iter().map(|(k, _)| k));

        woken.len() - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_drains_only_elapsed_entries() {
        let mut mgr: TimeoutManager<&str> = TimeoutManager::new();
        let base = MonoTime::from_micros(1_000_000);
        mgr.register("early", base);
        mgr.register("late", base + Duration::from_secs(10));
        assert_eq!(mgr.len(), 2);

        let mut woken = Vec::new();
        let count = mgr.wake(base, &mut woken);
        assert_eq!(count, 1);
        assert_eq!(woken, vec!["early"]);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.next_deadline(), Some(base + Duration::from_secs(10)));
    }

    #[test]
    fn wait_duration_is_none_when_empty() {
        let mgr: TimeoutManager<u64> = TimeoutManager::new();
        assert_eq!(mgr.wait_duration(MonoTime::now()), None);
    }

    #[test]
    fn retain_drops_matching_keys() {
        let mut mgr: TimeoutManager<u64> = TimeoutManager::new();
        let at = MonoTime::from_micros(0);
        mgr.register(1, at);
        mgr.register(2, at);
        mgr.retain(|&k| k != 1);
        assert_eq!(mgr.len(), 1);
        assert!(!mgr.is_empty());
    }
}
