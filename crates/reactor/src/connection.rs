//! The connection contract: capability flags, fd accessor, timeout,
//! priority, and the lifecycle hooks the reactor invokes.
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::time::{Duration, MonoTime};

/// A POLLIN/POLLOUT-style interest mask, backend-agnostic so the trait
/// below does not depend on the poll crate used by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest; the connection contributes no fd-driven events.
    pub const NONE: Interest = Interest(0);
    /// Readability.
    pub const READ: Interest = Interest(0b01);
    /// Writability.
    pub const WRITE: Interest = Interest(0b10);

    /// True if this mask includes [`Interest::READ`].
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// True if this mask includes [`Interest::WRITE`].
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// True if this mask requests nothing.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Shared bookkeeping fields every concrete connection embeds by
/// composition, per the collapse of the source's inheritance hierarchy
/// into capability methods over owned state.
#[derive(Debug)]
pub struct ConnectionState {
    name: String,
    enabled: bool,
    priority: i32,
    timeout_date: Option<MonoTime>,
    timeout_delay: Option<Duration>,
    last_dispatch: MonoTime,
    registered: bool,
}

impl ConnectionState {
    /// Build state for a newly constructed, enabled, default-priority
    /// connection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority: 0,
            timeout_date: None,
            timeout_delay: None,
            last_dispatch: MonoTime::now(),
            registered: false,
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the diagnostic name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// True unless disabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Exclude this connection from the next poll set.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Include this connection in the next poll set.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Dispatch tiebreaker; lower runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Set the dispatch tiebreaker.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// The absolute deadline, if one is set.
    pub fn timeout_date(&self) -> Option<MonoTime> {
        self.timeout_date
    }

    /// Set (or clear, with `None`) the absolute deadline.
    pub fn set_timeout_date(&mut self, at: Option<MonoTime>) {
        self.timeout_date = at;
    }

    /// The relative deadline, if one is set.
    pub fn timeout_delay(&self) -> Option<Duration> {
        self.timeout_delay
    }

    /// Set (or clear, with `None`) the relative deadline, measured from the
    /// connection's last dispatch.
    pub fn set_timeout_delay(&mut self, delay: Option<Duration>) {
        self.timeout_delay = delay;
    }

    /// Record that a hook ran just now, the reference point `timeout_delay`
    /// is measured from.
    pub fn mark_dispatched(&mut self, now: MonoTime) {
        self.last_dispatch = now;
    }

    /// The effective next deadline: the earlier of the absolute date and
    /// `last_dispatch + delay`, or `None` if neither is set ("never").
    pub fn effective_timeout(&self) -> Option<MonoTime> {
        let from_delay = self.timeout_delay.map(|d| self.last_dispatch + d);
        match (self.timeout_date, from_delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// True if this state is currently attached to a reactor registry.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Mark this state as attached to a reactor registry. Returns `false`
    /// (without mutating) if it was already attached.
    pub fn mark_registered(&mut self) -> bool {
        if self.registered {
            return false;
        }
        self.registered = true;
        true
    }

    /// Mark this state as detached from its reactor registry.
    pub fn mark_unregistered(&mut self) {
        self.registered = false;
    }
}

/// Any I/O source participating in the reactor: a socket, pipe, signal
/// source, or timer.
///
/// Capability flags are queried as methods rather than stored as flags so
/// a connection's shape can change at runtime (e.g. a stream connection
/// that is a writer only while its output buffer is non-empty).
pub trait Connection {
    /// Access to the shared bookkeeping state this connection embeds.
    fn state(&self) -> &ConnectionState;
    /// Mutable access to the shared bookkeeping state.
    fn state_mut(&mut self) -> &mut ConnectionState;

    /// True if this connection wants `process_read` called when readable.
    fn is_reader(&self) -> bool {
        false
    }

    /// True if this connection wants `process_write` called when writable.
    fn is_writer(&self) -> bool {
        false
    }

    /// True if this connection is a listening socket.
    fn is_listener(&self) -> bool {
        false
    }

    /// True if this connection is a signalfd source.
    fn is_signal(&self) -> bool {
        false
    }

    /// The OS handle to poll, or `-1` to skip this connection this round
    /// (it may still contribute a timeout).
    fn socket(&self) -> RawFd {
        -1
    }

    /// The interest mask derived from the capability flags above.
    fn events(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.is_reader() || self.is_listener() || self.is_signal() {
            interest = interest | Interest::READ;
        }
        if self.is_writer() {
            interest = interest | Interest::WRITE;
        }
        interest
    }

    /// Readiness to read (or accept, for a listener, or a signalfd byte).
    fn process_read(&mut self) -> Result<()> {
        Ok(())
    }

    /// Readiness to write.
    fn process_write(&mut self) -> Result<()> {
        Ok(())
    }

    /// A listener has a pending connection.
    fn process_accept(&mut self) -> Result<()> {
        Ok(())
    }

    /// A signalfd is readable.
    fn process_signal(&mut self) -> Result<()> {
        Ok(())
    }

    /// The configured deadline has been reached.
    fn process_timeout(&mut self) -> Result<()> {
        Ok(())
    }

    /// Poll reported an error condition on this fd.
    fn process_error(&mut self) {}

    /// Poll reported a hangup on this fd.
    fn process_hup(&mut self) {}

    /// Poll reported an invalid fd.
    fn process_invalid(&mut self) {}

    /// The output buffer was just drained to zero bytes queued.
    fn process_empty_buffer(&mut self) {}

    /// Called once, after successful registration with a reactor.
    fn connection_added(&mut self) {}

    /// Called once, after removal from a reactor.
    fn connection_removed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_picks_the_earlier_bound() {
        let mut state = ConnectionState::new("t");
        let base = MonoTime::now();
        state.mark_dispatched(base);
        assert_eq!(state.effective_timeout(), None);

        state.set_timeout_delay(Some(Duration::from_secs(10)));
        assert_eq!(state.effective_timeout(), Some(base + Duration::from_secs(10)));

        state.set_timeout_date(Some(base + Duration::from_secs(1)));
        assert_eq!(state.effective_timeout(), Some(base + Duration::from_secs(1)));
    }

    #[test]
    fn mark_registered_is_one_shot() {
        let mut state = ConnectionState::new("t");
        assert!(state.mark_registered());
        assert!(!state.mark_registered());
        state.mark_unregistered();
        assert!(state.mark_registered());
    }

    #[test]
    fn events_mask_follows_capability_flags() {
        struct Reader(ConnectionState);
        impl Connection for Reader {
            fn state(&self) -> &ConnectionState {
                &self.0
            }
            fn state_mut(&mut self) -> &mut ConnectionState {
                &mut self.0
            }
            fn is_reader(&self) -> bool {
                true
            }
        }
        let r = Reader(ConnectionState::new("r"));
        assert!(r.events().is_readable());
        assert!(!r.events().is_writable());
    }
}
