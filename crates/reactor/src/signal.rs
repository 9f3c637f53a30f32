//! Signal delivery via `signalfd`, and a timer connection built purely on
//! the reactor's existing deadline bookkeeping.
use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::warn;

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::reactor::{ConnectionHandle, Reactor};
use crate::time::{Duration, MonoTime};

fn map_nix_err(e: nix::Error) -> Error {
    Error::Io(io::Error::from_raw_os_error(e as i32))
}

/// One signal delivery, decoded from the kernel's `signalfd_siginfo`.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    /// The signal number delivered.
    pub signo: i32,
    /// The pid that sent the signal, as reported by the kernel.
    pub sender_pid: u32,
    /// The uid of the sender.
    pub sender_uid: u32,
    /// The value passed via `sigqueue`/`pthread_sigqueue`, if any.
    pub user_data: u64,
}

/// Notified of each signal a [`SignalConnection`] receives.
pub trait SignalHooks {
    /// A blocked signal was delivered and read off the signalfd.
    fn process_signal(&mut self, info: &SignalInfo);
}

/// A connection that turns a set of blocked signals into ordinary,
/// pollable read events, read through Linux's `signalfd`.
///
/// The signals are blocked process-wide for the lifetime of this
/// connection (otherwise the kernel would deliver them the normal way
/// instead of queuing them for the fd); `unblock_on_drop` controls whether
/// dropping this connection restores the previous mask.
pub struct SignalConnection {
    state: ConnectionState,
    fd: SignalFd,
    mask: SigSet,
    unblock_on_drop: bool,
    hooks: Rc<RefCell<dyn SignalHooks>>,
}

impl SignalConnection {
    /// Block `signals` and read them through a non-blocking signalfd.
    pub fn new(
        name: impl Into<String>,
        signals: &[Signal],
        hooks: Rc<RefCell<dyn SignalHooks>>,
        unblock_on_drop: bool,
    ) -> Result<Self> {
        let mut mask = SigSet::empty();
        for &sig in signals {
            mask.add(sig);
        }
        sigprocmask(SigmaskHow::SIG_BLOCK, &mask, None).map_err(map_nix_err)?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(map_nix_err)?;
        Ok(Self {
            state: ConnectionState::new(name),
            fd,
            mask,
            unblock_on_drop,
            hooks,
        })
    }

    /// Build and register a connection that gracefully stops `reactor`
    /// (per [`Reactor::stop`] with `force = false`) the first time it sees
    /// `SIGINT` or `SIGTERM`.
    pub fn interrupt_on(reactor: &mut Reactor) -> Result<ConnectionHandle> {
        struct StopOnSignal(Rc<std::cell::Cell<bool>>);
        impl SignalHooks for StopOnSignal {
            fn process_signal(&mut self, _info: &SignalInfo) {
                self.0.set(true);
            }
        }

        let hooks: Rc<RefCell<dyn SignalHooks>> =
            Rc::new(RefCell::new(StopOnSignal(reactor.stop_handle())));
        let conn: ConnectionHandle = Rc::new(RefCell::new(SignalConnection::new(
            "interrupt",
            &[Signal::SIGINT, Signal::SIGTERM],
            hooks,
            true,
        )?));
        reactor.add_connection(conn.clone());
        Ok(conn)
    }
}

impl Drop for SignalConnection {
    fn drop(&mut self) {
        if self.unblock_on_drop {
            if let Err(e) = sigprocmask(SigmaskHow::SIG_UNBLOCK, &self.mask, None) {
                warn!(
                    target: "reactor::signal",
                    "{}: failed to unblock signals on drop: {e}",
                    self.state.name()
                );
            }
        }
    }
}

impl Connection for SignalConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_signal(&self) -> bool {
        true
    }

    fn socket(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn process_signal(&mut self) -> Result<()> {
        loop {
            match self.fd.read_signal() {
                Ok(Some(siginfo)) => {
                    let info = SignalInfo {
                        signo: siginfo.ssi_signo as i32,
                        sender_pid: siginfo.ssi_pid,
                        sender_uid: siginfo.ssi_uid,
                        user_data: siginfo.ssi_ptr,
                    };
                    self.hooks.borrow_mut().process_signal(&info);
                }
                Ok(None) => break,
                Err(e) => return Err(map_nix_err(e)),
            }
        }
        Ok(())
    }
}

/// Notified when a [`TimerConnection`]'s deadline elapses.
pub trait TimerHooks {
    /// The configured deadline was reached.
    fn process_timeout(&mut self);
}

/// A pure-deadline connection: no fd, no readiness, just a timeout the
/// reactor's own bookkeeping ([`ConnectionState::effective_timeout`])
/// schedules and re-arms.
pub struct TimerConnection {
    state: ConnectionState,
    hooks: Rc<RefCell<dyn TimerHooks>>,
    recurring: bool,
}

impl TimerConnection {
    /// Fire once, `delay` from now.
    pub fn once_after(name: impl Into<String>, delay: Duration, hooks: Rc<RefCell<dyn TimerHooks>>) -> Self {
        let mut state = ConnectionState::new(name);
        state.set_timeout_date(Some(MonoTime::now() + delay));
        Self {
            state,
            hooks,
            recurring: false,
        }
    }

    /// Fire every `interval`, indefinitely.
    pub fn every(name: impl Into<String>, interval: Duration, hooks: Rc<RefCell<dyn TimerHooks>>) -> Self {
        let mut state = ConnectionState::new(name);
        state.set_timeout_delay(Some(interval));
        Self {
            state,
            hooks,
            recurring: true,
        }
    }
}

impl Connection for TimerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn process_timeout(&mut self) -> Result<()> {
        if !self.recurring {
            // One-shot: clear the date so effective_timeout() stops firing
            // every subsequent iteration.
            self.state.set_timeout_date(None);
        }
        self.hooks.borrow_mut().process_timeout();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counter(Cell<u32>);
    impl SignalHooks for Counter {
        fn process_signal(&mut self, _info: &SignalInfo) {
            self.0.set(self.0.get() + 1);
        }
    }
    impl TimerHooks for Counter {
        fn process_timeout(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn signal_connection_reports_raised_signal() {
        let hooks: Rc<RefCell<Counter>> = Rc::new(RefCell::new(Counter::default()));
        let hooks_dyn: Rc<RefCell<dyn SignalHooks>> = hooks.clone();
        let mut conn = SignalConnection::new("sig", &[Signal::SIGUSR1], hooks_dyn, true).unwrap();

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        conn.process_signal().unwrap();

        assert_eq!(hooks.borrow().0.get(), 1);
    }

    #[test]
    fn one_shot_timer_fires_once_and_stays_quiet() {
        let hooks: Rc<RefCell<Counter>> = Rc::new(RefCell::new(Counter::default()));
        let hooks_dyn: Rc<RefCell<dyn TimerHooks>> = hooks.clone();
        let conn: ConnectionHandle = Rc::new(RefCell::new(TimerConnection::once_after(
            "once",
            Duration::ZERO,
            hooks_dyn,
        )));

        let mut reactor = Reactor::new();
        reactor.add_connection(conn.clone());
        reactor.tick().unwrap();
        reactor.tick().unwrap();

        assert_eq!(hooks.borrow().0.get(), 1);
    }

    #[test]
    fn recurring_timer_fires_on_every_interval() {
        let hooks: Rc<RefCell<Counter>> = Rc::new(RefCell::new(Counter::default()));
        let hooks_dyn: Rc<RefCell<dyn TimerHooks>> = hooks.clone();
        let conn: ConnectionHandle = Rc::new(RefCell::new(TimerConnection::every(
            "tick",
            Duration::ZERO,
            hooks_dyn,
        )));

        let mut reactor = Reactor::new();
        reactor.add_connection(conn.clone());
        reactor.tick().unwrap();
        reactor.tick().unwrap();
        reactor.tick().unwrap();

        assert_eq!(hooks.borrow().0.get(), 3);
    }
}
