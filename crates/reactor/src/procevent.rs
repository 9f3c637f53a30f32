//! Subscriber for the kernel's process-event netlink stream ("proc
//! connector"), decoded into typed [`ProcessEvent`] records.
//!
//! Grounded on the raw netlink framing of
//! `linux/cn_proc.h`/`linux/connector.h`: there is no maintained crate
//! wrapping this particular multicast group, so the socket is built and
//! parsed by hand from `libc`, the same way the ambient stack already
//! reaches for `libc` in [`crate::transport`] and [`crate::signal`].
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::warn;

use crate::connection::{Connection, ConnectionState, Interest};
use crate::error::{Error, Result};

const NETLINK_CONNECTOR: libc::c_int = 11;
const CN_IDX_PROC: u32 = 0x0000_0001;
const CN_VAL_PROC: u32 = 0x0000_0001;
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_NONE: u32 = 0x0000_0000;
const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_UID: u32 = 0x0000_0004;
const PROC_EVENT_GID: u32 = 0x0000_0040;
const PROC_EVENT_SID: u32 = 0x0000_0080;
const PROC_EVENT_PTRACE: u32 = 0x0000_0100;
const PROC_EVENT_COMM: u32 = 0x0000_0200;
const PROC_EVENT_COREDUMP: u32 = 0x4000_0000;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSG_HDR_LEN: usize = 16;
const CN_MSG_HDR_LEN: usize = 20;
const MCAST_MSG_LEN: usize = NLMSG_HDR_LEN + CN_MSG_HDR_LEN + 4;
/// Large enough for `nlmsghdr + cn_msg + proc_event`, the biggest payload
/// the kernel sends over this multicast group.
const RECV_BUF_LEN: usize = 512;
/// Cap on events drained per `process_read` call, so one dispatch can't
/// do unbounded work even under a sustained flood of kernel events.
const EVENT_BUDGET: usize = 256;

/// The kind of process-lifecycle change a [`ProcessEvent`] reports.
///
/// The first kernel event kind this crate doesn't recognize is logged once
/// (see [`ProcEventSubscriber`]); every one after that is silently reported
/// as [`EventKind::Unknown`] so a single unfamiliar kernel doesn't spam logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Kernel reported no change (carries an ack/error code, see [`ProcessEvent::ack_code`]).
    None,
    /// A process forked; fields describe both child and parent.
    Fork,
    /// A process called `execve`.
    Exec,
    /// A process's real/effective uid changed.
    Uid,
    /// A process's real/effective gid changed.
    Gid,
    /// A process became a session leader.
    Session,
    /// A process attached a tracer.
    Ptrace,
    /// `/proc/<pid>/comm` was updated.
    Command,
    /// A process produced a core dump.
    Coredump,
    /// A process exited.
    Exit,
    /// A kernel event kind this crate does not recognize.
    Unknown,
}

/// One decoded process-event record.
///
/// Only the fields relevant to `event_kind` are meaningful; the rest hold
/// their default (zero) value. The kernel overlays its ack/error code (for
/// [`EventKind::None`]) and a process's exit status (for [`EventKind::Exit`])
/// in the same wire field; this type keeps one storage slot for it
/// (`code`, private) but exposes it only through [`ProcessEvent::exit_code`]
/// and [`ProcessEvent::ack_code`], each of which returns `None` unless
/// `event_kind` actually matches — the two meanings are never conflated at
/// the API surface, even though they share a field underneath.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEvent {
    /// What kind of change this record describes.
    pub event_kind: Option<EventKind>,
    /// CPU that was handling the reporting process.
    pub cpu: u32,
    /// Kernel timestamp, nanoseconds since boot (not wall-clock).
    pub timestamp_ns: u64,
    /// Affected process id.
    pub pid: u32,
    /// Affected thread-group id (== pid for the group leader).
    pub tgid: u32,
    /// Parent/tracer process id, where applicable (fork, ptrace).
    pub parent_pid: u32,
    /// Parent/tracer thread-group id, where applicable.
    pub parent_tgid: u32,
    /// Real uid, for `Uid` events.
    pub real_uid: u32,
    /// Effective uid, for `Uid` events.
    pub effective_uid: u32,
    /// Real gid, for `Gid` events.
    pub real_gid: u32,
    /// Effective gid, for `Gid` events.
    pub effective_gid: u32,
    /// `/proc/<pid>/comm`, up to 15 bytes, for `Command` events.
    pub command: [u8; 15],
    /// Overlaid exit-status/ack-code storage; read via [`ProcessEvent::exit_code`]
    /// or [`ProcessEvent::ack_code`], never directly.
    code: u32,
    /// Signal the process was terminated by, for `Exit` events (-1 if none).
    pub exit_signal: i32,
}

impl ProcessEvent {
    /// `command` decoded as a lossy UTF-8 string, trimmed at the first NUL.
    pub fn command_str(&self) -> std::borrow::Cow<'_, str> {
        let len = self.command.iter().position(|&b| b == 0).unwrap_or(self.command.len());
        String::from_utf8_lossy(&self.command[..len])
    }

    /// The process's exit status, for an [`EventKind::Exit`] event. `None`
    /// for any other event kind.
    pub fn exit_code(&self) -> Option<u32> {
        matches!(self.event_kind, Some(EventKind::Exit)).then_some(self.code)
    }

    /// The kernel's ack/error code for our last multicast-listen/ignore
    /// request, carried on an [`EventKind::None`] event. `None` for any
    /// other event kind.
    pub fn ack_code(&self) -> Option<u32> {
        matches!(self.event_kind, Some(EventKind::None)).then_some(self.code)
    }
}

/// Receives each decoded [`ProcessEvent`].
pub trait ProcEventHandler {
    /// A process event was decoded off the netlink socket.
    fn on_process_event(&mut self, event: ProcessEvent);
}

fn raw_socket() -> io::Result<RawFd> {
    // SAFETY: a plain libc::socket() call; the returned fd is checked below.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            NETLINK_CONNECTOR,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn bind_multicast(fd: RawFd) -> io::Result<()> {
    // SAFETY: `sockaddr_nl` is a plain-old-data C struct; zero-initializing
    // it and filling in the fields libc defines is the documented way to
    // build one.
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_pid = std::process::id();
    addr.nl_groups = CN_IDX_PROC;

    // SAFETY: `addr` and its size are consistent with the `sockaddr_nl`
    // layout `bind(2)` expects for `AF_NETLINK`.
    let r = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_mcast_op(fd: RawFd, listen: bool) -> io::Result<()> {
    let mut msg = [0u8; MCAST_MSG_LEN];
    msg[0..4].copy_from_slice(&(MCAST_MSG_LEN as u32).to_ne_bytes());
    // nlmsg_type = NLMSG_DONE (0x3), nlmsg_flags = 0
    msg[4..6].copy_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
    msg[6..8].copy_from_slice(&0u16.to_ne_bytes());
    msg[8..12].copy_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    msg[12..16].copy_from_slice(&(std::process::id()).to_ne_bytes()); // nlmsg_pid

    msg[16..20].copy_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg[20..24].copy_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg[24..28].copy_from_slice(&0u32.to_ne_bytes()); // cn_msg.seq
    msg[28..32].copy_from_slice(&0u32.to_ne_bytes()); // cn_msg.ack
    msg[32..34].copy_from_slice(&4u16.to_ne_bytes()); // cn_msg.len
    msg[34..36].copy_from_slice(&0u16.to_ne_bytes()); // cn_msg.flags

    let op: u32 = if listen { PROC_CN_MCAST_LISTEN } else { PROC_CN_MCAST_IGNORE };
    msg[36..40].copy_from_slice(&op.to_ne_bytes());

    // SAFETY: `fd` is a valid, open netlink socket; `msg` is a correctly
    // sized, fully initialized buffer.
    let r = unsafe { libc::send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn decode_event(buf: &[u8], warned_unknown: &mut bool) -> Option<ProcessEvent> {
    // Skip nlmsghdr (16 bytes) + cn_msg header (20 bytes); the proc_event
    // payload starts right after.
    let payload = buf.get(NLMSG_HDR_LEN + CN_MSG_HDR_LEN..)?;
    if payload.len() < 16 {
        return None;
    }
    let what = u32::from_ne_bytes(payload[0..4].try_into().ok()?);
    let cpu = u32::from_ne_bytes(payload[4..8].try_into().ok()?);
    let timestamp_ns = u64::from_ne_bytes(payload[8..16].try_into().ok()?);
    let data = &payload[16..];

    let mut event = ProcessEvent {
        cpu,
        timestamp_ns,
        ..Default::default()
    };

    let u32_at = |off: usize| -> u32 { data.get(off..off + 4).and_then(|b| b.try_into().ok()).map(u32::from_ne_bytes).unwrap_or(0) };
    let i32_at = |off: usize| -> i32 { data.get(off..off + 4).and_then(|b| b.try_into().ok()).map(i32::from_ne_bytes).unwrap_or(0) };

    match what {
        PROC_EVENT_NONE => {
            event.event_kind = Some(EventKind::None);
            event.code = u32_at(0);
        }
        PROC_EVENT_FORK => {
            event.event_kind = Some(EventKind::Fork);
            event.parent_pid = u32_at(0);
            event.parent_tgid = u32_at(4);
            event.pid = u32_at(8);
            event.tgid = u32_at(12);
        }
        PROC_EVENT_EXEC => {
            event.event_kind = Some(EventKind::Exec);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
        }
        PROC_EVENT_UID => {
            event.event_kind = Some(EventKind::Uid);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
            event.real_uid = u32_at(8);
            event.effective_uid = u32_at(12);
        }
        PROC_EVENT_GID => {
            event.event_kind = Some(EventKind::Gid);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
            event.real_gid = u32_at(8);
            event.effective_gid = u32_at(12);
        }
        PROC_EVENT_SID => {
            event.event_kind = Some(EventKind::Session);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
        }
        PROC_EVENT_PTRACE => {
            event.event_kind = Some(EventKind::Ptrace);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
            event.parent_pid = u32_at(8);
            event.parent_tgid = u32_at(12);
        }
        PROC_EVENT_COMM => {
            event.event_kind = Some(EventKind::Command);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
            if let Some(comm) = data.get(8..8 + 15) {
                event.command[..comm.len()].copy_from_slice(comm);
            }
        }
        PROC_EVENT_COREDUMP => {
            event.event_kind = Some(EventKind::Coredump);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
        }
        PROC_EVENT_EXIT => {
            event.event_kind = Some(EventKind::Exit);
            event.pid = u32_at(0);
            event.tgid = u32_at(4);
            event.code = u32_at(8);
            event.exit_signal = i32_at(12);
        }
        other => {
            event.event_kind = Some(EventKind::Unknown);
            event.code = other;
            if !*warned_unknown {
                *warned_unknown = true;
                warn!(target: "reactor::procevent", "unrecognized kernel proc_event kind {other:#x}, reporting as Unknown");
            }
        }
    }
    Some(event)
}

/// A connection subscribed to the kernel's process-event netlink multicast
/// group. Requires `CAP_NET_ADMIN` (typically root); construction fails
/// with [`Error::PermissionDenied`] on `EPERM`.
///
/// Disabling this connection (`ConnectionState::disable`) sends the
/// kernel an "ignore" request, but older kernels keep delivering events on
/// the socket regardless (see module docs and spec design notes); the
/// supported way to stop receiving is [`ProcEventSubscriber::unregister_and_drop`],
/// which drops the fd outright rather than asking the kernel to be quiet.
pub struct ProcEventSubscriber {
    state: ConnectionState,
    fd: RawFd,
    handler: Box<dyn ProcEventHandler>,
    warned_unknown: bool,
}

impl ProcEventSubscriber {
    /// Open the netlink socket, bind to the proc-connector multicast
    /// group, and start listening.
    pub fn new(name: impl Into<String>, handler: Box<dyn ProcEventHandler>) -> Result<Self> {
        let fd = raw_socket().map_err(map_permission(Error::Io))?;
        if let Err(e) = bind_multicast(fd) {
            // SAFETY: fd was just opened above and not yet shared.
            unsafe { libc::close(fd) };
            return Err(map_permission(Error::Io)(e));
        }
        if let Err(e) = send_mcast_op(fd, true) {
            unsafe { libc::close(fd) };
            return Err(map_permission(Error::Io)(e));
        }
        Ok(Self {
            state: ConnectionState::new(name),
            fd,
            handler,
            warned_unknown: false,
        })
    }

    /// The supported shutdown path: ask the kernel to stop the multicast
    /// (best-effort — older kernels ignore it) and close the fd right
    /// away, rather than relying on the kernel to honor the ignore
    /// request. Call this, then [`crate::reactor::Reactor::remove_connection_handle`]
    /// to drop it from the reactor's registry.
    pub fn unregister_and_drop(&mut self) {
        let _ = send_mcast_op(self.fd, false);
        self.close();
    }

    fn close(&mut self) {
        if self.fd >= 0 {
            // SAFETY: fd is owned exclusively by this struct.
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

fn map_permission(wrap: impl Fn(io::Error) -> Error) -> impl Fn(io::Error) -> Error {
    move |e: io::Error| {
        if e.raw_os_error() == Some(libc::EPERM) {
            Error::PermissionDenied("process-event subscription requires CAP_NET_ADMIN".to_string())
        } else {
            wrap(e)
        }
    }
}

impl Drop for ProcEventSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for ProcEventSubscriber {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Connection for ProcEventSubscriber {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn socket(&self) -> RawFd {
        self.fd
    }

    fn events(&self) -> Interest {
        Interest::READ
    }

    fn process_read(&mut self) -> Result<()> {
        let mut buf = [0u8; RECV_BUF_LEN];
        for _ in 0..EVENT_BUDGET {
            // SAFETY: buf is a correctly sized, writable stack buffer and
            // self.fd is the netlink socket owned by this struct.
            let r = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if r < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(Error::Io(e));
            }
            if r == 0 {
                break;
            }
            if let Some(event) = decode_event(&buf[..r as usize], &mut self.warned_unknown) {
                self.handler.on_process_event(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_exit_event() {
        let mut buf = [0u8; NLMSG_HDR_LEN + CN_MSG_HDR_LEN + 16 + 16];
        let payload_off = NLMSG_HDR_LEN + CN_MSG_HDR_LEN;
        buf[payload_off..payload_off + 4].copy_from_slice(&PROC_EVENT_EXIT.to_ne_bytes());
        buf[payload_off + 4..payload_off + 8].copy_from_slice(&0u32.to_ne_bytes()); // cpu
        buf[payload_off + 8..payload_off + 16].copy_from_slice(&0u64.to_ne_bytes()); // timestamp
        let data_off = payload_off + 16;
        buf[data_off..data_off + 4].copy_from_slice(&4242u32.to_ne_bytes()); // pid
        buf[data_off + 4..data_off + 8].copy_from_slice(&4242u32.to_ne_bytes()); // tgid
        buf[data_off + 8..data_off + 12].copy_from_slice(&7u32.to_ne_bytes()); // exit_code
        buf[data_off + 12..data_off + 16].copy_from_slice(&(-1i32).to_ne_bytes()); // exit_signal

        let mut warned = false;
        let event = decode_event(&buf, &mut warned).unwrap();
        assert_eq!(event.event_kind, Some(EventKind::Exit));
        assert_eq!(event.pid, 4242);
        assert_eq!(event.tgid, 4242);
        assert_eq!(event.exit_code(), Some(7));
        assert_eq!(event.ack_code(), None);
        assert_eq!(event.exit_signal, -1);
    }

    #[test]
    fn none_event_exposes_ack_code_not_exit_code() {
        let mut buf = [0u8; NLMSG_HDR_LEN + CN_MSG_HDR_LEN + 16 + 4];
        let payload_off = NLMSG_HDR_LEN + CN_MSG_HDR_LEN;
        buf[payload_off..payload_off + 4].copy_from_slice(&PROC_EVENT_NONE.to_ne_bytes());
        let data_off = payload_off + 16;
        buf[data_off..data_off + 4].copy_from_slice(&5u32.to_ne_bytes()); // ack/error code

        let mut warned = false;
        let event = decode_event(&buf, &mut warned).unwrap();
        assert_eq!(event.event_kind, Some(EventKind::None));
        assert_eq!(event.ack_code(), Some(5));
        assert_eq!(event.exit_code(), None);
    }

    #[test]
    fn unrecognized_kind_reports_unknown_once() {
        let mut buf = [0u8; NLMSG_HDR_LEN + CN_MSG_HDR_LEN + 16];
        let payload_off = NLMSG_HDR_LEN + CN_MSG_HDR_LEN;
        buf[payload_off..payload_off + 4].copy_from_slice(&0xdead_beefu32.to_ne_bytes());

        let mut warned = false;
        let event = decode_event(&buf, &mut warned).unwrap();
        assert_eq!(event.event_kind, Some(EventKind::Unknown));
        assert!(warned);

        let event2 = decode_event(&buf, &mut warned).unwrap();
        assert_eq!(event2.event_kind, Some(EventKind::Unknown));
        assert!(warned, "second call should not re-trigger the warning path");
    }

    #[test]
    fn command_str_trims_at_first_nul() {
        let mut event = ProcessEvent::default();
        event.command[..4].copy_from_slice(b"bash");
        assert_eq!(event.command_str(), "bash");
    }
}
