//! Bounded-packet datagram transport for UDP and Unix-DGRAM sockets.
use std::io;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

use tracing::warn;

use crate::connection::{Connection, ConnectionState, Interest};
use crate::error::{Error, Result};
use crate::message::{Message, PARAM_SECRET_CODE};

/// Maximum encoded message size a datagram transport will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Minimal surface both `UdpSocket` and `UnixDatagram` already provide,
/// named here so [`DatagramTransport`] need not pick one at compile time.
pub trait DatagramSocket: AsRawFd {
    /// Receive one datagram.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Send one datagram.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf)
    }
}

impl DatagramSocket for UnixDatagram {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixDatagram::recv(self, buf)
    }
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UnixDatagram::send(self, buf)
    }
}

/// Receives messages decoded by a [`DatagramTransport`].
pub trait DatagramHandler {
    /// A datagram decoded into a message and passed authentication.
    fn on_message(&mut self, msg: Message) -> Result<()>;
}

/// A connected or bound datagram socket, framed one message per packet.
pub struct DatagramTransport<S> {
    state: ConnectionState,
    socket: S,
    secret_code: Option<String>,
    handler: Box<dyn DatagramHandler>,
}

impl<S: DatagramSocket> DatagramTransport<S> {
    /// Wrap a non-blocking datagram socket. `secret_code`, if set, is
    /// required (and checked) on every inbound datagram.
    pub fn new(
        name: impl Into<String>,
        socket: S,
        secret_code: Option<String>,
        handler: Box<dyn DatagramHandler>,
    ) -> Self {
        Self {
            state: ConnectionState::new(name),
            socket,
            secret_code,
            handler,
        }
    }

    /// Encode and send `msg` in a single syscall.
    pub fn send_message(&self, msg: &Message) -> Result<()> {
        let encoded = msg.encode();
        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge {
                size: encoded.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send(encoded.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }

    fn accept(&self, msg: &Message) -> bool {
        secret_code_accepted(self.secret_code.as_deref(), msg, self.state.name())
    }
}

/// Shared `secret_code` acceptance policy for any datagram-receiving
/// connection: a configured code must match exactly; an unconfigured
/// receiver accepts (and warns about) a code it wasn't expecting.
pub(crate) fn secret_code_accepted(configured: Option<&str>, msg: &Message, conn_name: &str) -> bool {
    match (configured, msg.get_parameter(PARAM_SECRET_CODE)) {
        (Some(expected), Some(got)) => expected == got,
        (None, Some(_)) => {
            warn!(
                target: "reactor::datagram",
                "{conn_name}: accepting datagram with unexpected secret_code (none configured)"
            );
            true
        }
        (None, None) => true,
        (Some(_), None) => false,
    }
}

impl<S: DatagramSocket> Connection for DatagramTransport<S> {
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
        self.socket.as_raw_fd()
    }

    fn events(&self) -> Interest {
        Interest::READ
    }

    fn process_read(&mut self) -> Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                        warn!(target: "reactor::datagram", "{}: non-UTF8 datagram discarded", self.state.name());
                        continue;
                    };
                    match Message::decode(text) {
                        Ok(msg) => {
                            if self.accept(&msg) {
                                self.handler.on_message(msg)?;
                            } else {
                                warn!(
                                    target: "reactor::datagram",
                                    "{}: datagram with missing/mismatched secret_code dropped",
                                    self.state.name()
                                );
                            }
                        }
                        Err(e) => {
                            warn!(target: "reactor::datagram", "{}: malformed datagram: {e}", self.state.name());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}
