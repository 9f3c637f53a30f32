//! The message-oriented connection kinds: a stream connection and a
//! datagram connection that each decode framed bytes into [`Message`]s,
//! hand them to a shared [`Dispatcher`], and reply through the same
//! transport the message arrived on.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::warn;

use crate::connection::{Connection, ConnectionState, Interest};
use crate::dispatcher::{Dispatcher, MessageSender, Responder};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::datagram::{secret_code_accepted, DatagramSocket, MAX_DATAGRAM_SIZE};
use crate::transport::stream::{drain_complete_lines, MAX_LINE_LEN};

const READ_CHUNK: usize = 64 * 1024;

/// Replies by queueing onto a stream connection's output buffer, encoded
/// and newline-terminated exactly like an application-initiated send.
struct BufferResponder<'a>(&'a mut VecDeque<u8>);

impl Responder for BufferResponder<'_> {
    fn reply(&mut self, message: &Message) -> Result<()> {
        self.0.extend(message.encode().as_bytes());
        self.0.push_back(b'\n');
        Ok(())
    }
}

/// A byte-stream connection (TCP or Unix stream) whose lines are `Message`s,
/// dispatched through a dispatcher shared by every connection of the owning
/// service.
pub struct MessageStreamConnection<S> {
    state: ConnectionState,
    stream: S,
    input: Vec<u8>,
    output: VecDeque<u8>,
    dispatcher: Rc<Dispatcher>,
}

impl<S: Read + Write + AsRawFd> MessageStreamConnection<S> {
    /// Wrap an already-connected, already-nonblocking stream.
    pub fn new(name: impl Into<String>, stream: S, dispatcher: Rc<Dispatcher>) -> Self {
        Self {
            state: ConnectionState::new(name),
            stream,
            input: Vec::new(),
            output: VecDeque::new(),
            dispatcher,
        }
    }

    /// Bytes currently queued for write.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }
}

impl<S: Read + Write + AsRawFd> MessageSender for MessageStreamConnection<S> {
    /// Stream sends have no cache: the connection either has an open
    /// socket to write to or it doesn't. `cache` is accepted for interface
    /// uniformity with [`crate::permanent::PermanentConnection`] and
    /// ignored.
    fn send_message(&mut self, message: &Message, _cache: bool) -> Result<bool> {
        self.output.extend(message.encode().as_bytes());
        self.output.push_back(b'\n');
        Ok(true)
    }
}

impl<S: Read + Write + AsRawFd> Connection for MessageStreamConnection<S> {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn is_writer(&self) -> bool {
        !self.output.is_empty()
    }

    fn socket(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn events(&self) -> Interest {
        if self.is_writer() {
            Interest::READ | Interest::WRITE
        } else {
            Interest::READ
        }
    }

    fn process_read(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                self.process_hup();
                Ok(())
            }
            Ok(n) => {
                self.input.extend_from_slice(&chunk[..n]);
                let lines = drain_complete_lines(&mut self.input, MAX_LINE_LEN, self.state.name())?;
                for raw in lines {
                    let Ok(text) = std::str::from_utf8(&raw) else {
                        warn!(target: "reactor::message_stream", "{}: non-UTF8 line discarded", self.state.name());
                        continue;
                    };
                    match Message::decode(text) {
                        Ok(msg) => {
                            let mut responder = BufferResponder(&mut self.output);
                            self.dispatcher.dispatch(&msg, &mut responder)?;
                        }
                        Err(e) => {
                            warn!(target: "reactor::message_stream", "{}: malformed message: {e}", self.state.name());
                        }
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn process_write(&mut self) -> Result<()> {
        while !self.output.is_empty() {
            let (front, _) = self.output.as_slices();
            match self.stream.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if self.output.is_empty() {
            self.process_empty_buffer();
        }
        Ok(())
    }

    fn process_hup(&mut self) {
        warn!(target: "reactor::message_stream", "{}: hangup", self.state.name());
    }

    fn process_error(&mut self) {
        warn!(target: "reactor::message_stream", "{}: socket error", self.state.name());
    }
}

/// A datagram connection (UDP or Unix-DGRAM) whose packets are `Message`s,
/// dispatched through a shared [`Dispatcher`] and replied to immediately on
/// the same (connected) socket.
pub struct MessageDatagramConnection<S> {
    state: ConnectionState,
    socket: S,
    secret_code: Option<String>,
    dispatcher: Rc<Dispatcher>,
}

struct SocketResponder<'a, S: DatagramSocket>(&'a S);

impl<S: DatagramSocket> Responder for SocketResponder<'_, S> {
    fn reply(&mut self, message: &Message) -> Result<()> {
        let encoded = message.encode();
        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge {
                size: encoded.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.0.send(encoded.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }
}

impl<S: DatagramSocket> MessageDatagramConnection<S> {
    /// Wrap a non-blocking, connected datagram socket. `secret_code`, if
    /// set, is required (and checked) on every inbound datagram.
    pub fn new(
        name: impl Into<String>,
        socket: S,
        secret_code: Option<String>,
        dispatcher: Rc<Dispatcher>,
    ) -> Self {
        Self {
            state: ConnectionState::new(name),
            socket,
            secret_code,
            dispatcher,
        }
    }
}

impl<S: DatagramSocket> MessageSender for MessageDatagramConnection<S> {
    fn send_message(&mut self, message: &Message, _cache: bool) -> Result<bool> {
        let mut responder = SocketResponder(&self.socket);
        responder.reply(message)?;
        Ok(true)
    }
}

impl<S: DatagramSocket> Connection for MessageDatagramConnection<S> {
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
                        warn!(target: "reactor::message_datagram", "{}: non-UTF8 datagram discarded", self.state.name());
                        continue;
                    };
                    match Message::decode(text) {
                        Ok(msg) => {
                            if secret_code_accepted(self.secret_code.as_deref(), &msg, self.state.name()) {
                                let mut responder = SocketResponder(&self.socket);
                                self.dispatcher.dispatch(&msg, &mut responder)?;
                            } else {
                                warn!(
                                    target: "reactor::message_datagram",
                                    "{}: datagram with missing/mismatched secret_code dropped",
                                    self.state.name()
                                );
                            }
                        }
                        Err(e) => {
                            warn!(target: "reactor::message_datagram", "{}: malformed datagram: {e}", self.state.name());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MatchStrategy;
    use std::os::unix::net::UnixStream;

    #[test]
    fn echo_over_stream_dispatches_and_replies() {
        let mut d = Dispatcher::new();
        d.add_match("PING", MatchStrategy::Exact, |msg, responder| {
            let mut reply = Message::new("PONG")?;
            if let Some(serial) = msg.get_parameter("serial") {
                reply.set_parameter("serial", serial.to_string());
            }
            responder.reply(&reply)
        });
        let dispatcher = Rc::new(d);

        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();

        let mut conn = MessageStreamConnection::new("server", server, dispatcher);

        let mut ping = Message::new("PING").unwrap();
        ping.set_parameter("serial", "42");
        client.write_all(format!("{}\n", ping.encode()).as_bytes()).unwrap();

        conn.process_read().unwrap();
        assert!(conn.pending_output() > 0);
        conn.process_write().unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let reply = Message::decode(std::str::from_utf8(&buf[..n]).unwrap()).unwrap();
        assert_eq!(reply.command(), "PONG");
        assert_eq!(reply.get_parameter("serial"), Some("42"));
    }

    #[test]
    fn malformed_line_is_logged_and_connection_stays_open() {
        let dispatcher = Rc::new(Dispatcher::new());
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut conn = MessageStreamConnection::new("server", server, dispatcher);
        client.write_all(b"BADCOMMAND!!!\n").unwrap();
        assert!(conn.process_read().is_ok());

        client.write_all(b"PING\n").unwrap();
        assert!(conn.process_read().is_ok());
    }
}
