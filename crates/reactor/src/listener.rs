//! Accept-loop connection: turns a listening socket into new stream
//! connections handed off to the owning service.
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use tracing::{error, trace};

use crate::connection::{Connection, ConnectionState, Interest};
use crate::error::{Error, Result};

/// A listening socket type paired with the stream type `accept` produces.
pub trait Listen: AsRawFd {
    /// The connection type handed to a newly accepted peer.
    type Stream: Read + Write + AsRawFd;

    /// Accept one pending connection, returning the stream and a
    /// diagnostic description of the peer.
    fn accept(&self) -> io::Result<(Self::Stream, String)>;
}

impl Listen for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, addr) = TcpListener::accept(self)?;
        stream.set_nonblocking(true)?;
        Ok((stream, addr.to_string()))
    }
}

impl Listen for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> io::Result<(UnixStream, String)> {
        let (stream, addr) = UnixListener::accept(self)?;
        stream.set_nonblocking(true)?;
        let desc = addr
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unnamed>".to_string());
        Ok((stream, desc))
    }
}

/// Notified of each connection a [`Listener`] accepts.
pub trait AcceptHandler<S> {
    /// Wrap and register `stream` however the service sees fit.
    fn on_accept(&mut self, stream: S, peer: String) -> Result<()>;
}

/// Owns a listening socket and hands off accepted connections.
pub struct Listener<L: Listen> {
    state: ConnectionState,
    listener: L,
    handler: Box<dyn AcceptHandler<L::Stream>>,
}

impl<L: Listen> Listener<L> {
    /// Wrap an already-bound, already-nonblocking listening socket.
    pub fn new(name: impl Into<String>, listener: L, handler: Box<dyn AcceptHandler<L::Stream>>) -> Self {
        Self {
            state: ConnectionState::new(name),
            listener,
            handler,
        }
    }
}

impl<L: Listen> Connection for Listener<L> {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn socket(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn events(&self) -> Interest {
        Interest::READ
    }

    fn process_accept(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!(target: "reactor::listener", "{}: accepted {peer}", self.state.name());
                    if let Err(e) = self.handler.on_accept(stream, peer) {
                        error!(target: "reactor::listener", "{}: accept handler failed: {e}", self.state.name());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

/// Bind a non-blocking TCP listener.
pub fn listen_tcp(addr: std::net::SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(Error::Io)?;
    listener.set_nonblocking(true).map_err(Error::Io)?;
    Ok(listener)
}

/// Bind a non-blocking Unix stream listener, removing a stale socket file
/// at `path` first if one exists.
pub fn listen_unix(path: impl AsRef<std::path::Path>) -> Result<UnixListener> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path).map_err(Error::Io)?;
    }
    let listener = UnixListener::bind(path).map_err(Error::Io)?;
    listener.set_nonblocking(true).map_err(Error::Io)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Counter(Rc<RefCell<u32>>);
    impl AcceptHandler<TcpStream> for Counter {
        fn on_accept(&mut self, _stream: TcpStream, _peer: String) -> Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn accepts_pending_connections_until_would_block() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        let count = Rc::new(RefCell::new(0));
        let mut conn = Listener::new("l", listener, Box::new(Counter(count.clone())));

        // Give the kernel a moment to complete the handshake backlog.
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.process_accept().unwrap();
        assert_eq!(*count.borrow(), 2);
    }
}
