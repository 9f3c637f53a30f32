//! Single-threaded poll reactor and message-oriented service bus.
//!
//! The crate is split into two layers:
//!
//! - the reactor itself ([`reactor`], [`connection`], [`time`]): a
//!   process-wide registry of [`connection::Connection`] implementations,
//!   polled with `popol` and dispatched in priority order;
//! - the message bus built on top of it ([`message`], [`dispatcher`],
//!   [`transport`], [`listener`], [`permanent`], [`signal`], [`procevent`]):
//!   a textual, newline-terminated wire format, a declarative command
//!   dispatcher, and the connection kinds (listener, client, permanent
//!   reconnecting client, datagram client/server) that speak it.
//!
//! Everything here is synchronous and runs on the thread that calls
//! [`reactor::Reactor::run`]; there is no `async` anywhere in the crate.
pub mod address;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod message;
pub mod message_stream;
pub mod permanent;
#[cfg(target_os = "linux")]
pub mod procevent;
pub mod reactor;
#[cfg(target_os = "linux")]
pub mod signal;
pub mod time;
pub mod transport;

pub use address::Address;
pub use connection::{Connection, ConnectionState, Interest};
pub use dispatcher::{Dispatcher, MatchStrategy};
pub use error::{Error, Result};
pub use message::Message;
pub use reactor::{ConnectionHandle, ConnectionId, Reactor};
