//! Byte-stream and datagram framings layered on top of a raw connection.
pub mod datagram;
pub mod stream;

pub use datagram::DatagramTransport;
pub use stream::{LineHandler, StreamConnection};
