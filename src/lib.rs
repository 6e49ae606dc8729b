//! Async WebSockets endpoint library for the tokio stack.
//!
//! This library implements the endpoint side of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! over any established bidirectional byte stream: it performs the HTTP/1.1
//! upgrade handshake in either role, reads and writes frames, handles masks,
//! opcodes and fragmentation, correlates pings with pongs, and runs the
//! close handshake. The
//! [permessage-deflate](https://datatracker.ietf.org/doc/html/rfc7692)
//! extension is negotiated and applied transparently when enabled.
//!
//! A [`Connection`] is a cheap-to-clone handle, so one task can sit in
//! [`Connection::read`] while others write and ping. Whole messages move
//! through [`Connection::read`] and [`Connection::write`]; streaming
//! callers use [`Connection::reader`] and [`Connection::writer`] instead,
//! and [`ByteStream`] turns a connection of Binary messages into an
//! `AsyncRead + AsyncWrite` pipe.

mod close;
mod connection;
mod deflate;
pub mod error;
mod extensions;
pub mod frame;
pub mod handshake;
mod mask;
mod message;
mod read;
mod stream;
#[cfg(test)]
mod tests;
mod write;

pub use close::{CloseCode, CloseFrame, MAX_CLOSE_REASON};
pub use connection::{Connection, Role, DEFAULT_READ_LIMIT};
pub use error::{Error, ProtocolError};
pub use extensions::CompressionOptions;
pub use handshake::{
    accept, accept_with_options, client, client_with_options, connect, connect_with_options,
    AcceptOptions, ConnectOptions,
};
pub use mask::apply_mask;
pub use message::{Message, MessageType};
pub use read::MessageReader;
pub use stream::ByteStream;
pub use write::MessageWriter;
