use crate::close::CloseFrame;
use httparse::Error as HttpParseError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use url::ParseError;

/// A violation of the framing rules by the peer. Receiving one of these is
/// fatal for the connection: a Close frame with code 1002 is sent and every
/// subsequent operation fails with the recorded cause.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),

    #[error("reserved bits are not zero")]
    RsvNotZero,

    #[error("compressed frame received but permessage-deflate was not negotiated")]
    CompressionNotNegotiated,

    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,

    #[error("control frame payload can't be greater than 125 bytes")]
    ControlFramePayloadSize,

    #[error("the most significant bit of a 64-bit payload length must be zero")]
    InvalidPayloadLength,

    #[error("expected a masked frame from the client")]
    ExpectedMaskedFrame,

    #[error("received a masked frame from the server")]
    UnexpectedMaskedFrame,

    #[error("invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("incoming data message but there is one already in progress")]
    FragmentedInProgress,

    #[error("invalid close frame payload")]
    InvalidClosePayload,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("received a text message on a binary-only stream")]
    UnexpectedTextMessage,
}

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("IO error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("operation cancelled mid-transfer, the connection is closed")]
    Cancelled,

    // Handshake errors
    #[error("invalid handshake request method or HTTP version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the handshake")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the handshake")]
    NoUpgradeHeaderPresent,

    #[error("unsupported Sec-WebSocket-Version, only 13 is supported")]
    UnsupportedWebsocketVersion,

    #[error("couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("origin `{0}` is not allowed")]
    OriginNotAllowed(String),

    #[error("server didn't upgrade the connection")]
    NoUpgrade,

    #[error("server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("server selected subprotocol `{0}` which was never offered")]
    SubprotocolNotOffered(String),

    #[error("unknown Sec-WebSocket-Extensions parameter: `{0}`")]
    UnknownExtensionParameter(String),

    #[error("unexpected Sec-WebSocket-Extensions value: `{0}`")]
    UnexpectedExtension(String),

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("incomplete HTTP message")]
    IncompleteHTTPMessage,

    #[error("HTTP headers larger than the 16 KiB limit")]
    OversizedHTTPMessage,

    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("invalid scheme in WebSocket URL, expected ws")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    // Framing errors
    #[error("websocket protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Limits and policy
    #[error("message exceeds the read limit of {0} bytes")]
    MessageTooBig(usize),

    #[error("received a data message while reads are closed")]
    PolicyViolation,

    // Caller misuse, not fatal for the connection
    #[error("previous message reader was not read to completion")]
    ReaderNotDrained,

    #[error("close reason can't be longer than 123 bytes")]
    CloseReasonTooLong,

    // Terminal state after the close handshake
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseFrame),
}
