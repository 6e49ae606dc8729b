use crate::close::{CloseCode, CloseFrame};
use crate::connection::{ClosedCause, Connection, FatalOnDrop, Role, Shared};
use crate::deflate::Inflater;
use crate::error::{Error, ProtocolError};
use crate::extensions::CompressionOptions;
use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask;
use crate::message::{Message, MessageType};
use crate::write::WriteState;
use log::{debug, trace, warn};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf, ReadHalf};
use tokio::sync::{Mutex, OwnedMutexGuard};

// Payload bytes come off the transport in chunks of at most this size before
// unmasking and optional inflation.
const PAYLOAD_CHUNK: usize = 4096;

/// Serves the bytes the handshake read past the HTTP headers before
/// touching the transport again.
pub(crate) struct Prefixed<R> {
    prefix: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R> Prefixed<R> {
    fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prefixed<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// The inbound data message currently being handed to the caller.
pub(crate) struct CurrentMessage {
    kind: MessageType,
    compressed: bool,
    frame_remaining: u64,
    fin: bool,
    mask: Option<[u8; 4]>,
    mask_pos: usize,
    /// The configured limit when the message opened, kept for the error.
    limit: usize,
    /// Caller-visible bytes the message may still produce.
    limit_remaining: u64,
    /// Decompressed bytes waiting to be handed out.
    inflated: Vec<u8>,
    inflated_pos: usize,
    trailer_fed: bool,
}

/// Everything the read half owns: the buffered transport, the streaming
/// decompressor, and the partially consumed current message. Guarded by the
/// connection's read token.
pub(crate) struct ReadState<S> {
    reader: Prefixed<BufReader<ReadHalf<S>>>,
    role: Role,
    deflate_negotiated: bool,
    inflater: Option<Inflater>,
    inflater_reset: bool,
    pub(crate) current: Option<CurrentMessage>,
}

/// Records a fatal transport failure and converts it for the caller.
pub(crate) fn fatal_io(shared: &Shared, error: io::Error) -> Error {
    shared.record_cause(ClosedCause::Io(error.kind(), error.to_string()));
    Error::IOError { source: error }
}

/// Fails the connection: best-effort Close frame to the peer, cause recorded,
/// and the recorded cause (first writer wins) returned for the caller.
pub(crate) async fn fail_connection<S>(
    shared: &Shared,
    write: &Mutex<WriteState<S>>,
    cause: ClosedCause,
    code: CloseCode,
    reason: &str,
) -> Error
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("failing connection: {reason}");
    if shared.mark_close_sent() {
        let payload = CloseFrame::new(code, reason).encode();
        let mut writer = write.lock().await;
        let _ = writer
            .write_control(shared, OpCode::Close, &payload)
            .await;
    }
    shared.record_cause(cause);
    shared.closed_error()
}

/// Reads a control frame's payload and acts on it: Pings are answered with
/// an identical Pong, Pongs complete a waiting [`Connection::ping`], and a
/// Close frame ends the connection with the peer's status as the cause.
pub(crate) async fn dispatch_control<S>(
    state: &mut ReadState<S>,
    shared: &Shared,
    write: &Mutex<WriteState<S>>,
    header: FrameHeader,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Header validation capped this at 125 bytes.
    let mut payload = vec![0u8; header.payload_len as usize];
    state.read_exact_guarded(shared, &mut payload).await?;
    if let Some(key) = header.mask() {
        apply_mask(key, &mut payload, 0);
    }

    match header.opcode {
        OpCode::Ping => {
            trace!("received ping with {} payload bytes", payload.len());
            if !shared.close_sent() {
                let mut writer = write.lock().await;
                writer
                    .write_control(shared, OpCode::Pong, &payload)
                    .await?;
            }
            Ok(())
        }
        OpCode::Pong => {
            shared.complete_ping(&payload);
            Ok(())
        }
        OpCode::Close => {
            let frame = match CloseFrame::parse(&payload) {
                Ok(frame) => frame,
                Err(Error::Protocol(violation)) => {
                    return Err(fail_connection(
                        shared,
                        write,
                        ClosedCause::Protocol(violation),
                        CloseCode::PROTOCOL_ERROR,
                        "invalid close payload",
                    )
                    .await);
                }
                Err(error) => return Err(error),
            };
            debug!("received close frame with {frame}");
            if shared.mark_close_sent() {
                let echo = CloseFrame::new(frame.code, "").encode();
                let mut writer = write.lock().await;
                let _ = writer.write_control(shared, OpCode::Close, &echo).await;
            }
            shared.record_cause(ClosedCause::Closed(frame));
            Err(shared.closed_error())
        }
        _ => Ok(()),
    }
}

/// What the message pump should do next, decided without holding a borrow
/// across a suspension point.
enum Step {
    Done,
    TooBig(usize),
    DeliverInflated,
    ReadPlain { take: usize },
    ReadCompressed { take: usize },
    NextFrame,
    FeedTrailer,
}

impl<S> ReadState<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        read_half: ReadHalf<S>,
        role: Role,
        compression: Option<CompressionOptions>,
        leftover: Vec<u8>,
    ) -> Self {
        // Our inflater mirrors the peer's compressor, so the reset flag
        // follows the parameter that binds the peer's sending direction.
        let inflater_reset = compression
            .map(|options| match role {
                Role::Server => options.client_no_context_takeover,
                Role::Client => options.server_no_context_takeover,
            })
            .unwrap_or(false);

        Self {
            reader: Prefixed::new(leftover, BufReader::new(read_half)),
            role,
            deflate_negotiated: compression.is_some(),
            inflater: None,
            inflater_reset,
            current: None,
        }
    }

    async fn read_exact_guarded(&mut self, shared: &Shared, buf: &mut [u8]) -> Result<(), Error> {
        let mut shutdown = shared.shutdown_signal();
        let mut guard = FatalOnDrop::new(shared);
        let result = tokio::select! {
            read = self.reader.read_exact(buf) => read.map(|_| ()),
            _ = shutdown.changed() => {
                guard.disarm();
                return Err(shared.closed_error());
            }
        };
        guard.disarm();
        result.map_err(|error| fatal_io(shared, error))
    }

    /// One read of up to `buf.len()` payload bytes. Zero bytes mid-frame
    /// means the peer dropped the transport without a close handshake.
    async fn read_some_guarded(&mut self, shared: &Shared, buf: &mut [u8]) -> Result<usize, Error> {
        let mut shutdown = shared.shutdown_signal();
        let mut guard = FatalOnDrop::new(shared);
        let result = tokio::select! {
            read = self.reader.read(buf) => read,
            _ = shutdown.changed() => {
                guard.disarm();
                return Err(shared.closed_error());
            }
        };
        guard.disarm();
        match result {
            Ok(0) => Err(fatal_io(
                shared,
                io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed mid-frame"),
            )),
            Ok(n) => Ok(n),
            Err(error) => Err(fatal_io(shared, error)),
        }
    }

    async fn read_header(&mut self, shared: &Shared) -> Result<FrameHeader, Error> {
        let mut shutdown = shared.shutdown_signal();
        let mut guard = FatalOnDrop::new(shared);
        let result = tokio::select! {
            header = FrameHeader::read_from(&mut self.reader, self.role, self.deflate_negotiated) => header,
            _ = shutdown.changed() => {
                guard.disarm();
                return Err(shared.closed_error());
            }
        };
        guard.disarm();
        match result {
            Err(Error::IOError { source }) => Err(fatal_io(shared, source)),
            other => other,
        }
    }

    /// Advances past interleaved control frames to the next Continuation
    /// frame of the in-flight message.
    async fn next_continuation(
        &mut self,
        shared: &Shared,
        write: &Mutex<WriteState<S>>,
    ) -> Result<(), Error> {
        loop {
            let header = match self.read_header(shared).await {
                Ok(header) => header,
                Err(Error::Protocol(violation)) => {
                    return Err(fail_connection(
                        shared,
                        write,
                        ClosedCause::Protocol(violation),
                        CloseCode::PROTOCOL_ERROR,
                        "protocol violation",
                    )
                    .await);
                }
                Err(error) => return Err(error),
            };

            if header.opcode.is_control() {
                dispatch_control(self, shared, write, header).await?;
                continue;
            }
            if header.opcode != OpCode::Continue {
                return Err(fail_connection(
                    shared,
                    write,
                    ClosedCause::Protocol(ProtocolError::FragmentedInProgress),
                    CloseCode::PROTOCOL_ERROR,
                    "new data message inside a fragmented message",
                )
                .await);
            }

            let (exceeds, limit) = match self.current.as_ref() {
                Some(current) => (
                    !current.compressed && header.payload_len > current.limit_remaining,
                    current.limit,
                ),
                None => (false, 0),
            };
            if exceeds {
                return Err(fail_connection(
                    shared,
                    write,
                    ClosedCause::TooBig(limit),
                    CloseCode::MESSAGE_TOO_BIG,
                    "message exceeds read limit",
                )
                .await);
            }

            if let Some(current) = self.current.as_mut() {
                current.frame_remaining = header.payload_len;
                current.fin = header.fin;
                // Every frame carries its own mask key and starts its key
                // stream from the top.
                current.mask = header.mask();
                current.mask_pos = 0;
            }
            return Ok(());
        }
    }

    /// The per-message pump behind [`MessageReader::read`]. Ok(0) is end of
    /// message, after which the read token is free for the next message.
    async fn message_read(
        &mut self,
        shared: &Shared,
        write: &Mutex<WriteState<S>>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        if buf.is_empty() || self.current.is_none() {
            return Ok(0);
        }

        loop {
            shared.ensure_open()?;

            let step = match &self.current {
                None => Step::Done,
                Some(current) if current.compressed => {
                    let pending = current.inflated.len() - current.inflated_pos;
                    if pending > 0 {
                        if current.limit_remaining == 0 {
                            Step::TooBig(current.limit)
                        } else {
                            Step::DeliverInflated
                        }
                    } else if current.frame_remaining > 0 {
                        Step::ReadCompressed {
                            take: current.frame_remaining.min(PAYLOAD_CHUNK as u64) as usize,
                        }
                    } else if !current.fin {
                        Step::NextFrame
                    } else if !current.trailer_fed {
                        Step::FeedTrailer
                    } else {
                        Step::Done
                    }
                }
                Some(current) => {
                    if current.frame_remaining == 0 {
                        if current.fin {
                            Step::Done
                        } else {
                            Step::NextFrame
                        }
                    } else if current.limit_remaining == 0 {
                        Step::TooBig(current.limit)
                    } else {
                        Step::ReadPlain {
                            take: buf
                                .len()
                                .min(current.frame_remaining as usize)
                                .min(current.limit_remaining as usize),
                        }
                    }
                }
            };

            match step {
                Step::Done => {
                    self.finish_message();
                    return Ok(0);
                }
                Step::TooBig(limit) => {
                    return Err(fail_connection(
                        shared,
                        write,
                        ClosedCause::TooBig(limit),
                        CloseCode::MESSAGE_TOO_BIG,
                        "message exceeds read limit",
                    )
                    .await);
                }
                Step::DeliverInflated => {
                    if let Some(current) = self.current.as_mut() {
                        let pending = current.inflated.len() - current.inflated_pos;
                        let n = pending.min(buf.len()).min(current.limit_remaining as usize);
                        buf[..n].copy_from_slice(
                            &current.inflated[current.inflated_pos..current.inflated_pos + n],
                        );
                        current.inflated_pos += n;
                        current.limit_remaining -= n as u64;
                        if current.inflated_pos == current.inflated.len() {
                            current.inflated.clear();
                            current.inflated_pos = 0;
                            if current.trailer_fed {
                                self.finish_message();
                            }
                        }
                        return Ok(n);
                    }
                }
                Step::ReadPlain { take } => {
                    let n = self.read_some_guarded(shared, &mut buf[..take]).await?;
                    if let Some(current) = self.current.as_mut() {
                        if let Some(key) = current.mask {
                            current.mask_pos = apply_mask(key, &mut buf[..n], current.mask_pos);
                        }
                        current.frame_remaining -= n as u64;
                        current.limit_remaining -= n as u64;
                        if current.frame_remaining == 0 && current.fin {
                            self.finish_message();
                        }
                    }
                    return Ok(n);
                }
                Step::ReadCompressed { take } => {
                    let mut chunk = vec![0u8; take];
                    self.read_exact_guarded(shared, &mut chunk).await?;
                    let over_limit = self.inflate_chunk(shared, &mut chunk)?;
                    if let Some(limit) = over_limit {
                        return Err(fail_connection(
                            shared,
                            write,
                            ClosedCause::TooBig(limit),
                            CloseCode::MESSAGE_TOO_BIG,
                            "message exceeds read limit",
                        )
                        .await);
                    }
                }
                Step::NextFrame => {
                    self.next_continuation(shared, write).await?;
                }
                Step::FeedTrailer => {
                    let over_limit = self.feed_trailer(shared)?;
                    if let Some(limit) = over_limit {
                        return Err(fail_connection(
                            shared,
                            write,
                            ClosedCause::TooBig(limit),
                            CloseCode::MESSAGE_TOO_BIG,
                            "message exceeds read limit",
                        )
                        .await);
                    }
                }
            }
        }
    }

    /// Unmasks one compressed payload chunk and runs it through the
    /// inflater. Returns the limit if the output already overran it.
    fn inflate_chunk(&mut self, shared: &Shared, chunk: &mut [u8]) -> Result<Option<usize>, Error> {
        let reset = self.inflater_reset;
        let inflater = self.inflater.get_or_insert_with(|| Inflater::new(reset));
        if let Some(current) = self.current.as_mut() {
            if let Some(key) = current.mask {
                current.mask_pos = apply_mask(key, chunk, current.mask_pos);
            }
            current.frame_remaining -= chunk.len() as u64;
            inflater
                .inflate(chunk, &mut current.inflated)
                .map_err(|error| fatal_io(shared, error))?;
            let pending = (current.inflated.len() - current.inflated_pos) as u64;
            if pending > current.limit_remaining {
                return Ok(Some(current.limit));
            }
        }
        Ok(None)
    }

    /// Replays the stripped `00 00 FF FF` tail once the final frame has been
    /// consumed, flushing the inflater's last bytes for the message.
    fn feed_trailer(&mut self, shared: &Shared) -> Result<Option<usize>, Error> {
        let reset = self.inflater_reset;
        let inflater = self.inflater.get_or_insert_with(|| Inflater::new(reset));
        if let Some(current) = self.current.as_mut() {
            inflater
                .finish_message(&mut current.inflated)
                .map_err(|error| fatal_io(shared, error))?;
            current.trailer_fed = true;
            let pending = (current.inflated.len() - current.inflated_pos) as u64;
            if pending > current.limit_remaining {
                return Ok(Some(current.limit));
            }
        }
        Ok(None)
    }

    fn finish_message(&mut self) {
        if let Some(current) = self.current.take() {
            trace!("finished {:?} message", current.kind);
        }
    }

    /// Reads one frame during the close-handshake wait, answering control
    /// frames and throwing data payload away.
    pub(crate) async fn discard_frame(
        &mut self,
        shared: &Shared,
        write: &Mutex<WriteState<S>>,
    ) -> Result<(), Error> {
        let header = self.read_header(shared).await?;
        if header.opcode.is_control() {
            return dispatch_control(self, shared, write, header).await;
        }

        let mut remaining = header.payload_len;
        let mut chunk = [0u8; PAYLOAD_CHUNK];
        while remaining > 0 {
            let take = remaining.min(PAYLOAD_CHUNK as u64) as usize;
            self.read_exact_guarded(shared, &mut chunk[..take]).await?;
            remaining -= take as u64;
        }
        Ok(())
    }
}

/// A streaming handle over one inbound data message.
///
/// Holds the connection's read token, so the next [`Connection::reader`]
/// call waits until this one is dropped. Reads return payload bytes as they
/// arrive, with interleaved control frames handled transparently, and Ok(0)
/// once the message is complete.
pub struct MessageReader<S> {
    kind: MessageType,
    state: OwnedMutexGuard<ReadState<S>>,
    shared: Arc<Shared>,
    write: Arc<Mutex<WriteState<S>>>,
}

impl<S> MessageReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn message_type(&self) -> MessageType {
        self.kind
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.state.message_read(&self.shared, &self.write, buf).await
    }

    /// Drains the rest of the message into a buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        let mut chunk = [0u8; PAYLOAD_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Opens the next inbound data message, skipping over control traffic.
    ///
    /// At most one message reader exists at a time. Calls queue up behind
    /// the current one; if it was dropped before reaching end of message,
    /// the next call fails with [`Error::ReaderNotDrained`], which is not
    /// fatal for the connection.
    pub async fn reader(&self) -> Result<(MessageType, MessageReader<S>), Error> {
        self.shared.ensure_open()?;
        let mut state = self.read.clone().lock_owned().await;
        self.shared.ensure_open()?;
        if state.current.is_some() {
            return Err(Error::ReaderNotDrained);
        }

        loop {
            let header = match state.read_header(&self.shared).await {
                Ok(header) => header,
                Err(Error::Protocol(violation)) => {
                    return Err(fail_connection(
                        &self.shared,
                        &self.write,
                        ClosedCause::Protocol(violation),
                        CloseCode::PROTOCOL_ERROR,
                        "protocol violation",
                    )
                    .await);
                }
                Err(error) => return Err(error),
            };

            if header.opcode.is_control() {
                dispatch_control(&mut state, &self.shared, &self.write, header).await?;
                continue;
            }

            if header.opcode == OpCode::Continue {
                return Err(fail_connection(
                    &self.shared,
                    &self.write,
                    ClosedCause::Protocol(ProtocolError::InvalidContinuationFrame),
                    CloseCode::PROTOCOL_ERROR,
                    "unexpected continuation frame",
                )
                .await);
            }

            let kind = match header.opcode {
                OpCode::Text => MessageType::Text,
                _ => MessageType::Binary,
            };
            let limit = self.shared.read_limit();
            if !header.rsv1 && header.payload_len > limit as u64 {
                return Err(fail_connection(
                    &self.shared,
                    &self.write,
                    ClosedCause::TooBig(limit),
                    CloseCode::MESSAGE_TOO_BIG,
                    "message exceeds read limit",
                )
                .await);
            }

            state.current = Some(CurrentMessage {
                kind,
                compressed: header.rsv1,
                frame_remaining: header.payload_len,
                fin: header.fin,
                mask: header.mask(),
                mask_pos: 0,
                limit,
                limit_remaining: limit as u64,
                inflated: Vec::new(),
                inflated_pos: 0,
                trailer_fed: false,
            });
            trace!("opened {kind:?} message");

            return Ok((
                kind,
                MessageReader {
                    kind,
                    state,
                    shared: Arc::clone(&self.shared),
                    write: Arc::clone(&self.write),
                },
            ));
        }
    }

    /// Reads the next data message to completion, validating UTF-8 for text.
    pub async fn read(&self) -> Result<Message, Error> {
        let (kind, mut reader) = self.reader().await?;
        let data = reader.read_to_end().await?;
        Message::assemble(kind, data)
    }
}
