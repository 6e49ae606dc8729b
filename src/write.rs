use crate::connection::{ClosedCause, Connection, FatalOnDrop, Role, Shared};
use crate::deflate::Deflater;
use crate::error::Error;
use crate::extensions::CompressionOptions;
use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask;
use crate::message::{Message, MessageType};
use crate::read::fatal_io;
use bytes::BytesMut;
use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything the write half owns: the buffered transport, the streaming
/// compressor, and the scratch buffer frames are assembled in. Guarded by
/// the connection's frame token, which control frames take on their own so
/// they can slot in between the fragments of a data message.
pub(crate) struct WriteState<S> {
    writer: BufWriter<WriteHalf<S>>,
    role: Role,
    deflater: Option<Deflater>,
    deflater_reset: bool,
    scratch: BytesMut,
}

impl<S> WriteState<S>
where
    S: AsyncWrite + Unpin,
{
    pub(crate) fn new(
        write_half: WriteHalf<S>,
        role: Role,
        compression: Option<CompressionOptions>,
    ) -> Self {
        // Our compressor binds our own sending direction, so the reset flag
        // follows the parameter named after our role.
        let deflater_reset = compression
            .map(|options| match role {
                Role::Server => options.server_no_context_takeover,
                Role::Client => options.client_no_context_takeover,
            })
            .unwrap_or(false);

        Self {
            writer: BufWriter::new(write_half),
            role,
            deflater: None,
            deflater_reset,
            scratch: BytesMut::new(),
        }
    }

    /// Encodes and sends one frame, flushing it onto the wire.
    ///
    /// In the client role a fresh mask key is drawn per frame and the
    /// payload is masked inside the outbound scratch buffer, the caller's
    /// slice is left untouched.
    pub(crate) async fn write_frame(
        &mut self,
        shared: &Shared,
        fin: bool,
        rsv1: bool,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mut header = FrameHeader::new(fin, rsv1, opcode, payload.len() as u64);
        self.scratch.clear();

        if self.role == Role::Client {
            let mut rng = StdRng::from_rng(&mut rand::rng());
            header.masked = true;
            header.mask_key = rng.random::<[u8; 4]>();
            header.encode(&mut self.scratch);
            let payload_start = self.scratch.len();
            self.scratch.extend_from_slice(payload);
            apply_mask(header.mask_key, &mut self.scratch[payload_start..], 0);
        } else {
            header.encode(&mut self.scratch);
            self.scratch.extend_from_slice(payload);
        }
        trace!(
            "writing {opcode:?} frame, fin={fin}, {} payload bytes",
            payload.len()
        );

        let frame = self.scratch.split();
        let mut shutdown = shared.shutdown_signal();
        let mut guard = FatalOnDrop::new(shared);
        let result = tokio::select! {
            write = async {
                self.writer.write_all(&frame).await?;
                self.writer.flush().await
            } => write,
            _ = shutdown.changed() => {
                guard.disarm();
                return Err(shared.closed_error());
            }
        };
        guard.disarm();
        result.map_err(|error| fatal_io(shared, error))
    }

    /// Sends a single-frame control message.
    pub(crate) async fn write_control(
        &mut self,
        shared: &Shared,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write_frame(shared, true, false, opcode, payload).await
    }

    fn deflater_mut(&mut self) -> &mut Deflater {
        let reset = self.deflater_reset;
        self.deflater.get_or_insert_with(|| Deflater::new(reset))
    }

    pub(crate) fn deflate_chunk(
        &mut self,
        shared: &Shared,
        data: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        self.deflater_mut()
            .deflate(data, out)
            .map_err(|error| fatal_io(shared, error))
    }

    pub(crate) fn finish_deflate(
        &mut self,
        shared: &Shared,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        self.deflater_mut()
            .finish_message(out)
            .map_err(|error| fatal_io(shared, error))
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// A streaming handle over one outbound data message.
///
/// Holds the connection's message token, serializing whole messages, while
/// each fragment takes the frame token only for its own write so pings and
/// close frames can interleave. Consuming the writer with
/// [`MessageWriter::finish`] emits the final frame; dropping a started
/// writer without finishing leaves the peer mid-message and therefore
/// closes the connection.
pub struct MessageWriter<S> {
    shared: Arc<Shared>,
    write: Arc<Mutex<WriteState<S>>>,
    _message_token: OwnedMutexGuard<()>,
    kind: MessageType,
    compressed: bool,
    started: bool,
    finished: bool,
}

impl<S> MessageWriter<S>
where
    S: AsyncWrite + Unpin,
{
    /// Sends `data` as the next fragment of the message.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.shared.ensure_open()?;
        let mut write = self.write.lock().await;

        let opcode = if self.started {
            OpCode::Continue
        } else {
            self.kind.opcode()
        };

        if self.compressed {
            let mut out = Vec::new();
            write.deflate_chunk(&self.shared, data, &mut out)?;
            write
                .write_frame(&self.shared, false, !self.started, opcode, &out)
                .await?;
        } else {
            write
                .write_frame(&self.shared, false, false, opcode, data)
                .await?;
        }
        self.started = true;
        Ok(())
    }

    /// Ends the message: flushes the compressor if one is active and emits
    /// the final frame.
    pub async fn finish(mut self) -> Result<(), Error> {
        self.shared.ensure_open()?;
        let mut write = self.write.lock().await;

        let opcode = if self.started {
            OpCode::Continue
        } else {
            self.kind.opcode()
        };

        if self.compressed {
            let mut out = Vec::new();
            write.finish_deflate(&self.shared, &mut out)?;
            write
                .write_frame(&self.shared, true, !self.started, opcode, &out)
                .await?;
        } else {
            write
                .write_frame(&self.shared, true, false, opcode, &[])
                .await?;
        }
        self.finished = true;
        Ok(())
    }
}

impl<S> Drop for MessageWriter<S> {
    fn drop(&mut self) {
        // An abandoned message leaves the peer waiting for fragments that
        // will never come, the stream position is unusable.
        if self.started && !self.finished {
            self.shared.record_cause(ClosedCause::Cancelled);
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Opens a streaming writer for one outbound message. Writers queue up
    /// behind each other in the order the calls were made.
    pub async fn writer(&self, kind: MessageType) -> Result<MessageWriter<S>, Error> {
        self.shared.ensure_open()?;
        let token = self.write_message.clone().lock_owned().await;
        self.shared.ensure_open()?;
        Ok(MessageWriter {
            shared: Arc::clone(&self.shared),
            write: Arc::clone(&self.write),
            _message_token: token,
            kind,
            compressed: self.shared.compression.is_some(),
            started: false,
            finished: false,
        })
    }

    /// Sends a whole message at once. Uncompressed messages go out as a
    /// single fin frame.
    pub async fn write(&self, message: impl Into<Message>) -> Result<(), Error> {
        let message = message.into();
        self.shared.ensure_open()?;
        let _token = self.write_message.clone().lock_owned().await;
        self.shared.ensure_open()?;

        let kind = message.message_type();
        let payload = message.into_data();
        let mut write = self.write.lock().await;

        if self.shared.compression.is_some() && !payload.is_empty() {
            let mut out = Vec::new();
            write.deflate_chunk(&self.shared, &payload, &mut out)?;
            write.finish_deflate(&self.shared, &mut out)?;
            write
                .write_frame(&self.shared, true, true, kind.opcode(), &out)
                .await
        } else {
            write
                .write_frame(&self.shared, true, false, kind.opcode(), &payload)
                .await
        }
    }
}
