use crate::close::{CloseCode, CloseFrame, MAX_CLOSE_REASON};
use crate::error::{Error, ProtocolError};
use crate::extensions::CompressionOptions;
use crate::frame::OpCode;
use crate::read::{self, ReadState};
use crate::write::WriteState;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How many payload bytes a single received message may carry before the
/// connection is failed with status 1009. Adjustable per connection with
/// [`Connection::set_read_limit`].
pub const DEFAULT_READ_LIMIT: usize = 32 * 1024;

/// How long the side initiating the close handshake waits for the peer's
/// Close frame before giving up on it.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which end of the connection we are. The client masks every frame it
/// sends, the server none, and each side enforces the opposite on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Why the connection stopped. Recorded exactly once; every operation after
/// that reproduces the same error for the caller.
#[derive(Debug, Clone)]
pub(crate) enum ClosedCause {
    Closed(CloseFrame),
    Protocol(ProtocolError),
    TooBig(usize),
    Policy,
    Io(io::ErrorKind, String),
    Cancelled,
}

impl ClosedCause {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            ClosedCause::Closed(frame) => Error::ConnectionClosed(frame.clone()),
            ClosedCause::Protocol(violation) => Error::Protocol(*violation),
            ClosedCause::TooBig(limit) => Error::MessageTooBig(*limit),
            ClosedCause::Policy => Error::PolicyViolation,
            ClosedCause::Io(kind, message) => Error::IOError {
                source: io::Error::new(*kind, message.clone()),
            },
            ClosedCause::Cancelled => Error::Cancelled,
        }
    }
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every handle and task working on one connection.
pub(crate) struct Shared {
    pub(crate) role: Role,
    subprotocol: Option<String>,
    pub(crate) compression: Option<CompressionOptions>,
    closed: StdMutex<Option<ClosedCause>>,
    shutdown: watch::Sender<bool>,
    pings: StdMutex<HashMap<Vec<u8>, oneshot::Sender<()>>>,
    read_limit: AtomicUsize,
    close_sent: AtomicBool,
}

impl Shared {
    fn new(
        role: Role,
        subprotocol: Option<String>,
        compression: Option<CompressionOptions>,
    ) -> Shared {
        let (shutdown, _) = watch::channel(false);
        Shared {
            role,
            subprotocol,
            compression,
            closed: StdMutex::new(None),
            shutdown,
            pings: StdMutex::new(HashMap::new()),
            read_limit: AtomicUsize::new(DEFAULT_READ_LIMIT),
            close_sent: AtomicBool::new(false),
        }
    }

    /// Records the terminal cause. Only the first call takes effect, and it
    /// wakes everything parked on transport I/O or a pong.
    pub(crate) fn record_cause(&self, cause: ClosedCause) {
        let mut closed = lock_unpoisoned(&self.closed);
        if closed.is_none() {
            *closed = Some(cause);
            let _ = self.shutdown.send(true);
        }
    }

    pub(crate) fn cause(&self) -> Option<ClosedCause> {
        lock_unpoisoned(&self.closed).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.closed).is_some()
    }

    /// The error operations surface once the connection is down.
    pub(crate) fn closed_error(&self) -> Error {
        match self.cause() {
            Some(cause) => cause.to_error(),
            None => Error::Cancelled,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        match self.cause() {
            Some(cause) => Err(cause.to_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::Relaxed)
    }

    /// Claims the right to send the single Close frame of this connection.
    /// Returns true for exactly one caller.
    pub(crate) fn mark_close_sent(&self) -> bool {
        !self.close_sent.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::SeqCst)
    }

    fn register_ping(&self, payload: Vec<u8>) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        lock_unpoisoned(&self.pings).insert(payload, sender);
        receiver
    }

    /// Completes the waiter for a received Pong. Pongs nobody asked for are
    /// dropped on the floor.
    pub(crate) fn complete_ping(&self, payload: &[u8]) {
        if let Some(sender) = lock_unpoisoned(&self.pings).remove(payload) {
            let _ = sender.send(());
        }
    }

    fn forget_ping(&self, payload: &[u8]) {
        lock_unpoisoned(&self.pings).remove(payload);
    }
}

/// Marks the connection dead if an I/O future is dropped before it ran to
/// completion, since the byte stream position is indeterminate after that.
pub(crate) struct FatalOnDrop<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> FatalOnDrop<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FatalOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.record_cause(ClosedCause::Cancelled);
        }
    }
}

/// Clears the outstanding-ping entry when the waiter goes away, whether it
/// resolved, failed, or was dropped mid-wait.
struct PingEntry<'a> {
    shared: &'a Shared,
    payload: &'a [u8],
}

impl Drop for PingEntry<'_> {
    fn drop(&mut self) {
        self.shared.forget_ping(self.payload);
    }
}

/// A WebSocket connection over an upgraded byte stream.
///
/// The connection is a handle: it is cheap to clone, and clones share the
/// same state, so one task can read while another writes and a third pings.
/// Data-message reads are serialized against each other, as are data-message
/// writes, while control frames interleave freely.
pub struct Connection<S> {
    pub(crate) shared: Arc<Shared>,
    pub(crate) read: Arc<Mutex<ReadState<S>>>,
    pub(crate) write_message: Arc<Mutex<()>>,
    pub(crate) write: Arc<Mutex<WriteState<S>>>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Connection {
            shared: Arc::clone(&self.shared),
            read: Arc::clone(&self.read),
            write_message: Arc::clone(&self.write_message),
            write: Arc::clone(&self.write),
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-upgraded stream. `leftover` carries any bytes the
    /// handshake read past the end of the HTTP headers, which belong to the
    /// first frame.
    pub(crate) fn new(
        stream: S,
        role: Role,
        subprotocol: Option<String>,
        compression: Option<CompressionOptions>,
        leftover: Vec<u8>,
    ) -> Connection<S> {
        let (read_half, write_half) = tokio::io::split(stream);
        Connection {
            shared: Arc::new(Shared::new(role, subprotocol, compression)),
            read: Arc::new(Mutex::new(ReadState::new(
                read_half,
                role,
                compression,
                leftover,
            ))),
            write_message: Arc::new(Mutex::new(())),
            write: Arc::new(Mutex::new(WriteState::new(write_half, role, compression))),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The subprotocol agreed on during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    pub fn compression(&self) -> Option<CompressionOptions> {
        self.shared.compression
    }

    /// Caps how many payload bytes a single received message may carry.
    /// Takes effect for messages opened after the call.
    pub fn set_read_limit(&self, limit: usize) {
        self.shared.read_limit.store(limit, Ordering::Relaxed);
    }

    /// Sends a Ping with a random payload and waits for the matching Pong.
    ///
    /// Pongs are only noticed while something is reading the connection, so
    /// a ping resolves once some task is inside [`Connection::read`] or a
    /// message reader. Dropping the returned future abandons the wait but
    /// leaves the connection usable.
    pub async fn ping(&self) -> Result<(), Error> {
        let payload = rand::random::<[u8; 16]>();
        self.ping_with(payload.to_vec()).await
    }

    /// Sends a Ping with the given payload and waits for the matching Pong.
    pub async fn ping_with(&self, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() > 125 {
            return Err(ProtocolError::ControlFramePayloadSize.into());
        }

        let mut shutdown = self.shared.shutdown_signal();
        self.shared.ensure_open()?;

        let receiver = self.shared.register_ping(payload.clone());
        let _entry = PingEntry {
            shared: &self.shared,
            payload: &payload,
        };

        {
            let mut write = self.write.lock().await;
            write
                .write_control(&self.shared, OpCode::Ping, &payload)
                .await?;
        }

        tokio::select! {
            reply = receiver => match reply {
                Ok(()) => Ok(()),
                Err(_) => Err(self.shared.closed_error()),
            },
            _ = shutdown.changed() => Err(self.shared.closed_error()),
        }
    }

    /// Performs the close handshake: sends a Close frame, waits up to five
    /// seconds for the peer's Close while discarding data still in flight,
    /// then shuts the transport down.
    ///
    /// The first call records the cause; calling again returns the recorded
    /// error without sending anything.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        if reason.len() > MAX_CLOSE_REASON {
            return Err(Error::CloseReasonTooLong);
        }
        if let Some(cause) = self.shared.cause() {
            return Err(cause.to_error());
        }

        let frame = CloseFrame::new(code, reason);

        if self.shared.mark_close_sent() {
            let payload = frame.encode();
            let mut write = self.write.lock().await;
            if let Err(error) = write
                .write_control(&self.shared, OpCode::Close, &payload)
                .await
            {
                let _ = write.shutdown().await;
                return Err(error);
            }
            debug!("sent close frame with {frame}");
        }

        let _ = timeout(CLOSE_HANDSHAKE_TIMEOUT, self.wait_peer_close()).await;

        // If the peer's Close frame arrived it recorded the cause already,
        // and that one wins.
        self.shared.record_cause(ClosedCause::Closed(frame));

        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        Ok(())
    }

    /// Reads and throws away frames until the peer's Close frame shows up
    /// or the transport dies. Control frames are still dispatched so a
    /// simultaneous close from the other side is noticed.
    async fn wait_peer_close(&self) {
        loop {
            if self.shared.is_closed() {
                return;
            }
            let mut state = self.read.lock().await;
            if self.shared.is_closed() {
                return;
            }
            if state
                .discard_frame(&self.shared, &self.write)
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Stops accepting data messages while keeping the write side open.
    ///
    /// A background task drains the connection so control traffic keeps
    /// flowing; if the peer sends another data message the connection is
    /// failed with status 1008. The returned handle completes when the
    /// drain task ends, which happens once the connection is closed.
    pub fn close_read(&self) -> JoinHandle<()> {
        let conn = self.clone();
        tokio::spawn(async move {
            match conn.reader().await {
                Ok(_ignored_reader) => {
                    debug!("data message received while reads are closed");
                    read::fail_connection(
                        &conn.shared,
                        &conn.write,
                        ClosedCause::Policy,
                        CloseCode::POLICY_VIOLATION,
                        "unexpected data message",
                    )
                    .await;
                }
                Err(_) => {}
            }
        })
    }
}
