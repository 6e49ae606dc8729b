use crate::close::CloseCode;
use crate::connection::{ClosedCause, Connection};
use crate::error::{Error, ProtocolError};
use crate::message::Message;
use crate::read::fail_connection;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Presents a connection as a plain bidirectional byte stream.
///
/// Reads yield the payloads of Binary messages back to back, and a received
/// Text message fails the connection as a protocol violation. Every write
/// call goes out as one Binary message. Shutting the stream down runs the
/// close handshake, and the peer's clean close reads as end of stream.
pub struct ByteStream<S> {
    conn: Connection<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_fut: Option<BoxFuture<'static, Result<Vec<u8>, Error>>>,
    write_fut: Option<(usize, BoxFuture<'static, Result<(), Error>>)>,
    shutdown_fut: Option<BoxFuture<'static, Result<(), Error>>>,
}

fn to_io(error: Error) -> io::Error {
    match error {
        Error::IOError { source } => source,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

async fn read_binary<S>(conn: Connection<S>) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match conn.read().await? {
        Message::Binary(data) => Ok(data),
        Message::Text(_) => Err(fail_connection(
            &conn.shared,
            &conn.write,
            ClosedCause::Protocol(ProtocolError::UnexpectedTextMessage),
            CloseCode::PROTOCOL_ERROR,
            "text message on a binary stream",
        )
        .await),
    }
}

impl<S> ByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn: Connection<S>) -> Self {
        Self {
            conn,
            read_buf: Vec::new(),
            read_pos: 0,
            read_fut: None,
            write_fut: None,
            shutdown_fut: None,
        }
    }

    pub fn get_ref(&self) -> &Connection<S> {
        &self.conn
    }

    pub fn into_inner(self) -> Connection<S> {
        self.conn
    }
}

impl<S> AsyncRead for ByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.remaining().min(this.read_buf.len() - this.read_pos);
                buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            let fut = this.read_fut.get_or_insert_with(|| {
                let conn = this.conn.clone();
                read_binary(conn).boxed()
            });
            match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.read_fut = None;
                    match result {
                        // Empty messages produce no bytes, keep pulling.
                        Ok(data) => {
                            this.read_buf = data;
                            this.read_pos = 0;
                        }
                        Err(Error::ConnectionClosed(_)) => return Poll::Ready(Ok(())),
                        Err(error) => return Poll::Ready(Err(to_io(error))),
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for ByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some((len, fut)) = this.write_fut.as_mut() {
                let len = *len;
                return match fut.as_mut().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(result) => {
                        this.write_fut = None;
                        match result {
                            Ok(()) => Poll::Ready(Ok(len)),
                            Err(error) => Poll::Ready(Err(to_io(error))),
                        }
                    }
                };
            }

            let conn = this.conn.clone();
            let data = buf.to_vec();
            this.write_fut = Some((
                buf.len(),
                async move { conn.write(Message::Binary(data)).await }.boxed(),
            ));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.write_fut.as_mut() {
            Some((_, fut)) => match fut.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    this.write_fut = None;
                    Poll::Ready(result.map_err(to_io))
                }
            },
            // Frames are flushed as they are written.
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let fut = this.shutdown_fut.get_or_insert_with(|| {
            let conn = this.conn.clone();
            async move {
                match conn.close(CloseCode::NORMAL, "").await {
                    Ok(()) | Err(Error::ConnectionClosed(_)) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            .boxed()
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.shutdown_fut = None;
                Poll::Ready(result.map_err(to_io))
            }
        }
    }
}
