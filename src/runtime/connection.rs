//! Connection lifecycle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::{self, Segment, EOL};
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::server::Shared;

/// One accepted connection, driven from `SYN` to `FIN`.
pub(crate) struct Connection<S> {
    stream: S,
    peer: String,
    shared: Arc<Shared>,
    read_timeout: Option<Duration>,
    base: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        stream: S,
        peer: String,
        shared: Arc<Shared>,
        read_timeout: Option<Duration>,
        base: CancellationToken,
    ) -> Self {
        Connection {
            stream,
            peer,
            shared,
            read_timeout,
            base,
        }
    }

    /// Dispatches `SYN`, one `ACK` per message and a single `FIN`, then
    /// closes the write side.
    pub async fn run(self) {
        let Connection {
            stream,
            peer,
            shared,
            read_timeout,
            base,
        } = self;

        let (reader, writer) = tokio::io::split(stream);
        let writer: Arc<dyn ResponseWriter> = Arc::new(ConnWriter::new(writer));
        let mut reader = BufReader::new(reader);
        let dispatcher = Dispatcher {
            peer: &peer,
            shared: &shared,
            writer: &writer,
            base: &base,
        };

        debug!(peer = %peer, "connection opened");
        dispatcher.dispatch(Segment::Syn, None).await;

        loop {
            let mut line = Vec::new();
            let read = tokio::select! {
                _ = base.cancelled() => {
                    debug!(peer = %peer, "connection cancelled");
                    break;
                }
                read = read_message(&mut reader, &mut line, read_timeout) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => match protocol::frame(line) {
                    Some(body) => {
                        trace!(peer = %peer, bytes = n, "message received");
                        dispatcher.dispatch(Segment::Ack, Some(Bytes::from(body))).await;
                    }
                    None => {
                        trace!(peer = %peer, bytes = n, "dropping unterminated message");
                        break;
                    }
                },
                Err(e) => {
                    debug!(peer = %peer, error = %e, "read failed");
                    break;
                }
            }
        }

        dispatcher.dispatch(Segment::Fin, None).await;

        if let Err(e) = writer.close().await {
            trace!(peer = %peer, error = %e, "close failed");
        }
        debug!(peer = %peer, "connection closed");
    }
}

/// Reads one message, bounded by the read timeout when one is set.
async fn read_message<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    read_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read_until(EOL, line))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))?,
        None => reader.read_until(EOL, line).await,
    }
}

struct Dispatcher<'a> {
    peer: &'a str,
    shared: &'a Shared,
    writer: &'a Arc<dyn ResponseWriter>,
    base: &'a CancellationToken,
}

impl Dispatcher<'_> {
    async fn dispatch(&self, segment: Segment, body: Option<Bytes>) {
        let mut req = Request::new(segment, body).with_cancel(self.base);
        req.remote_addr = self.peer.to_string();
        // The request scope ends with its dispatch.
        let _scope = req.token.clone().drop_guard();
        self.shared.serve_tcp(Arc::clone(self.writer), req).await;
    }
}

/// Write side of a connection, shared by every dispatch.
struct ConnWriter<S> {
    inner: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
}

impl<S> ConnWriter<S> {
    fn new(inner: WriteHalf<S>) -> Self {
        ConnWriter {
            inner: Mutex::new(inner),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> ResponseWriter for ConnWriter<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        let mut inner = self.inner.lock().await;
        inner.write_all(buf).await?;
        inner.flush().await?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.lock().await.shutdown().await
    }
}
