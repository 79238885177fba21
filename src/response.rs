//! Response side of a dispatch.
//!
//! [`ResponseWriter`] is the sink handed to [`Server::serve_tcp`](crate::Server::serve_tcp):
//! the write side of a socket, or a [`ResponseRecorder`] in tests. The context
//! wraps it in a [`Writer`] that counts the bytes written during one dispatch.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

/// Write side used by handlers to answer a request.
///
/// Implementations are shared by every dispatch of one connection, hence `&self`.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    /// Writes the whole buffer, returning the number of bytes written.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the sink. Further writes fail.
    async fn close(&self) -> io::Result<()>;
}

/// Size-tracking wrapper owned by a pooled context.
///
/// Rebased onto a new sink for every dispatch instead of being reallocated.
#[derive(Default)]
pub struct Writer {
    sink: Option<Arc<dyn ResponseWriter>>,
    size: Option<usize>,
}

impl Writer {
    pub(crate) fn new(sink: Option<Arc<dyn ResponseWriter>>) -> Self {
        Writer { sink, size: None }
    }

    /// Bytes written since the last rebase, `None` while nothing has been written.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sink = self.sink.as_ref().ok_or_else(no_sink)?;
        let n = sink.write(buf).await?;
        self.incr(n);
        Ok(n)
    }

    pub async fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes()).await
    }

    pub async fn close(&self) -> io::Result<()> {
        match &self.sink {
            Some(sink) => sink.close().await,
            None => Ok(()),
        }
    }

    fn incr(&mut self, n: usize) {
        *self.size.get_or_insert(0) += n;
    }

    pub(crate) fn rebase(&mut self, sink: Option<Arc<dyn ResponseWriter>>) {
        self.sink = sink;
        self.size = None;
    }
}

fn no_sink() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "EOF")
}

/// In-memory [`ResponseWriter`] recording everything written to it.
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    body: Mutex<BytesMut>,
}

impl ResponseRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the recorded bytes.
    pub fn body(&self) -> Bytes {
        match self.body.lock() {
            Ok(body) => body.clone().freeze(),
            Err(_) => Bytes::new(),
        }
    }

    /// Recorded bytes as a (lossy) string.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    /// Number of bytes recorded.
    pub fn size(&self) -> usize {
        self.body.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ResponseWriter for ResponseRecorder {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut body = self
            .body
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "recorder poisoned"))?;
        body.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
