//! Per-dispatch context and its middleware chain.
//!
//! A [`Context`] binds a request, a response writer, a key/value bag, the
//! handler chain with its cursor and the errors reported so far. Contexts are
//! pooled by the server and fully reset before each dispatch.
//!
//! ## Chain execution
//!
//! [`Context::next`] runs every remaining handler in order. A handler that
//! wants to run code after the rest of the chain calls `next().await` once and
//! continues afterwards; a handler that never calls it lets the chain carry on
//! with its successor when it returns. [`Context::abort`] stops every handler
//! that has not started yet.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use futures::future::BoxFuture;
use tracing::trace;

use crate::error::{BoxError, Error, Errors};
use crate::protocol::terminate;
use crate::request::{Request, Value};
use crate::response::{ResponseWriter, Writer};

/// A handler, or middleware, invoked with the dispatch context.
pub type HandlerFunc = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync>;

/// Pins down the handler signature of a closure.
pub(crate) fn handler_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    f
}

/// State of one dispatch.
pub struct Context {
    request: Option<Request>,
    writer: Writer,
    shared: HashMap<String, Value>,
    handlers: Arc<[HandlerFunc]>,
    /// Index of the next handler to run.
    index: usize,
    aborted: bool,
    errors: Errors,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            request: None,
            writer: Writer::default(),
            shared: HashMap::new(),
            handlers: Arc::new([]),
            index: 0,
            aborted: false,
            errors: Errors::new(),
        }
    }
}

impl Context {
    /// Creates a context outside of any server, mostly useful in tests.
    pub fn new(request: Request, writer: Arc<dyn ResponseWriter>) -> Self {
        Context {
            request: Some(request),
            writer: Writer::new(Some(writer)),
            ..Context::default()
        }
    }

    /// Prepares a (possibly reused) context for a new dispatch.
    pub(crate) fn reset(
        &mut self,
        writer: Option<Arc<dyn ResponseWriter>>,
        request: Option<Request>,
        handlers: Arc<[HandlerFunc]>,
    ) {
        self.writer.rebase(writer);
        self.request = request;
        self.shared.clear();
        self.handlers = handlers;
        self.index = 0;
        self.aborted = false;
        self.errors.clear();
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut Request> {
        self.request.as_mut()
    }

    /// Size-tracking writer of this dispatch.
    pub fn response_writer(&self) -> &Writer {
        &self.writer
    }

    /// Runs the remaining handlers of the chain.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while !self.aborted && self.index < self.handlers.len() {
                let handler = Arc::clone(&self.handlers[self.index]);
                self.index += 1;
                handler(&mut *self).await;
            }
        })
    }

    /// Prevents pending handlers from being called.
    ///
    /// The current handler keeps running until it returns.
    pub fn abort(&mut self) {
        trace!(index = self.index, "chain aborted");
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Records an error. Execution goes on.
    pub fn error(&mut self, err: impl Into<BoxError>) {
        self.errors.push(err.into());
    }

    /// Errors reported during this dispatch, `None` if there were none.
    pub fn err(&self) -> Option<&Errors> {
        (!self.errors.is_empty()).then_some(&self.errors)
    }

    /// Per-dispatch key/value bag.
    pub fn shared(&self) -> &HashMap<String, Value> {
        &self.shared
    }

    /// Stores a value for the handlers of this dispatch.
    pub fn set<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.shared.insert(key.into(), Arc::new(value));
    }

    /// Looks up `key` in the bag first, then in the request's ambient values.
    pub fn get(&self, key: &str) -> Option<&(dyn Any + Send + Sync)> {
        match self.shared.get(key) {
            Some(v) => Some(v.as_ref()),
            None => self.request.as_ref()?.value(key),
        }
    }

    fn get_as<T: Any + Clone + Default>(&self, key: &str) -> T {
        self.get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_as(key)
    }

    /// Integer stored as `i32`, the type of an unsuffixed literal.
    pub fn get_int(&self, key: &str) -> i32 {
        self.get_as(key)
    }

    pub fn get_int64(&self, key: &str) -> i64 {
        self.get_as(key)
    }

    pub fn get_float64(&self, key: &str) -> f64 {
        self.get_as(key)
    }

    /// String stored either as `String` or `&'static str`.
    pub fn get_string(&self, key: &str) -> String {
        match self.get(key) {
            Some(v) => match v.downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => v
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            },
            None => String::new(),
        }
    }

    pub fn get_duration(&self, key: &str) -> Duration {
        self.get_as(key)
    }

    /// Returns the request body.
    ///
    /// Fails with [`Error::InvalidRequest`] without request and with an
    /// end-of-stream error when the request has no body.
    pub fn read_all(&self) -> Result<Bytes, Error> {
        let req = self.request.as_ref().ok_or(Error::InvalidRequest)?;
        req.body.clone().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF",
            ))
        })
    }

    /// Writes raw bytes to the response.
    pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf).await
    }

    /// Writes a message, adding the terminator if missing.
    ///
    /// A write failure is recorded with [`Context::error`].
    pub async fn string(&mut self, s: impl AsRef<str>) {
        let msg = terminate(s.as_ref());
        if let Err(e) = self.writer.write_str(&msg).await {
            self.error(e);
        }
    }

    /// Closes the response writer, hence the connection's write side.
    pub async fn close(&self) -> std::io::Result<()> {
        self.writer.close().await
    }

    /// Resolves when the request is cancelled. Never resolves without request.
    pub async fn canceled(&self) {
        match &self.request {
            Some(req) => req.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Free list of contexts shared by every connection of a server.
pub(crate) struct ContextPool {
    free: ArrayQueue<Box<Context>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        ContextPool {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Borrows a context, allocating one when the pool is empty.
    pub fn get(&self) -> PooledContext<'_> {
        let ctx = self.free.pop().unwrap_or_default();
        PooledContext {
            ctx: Some(ctx),
            pool: self,
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Context borrowed from the pool, given back on drop.
pub(crate) struct PooledContext<'a> {
    ctx: Option<Box<Context>>,
    pool: &'a ContextPool,
}

impl std::ops::Deref for PooledContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.ctx.as_deref().expect("context already released")
    }
}

impl std::ops::DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_deref_mut().expect("context already released")
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            // Drop references to the connection and the request right away.
            ctx.reset(None, None, Arc::new([]));
            let _ = self.pool.free.push(ctx);
        }
    }
}
