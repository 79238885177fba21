//! TCP server.
//!
//! Owns the handler registry and the context pool, accepts connections and
//! coordinates graceful shutdown.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{Context, ContextPool, HandlerFunc};
use crate::error::{Error, Result};
use crate::middleware::{logger, recovery, LogFields};
use crate::protocol::Segment;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::runtime::{self, tls, Connection, IoStream};

/// Default number of idle contexts kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Handlers per segment plus the global ones.
#[derive(Default)]
struct Router {
    global: Vec<HandlerFunc>,
    segments: HashMap<Segment, Vec<HandlerFunc>>,
}

impl Router {
    /// Global handlers first, then the segment's, in registration order.
    fn chain(&self, segment: Segment) -> Arc<[HandlerFunc]> {
        let own = self.segments.get(&segment).map_or(&[][..], Vec::as_slice);
        self.global.iter().chain(own).cloned().collect()
    }
}

/// State shared with every connection task.
pub(crate) struct Shared {
    router: Router,
    pool: ContextPool,
}

impl Shared {
    fn new(pool_capacity: usize) -> Self {
        Shared {
            router: Router::default(),
            pool: ContextPool::new(pool_capacity),
        }
    }

    pub(crate) async fn serve_tcp(&self, w: Arc<dyn ResponseWriter>, req: Request) {
        let handlers = self.router.chain(req.segment);
        let mut ctx = self.pool.get();
        let empty = handlers.is_empty();
        ctx.reset(Some(w), Some(req), handlers);
        if empty {
            return;
        }
        ctx.next().await;
    }
}

/// Signals of one serving run.
#[derive(Clone)]
struct Lifecycle {
    /// Stops the accept loop.
    shutdown: CancellationToken,
    /// Parent of every dispatch scope. Cancelled when the run ends or is forced.
    base: CancellationToken,
    /// Cancelled once every connection task of a stopped run has finished.
    closed: CancellationToken,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            shutdown: CancellationToken::new(),
            base: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }
}

/// TCP server dispatching connection events to registered handlers.
///
/// ```no_run
/// use linewire::Server;
///
/// # async fn demo() -> linewire::Result<()> {
/// let mut server = Server::with_defaults();
/// server.ack(|c| {
///     Box::pin(async move {
///         let n = c.request().map_or(0, |r| r.len());
///         c.string(format!("received: {n} bytes")).await;
///     })
/// });
/// server.run("127.0.0.1:9090").await
/// # }
/// ```
pub struct Server {
    /// Maximum time a connection may wait for its next message. `None` never times out.
    pub read_timeout: Option<Duration>,
    /// Listen backlog used by `run` and `run_tls`.
    pub backlog: u32,
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    /// Creates a server without any handler.
    pub fn new() -> Self {
        Server::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Creates a server keeping at most `capacity` idle contexts.
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Server {
            read_timeout: None,
            backlog: runtime::DEFAULT_BACKLOG,
            shared: Arc::new(Shared::new(capacity)),
            lifecycle: Mutex::new(None),
        }
    }

    /// Creates a server with the logging and the recovery middlewares attached.
    pub fn with_defaults() -> Self {
        let mut server = Server::new();
        server
            .use_handler(logger(LogFields::default()))
            .use_handler(recovery());
        server
    }

    /// Creates a server from the resolved configuration, without any handler.
    pub fn from_config(config: &Config) -> Self {
        let mut server = Server::with_pool_capacity(config.pool_capacity);
        server.read_timeout = config.read_timeout;
        server.backlog = config.backlog;
        server
    }

    /// Attaches a handler on every segment.
    pub fn use_handler<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(f))
    }

    /// Attaches a handler on each new connection.
    pub fn syn<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Some(Segment::Syn), Arc::new(f))
    }

    /// Attaches a handler on each new message.
    pub fn ack<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Some(Segment::Ack), Arc::new(f))
    }

    /// Attaches a handler on each closed connection.
    pub fn fin<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Some(Segment::Fin), Arc::new(f))
    }

    /// Attaches a handler on the named segment. Any other name, including
    /// [`ANY`](crate::protocol::ANY), attaches it on every segment.
    pub fn any<F>(&mut self, segment: &str, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(segment.parse().ok(), Arc::new(f))
    }

    /// Attaches an already built handler, on every segment when `segment` is `None`.
    pub fn handle(&mut self, segment: Option<Segment>, handler: HandlerFunc) -> &mut Self {
        self.register(segment, handler)
    }

    fn register(&mut self, segment: Option<Segment>, handler: HandlerFunc) -> &mut Self {
        let Some(shared) = Arc::get_mut(&mut self.shared) else {
            warn!(
                segment = segment.map_or("ANY", |s| s.as_str()),
                "server is serving, handler ignored"
            );
            return self;
        };
        match segment {
            Some(segment) => shared
                .router
                .segments
                .entry(segment)
                .or_default()
                .push(handler),
            None => shared.router.global.push(handler),
        }
        self
    }

    /// Dispatches one request through the chain matching its segment.
    ///
    /// Does nothing when no handler matches.
    pub async fn serve_tcp(&self, w: Arc<dyn ResponseWriter>, req: Request) {
        self.shared.serve_tcp(w, req).await
    }

    /// Listens on `addr` and serves until shutdown or an accept failure.
    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = runtime::bind(addr, self.backlog).await?;
        self.serve(listener).await
    }

    /// Same as [`Server::run`] over TLS, with PEM encoded certificate and key files.
    pub async fn run_tls(&self, addr: &str, cert_file: &str, key_file: &str) -> Result<()> {
        let acceptor = tls::acceptor(cert_file, key_file)?;
        let listener = runtime::bind(addr, self.backlog).await?;
        self.serve_tls(listener, acceptor).await
    }

    /// Serves connections accepted on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, None).await
    }

    /// Serves TLS connections accepted on an already bound listener.
    pub async fn serve_tls(&self, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        self.accept_loop(listener, Some(acceptor)).await
    }

    async fn accept_loop(&self, listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
        let lifecycle = Lifecycle::new();
        self.set_lifecycle(Some(lifecycle.clone()));

        let tracker = TaskTracker::new();
        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, tls = tls.is_some(), "server listening"),
            Err(e) => debug!(error = %e, "unknown local address"),
        }

        let result = loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = lifecycle.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        break Err(Error::Io(e));
                    }
                },
            };

            let peer = addr.to_string();
            let shared = Arc::clone(&self.shared);
            let read_timeout = self.read_timeout;
            let base = lifecycle.base.clone();
            let tls = tls.clone();

            tracker.spawn(async move {
                let stream = match tls {
                    None => IoStream::Plain(stream),
                    Some(acceptor) => {
                        let accepted = tokio::select! {
                            _ = base.cancelled() => return,
                            accepted = handshake(&acceptor, stream, read_timeout) => accepted,
                        };
                        match accepted {
                            Ok(stream) => IoStream::Tls(Box::new(stream)),
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "tls handshake failed");
                                return;
                            }
                        }
                    }
                };
                Connection::new(stream, peer, shared, read_timeout, base)
                    .run()
                    .await;
            });
        };

        // Stop listening, active connections go on.
        drop(listener);
        tracker.close();

        if result.is_ok() {
            debug!(active = tracker.len(), "waiting for connections");
            tracker.wait().await;
            lifecycle.closed.cancel();
            info!("server stopped");
        }
        lifecycle.base.cancel();
        self.set_lifecycle(None);
        result
    }

    /// Stops accepting connections, then waits for the active ones to finish.
    ///
    /// When `timeout` elapses first, every in-flight dispatch is cancelled
    /// and [`Error::DeadlineExceeded`] is returned. Does nothing when the
    /// server is not serving.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let Some(lifecycle) = self.current_lifecycle() else {
            return Ok(());
        };
        info!(timeout = ?timeout, "shutting down");
        lifecycle.shutdown.cancel();

        match tokio::time::timeout(timeout, lifecycle.closed.cancelled()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("shutdown deadline exceeded, cancelling active connections");
                lifecycle.base.cancel();
                Err(Error::DeadlineExceeded)
            }
        }
    }

    fn set_lifecycle(&self, lifecycle: Option<Lifecycle>) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = lifecycle;
    }

    fn current_lifecycle(&self) -> Option<Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

/// Runs the TLS handshake, bounded by the read timeout when one is set.
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    read_timeout: Option<Duration>,
) -> io::Result<TlsStream<TcpStream>> {
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))?,
        None => acceptor.accept(stream).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::handler_fn;
    use crate::response::ResponseRecorder;
    use crate::runtime::tls::tests::{client_config, testdata};
    use bytes::Bytes;
    use tokio::io::{
        AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    };

    fn write_handler(
        msg: &'static str,
    ) -> impl for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static {
        handler_fn(move |c| Box::pin(async move { c.string(msg).await }))
    }

    async fn dispatch(server: &Server, segment: Segment, body: Option<&'static [u8]>) -> String {
        let rec = ResponseRecorder::new();
        let req = Request::new(segment, body.map(Bytes::from_static));
        server.serve_tcp(rec.clone(), req).await;
        rec.body_string()
    }

    #[tokio::test]
    async fn test_any_registration() {
        let segments = [Segment::Syn, Segment::Ack, Segment::Fin];
        let cases: [(&str, &[Segment]); 5] = [
            ("", &segments),
            ("NOP", &segments),
            ("SYN", &[Segment::Syn]),
            ("ACK", &[Segment::Ack]),
            ("FIN", &[Segment::Fin]),
        ];

        for (name, matching) in cases {
            let mut server = Server::new();
            server.any(name, write_handler("hit"));
            for segment in segments {
                let expected = if matching.contains(&segment) { "hit\n" } else { "" };
                assert_eq!(
                    dispatch(&server, segment, None).await,
                    expected,
                    "registered on {name:?}, dispatched {segment}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_global_handlers_run_first() {
        let mut server = Server::new();
        server
            .ack(write_handler("ack 1"))
            .use_handler(write_handler("any 1"))
            .ack(write_handler("ack 2"))
            .use_handler(write_handler("any 2"))
            .fin(write_handler("fin"));

        assert_eq!(
            dispatch(&server, Segment::Ack, None).await,
            "any 1\nany 2\nack 1\nack 2\n"
        );
        assert_eq!(dispatch(&server, Segment::Syn, None).await, "any 1\nany 2\n");
    }

    #[tokio::test]
    async fn test_no_handler() {
        let server = Server::new();
        let rec = ResponseRecorder::new();
        server
            .serve_tcp(rec.clone(), Request::new(Segment::Ack, None))
            .await;
        assert_eq!(rec.size(), 0);
    }

    #[tokio::test]
    async fn test_context_reused_clean() {
        let mut server = Server::new();
        server.ack(|c| {
            Box::pin(async move {
                let seen = c.get_string("seen");
                c.set("seen", "yes".to_string());
                c.string(format!("seen: {seen:?}")).await;
            })
        });

        for _ in 0..3 {
            assert_eq!(dispatch(&server, Segment::Ack, None).await, "seen: \"\"\n");
        }
        assert_eq!(server.shared.pool.available(), 1);
    }

    #[tokio::test]
    async fn test_handle_prebuilt() {
        let handler: HandlerFunc = Arc::new(write_handler("prebuilt"));
        let mut server = Server::new();
        server
            .handle(Some(Segment::Fin), handler.clone())
            .handle(None, handler);
        assert_eq!(
            dispatch(&server, Segment::Fin, None).await,
            "prebuilt\nprebuilt\n"
        );
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn test_panic_without_recovery() {
        let mut server = Server::new();
        server.ack(|_| Box::pin(async move { panic!("boom") }));
        dispatch(&server, Segment::Ack, None).await;
    }

    #[tokio::test]
    async fn test_defaults_recover() {
        let mut server = Server::with_defaults();
        server
            .ack(|_| Box::pin(async move { panic!("boom") }))
            .ack(write_handler("unreachable"));

        assert_eq!(dispatch(&server, Segment::Ack, None).await, "");
        // the pool got its context back
        assert_eq!(server.shared.pool.available(), 1);
    }

    #[tokio::test]
    async fn test_registration_sealed_while_shared() {
        let mut server = Server::new();
        server.ack(write_handler("before"));

        let held = server.shared();
        server.ack(write_handler("after"));
        drop(held);

        assert_eq!(dispatch(&server, Segment::Ack, None).await, "before\n");
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = Config {
            read_timeout: Some(Duration::from_secs(3)),
            backlog: 16,
            pool_capacity: 8,
            ..Config::default()
        };
        let server = Server::from_config(&config);
        assert_eq!(server.read_timeout, Some(Duration::from_secs(3)));
        assert_eq!(server.backlog, 16);
    }

    fn echo_server() -> Server {
        let mut server = Server::new();
        server
            .syn(write_handler("welcome"))
            .ack(|c| {
                Box::pin(async move {
                    let n = c.request().map_or(0, Request::len);
                    c.string(format!("received: {n} bytes")).await;
                })
            });
        server
    }

    /// Starts serving on an ephemeral port.
    async fn start(server: Server) -> (Arc<Server>, String, tokio::task::JoinHandle<Result<()>>) {
        let listener = runtime::bind("127.0.0.1:0", runtime::DEFAULT_BACKLOG)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(server);
        let srv = server.clone();
        let handle = tokio::spawn(async move { srv.serve(listener).await });
        (server, addr, handle)
    }

    async fn read_line<S: AsyncRead + Unpin>(reader: &mut BufReader<S>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    async fn converse<S: AsyncRead + AsyncWrite + Unpin>(stream: S) {
        let mut stream = BufReader::new(stream);
        assert_eq!(read_line(&mut stream).await, "welcome\n");

        stream
            .get_mut()
            .write_all(b"hi, there's someone?\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "received: 21 bytes\n");
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let (server, addr, handle) = start(echo_server()).await;

        let client = TcpStream::connect(&addr).await.unwrap();
        converse(client).await;

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(TcpStream::connect(&addr).await.is_err());

        // not serving anymore
        assert!(server.shutdown(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_tls() {
        let acceptor = tls::acceptor(testdata("server.pem"), testdata("server.key")).unwrap();
        let listener = runtime::bind("127.0.0.1:0", runtime::DEFAULT_BACKLOG)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(echo_server());
        let srv = server.clone();
        let handle = tokio::spawn(async move { srv.serve_tls(listener, acceptor).await });

        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config()));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let client = connector.connect(name, tcp).await.unwrap();
        converse(client).await;

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_handshake_bounded_by_read_timeout() {
        let acceptor = tls::acceptor(testdata("server.pem"), testdata("server.key")).unwrap();
        let listener = runtime::bind("127.0.0.1:0", runtime::DEFAULT_BACKLOG)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = echo_server();
        server.read_timeout = Some(Duration::from_millis(100));
        let server = Arc::new(server);
        let srv = server.clone();
        let handle = tokio::spawn(async move { srv.serve_tls(listener, acceptor).await });

        // connects and never sends a client hello
        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf))
            .await
            .expect("handshake not timed out");
        assert!(matches!(read, Ok(0) | Err(_)));

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients() {
        let mut server = Server::new();
        server.ack(|c| {
            Box::pin(async move {
                let body = c.read_all().unwrap_or_default();
                let msg = String::from_utf8_lossy(&body).trim_end().to_string();
                let prev = c.get_string("last");
                c.set("last", msg);
                tokio::task::yield_now().await;
                let last = c.get_string("last");
                c.string(format!("{prev}|{last}")).await;
            })
        });
        let (server, addr, handle) = start(server).await;

        let clients = (0..8).map(|i| {
            let addr = addr.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(TcpStream::connect(&addr).await.unwrap());
                for j in 0..50 {
                    let msg = format!("client-{i} msg-{j}");
                    stream
                        .get_mut()
                        .write_all(format!("{msg}\n").as_bytes())
                        .await
                        .unwrap();
                    assert_eq!(read_line(&mut stream).await, format!("|{msg}\n"));
                }
            })
        });
        for client in clients.collect::<Vec<_>>() {
            client.await.unwrap();
        }

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_port_only_address() {
        let server = Arc::new(echo_server());
        let srv = server.clone();
        let handle = tokio::spawn(async move { srv.run(":0").await });

        // the accept loop publishes its lifecycle once bound
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.current_lifecycle().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("server not listening");
        server.shutdown(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_deadline_exceeded() {
        let mut server = echo_server();
        let cancelled: Arc<Mutex<Option<bool>>> = Arc::default();
        let seen = cancelled.clone();
        server.fin(move |c| {
            let seen = seen.clone();
            Box::pin(async move {
                *seen.lock().unwrap() = c.request().map(Request::is_cancelled);
            })
        });
        let (server, addr, handle) = start(server).await;

        let client = TcpStream::connect(&addr).await.unwrap();
        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client).await, "welcome\n");

        let err = server.shutdown(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(err.to_string(), "tcp: context deadline exceeded");

        // the forced connection went through FIN
        handle.await.unwrap().unwrap();
        assert_eq!(*cancelled.lock().unwrap(), Some(true));
        assert_eq!(read_line(&mut client).await, "");
    }

    #[tokio::test]
    async fn test_shutdown_never_run() {
        let server = Server::new();
        assert!(server.shutdown(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_invalid_address() {
        let server = Server::new();
        assert!(matches!(
            server.run("not an address").await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_run_tls_missing_certificate() {
        let server = Server::new();
        let cert = testdata("missing.pem");
        let key = testdata("server.key");
        let result = server
            .run_tls(
                "127.0.0.1:0",
                cert.to_str().unwrap(),
                key.to_str().unwrap(),
            )
            .await;
        assert!(matches!(result, Err(Error::Certificate(_))));
    }
}
