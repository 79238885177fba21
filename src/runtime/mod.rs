//! Socket plumbing under the server.
//!
//! - `connection`: per-connection lifecycle (SYN, ACK per line, FIN)
//! - `stream`: plain or TLS stream behind one type
//! - `tls`: certificate loading

pub(crate) mod connection;
pub(crate) mod stream;
pub mod tls;

pub(crate) use connection::Connection;
pub(crate) use stream::IoStream;

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Resolves `addr` and binds a listener on the first address found.
///
/// A port-only address such as `":9090"` listens on every interface.
pub(crate) async fn bind(addr: &str, backlog: u32) -> io::Result<TcpListener> {
    let addr = with_host(addr);
    let addr = tokio::net::lookup_host(addr.as_ref()).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {addr:?}"),
        )
    })?;
    let listener = create_listener(addr, backlog)?;
    TcpListener::from_std(listener)
}

fn with_host(addr: &str) -> Cow<'_, str> {
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Create a TCP listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
