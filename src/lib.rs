//! linewire: a line-oriented TCP server framework.
//!
//! Every accepted connection is turned into a sequence of requests, one per
//! segment:
//! - `SYN` when the connection opens
//! - `ACK` for each newline-terminated message
//! - `FIN` when the connection closes
//!
//! Each request runs through a chain of handlers: the global ones registered
//! with [`Server::use_handler`] followed by the ones registered for its
//! segment. Handlers share a pooled [`Context`] to read the request, answer
//! on the connection, store values and report errors.
//!
//! ```no_run
//! use std::time::Duration;
//! use linewire::Server;
//!
//! #[tokio::main]
//! async fn main() -> linewire::Result<()> {
//!     let mut server = Server::with_defaults();
//!     server
//!         .syn(|c| Box::pin(async move { c.string("welcome").await }))
//!         .ack(|c| {
//!             Box::pin(async move {
//!                 let n = c.request().map_or(0, |r| r.len());
//!                 c.string(format!("received: {n} bytes")).await;
//!             })
//!         });
//!     server.run("127.0.0.1:9090").await
//! }
//! ```

pub mod config;
mod context;
mod error;
mod middleware;
pub mod protocol;
mod request;
mod response;
mod runtime;
mod server;

pub use context::{Context, HandlerFunc};
pub use error::{BoxError, Error, Errors, Result};
pub use middleware::{hostname, logger, recovery, LogFields};
pub use protocol::Segment;
pub use request::{Request, Value};
pub use response::{ResponseRecorder, ResponseWriter, Writer};
pub use runtime::tls;
pub use runtime::DEFAULT_BACKLOG;
pub use server::{Server, DEFAULT_POOL_CAPACITY};
