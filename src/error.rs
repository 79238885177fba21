//! Error types.
//!
//! `Error` covers transport failures, request-shape problems and errors
//! reported by handlers. `Errors` is the per-dispatch aggregate collected by
//! [`Context::error`](crate::Context::error).

use std::fmt;
use std::io;

/// Boxed error as stored in the per-dispatch aggregate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the server and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket level failure (bind, accept, read, write).
    #[error("tcp: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration failure.
    #[error("tcp: tls: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or private key could not be loaded.
    #[error("tcp: certificate: {0}")]
    Certificate(String),

    /// No request is bound to the context.
    #[error("tcp: invalid request")]
    InvalidRequest,

    /// Graceful shutdown did not complete before its deadline.
    #[error("tcp: context deadline exceeded")]
    DeadlineExceeded,

    /// Error reported by a handler, optionally wrapping its cause.
    #[error("tcp: {msg}{}", .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    Message {
        msg: String,
        #[source]
        cause: Option<BoxError>,
    },

    /// A handler panicked and the panic was caught by the recovery middleware.
    #[error("tcp: panic recovered: {0}")]
    Panic(String),
}

impl Error {
    /// Creates a handler error with an optional cause.
    pub fn new(msg: impl Into<String>, cause: Option<BoxError>) -> Self {
        Error::Message {
            msg: msg.into(),
            cause,
        }
    }

    /// Returns true if the error comes from a recovered panic.
    pub fn is_recovered(&self) -> bool {
        matches!(self, Error::Panic(_))
    }
}

/// Errors collected during one dispatch, in the order they were reported.
#[derive(Debug, Default)]
pub struct Errors(Vec<BoxError>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: BoxError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        self.0.iter().map(|e| e.as_ref())
    }

    /// True iff at least one collected error comes from a recovered panic.
    pub fn is_recovered(&self) -> bool {
        self.0
            .iter()
            .any(|e| e.downcast_ref::<Error>().is_some_and(Error::is_recovered))
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}
