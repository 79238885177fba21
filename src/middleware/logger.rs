use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use tracing::field::{display, Empty};
use tracing::{error, info, info_span, warn};

use crate::context::{handler_fn, Context};

/// Fields attached to each log line, all enabled by default.
///
/// - `addr`: remote address
/// - `req_size`: request body size in bytes
/// - `resp_size`: bytes written in response, -1 when nothing was written
/// - `latency`: time spent in the rest of the chain, in milliseconds rounded up
/// - `server`: host name of the server
///
/// `extra` pairs are appended to every message as `key=value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFields {
    pub addr: bool,
    pub req_size: bool,
    pub resp_size: bool,
    pub latency: bool,
    pub server: bool,
    pub extra: &'static [(&'static str, &'static str)],
}

impl Default for LogFields {
    fn default() -> Self {
        LogFields {
            addr: true,
            req_size: true,
            resp_size: true,
            latency: true,
            server: true,
            extra: &[],
        }
    }
}

impl LogFields {
    /// No field, only the message.
    pub fn none() -> Self {
        LogFields {
            addr: false,
            req_size: false,
            resp_size: false,
            latency: false,
            server: false,
            extra: &[],
        }
    }

    /// Same fields, with static `key=value` pairs added to every message.
    pub fn with_extra(self, extra: &'static [(&'static str, &'static str)]) -> Self {
        LogFields { extra, ..self }
    }
}

/// Returns a middleware logging one event per dispatch.
///
/// The message reads `[TCP] <start> | <SEGMENT>`, followed by the errors of
/// the dispatch if any. The event is emitted at INFO level without error,
/// ERROR when a panic was recovered and WARN otherwise.
pub fn logger(
    fields: LogFields,
) -> impl for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static {
    let host: Arc<str> = if fields.server {
        hostname().into()
    } else {
        Arc::from("")
    };

    handler_fn(move |c| {
        let host = Arc::clone(&host);
        Box::pin(async move {
            let start = Utc::now();
            let timer = Instant::now();
            let (segment, req_size, addr) = match c.request() {
                Some(req) => (Some(req.segment), req.len(), req.remote_addr.clone()),
                None => (None, 0, String::new()),
            };

            c.next().await;

            let latency = timer.elapsed().as_nanos().div_ceil(1_000_000) as u64;
            let mut message = match segment {
                Some(segment) => format!(
                    "[TCP] {} | {}",
                    start.to_rfc3339_opts(SecondsFormat::Secs, true),
                    segment
                ),
                // no request bound
                None => String::new(),
            };
            for (key, value) in fields.extra {
                message.push_str(&format!(" {key}={value}"));
            }

            let span = info_span!(
                "tcp",
                addr = Empty,
                req_size = Empty,
                resp_size = Empty,
                latency = Empty,
                server = Empty,
            );
            if fields.addr {
                span.record("addr", display(&addr));
            }
            if fields.req_size {
                span.record("req_size", req_size);
            }
            if fields.resp_size {
                let size = c.response_writer().size().map_or(-1, |n| n as i64);
                span.record("resp_size", size);
            }
            if fields.latency {
                span.record("latency", latency);
            }
            if fields.server {
                span.record("server", display(&host));
            }

            span.in_scope(|| match c.err() {
                None => info!("{message}"),
                Some(errs) if errs.is_recovered() => error!("{message} {errs}"),
                Some(errs) => warn!("{message} {errs}"),
            });
        })
    })
}

/// Host name of the machine, empty when unknown.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: the buffer is valid for writes of its whole length.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..end]).into_owned();
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default()
}
