//! Line framing protocol.
//!
//! A connection produces three kinds of segments:
//! - `SYN` once, when the connection is accepted (synthetic, never on the wire)
//! - `ACK` for every newline-terminated message read from the peer
//! - `FIN` once, after the last read failed or the peer closed (synthetic)
//!
//! ## Wire Format
//!
//! ```text
//! hello\n        -> ACK with body "hello\n"
//! \n             -> ACK with body "\n"
//! partial<EOF>   -> dropped, FIN follows
//! ```
//!
//! No escaping, no length prefix and no maximum line length.

use std::fmt;
use std::str::FromStr;

/// Message terminator.
pub const EOL: u8 = b'\n';

/// Registration key matching every segment.
pub const ANY: &str = "";

/// Connection lifecycle event a request is dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Segment {
    /// Connection opened.
    #[default]
    Syn,
    /// Message received.
    Ack,
    /// Connection closed.
    Fin,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Syn => "SYN",
            Segment::Ack => "ACK",
            Segment::Fin => "FIN",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a name that is not a segment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown segment {0:?}")]
pub struct UnknownSegment(pub String);

impl FromStr for Segment {
    type Err = UnknownSegment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYN" => Ok(Segment::Syn),
            "ACK" => Ok(Segment::Ack),
            "FIN" => Ok(Segment::Fin),
            other => Err(UnknownSegment(other.to_string())),
        }
    }
}

/// Turns a line read up to and including the terminator into a message body.
///
/// The body keeps its terminator. Returns `None` when the line is not
/// terminated, which happens when the peer closed the connection in the
/// middle of a message.
pub fn frame(line: Vec<u8>) -> Option<Vec<u8>> {
    (line.last() == Some(&EOL)).then_some(line)
}

/// Appends the terminator to an outbound message unless it already ends with one.
pub fn terminate(msg: &str) -> std::borrow::Cow<'_, str> {
    if msg.as_bytes().last() == Some(&EOL) {
        std::borrow::Cow::Borrowed(msg)
    } else {
        std::borrow::Cow::Owned(format!("{msg}\n"))
    }
}
