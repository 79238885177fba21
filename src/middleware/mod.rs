//! Built-in middlewares.

mod logger;
mod recovery;

pub use logger::{hostname, logger, LogFields};
pub use recovery::recovery;
