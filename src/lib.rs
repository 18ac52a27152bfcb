//! Cooperative green tasks over a poll(2) readiness reactor.
//!
//! Tasks perform nonblocking socket I/O as if it were blocking: an operation
//! suspends the calling task until the descriptor is ready (or a deadline
//! fires), then resumes it to carry on.

pub mod hub;
pub mod net;
pub mod queue;
pub mod trigger;

mod probe;
mod task;
mod timer;
mod util;

pub use hub::{current, Hub, Interest};
pub use queue::Queue;
pub use trigger::Trigger;

/// Ways a suspended operation can fail.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wait's deadline elapsed before the awaited condition.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection before the requested data arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// The underlying descriptor operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error carries the given OS error code.
    pub fn is_raw_os_error(&self, code: i32) -> bool {
        match self {
            Error::Io(error) => error.raw_os_error() == Some(code),
            _ => false,
        }
    }
}

/// Shorthand for results of suspended operations.
pub type Result<T> = std::result::Result<T, Error>;
