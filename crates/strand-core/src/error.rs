//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors surfaced by the runtime.
///
/// Resource-acquisition failures carry the raw OS errno. Invariant
/// violations (resuming a TERM fiber, yielding off-fiber) are programmer
/// errors and panic instead of returning one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// epoll instance could not be created
    PollerCreate(i32),

    /// self-pipe could not be created
    PipeCreate(i32),

    /// fd could not be switched to non-blocking mode
    Nonblock(i32),

    /// epoll_ctl failed for a registration change
    PollerCtl(i32),

    /// the event mask is not a single waitable direction
    InvalidEvent,

    /// the (fd, direction) pair already has a waiter
    EventExists,

    /// no registration exists for the (fd, direction) pair
    EventNotFound,

    /// fiber stack could not be mapped
    StackAlloc(i32),

    /// invalid runtime options
    InvalidOptions(&'static str),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::PollerCreate(e) => write!(f, "poller create failed (errno {})", e),
            RtError::PipeCreate(e) => write!(f, "self-pipe create failed (errno {})", e),
            RtError::Nonblock(e) => write!(f, "set nonblocking failed (errno {})", e),
            RtError::PollerCtl(e) => write!(f, "poller ctl failed (errno {})", e),
            RtError::InvalidEvent => write!(f, "event mask is not a single direction"),
            RtError::EventExists => write!(f, "event already registered for this direction"),
            RtError::EventNotFound => write!(f, "no event registered for this direction"),
            RtError::StackAlloc(e) => write!(f, "fiber stack mapping failed (errno {})", e),
            RtError::InvalidOptions(msg) => write!(f, "invalid options: {}", msg),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", RtError::PollerCreate(24)),
            "poller create failed (errno 24)"
        );
        assert_eq!(
            format!("{}", RtError::EventExists),
            "event already registered for this direction"
        );
    }
}
