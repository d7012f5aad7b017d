//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber.
///
/// Ids are handed out from a process-wide monotonic counter starting at 1;
/// the value 0 is never assigned and reads as "no fiber" in log output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next fiber id.
#[inline]
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

impl FiberId {
    /// Sentinel for "not running on a fiber".
    pub const NONE: FiberId = FiberId(0);

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = next_fiber_id();
        let b = next_fiber_id();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(FiberId::NONE.is_none());
        assert!(!next_fiber_id().is_none());
        assert_eq!(FiberId::default(), FiberId::NONE);
    }
}
