//! Fiber stack allocation
//!
//! Each fiber owns an mmap'd stack with a PROT_NONE guard page at the low
//! end. Running off the bottom of the stack hits the guard and faults
//! instead of silently corrupting neighbouring memory.

use strand_core::error::{RtError, RtResult};

/// An owned, guard-paged stack region.
///
/// Layout, low to high: one guard page, then `size` usable bytes. The
/// usable region starts read-write; the guard page is never accessible.
pub struct Stack {
    base: *mut u8,
    total: usize,
    size: usize,
}

// The raw base pointer is only dereferenced by the fiber that runs on the
// stack; the Stack object itself just carries ownership of the mapping.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on any supported platform
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Stack {
    /// Map a stack with `size` usable bytes (rounded up to whole pages).
    pub fn new(size: usize) -> RtResult<Stack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::StackAlloc(last_errno()));
        }

        // Guard page at the low end (stacks grow downward)
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, total) };
            return Err(RtError::StackAlloc(errno));
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            size: usable,
        })
    }

    /// Top of the usable region (highest address; stacks grow down).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_to_pages() {
        let s = Stack::new(1000).unwrap();
        assert_eq!(s.size() % page_size(), 0);
        assert!(s.size() >= 1000);
    }

    #[test]
    fn test_stack_is_writable_at_top() {
        let s = Stack::new(64 * 1024).unwrap();
        unsafe {
            let p = s.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }

    #[test]
    fn test_top_is_above_base() {
        let s = Stack::new(16 * 1024).unwrap();
        assert!(s.top() as usize > s.base as usize);
        assert_eq!(s.top() as usize - s.base as usize, s.total);
    }
}
