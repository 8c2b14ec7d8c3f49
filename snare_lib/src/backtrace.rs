//! Frame-pointer backtraces.
//!
//! Every frame record on x86_64 and aarch64 starts with two words: the
//! caller's frame pointer followed by the return address. The chain lives in
//! memory we do not own and may be garbage, so each link is checked before
//! it is followed and the walk is capped at a fixed depth. Hitting a bad
//! link just ends the trace.
//!
//! Only the calling thread's own stack can be walked safely. Another
//! thread's stack changes underneath the walker unless that thread is
//! suspended first.

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use std::arch::asm;
use std::{mem, ops::Range};

use log::info;

use crate::classify::AddressClassifier;

pub const MAX_TRACE_DEPTH: usize = 0x20;

const WORD: usize = mem::size_of::<usize>();

/// One frame record, as laid out on the stack.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub next: *const StackFrame,
    pub return_address: usize,
}

/// Return addresses, innermost call first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    addresses: Vec<usize>,
}

impl Backtrace {
    /// Walks the calling thread's stack. The first address is the return
    /// address into the caller of `capture`.
    #[inline(never)]
    pub fn capture() -> Self {
        // Safety: the frame pointer register refers to the current thread's
        // own stack, and the walker never leaves it.
        unsafe { StackWalker::for_current_thread().walk(current_frame_pointer()) }
    }

    pub fn addresses(&self) -> &[usize] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.addresses.iter().copied()
    }
}

#[derive(Debug, Clone)]
pub struct StackWalker {
    max_depth: usize,
    bounds: Option<Range<usize>>,
}

impl Default for StackWalker {
    fn default() -> Self {
        Self::new()
    }
}

impl StackWalker {
    pub fn new() -> Self {
        Self {
            max_depth: MAX_TRACE_DEPTH,
            bounds: None,
        }
    }

    /// A walker confined to the calling thread's stack. Frame records
    /// outside of it are treated as the end of the chain, which keeps
    /// garbage left in the frame pointer by code built without frame
    /// pointers from being dereferenced.
    pub fn for_current_thread() -> Self {
        let walker = Self::new();
        match current_thread_stack() {
            Some(stack) => walker.within(stack),
            None => walker,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Only follow frame records that lie entirely inside `stack`.
    pub fn within(mut self, stack: Range<usize>) -> Self {
        self.bounds = Some(stack);
        self
    }

    fn is_valid(&self, frame: *const StackFrame) -> bool {
        let addr = frame as usize;
        if addr == 0 || addr % WORD != 0 {
            return false;
        }
        match &self.bounds {
            Some(stack) => {
                stack.start <= addr
                    && addr
                        .checked_add(mem::size_of::<StackFrame>())
                        .map_or(false, |end| end <= stack.end)
            }
            None => true,
        }
    }

    /// Follows the chain starting at `frame` for at most `max_depth` frames.
    ///
    /// A short trace is a complete result: a null or misaligned link is how
    /// both the end of the chain and a corrupted one look from here.
    ///
    /// # Safety
    ///
    /// Every frame that passes the alignment (and optional bounds) check is
    /// read. The chain must therefore live in readable memory, normally the
    /// calling thread's own stack.
    pub unsafe fn walk(&self, frame: *const StackFrame) -> Backtrace {
        let mut addresses = Vec::with_capacity(self.max_depth.min(MAX_TRACE_DEPTH));
        let mut current = frame;
        while addresses.len() < self.max_depth {
            if !self.is_valid(current) {
                break;
            }
            let record = current.read();
            addresses.push(record.return_address);
            current = record.next;
        }
        Backtrace { addresses }
    }

    /// The first return address of the chain, i.e. the immediate caller.
    ///
    /// # Safety
    ///
    /// Same as [`walk`](Self::walk).
    pub unsafe fn first_return(&self, frame: *const StackFrame) -> Option<usize> {
        self.clone()
            .with_max_depth(1)
            .walk(frame)
            .addresses
            .first()
            .copied()
    }
}

/// Return address of whoever called the function that calls this.
#[inline(never)]
pub fn caller_return_address() -> Option<usize> {
    let walker = StackWalker::for_current_thread();
    let own = current_frame_pointer();
    if !walker.is_valid(own) {
        return None;
    }
    // Safety: see `Backtrace::capture`. Our own record is skipped so the
    // answer is about our caller's caller.
    unsafe { walker.first_return((*own).next) }
}

/// Reads the frame pointer register of the calling function.
///
/// Only meaningful when frame pointers are kept, which this workspace
/// forces through `-C force-frame-pointers=yes`.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn current_frame_pointer() -> *const StackFrame {
    let fp: usize;
    unsafe { asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags)) };
    fp as *const StackFrame
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn current_frame_pointer() -> *const StackFrame {
    let fp: usize;
    unsafe { asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags)) };
    fp as *const StackFrame
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn current_frame_pointer() -> *const StackFrame {
    std::ptr::null()
}

/// The stack of the calling thread, as reported by pthreads.
#[cfg(target_os = "linux")]
pub fn current_thread_stack() -> Option<Range<usize>> {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0 && !addr.is_null()).then(|| addr as usize..addr as usize + size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_stack() -> Option<Range<usize>> {
    None
}

/// Writes one line per non-null return address to the log.
pub fn log_backtrace(classifier: &AddressClassifier, backtrace: &Backtrace) {
    for address in backtrace.iter().filter(|address| *address != 0) {
        info!("{}", classifier.render(address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds frame records in a buffer we own, so the chain can point
    /// anywhere without touching real stack memory.
    struct FakeStack {
        frames: Vec<StackFrame>,
    }

    impl FakeStack {
        fn new(return_addresses: &[usize]) -> Self {
            let frames = return_addresses
                .iter()
                .map(|&return_address| StackFrame {
                    next: std::ptr::null(),
                    return_address,
                })
                .collect();
            Self { frames }
        }

        fn frame(&self, index: usize) -> *const StackFrame {
            &self.frames[index]
        }

        fn link(&mut self, from: usize, to: *const StackFrame) {
            self.frames[from].next = to;
        }
    }

    #[test]
    fn walks_until_the_null_link() {
        let mut stack = FakeStack::new(&[0x10, 0x20, 0x30]);
        let second = stack.frame(1);
        let third = stack.frame(2);
        stack.link(0, second);
        stack.link(1, third);

        let trace = unsafe { StackWalker::new().walk(stack.frame(0)) };
        assert_eq!(trace.addresses(), &[0x10, 0x20, 0x30]);
    }

    #[test]
    fn cyclic_chains_stop_at_max_depth() {
        let mut stack = FakeStack::new(&[0xa, 0xb]);
        let a = stack.frame(0);
        let b = stack.frame(1);
        stack.link(0, b);
        stack.link(1, a);

        let trace = unsafe { StackWalker::new().with_max_depth(5).walk(a) };
        assert_eq!(trace.addresses(), &[0xa, 0xb, 0xa, 0xb, 0xa]);
    }

    #[test]
    fn misaligned_link_ends_the_walk() {
        let mut stack = FakeStack::new(&[0x10, 0x20]);
        let misaligned = (stack.frame(1) as usize + 1) as *const StackFrame;
        stack.link(0, misaligned);

        let trace = unsafe { StackWalker::new().walk(stack.frame(0)) };
        assert_eq!(trace.addresses(), &[0x10]);
    }

    #[test]
    fn null_start_gives_an_empty_trace() {
        let trace = unsafe { StackWalker::new().walk(std::ptr::null()) };
        assert!(trace.is_empty());
    }

    #[test]
    fn bounds_reject_frames_outside_the_stack() {
        let mut stack = FakeStack::new(&[0x10, 0x20]);
        let second = stack.frame(1);
        stack.link(0, second);
        let first = stack.frame(0) as usize;
        let bounds = first..first + mem::size_of::<StackFrame>();

        let trace = unsafe { StackWalker::new().within(bounds).walk(stack.frame(0)) };
        assert_eq!(trace.addresses(), &[0x10]);
    }

    #[test]
    fn first_return_matches_a_depth_one_walk() {
        let mut stack = FakeStack::new(&[0x10, 0x20]);
        let second = stack.frame(1);
        stack.link(0, second);

        let walker = StackWalker::new();
        let first = unsafe { walker.first_return(stack.frame(0)) };
        let walked = unsafe { walker.with_max_depth(1).walk(stack.frame(0)) };
        assert_eq!(first, Some(0x10));
        assert_eq!(walked.addresses(), &[0x10]);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn captures_the_live_stack() {
        let trace = Backtrace::capture();
        assert!(!trace.is_empty());
        assert!(trace.len() <= MAX_TRACE_DEPTH);
    }
}
