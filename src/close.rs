use std::os::unix::io::RawFd;

use crate::fditer::{FdEnumerator, Scan};
use crate::util;

/// Closes every open descriptor from some threshold upward, sparing a keep-list.
#[derive(Clone, Copy, Debug)]
pub struct Closer<'a> {
    enumerator: &'a dyn FdEnumerator,
    keep_fds: &'a [RawFd],
    keep: util::KeepInfo,
}

impl<'a> Closer<'a> {
    /// Create a closer that lists descriptors with `enumerator` and keeps nothing.
    pub fn new(enumerator: &'a dyn FdEnumerator) -> Self {
        Self {
            enumerator,
            keep_fds: &[],
            keep: util::inspect_keep_fds(&[]),
        }
    }

    /// Leave the descriptors in `keep_fds` open. The list may be in any order, but lookups are
    /// much cheaper when it is sorted. It is only ever read.
    pub fn keep_fds(mut self, keep_fds: &'a [RawFd]) -> Self {
        self.keep_fds = keep_fds;
        self.keep = util::inspect_keep_fds(keep_fds);
        self
    }

    /// Close every open descriptor `>= first` that isn't in the keep-list.
    ///
    /// The live descriptor table is enumerated during the call, so it doesn't matter how many
    /// descriptors are open or how many were opened since any earlier scan. Descriptors that are
    /// already closed are skipped. Nothing below `first` is ever touched.
    ///
    /// This neither allocates nor logs, so it can run between `fork()` and `exec()`.
    ///
    /// # Safety
    ///
    /// Descriptors owned by other code (a `File`, a socket held by another thread) are closed out
    /// from under it. Only call this where no such owner can observe the result: in a freshly
    /// forked child, or at startup before anything else has opened descriptors.
    pub unsafe fn close_from(&self, first: RawFd) -> Scan {
        let first = first.max(0);
        let max_keep_fd = self.keep.max;
        let sorted = self.keep.sorted;
        let mut keep_fds = self.keep_fds;

        self.enumerator.scan(first, &mut |fd| {
            if fd < first {
                return;
            }

            // Past the largest kept descriptor there is nothing left to look up
            if fd > max_keep_fd || !util::check_should_keep(&mut keep_fds, fd, sorted) {
                libc::close(fd);
            }
        })
    }
}
