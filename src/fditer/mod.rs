//! Listing the descriptors a process has open.

use std::fmt;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

use crate::{util, Result};

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
mod dirfd;

/// Used when the platform doesn't report a descriptor limit we can trust.
const FALLBACK_BOUND: RawFd = 65536;
/// Limits below this are not trusted: they may have been lowered after higher descriptors were
/// already opened.
const LOWER_TRUSTED_LIMIT: libc::c_long = 1024;

const INITIAL_CAPACITY: usize = 32;

/// How complete a scan was.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scan {
    /// The platform's descriptor directory was used from start to finish.
    Complete,
    /// The fast path was unavailable or failed part way; the remaining range was probed one
    /// descriptor at a time up to [`max_descriptor_bound()`]. The result is still correct.
    Degraded,
}

/// A strategy for visiting the open descriptors of the calling process.
///
/// Implementations must visit descriptors in ascending order and must not allocate, lock or log:
/// the spawner calls [`scan()`](Self::scan) in the child between `fork()` and `exec()`.
/// Descriptors opened or closed by other threads during a scan may or may not be visited.
pub trait FdEnumerator: fmt::Debug + Send + Sync {
    /// Call `visit` once for every open descriptor `>= minfd`.
    ///
    /// `visit` may close the descriptor it is handed.
    fn scan(&self, minfd: RawFd, visit: &mut dyn FnMut(RawFd)) -> Scan;
}

/// Reads the per-process descriptor directory (`/proc/self/fd` on Linux, `/dev/fd` on macOS and
/// on FreeBSD with fdescfs), falling back to probing if it can't be used.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirEnumerator;

/// Checks every descriptor number from `minfd` up to [`max_descriptor_bound()`] with `fcntl()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeEnumerator;

impl FdEnumerator for ProbeEnumerator {
    fn scan(&self, minfd: RawFd, visit: &mut dyn FnMut(RawFd)) -> Scan {
        probe_from(minfd.max(0), visit);
        Scan::Complete
    }
}

fn probe_from(minfd: RawFd, visit: &mut dyn FnMut(RawFd)) {
    let maxfd = max_descriptor_bound();

    let mut fd = minfd;
    while fd <= maxfd {
        if util::is_fd_valid(fd) {
            visit(fd);
        }
        fd += 1;
    }
}

/// An ascending stream of open descriptors that may fail part way through.
trait EntrySource {
    fn next_fd(&mut self) -> io::Result<Option<RawFd>>;
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
impl EntrySource for dirfd::DirFdIter {
    fn next_fd(&mut self) -> io::Result<Option<RawFd>> {
        self.next()
    }
}

/// Visit everything `source` yields. If it fails, it is dropped (closing any descriptor it
/// holds) and the rest of the range is probed, starting just past the last descriptor visited.
fn scan_entries<S: EntrySource>(
    mut source: S,
    minfd: RawFd,
    visit: &mut dyn FnMut(RawFd),
) -> Scan {
    let mut next_fd = minfd;

    loop {
        match source.next_fd() {
            Ok(Some(fd)) => {
                debug_assert!(fd >= next_fd);
                next_fd = fd.saturating_add(1);
                visit(fd);
            }
            Ok(None) => return Scan::Complete,
            Err(_) => {
                drop(source);
                probe_from(next_fd, visit);
                return Scan::Degraded;
            }
        }
    }
}

impl FdEnumerator for DirEnumerator {
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    fn scan(&self, minfd: RawFd, visit: &mut dyn FnMut(RawFd)) -> Scan {
        let minfd = minfd.max(0);

        match dirfd::DirFdIter::open(minfd) {
            Some(it) => scan_entries(it, minfd, visit),
            None => {
                probe_from(minfd, visit);
                Scan::Degraded
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
    fn scan(&self, minfd: RawFd, visit: &mut dyn FnMut(RawFd)) -> Scan {
        probe_from(minfd.max(0), visit);
        Scan::Degraded
    }
}

static DIR_ENUMERATOR: DirEnumerator = DirEnumerator;
static PROBE_ENUMERATOR: ProbeEnumerator = ProbeEnumerator;

/// The enumerator this process uses unless told otherwise.
///
/// The choice is made once, on first use: the descriptor directory if it can be opened here,
/// probing otherwise. The first call takes a lock and may log, so it must not happen in a forked
/// child; later calls only read the stored choice.
pub fn default_enumerator() -> &'static dyn FdEnumerator {
    static SELECTED: OnceLock<&'static dyn FdEnumerator> = OnceLock::new();

    *SELECTED.get_or_init(|| {
        // Scanning from the top of the range visits nothing; it only tells us if the fast path
        // works
        if DIR_ENUMERATOR.scan(RawFd::MAX, &mut |_| ()) == Scan::Complete {
            &DIR_ENUMERATOR
        } else {
            log::debug!("descriptor directory unavailable, probing descriptors instead");
            &PROBE_ENUMERATOR
        }
    })
}

/// Return the largest descriptor number a scan needs to consider.
///
/// This is `sysconf(_SC_OPEN_MAX) - 1`. A limit below 1024 is not trusted (it may have been
/// lowered after higher descriptors were opened), and neither is a missing one; both give a
/// conservative finite default instead.
pub fn max_descriptor_bound() -> RawFd {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };

    if limit < LOWER_TRUSTED_LIMIT {
        FALLBACK_BOUND
    } else if limit > RawFd::MAX as libc::c_long {
        // Leave room for the probe loop to step past the bound
        RawFd::MAX - 1
    } else {
        (limit - 1) as RawFd
    }
}

/// The open descriptors of the calling process at the time of a scan, in ascending order.
///
/// The list is owned by the caller and never shares storage with another scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorList {
    fds: Vec<RawFd>,
}

impl DescriptorList {
    pub fn as_slice(&self) -> &[RawFd] {
        &self.fds
    }

    pub fn into_vec(self) -> Vec<RawFd> {
        self.fds
    }

    /// Number of descriptors at or above `minfd`.
    pub fn count_from(&self, minfd: RawFd) -> usize {
        self.fds.iter().filter(|&&fd| fd >= minfd).count()
    }
}

impl Deref for DescriptorList {
    type Target = [RawFd];

    fn deref(&self) -> &[RawFd] {
        &self.fds
    }
}

impl IntoIterator for DescriptorList {
    type Item = RawFd;
    type IntoIter = std::vec::IntoIter<RawFd>;

    fn into_iter(self) -> Self::IntoIter {
        self.fds.into_iter()
    }
}

impl<'a> IntoIterator for &'a DescriptorList {
    type Item = &'a RawFd;
    type IntoIter = std::slice::Iter<'a, RawFd>;

    fn into_iter(self) -> Self::IntoIter {
        self.fds.iter()
    }
}

impl fmt::Display for DescriptorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} open (", self.fds.len())?;
        for (i, fd) in self.fds.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", fd)?;
        }
        f.write_str(")")
    }
}

/// Collect every open descriptor `>= minfd` reported by `enumerator`.
///
/// The buffer starts small and doubles whenever it fills up; if growing it fails the whole call
/// fails with [`Error::AllocationFailure`](crate::Error::AllocationFailure) instead of returning
/// a truncated list.
pub fn enumerate_with(enumerator: &dyn FdEnumerator, minfd: RawFd) -> Result<DescriptorList> {
    let mut fds: Vec<RawFd> = Vec::new();
    fds.try_reserve_exact(INITIAL_CAPACITY)?;

    let mut failure = None;
    let outcome = enumerator.scan(minfd, &mut |fd| {
        if failure.is_some() {
            return;
        }

        if fds.len() == fds.capacity() {
            let additional = fds.capacity().max(INITIAL_CAPACITY);
            if let Err(e) = fds.try_reserve_exact(additional) {
                failure = Some(e);
                return;
            }
        }

        fds.push(fd);
    });

    if let Some(e) = failure {
        return Err(e.into());
    }

    if outcome == Scan::Degraded {
        log::debug!("descriptor scan fell back to probing");
    }
    log::trace!("enumerated {} open descriptors from {}", fds.len(), minfd);

    Ok(DescriptorList { fds })
}
