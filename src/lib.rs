//! # What is this crate for?
//!
//! A program that holds secrets (open key files, a random-number-generator device, pipes to a
//! PIN entry dialog) has to be careful when it starts helper programs: by default every
//! descriptor without the close-on-exec flag is inherited by the child. Rust's standard library
//! sets that flag on everything it opens, but C libraries linked into the same process often
//! don't, and some platforms can't set it atomically.
//!
//! This crate starts children with a descriptor table that contains the standard channels the
//! caller asked for, plus an explicit keep-list, and nothing else. The table is scrubbed in the
//! child after the channels are wired up and before the program image is replaced, and it is
//! enumerated afresh at that point, so descriptors opened concurrently by other threads don't
//! slip through.
//!
//! # Example usage
//!
//! ```no_run
//! use std::io::Read;
//! use exechelp::{Channels, SpawnFlags};
//!
//! let mut proc = exechelp::spawn(
//!     "/usr/bin/gpgsm",
//!     &["--dump-cert"],
//!     SpawnFlags::STDOUT_PIPE | SpawnFlags::STDERR_KEEP,
//!     None,
//!     None,
//! )?;
//!
//! let mut stdout = proc.streams(Channels::STDOUT).stdout.unwrap();
//! let mut listing = String::new();
//! stdout.read_to_string(&mut listing).unwrap();
//!
//! let status = proc.release()?;
//! assert!(status.success());
//! # Ok::<(), exechelp::Error>(())
//! ```
//!
//! # Pieces
//!
//! - [`enumerate_open_descriptors()`] and the [`FdEnumerator`] strategies list the open
//!   descriptors of the calling process.
//! - [`close_all_from()`] and [`Closer`] close everything from a threshold upward except a
//!   keep-list.
//! - [`spawn()`] and [`Spawner`] start the child; [`Process`] is the handle it returns.
//! - [`Stream`] wraps the parent's end of each pipe.
//! - [`Process::release()`] waits for the child and reaps it.
//!
//! Nothing here times out: reads, writes and `release()` block until they finish. Callers that
//! need deadlines have to build them on top.
//!
//! # Async-signal-safety
//!
//! The enumerators and the closer neither allocate nor log, so they may run between `fork()` and
//! `exec()` (the spawner relies on this). They assume `getdents()`/`getdirentries()` and
//! `sysconf(_SC_OPEN_MAX)` are async-signal-safe, which holds on Linux, macOS and FreeBSD.
//!
//! [`default_enumerator()`] picks its strategy behind a lock the first time it is called, so that
//! first call must happen before forking. [`Spawner::new()`] makes it. Code that forks by other
//! means should call `default_enumerator()` in the parent and use the returned enumerator with a
//! [`Closer`] in the child; [`close_all_from()`] may log and is meant for the parent.

#![cfg(unix)]

mod close;
mod error;
mod fditer;
mod process;
mod spawn;
mod stream;
mod sys;
mod util;

use std::os::unix::io::RawFd;

pub use close::Closer;
pub use error::{Error, Result, SpawnError};
pub use fditer::{
    default_enumerator, enumerate_with, max_descriptor_bound, DescriptorList, DirEnumerator,
    FdEnumerator, ProbeEnumerator, Scan,
};
pub use process::{release, streams_of, Lifecycle, Process, ProcessId};
pub use spawn::{spawn, Channel, Channels, Redirect, SpawnFlags, Spawner};
pub use stream::{Stream, Streams};

/// List every descriptor the calling process has open, in ascending order.
///
/// Uses [`default_enumerator()`]. The only failure is running out of memory for the list; the
/// result is never silently truncated.
pub fn enumerate_open_descriptors() -> Result<DescriptorList> {
    enumerate_with(default_enumerator(), 0)
}

/// Close every open descriptor `>= first`, except those in `except`.
///
/// This is `Closer::new(default_enumerator()).keep_fds(except).close_from(first)`, plus a debug
/// log line if the enumerator had to fall back to probing.
///
/// # Safety
///
/// See [`Closer::close_from()`]. In short: descriptors that other code still owns are closed out
/// from under it, so only use this at startup or in a process that is about to `exec()`.
///
/// This is not for use between `fork()` and `exec()`: it may log, and it may be the first caller
/// of [`default_enumerator()`]. Use a [`Closer`] there instead (see the crate docs).
pub unsafe fn close_all_from(first: RawFd, except: &[RawFd]) {
    let outcome = Closer::new(default_enumerator())
        .keep_fds(except)
        .close_from(first);

    if outcome == Scan::Degraded {
        log::debug!("closing descriptors from {} fell back to probing", first);
    }
}
