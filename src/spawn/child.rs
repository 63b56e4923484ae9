//! Code that runs in the child between `fork()` and `exec()`.
//!
//! Only async-signal-safe calls are allowed here: no allocation, no locks, no logging. Everything
//! the child needs is prepared by the parent in a [`ChildSetup`].

use std::convert::Infallible;
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use super::exec::ExecVec;
use crate::close::Closer;
use crate::fditer::FdEnumerator;
use crate::util::{self, cvt};

/// Marks a genuine exec failure report on the error pipe.
pub const EXEC_FAILED_FOOTER: [u8; 4] = *b"XERR";

/// What happens to one standard descriptor in the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStdio {
    /// Move this descriptor (always `>= 3`) onto the standard position.
    Wire(RawFd),
    /// Leave the descriptor the child inherited alone.
    Inherit,
    Close,
}

pub struct ChildSetup<'a> {
    pub program: &'a CStr,
    pub argv: &'a ExecVec,
    pub envp: Option<&'a ExecVec>,
    pub cwd: Option<&'a CStr>,
    /// Indexed by standard descriptor number.
    pub stdio: [ChildStdio; 3],
    /// Extra descriptors the program should inherit.
    pub inherit_fds: &'a [RawFd],
    /// Sorted; `inherit_fds` plus the write end of the error pipe.
    pub scrub_keep: &'a [RawFd],
    pub enumerator: &'a dyn FdEnumerator,
    pub err_fd: RawFd,
}

/// Wire up the child and replace its image. Never returns.
///
/// If anything fails, the errno is sent to the parent over `err_fd` (which is close-on-exec, so
/// a successful exec closes it with nothing written) and the child exits with status 127.
///
/// # Safety
///
/// Must only be called in the child right after `fork()`.
pub unsafe fn run(setup: &ChildSetup<'_>) -> ! {
    let err = match do_exec(setup) {
        Ok(never) => match never {},
        Err(e) => e,
    };

    report_failure(setup.err_fd, err.raw_os_error().unwrap_or(libc::EINVAL));
    libc::_exit(127)
}

/// Send `errno` and the footer to the parent as one 8-byte record.
pub fn report_failure(err_fd: RawFd, errno: i32) {
    let errno = (errno as u32).to_be_bytes();
    let bytes = [
        errno[0],
        errno[1],
        errno[2],
        errno[3],
        EXEC_FAILED_FOOTER[0],
        EXEC_FAILED_FOOTER[1],
        EXEC_FAILED_FOOTER[2],
        EXEC_FAILED_FOOTER[3],
    ];

    // Writes this small to a pipe are atomic, but may be interrupted before anything is written
    loop {
        let ret = unsafe {
            libc::write(
                err_fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if ret >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}

unsafe fn do_exec(setup: &ChildSetup<'_>) -> io::Result<Infallible> {
    reset_signals()?;

    for (target, stdio) in setup.stdio.iter().enumerate() {
        let target = target as RawFd;
        match *stdio {
            ChildStdio::Wire(fd) => {
                debug_assert!(fd > libc::STDERR_FILENO);
                // dup2() clears FD_CLOEXEC on the new descriptor
                loop {
                    match cvt(libc::dup2(fd, target)) {
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        res => {
                            res?;
                            break;
                        }
                    }
                }
            }
            ChildStdio::Close => {
                libc::close(target);
            }
            ChildStdio::Inherit => (),
        }
    }

    for &fd in setup.inherit_fds {
        util::set_cloexec(fd, false)?;
    }

    // The standard descriptors are in place; everything else goes. The table is enumerated again
    // here because other threads in the parent may have opened descriptors since the fork
    // decision was made.
    Closer::new(setup.enumerator)
        .keep_fds(setup.scrub_keep)
        .close_from(libc::STDERR_FILENO + 1);

    if let Some(cwd) = setup.cwd {
        cvt(libc::chdir(cwd.as_ptr()))?;
    }

    match setup.envp {
        Some(envp) => {
            libc::execve(setup.program.as_ptr(), setup.argv.as_ptr(), envp.as_ptr());
        }
        None => {
            libc::execv(setup.program.as_ptr(), setup.argv.as_ptr());
        }
    }

    Err(io::Error::last_os_error())
}

/// The parent may block signals or ignore SIGPIPE (the Rust runtime does); the program we start
/// expects neither.
unsafe fn reset_signals() -> io::Result<()> {
    let mut set: libc::sigset_t = std::mem::zeroed();
    cvt(libc::sigemptyset(&mut set))?;
    let ret = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }

    if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
