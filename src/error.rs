use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;

use crate::Channel;

/// Errors reported by the enumerator, the spawner, the stream adapter and the reaper.
///
/// Nothing in this crate swallows an error or retries on the caller's behalf.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Growing the buffer that holds an enumerated descriptor list failed.
    #[error("failed to grow descriptor list: {0}")]
    AllocationFailure(#[from] TryReserveError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// A stream transfer stopped before the requested byte count was reached.
    #[error("{channel} transfer failed after {transferred} bytes: {source}")]
    StreamIo {
        channel: Channel,
        transferred: usize,
        #[source]
        source: io::Error,
    },

    /// The stream was already closed.
    #[error("{channel} stream already closed")]
    StreamClosed { channel: Channel },

    /// `release()` was called on a handle that was already released.
    #[error("process handle already released")]
    ReleaseMisuse,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `waitpid()` or `kill()` failed on a live handle.
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] io::Error),
}

/// Reasons a call to [`spawn()`](crate::spawn()) did not produce a process handle.
///
/// When one of these is returned, every pipe and descriptor the spawner created has already been
/// closed again and any child that was forked has been reaped.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("program {program:?} is missing or not executable: {source}")]
    ProgramNotFound {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to allocate {what}: {source}")]
    ResourceExhausted {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to create child process: {source}")]
    ProcessCreation {
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Classify an errno reported by `execve()` in the child.
    pub(crate) fn from_exec_errno(program: &std::path::Path, errno: i32) -> Self {
        let source = io::Error::from_raw_os_error(errno);

        match errno {
            libc::ENOENT | libc::EACCES | libc::ENOEXEC | libc::ENOTDIR | libc::ELOOP => {
                SpawnError::ProgramNotFound {
                    program: program.to_path_buf(),
                    source,
                }
            }
            libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::E2BIG => {
                SpawnError::ResourceExhausted {
                    what: "child process image",
                    source,
                }
            }
            _ => SpawnError::ProcessCreation { source },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
