//! Handles to spawned children and reaping them.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use crate::stream::{Stream, Streams};
use crate::{Channel, Channels, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RawId {
    Pid(libc::pid_t),
}

/// Identifies a spawned child. The platform value is only reachable through [`as_raw()`].
///
/// [`as_raw()`]: Self::as_raw
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(RawId);

impl ProcessId {
    pub(crate) fn from_pid(pid: libc::pid_t) -> Self {
        ProcessId(RawId::Pid(pid))
    }

    /// The process id, for code that has to talk to the OS directly.
    pub fn as_raw(&self) -> libc::pid_t {
        match self.0 {
            RawId::Pid(pid) => pid,
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            RawId::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Where a [`Process`] is in its life. States only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// The child has not been seen to exit.
    Running,
    /// The child has exited and its status has been collected.
    Exited,
    /// [`Process::release()`] has completed; the handle is spent.
    Released,
}

#[derive(Debug)]
enum State {
    Running,
    Exited(ExitStatus),
    Released,
}

/// A running (or finished) child started by [`spawn()`](crate::spawn()).
///
/// The handle belongs to whoever called `spawn()`. Call [`release()`](Self::release) exactly once
/// to wait for the child and free its process-table entry.
#[derive(Debug)]
pub struct Process {
    id: ProcessId,
    program: PathBuf,
    piped: Channels,
    streams: [Option<Stream>; 3],
    state: State,
}

impl Process {
    pub(crate) fn new(id: ProcessId, program: PathBuf, streams: [Option<Stream>; 3]) -> Self {
        let mut piped = Channels::empty();
        for (channel, stream) in Channel::ALL.iter().zip(streams.iter()) {
            piped.set(channel.as_set(), stream.is_some());
        }

        Self {
            id,
            program,
            piped,
            streams,
            state: State::Running,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The channels that were spawned as pipes, whether or not their streams were taken.
    pub fn piped(&self) -> Channels {
        self.piped
    }

    pub fn state(&self) -> Lifecycle {
        match self.state {
            State::Running => Lifecycle::Running,
            State::Exited(_) => Lifecycle::Exited,
            State::Released => Lifecycle::Released,
        }
    }

    /// The exit status, once the child has been waited for.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.state {
            State::Exited(status) => Some(status),
            _ => None,
        }
    }

    /// Take the streams for the selected piped channels.
    ///
    /// Each stream can only be taken once; later calls leave it out. Streams that are never taken
    /// are closed by [`release()`](Self::release).
    pub fn streams(&mut self, selection: Channels) -> Streams {
        let [stdin, stdout, stderr] = &mut self.streams;
        let take = |channel: Channels, slot: &mut Option<Stream>| {
            if selection.contains(channel) {
                slot.take()
            } else {
                None
            }
        };

        Streams {
            stdin: take(Channels::STDIN, stdin),
            stdout: take(Channels::STDOUT, stdout),
            stderr: take(Channels::STDERR, stderr),
        }
    }

    /// Wait for the child to exit.
    ///
    /// With `hang` false this only checks, returning `Ok(None)` if the child is still running.
    /// Once the child has exited its status is kept and returned by later calls.
    pub fn wait(&mut self, hang: bool) -> Result<Option<ExitStatus>> {
        match self.state {
            State::Released => return Err(Error::ReleaseMisuse),
            State::Exited(status) => return Ok(Some(status)),
            State::Running => (),
        }

        let flags = if hang { 0 } else { libc::WNOHANG };
        let mut status = 0;

        loop {
            let ret = unsafe { libc::waitpid(self.id.as_raw(), &mut status, flags) };

            if ret == 0 {
                return Ok(None);
            } else if ret > 0 {
                let status = ExitStatus::from_raw(status);
                self.state = State::Exited(status);
                return Ok(Some(status));
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Wait(err));
            }
        }
    }

    /// Ask a running child to terminate (SIGTERM). Does nothing if it has already been reaped.
    pub fn terminate(&mut self) -> Result<()> {
        match self.state {
            State::Released => Err(Error::ReleaseMisuse),
            State::Exited(_) => Ok(()),
            State::Running => {
                if unsafe { libc::kill(self.id.as_raw(), libc::SIGTERM) } != 0 {
                    let err = io::Error::last_os_error();
                    // Already gone but not yet reaped
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        return Err(Error::Wait(err));
                    }
                }
                log::debug!("sent SIGTERM to {} ({:?})", self.id, self.program);
                Ok(())
            }
        }
    }

    /// Wait for the child to exit, collect its status and spend the handle.
    ///
    /// Streams still held by the handle are closed first, so a child blocked reading its stdin
    /// sees end-of-file. Streams already handed out are not touched: any output the child wrote
    /// before exiting can still be read from them afterwards.
    ///
    /// Calling this a second time returns [`Error::ReleaseMisuse`].
    pub fn release(&mut self) -> Result<ExitStatus> {
        if let State::Released = self.state {
            return Err(Error::ReleaseMisuse);
        }

        for stream in self.streams.iter_mut() {
            drop(stream.take());
        }

        // A blocking waitpid() only returns once the child is gone
        let status = loop {
            if let Some(status) = self.wait(true)? {
                break status;
            }
        };

        self.state = State::Released;
        log::debug!("released {} ({:?}): {}", self.id, self.program, status);

        Ok(status)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let State::Running = self.state {
            match self.wait(false) {
                Ok(Some(_)) => (),
                _ => log::warn!(
                    "{} ({:?}) dropped without release; the child is left running",
                    self.id,
                    self.program
                ),
            }
        }
    }
}

/// Take the streams for `selection` out of `process`. See [`Process::streams()`].
pub fn streams_of(process: &mut Process, selection: Channels) -> Streams {
    process.streams(selection)
}

/// Wait for `process` to exit and spend the handle. See [`Process::release()`].
pub fn release(process: &mut Process) -> Result<ExitStatus> {
    process.release()
}
