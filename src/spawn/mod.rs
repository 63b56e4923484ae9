//! Starting helper programs with a scrubbed descriptor table.

use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::fditer::{default_enumerator, FdEnumerator};
use crate::process::{Process, ProcessId};
use crate::stream::Stream;
use crate::util::cvt;
use crate::{sys, Error, Result, SpawnError};

mod child;
mod exec;

use child::{ChildSetup, ChildStdio, EXEC_FAILED_FOOTER};
use exec::ExecVec;

bitflags! {
    /// How each standard channel of the child is wired.
    ///
    /// At most one of `*_PIPE`, `*_NULL` and `*_KEEP` may be set per channel. A channel with no
    /// flag is closed in the child.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SpawnFlags: u32 {
        /// The parent gets a stream connected to the child's stdin.
        const STDIN_PIPE = 1 << 0;
        /// The parent gets a stream connected to the child's stdout.
        const STDOUT_PIPE = 1 << 1;
        /// The parent gets a stream connected to the child's stderr.
        const STDERR_PIPE = 1 << 2;
        /// The child's stdin reads from `/dev/null`.
        const STDIN_NULL = 1 << 3;
        /// The child's stdout is discarded.
        const STDOUT_NULL = 1 << 4;
        /// The child's stderr is discarded.
        const STDERR_NULL = 1 << 5;
        /// The child shares the parent's stdin.
        const STDIN_KEEP = 1 << 6;
        /// The child shares the parent's stdout.
        const STDOUT_KEEP = 1 << 7;
        /// The child shares the parent's stderr.
        const STDERR_KEEP = 1 << 8;
    }
}

bitflags! {
    /// A set of standard channels.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Channels: u8 {
        const STDIN = 1 << 0;
        const STDOUT = 1 << 1;
        const STDERR = 1 << 2;
    }
}

/// One of the three standard channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Stdin, Channel::Stdout, Channel::Stderr];

    /// The descriptor number this channel occupies in the child.
    pub fn fileno(self) -> RawFd {
        match self {
            Channel::Stdin => libc::STDIN_FILENO,
            Channel::Stdout => libc::STDOUT_FILENO,
            Channel::Stderr => libc::STDERR_FILENO,
        }
    }

    pub fn as_set(self) -> Channels {
        match self {
            Channel::Stdin => Channels::STDIN,
            Channel::Stdout => Channels::STDOUT,
            Channel::Stderr => Channels::STDERR,
        }
    }

    fn flags(self) -> (SpawnFlags, SpawnFlags, SpawnFlags) {
        match self {
            Channel::Stdin => (
                SpawnFlags::STDIN_PIPE,
                SpawnFlags::STDIN_NULL,
                SpawnFlags::STDIN_KEEP,
            ),
            Channel::Stdout => (
                SpawnFlags::STDOUT_PIPE,
                SpawnFlags::STDOUT_NULL,
                SpawnFlags::STDOUT_KEEP,
            ),
            Channel::Stderr => (
                SpawnFlags::STDERR_PIPE,
                SpawnFlags::STDERR_NULL,
                SpawnFlags::STDERR_KEEP,
            ),
        }
    }

    /// Whether the parent writes to (rather than reads from) this channel.
    pub fn is_input(self) -> bool {
        self == Channel::Stdin
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Stdin => "stdin",
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        })
    }
}

/// What the child sees on one standard channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redirect {
    /// Connected to a [`Stream`] in the parent.
    Pipe,
    /// Connected to `/dev/null`.
    Discard,
    /// Shared with the parent.
    Inherit,
    /// Not open at all.
    Close,
}

impl SpawnFlags {
    /// Work out the redirection for `channel`, rejecting conflicting flags.
    pub fn redirect(self, channel: Channel) -> Result<Redirect> {
        let (pipe, null, keep) = channel.flags();

        match (self.contains(pipe), self.contains(null), self.contains(keep)) {
            (false, false, false) => Ok(Redirect::Close),
            (true, false, false) => Ok(Redirect::Pipe),
            (false, true, false) => Ok(Redirect::Discard),
            (false, false, true) => Ok(Redirect::Inherit),
            _ => Err(Error::InvalidArgument(
                "more than one redirection requested for a channel",
            )),
        }
    }

    /// The channels that get a stream in the parent.
    pub fn piped(self) -> Channels {
        Channel::ALL
            .iter()
            .filter(|c| self.contains(c.flags().0))
            .fold(Channels::empty(), |set, c| set | c.as_set())
    }
}

/// Builder for spawning a helper program.
///
/// ```no_run
/// use exechelp::{Spawner, SpawnFlags};
///
/// let mut proc = Spawner::new("/usr/bin/gpg-connect-agent")
///     .arg("--no-autostart")
///     .flags(SpawnFlags::STDIN_PIPE | SpawnFlags::STDOUT_PIPE | SpawnFlags::STDERR_KEEP)
///     .spawn()?;
/// # let _ = proc.release();
/// # Ok::<(), exechelp::Error>(())
/// ```
#[derive(Debug)]
pub struct Spawner<'e> {
    program: PathBuf,
    args: Vec<OsString>,
    flags: SpawnFlags,
    env: Option<Vec<(OsString, OsString)>>,
    cwd: Option<PathBuf>,
    keep_fds: Vec<RawFd>,
    enumerator: &'e dyn FdEnumerator,
}

impl Spawner<'static> {
    /// Start building a spawn of `program`. The path is used as is; there is no `PATH` search.
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: vec![],
            flags: SpawnFlags::empty(),
            env: None,
            cwd: None,
            keep_fds: vec![],
            // Selected here, in the parent; the child only uses the result
            enumerator: default_enumerator(),
        }
    }
}

impl<'e> Spawner<'e> {
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn flags(mut self, flags: SpawnFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the child's environment with exactly these variables. Without this the child
    /// inherits the parent's environment.
    pub fn env_clear_and_set<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string()))
                .collect(),
        );
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Let the child inherit these descriptors (at the same numbers) in addition to the standard
    /// channels. Descriptors below 3 are ignored; use the flags for those.
    pub fn keep_fds(mut self, fds: &[RawFd]) -> Self {
        self.keep_fds.extend_from_slice(fds);
        self
    }

    /// List descriptors in the child with `enumerator` instead of the process default.
    pub fn enumerator<'a>(self, enumerator: &'a dyn FdEnumerator) -> Spawner<'a> {
        Spawner {
            program: self.program,
            args: self.args,
            flags: self.flags,
            env: self.env,
            cwd: self.cwd,
            keep_fds: self.keep_fds,
            enumerator,
        }
    }

    /// Start the child.
    ///
    /// On error nothing is left behind: every pipe opened for the child is closed again and a
    /// child that was already forked has been reaped.
    pub fn spawn(&self) -> Result<Process> {
        let program = exec::to_cstring(self.program.as_os_str())?;

        let mut argv = ExecVec::empty();
        argv.push(program.clone());
        for arg in &self.args {
            argv.push_os(arg)?;
        }

        let envp = match &self.env {
            Some(vars) => {
                let mut envp = ExecVec::empty();
                for (k, v) in vars {
                    envp.push_env(k, v)?;
                }
                Some(envp)
            }
            None => None,
        };

        let cwd = match &self.cwd {
            Some(dir) => Some(exec::to_cstring(dir.as_os_str())?),
            None => None,
        };

        let redirects = [
            self.flags.redirect(Channel::Stdin)?,
            self.flags.redirect(Channel::Stdout)?,
            self.flags.redirect(Channel::Stderr)?,
        ];

        check_executable(&self.program, &program)?;

        let mut inherit_fds: Vec<RawFd> = self
            .keep_fds
            .iter()
            .copied()
            .filter(|&fd| fd > libc::STDERR_FILENO)
            .collect();
        inherit_fds.sort_unstable();
        inherit_fds.dedup();

        // Child ends live here until the child has them; dropping them closes them
        let mut child_ends: [Option<OwnedFd>; 3] = [None, None, None];
        let mut parent_ends: [Option<OwnedFd>; 3] = [None, None, None];
        let mut stdio = [ChildStdio::Close; 3];

        for (i, (&channel, redirect)) in Channel::ALL.iter().zip(redirects.iter()).enumerate() {
            match redirect {
                Redirect::Pipe => {
                    let (read, write) = anon_pipe()?;
                    let (ours, theirs) = if channel.is_input() {
                        (write, read)
                    } else {
                        (read, write)
                    };
                    let theirs = above_stdio(theirs)?;
                    stdio[i] = ChildStdio::Wire(theirs.as_raw_fd());
                    child_ends[i] = Some(theirs);
                    parent_ends[i] = Some(ours);
                }
                Redirect::Discard => {
                    let null = above_stdio(open_dev_null()?)?;
                    stdio[i] = ChildStdio::Wire(null.as_raw_fd());
                    child_ends[i] = Some(null);
                }
                Redirect::Inherit => stdio[i] = ChildStdio::Inherit,
                Redirect::Close => stdio[i] = ChildStdio::Close,
            }
        }

        // With stdio closed in the parent the error pipe could land on 0-2, where the child's
        // channel wiring would close or overwrite it
        let (err_read, err_write) = anon_pipe()?;
        let err_read = above_stdio(err_read)?;
        let err_write = above_stdio(err_write)?;

        let mut scrub_keep = inherit_fds.clone();
        scrub_keep.push(err_write.as_raw_fd());
        scrub_keep.sort_unstable();

        let setup = ChildSetup {
            program: &program,
            argv: &argv,
            envp: envp.as_ref(),
            cwd: cwd.as_deref(),
            stdio,
            inherit_fds: &inherit_fds,
            scrub_keep: &scrub_keep,
            enumerator: self.enumerator,
            err_fd: err_write.as_raw_fd(),
        };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOMEM) => SpawnError::ResourceExhausted {
                    what: "process",
                    source: err,
                },
                _ => SpawnError::ProcessCreation { source: err },
            }
            .into());
        }

        if pid == 0 {
            unsafe { child::run(&setup) }
        }

        drop(err_write);
        drop(child_ends);

        if let Err(e) = read_exec_result(err_read) {
            reap_failed(pid);
            let e = match e {
                ExecFailure::Errno(errno) => SpawnError::from_exec_errno(&self.program, errno),
                ExecFailure::Pipe(source) => SpawnError::ProcessCreation { source },
            };
            log::debug!("spawning {:?} failed: {}", self.program, e);
            return Err(e.into());
        }

        let [stdin, stdout, stderr] = parent_ends;
        let streams = [
            stdin.map(|fd| Stream::new(Channel::Stdin, fd)),
            stdout.map(|fd| Stream::new(Channel::Stdout, fd)),
            stderr.map(|fd| Stream::new(Channel::Stderr, fd)),
        ];

        let id = ProcessId::from_pid(pid);
        log::debug!(
            "spawned {:?} with {} args as {} (stdin: {:?}, stdout: {:?}, stderr: {:?}, {} extra fds)",
            self.program,
            argv.len() - 1,
            id,
            redirects[0],
            redirects[1],
            redirects[2],
            inherit_fds.len(),
        );

        Ok(Process::new(id, self.program.clone(), streams))
    }
}

/// Spawn `program` with `args` (not including `argv[0]`, which is set to `program`).
///
/// `env`, if given, replaces the child's environment entirely; `cwd`, if given, is the child's
/// working directory. See [`Spawner`] for the descriptor guarantees.
pub fn spawn<P: AsRef<Path>, S: AsRef<OsStr>>(
    program: P,
    args: &[S],
    flags: SpawnFlags,
    env: Option<&[(OsString, OsString)]>,
    cwd: Option<&Path>,
) -> Result<Process> {
    let mut spawner = Spawner::new(program).args(args).flags(flags);

    if let Some(env) = env {
        spawner = spawner.env_clear_and_set(env.iter().map(|(k, v)| (k, v)));
    }
    if let Some(cwd) = cwd {
        spawner = spawner.current_dir(cwd);
    }

    spawner.spawn()
}

fn check_executable(path: &Path, program: &CString) -> Result<()> {
    if unsafe { libc::access(program.as_ptr(), libc::X_OK) } != 0 {
        return Err(SpawnError::ProgramNotFound {
            program: path.to_path_buf(),
            source: io::Error::last_os_error(),
        }
        .into());
    }

    Ok(())
}

fn resource_error(what: &'static str, source: io::Error) -> Error {
    SpawnError::ResourceExhausted { what, source }.into()
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
fn anon_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })
            .map_err(|e| resource_error("pipe", e))?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    {
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) }).map_err(|e| resource_error("pipe", e))?;
    }

    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    {
        // Not atomic; a concurrent fork elsewhere may see these without the flag
        crate::util::set_cloexec(read.as_raw_fd(), true).map_err(|e| resource_error("pipe", e))?;
        crate::util::set_cloexec(write.as_raw_fd(), true).map_err(|e| resource_error("pipe", e))?;
    }

    Ok((read, write))
}

fn open_dev_null() -> Result<OwnedFd> {
    let fd = unsafe {
        libc::open(
            sys::DEV_NULL.as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    let fd = cvt(fd).map_err(|e| resource_error("/dev/null descriptor", e))?;

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Make sure a descriptor meant for the child isn't itself one of the standard positions (which
/// happens when the parent runs with some of them closed), so wiring one channel can't clobber
/// another.
fn above_stdio(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }

    let new_fd = cvt(unsafe {
        libc::fcntl(
            fd.as_raw_fd(),
            libc::F_DUPFD_CLOEXEC,
            libc::STDERR_FILENO + 1,
        )
    })
    .map_err(|e| resource_error("descriptor", e))?;

    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

enum ExecFailure {
    Errno(i32),
    Pipe(io::Error),
}

/// Wait for the child to either exec (the error pipe closes with nothing written) or report why
/// it couldn't.
fn read_exec_result(err_read: OwnedFd) -> std::result::Result<(), ExecFailure> {
    let mut pipe = File::from(err_read);
    let mut bytes = [0u8; 8];
    let mut filled = 0;

    loop {
        match pipe.read(&mut bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(()),
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == bytes.len() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ExecFailure::Pipe(e)),
        }
    }

    let (errno, footer) = bytes.split_at(4);
    if filled != bytes.len() || footer != EXEC_FAILED_FOOTER {
        return Err(ExecFailure::Pipe(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed exec status from child",
        )));
    }

    let errno = u32::from_be_bytes([errno[0], errno[1], errno[2], errno[3]]);
    Err(ExecFailure::Errno(errno as i32))
}

/// Collect a child that failed before exec so it doesn't linger as a zombie.
fn reap_failed(pid: libc::pid_t) {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}
