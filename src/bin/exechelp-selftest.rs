//! Self-test and test helper for `exechelp`.
//!
//! ```text
//! exechelp-selftest [--verbose] [--server | --close-fds | --list-fds]
//! ```
//!
//! - `--server`: write a native-endian `u32` length (12288) and then that many bytes of a fixed
//!   pattern to stdout, and exit.
//! - `--close-fds`: check enumeration and closing against this process's own descriptor table.
//! - `--list-fds`: print the descriptors this process was started with, separated by spaces.
//! - no mode: run the `--close-fds` checks, then start a copy of this program with `--server`
//!   and check what it sends.

use std::io::Write;
use std::os::unix::io::RawFd;

use anyhow::{bail, ensure, Context};
use exechelp::{Channels, SpawnFlags};

const PAYLOAD_LEN: usize = 12 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN)
        .map(|i| {
            if i % 64 == 63 {
                b'\n'
            } else {
                b'@' + (i % 64) as u8
            }
        })
        .collect()
}

fn run_server() -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    out.write_all(&(PAYLOAD_LEN as u32).to_ne_bytes())
        .context("writing length")?;
    out.write_all(&payload()).context("writing payload")?;
    out.flush().context("flushing stdout")?;

    Ok(())
}

fn list_fds() -> anyhow::Result<()> {
    let fds = exechelp::enumerate_open_descriptors().context("enumerating descriptors")?;
    let line: Vec<String> = fds.iter().map(|fd| fd.to_string()).collect();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", line.join(" ")).context("writing descriptor list")?;

    Ok(())
}

fn open_fds() -> anyhow::Result<exechelp::DescriptorList> {
    let fds = exechelp::enumerate_open_descriptors().context("enumerating descriptors")?;
    log::debug!("open file descriptors: {}", fds);
    Ok(fds)
}

fn dup_stdout() -> anyhow::Result<RawFd> {
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("dup(1)");
    }
    Ok(fd)
}

fn test_close_all_fds() -> anyhow::Result<()> {
    log::debug!("max. file descriptors: {}", exechelp::max_descriptor_bound());

    let initial_count = open_fds()?.len();

    // A few dups to get more descriptors, then close one of them
    dup_stdout()?;
    dup_stdout()?;
    let fd = dup_stdout()?;
    dup_stdout()?;
    unsafe {
        libc::close(fd);
    }

    let count = open_fds()?.len();
    ensure!(
        count == initial_count + 3,
        "dup or close failed: {} descriptors open, expected {}",
        count,
        initial_count + 3
    );

    // Close the non-standard ones
    unsafe {
        exechelp::close_all_from(3, &[]);
    }

    let fds = open_fds()?;
    ensure!(
        fds.count_from(3) == 0,
        "not all files were closed: {}",
        fds
    );
    ensure!(fds.len() <= initial_count, "not all files were closed: {}", fds);
    let initial_count = fds.len();

    // Nothing left to do the second time round
    unsafe {
        exechelp::close_all_from(3, &[]);
    }
    ensure!(
        open_fds()? == fds,
        "closing twice changed the descriptor table"
    );

    if exechelp::max_descriptor_bound() > 32 {
        let except = [20, 23, 24];

        // Enough descriptors to make the enumeration grow its buffer
        for _ in initial_count..31 {
            dup_stdout()?;
        }
        open_fds()?;
        for _ in 0..5 {
            dup_stdout()?;
            open_fds()?;
        }

        let before = open_fds()?;
        for fd in &except {
            ensure!(before.contains(fd), "descriptor {} was never opened", fd);
        }

        unsafe {
            exechelp::close_all_from(3, &except);
        }

        let after = open_fds()?;
        let kept: Vec<RawFd> = after.iter().copied().filter(|&fd| fd >= 3).collect();
        ensure!(
            after.len() == initial_count + except.len() && kept == except,
            "close_all_from with a keep-list failed: {}",
            after
        );

        unsafe {
            exechelp::close_all_from(3, &[]);
        }
    }

    Ok(())
}

fn test_pipe_stream(program: &str) -> anyhow::Result<()> {
    let mut proc = exechelp::spawn(
        program,
        &["--server"],
        SpawnFlags::STDOUT_PIPE | SpawnFlags::STDERR_KEEP,
        None,
        None,
    )
    .context("spawning server")?;

    let mut out = proc
        .streams(Channels::STDOUT)
        .stdout
        .context("no stdout stream")?;

    let mut len = [0u8; 4];
    out.read_exact_len(&mut len).context("reading length")?;
    let len = u32::from_ne_bytes(len) as usize;
    ensure!(len == PAYLOAD_LEN, "unexpected length {}", len);

    let mut buf = vec![0u8; len];
    out.read_exact_len(&mut buf).context("reading payload")?;
    ensure!(buf == payload(), "payload does not match");

    out.close().context("closing stdout stream")?;

    let status = proc.release().context("releasing server")?;
    if !status.success() {
        bail!("server failed: {}", status);
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let myname = args.next().unwrap_or_else(|| "exechelp-selftest".to_string());
    let mut args: Vec<String> = args.collect();

    let verbose = args.first().map(String::as_str) == Some("--verbose");
    if verbose {
        args.remove(0);
    }

    env_logger::Builder::new()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .parse_default_env()
        .init();

    match args.first().map(String::as_str) {
        Some("--server") => run_server(),
        Some("--list-fds") => list_fds(),
        Some("--close-fds") => test_close_all_fds(),
        Some(other) => bail!("unknown argument {:?}", other),
        None => {
            test_close_all_fds()?;

            let me = std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(myname);
            test_pipe_stream(&me)
        }
    }
}
