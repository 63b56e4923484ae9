use std::io::{Read, Write};
use std::os::unix::prelude::*;

use exechelp::{Channels, Lifecycle, SpawnFlags, Spawner};

const SELFTEST: &str = env!("CARGO_BIN_EXE_exechelp-selftest");

fn expected_payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 64 == 63 { b'\n' } else { b'@' + (i % 64) as u8 })
        .collect()
}

fn child_fds(proc: &mut exechelp::Process) -> Vec<RawFd> {
    let mut out = String::new();
    proc.streams(Channels::STDOUT)
        .stdout
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();

    out.split_whitespace().map(|s| s.parse().unwrap()).collect()
}

#[test]
fn test_server_payload() {
    let mut proc = exechelp::spawn(
        SELFTEST,
        &["--server"],
        SpawnFlags::STDOUT_PIPE | SpawnFlags::STDERR_KEEP,
        None,
        None,
    )
    .unwrap();

    assert_eq!(proc.piped(), Channels::STDOUT);
    let mut out = proc.streams(Channels::all()).stdout.unwrap();

    let mut len = [0u8; 4];
    assert_eq!(out.read_exact_len(&mut len).unwrap(), 4);
    let len = u32::from_ne_bytes(len) as usize;
    assert_eq!(len, 12288);

    let mut buf = vec![0u8; len];
    assert_eq!(out.read_exact_len(&mut buf).unwrap(), len);
    assert_eq!(buf, expected_payload(len));

    // Nothing follows the payload
    let mut rest = Vec::new();
    assert_eq!(out.read_until_eof(&mut rest).unwrap(), 0);
    out.close().unwrap();

    let status = proc.release().unwrap();
    assert!(status.success());
    assert_eq!(proc.state(), Lifecycle::Released);
    assert!(matches!(proc.release(), Err(exechelp::Error::ReleaseMisuse)));
}

#[test]
fn test_selftest_default_mode() {
    let mut proc = Spawner::new(SELFTEST)
        .flags(SpawnFlags::STDIN_NULL | SpawnFlags::STDOUT_NULL | SpawnFlags::STDERR_PIPE)
        .spawn()
        .unwrap();

    let mut errors = String::new();
    proc.streams(Channels::STDERR)
        .stderr
        .unwrap()
        .read_to_string(&mut errors)
        .unwrap();

    let status = proc.release().unwrap();
    assert!(status.success(), "{}: {}", status, errors);
}

#[test]
fn test_selftest_close_fds() {
    let mut proc = Spawner::new(SELFTEST)
        .arg("--close-fds")
        .flags(SpawnFlags::STDIN_NULL | SpawnFlags::STDOUT_NULL | SpawnFlags::STDERR_PIPE)
        .spawn()
        .unwrap();

    let mut errors = String::new();
    proc.streams(Channels::STDERR)
        .stderr
        .unwrap()
        .read_to_string(&mut errors)
        .unwrap();

    let status = proc.release().unwrap();
    assert!(status.success(), "{}: {}", status, errors);
}

#[test]
fn test_no_leaked_descriptors() {
    // Inheritable on purpose: only the scrub keeps this out of the child
    let leaky = tempfile::tempfile().unwrap();
    let flags = unsafe { libc::fcntl(leaky.as_raw_fd(), libc::F_GETFD) };
    assert!(flags >= 0);
    assert_eq!(
        unsafe { libc::fcntl(leaky.as_raw_fd(), libc::F_SETFD, flags & !libc::FD_CLOEXEC) },
        0
    );

    let mut proc = exechelp::spawn(
        SELFTEST,
        &["--list-fds"],
        SpawnFlags::STDOUT_PIPE,
        None,
        None,
    )
    .unwrap();
    // The child's runtime may put /dev/null on the closed standard descriptors; anything above
    // those is a leak
    let fds = child_fds(&mut proc);
    assert!(proc.release().unwrap().success());
    assert!(fds.contains(&1));
    assert!(fds.iter().all(|&fd| fd <= 2), "{:?}", fds);

    let mut proc = exechelp::spawn(
        SELFTEST,
        &["--list-fds"],
        SpawnFlags::STDIN_NULL | SpawnFlags::STDOUT_PIPE | SpawnFlags::STDERR_KEEP,
        None,
        None,
    )
    .unwrap();
    assert_eq!(child_fds(&mut proc), [0, 1, 2]);
    assert!(proc.release().unwrap().success());
}

#[test]
fn test_keep_fds_are_inherited() {
    let kept = tempfile::tempfile().unwrap();
    let other = tempfile::tempfile().unwrap();

    let mut proc = Spawner::new(SELFTEST)
        .arg("--list-fds")
        .flags(SpawnFlags::STDOUT_PIPE)
        .keep_fds(&[kept.as_raw_fd()])
        .spawn()
        .unwrap();

    let fds = child_fds(&mut proc);
    assert!(proc.release().unwrap().success());

    let extra: Vec<RawFd> = fds.iter().copied().filter(|&fd| fd > 2).collect();
    assert_eq!(extra, [kept.as_raw_fd()]);
    assert!(!fds.contains(&other.as_raw_fd()));

    // The parent's copy keeps its close-on-exec flag
    let flags = unsafe { libc::fcntl(kept.as_raw_fd(), libc::F_GETFD) };
    assert!(flags & libc::FD_CLOEXEC != 0);
}

#[test]
fn test_stdin_round_trip() {
    let mut proc = Spawner::new("/bin/cat")
        .flags(SpawnFlags::STDIN_PIPE | SpawnFlags::STDOUT_PIPE)
        .spawn()
        .unwrap();

    let streams = proc.streams(Channels::STDIN | Channels::STDOUT);
    let mut stdin = streams.stdin.unwrap();
    let mut stdout = streams.stdout.unwrap();

    let data = expected_payload(3000);
    assert_eq!(stdin.write_all_len(&data).unwrap(), data.len());
    stdin.flush().unwrap();
    stdin.close().unwrap();

    let mut echoed = Vec::new();
    stdout.read_until_eof(&mut echoed).unwrap();
    assert_eq!(echoed, data);

    assert!(proc.release().unwrap().success());
}
