use std::os::unix::prelude::*;

use exechelp::{Error, SpawnError, SpawnFlags, Spawner};

/// Run `f` with descriptors 0 and 1 closed, the way a daemon might be started.
fn with_stdin_stdout_closed<T>(f: impl FnOnce() -> T) -> T {
    let saved_in = unsafe { libc::dup(0) };
    let saved_out = unsafe { libc::dup(1) };
    assert!(saved_in >= 0 && saved_out >= 0);

    unsafe {
        libc::close(0);
        libc::close(1);
    }

    let res = f();

    unsafe {
        assert_eq!(libc::dup2(saved_in, 0), 0);
        assert_eq!(libc::dup2(saved_out, 1), 1);
        libc::close(saved_in);
        libc::close(saved_out);
    }

    res
}

fn assert_not_found(res: exechelp::Result<exechelp::Process>) {
    match res {
        Err(Error::Spawn(SpawnError::ProgramNotFound { source, .. })) => {
            assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(mut proc) => {
            let status = proc.release();
            panic!("spawn with a bad working directory succeeded: {:?}", status);
        }
    }
}

fn closed_channels_test() {
    let res = with_stdin_stdout_closed(|| {
        Spawner::new("/bin/sh")
            .args(["-c", "exit 0"])
            .current_dir("/nonexistent/exechelp-dir")
            .flags(SpawnFlags::STDERR_KEEP)
            .spawn()
    });

    assert_not_found(res);
}

fn wired_channels_test() {
    // Both /dev/null descriptors end up wired over 0 and 1 in the child
    let res = with_stdin_stdout_closed(|| {
        Spawner::new("/bin/sh")
            .args(["-c", "exit 0"])
            .current_dir("/nonexistent/exechelp-dir")
            .flags(SpawnFlags::STDIN_NULL | SpawnFlags::STDOUT_NULL | SpawnFlags::STDERR_KEEP)
            .spawn()
    });

    assert_not_found(res);
}

fn success_with_closed_stdio_test() {
    let before = exechelp::enumerate_open_descriptors().unwrap();

    let status = with_stdin_stdout_closed(|| {
        let mut proc = Spawner::new("/bin/sh")
            .args(["-c", "exit 4"])
            .flags(SpawnFlags::STDERR_KEEP)
            .spawn()
            .unwrap();
        proc.release().unwrap()
    });

    assert_eq!(status.code(), Some(4));
    assert_eq!(exechelp::enumerate_open_descriptors().unwrap(), before);
}

#[test]
fn run_tests() {
    // Run all tests here because these tests close the standard descriptors

    closed_channels_test();

    wired_channels_test();

    success_with_closed_stdio_test();
}
