use std::fs;
use std::os::unix::prelude::*;

use exechelp::{DirEnumerator, FdEnumerator, ProbeEnumerator};

fn is_fd_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

fn open_fds(minfd: RawFd) -> Vec<RawFd> {
    exechelp::enumerate_with(exechelp::default_enumerator(), minfd)
        .unwrap()
        .into_vec()
}

fn run_basic_test(callback: fn(fd1: RawFd, fd2: RawFd, fd3: RawFd)) {
    let f1 = fs::File::open("/").unwrap();
    let f2 = fs::File::open("/").unwrap();
    let f3 = fs::File::open("/").unwrap();

    // The closing tests close these behind the files' backs
    let fd1 = f1.into_raw_fd();
    let fd2 = f2.into_raw_fd();
    let fd3 = f3.as_raw_fd();

    drop(f3);

    assert!(is_fd_open(fd1));
    assert!(is_fd_open(fd2));
    assert!(!is_fd_open(fd3));

    callback(fd1, fd2, fd3);

    for fd in [fd1, fd2] {
        if is_fd_open(fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn enumerate_test(fd1: RawFd, fd2: RawFd, fd3: RawFd) {
    for enumerator in [
        &DirEnumerator as &dyn FdEnumerator,
        &ProbeEnumerator,
        exechelp::default_enumerator(),
    ] {
        let fds = exechelp::enumerate_with(enumerator, -1).unwrap();
        assert!(!fds.contains(&-1));
        assert!(fds.contains(&fd1));
        assert!(fds.contains(&fd2));
        assert!(!fds.contains(&fd3));

        // Test handling of minfd
        assert_eq!(exechelp::enumerate_with(enumerator, fd1).unwrap().as_slice(), [fd1, fd2]);
        assert_eq!(exechelp::enumerate_with(enumerator, fd2).unwrap().as_slice(), [fd2]);
        assert!(exechelp::enumerate_with(enumerator, fd3).unwrap().is_empty());
    }

    let all = exechelp::enumerate_open_descriptors().unwrap();
    assert!(all.contains(&fd1));
    assert!(all.windows(2).all(|w| w[0] < w[1]));
}

fn count_test(fd1: RawFd, _fd2: RawFd, _fd3: RawFd) {
    let before = exechelp::enumerate_open_descriptors().unwrap().len();

    let dups: Vec<RawFd> = (0..40).map(|_| unsafe { libc::dup(fd1) }).collect();
    assert!(dups.iter().all(|&fd| fd >= 0));
    assert_eq!(exechelp::enumerate_open_descriptors().unwrap().len(), before + 40);

    for fd in dups {
        unsafe {
            libc::close(fd);
        }
    }
    assert_eq!(exechelp::enumerate_open_descriptors().unwrap().len(), before);
}

fn close_fds_test(fd1: RawFd, fd2: RawFd, _fd3: RawFd) {
    assert_eq!(open_fds(fd1), [fd1, fd2]);

    unsafe {
        exechelp::close_all_from(fd1, &[]);
    }

    assert!(open_fds(fd1).is_empty());

    // Again, with nothing left to close
    unsafe {
        exechelp::close_all_from(fd1, &[]);
    }

    assert!(open_fds(fd1).is_empty());
}

fn close_fds_keep1_test(fd1: RawFd, fd2: RawFd, fd3: RawFd) {
    assert_eq!(open_fds(fd1), [fd1, fd2]);

    unsafe {
        exechelp::close_all_from(fd1, &[fd1, fd3]);
    }

    assert_eq!(open_fds(fd1), [fd1]);
}

fn close_fds_keep2_test(fd1: RawFd, fd2: RawFd, fd3: RawFd) {
    assert_eq!(open_fds(fd1), [fd1, fd2]);

    // Unsorted on purpose
    unsafe {
        exechelp::close_all_from(fd1, &[fd3, fd2]);
    }

    assert_eq!(open_fds(fd1), [fd2]);
}

fn close_fds_probe_test(fd1: RawFd, fd2: RawFd, _fd3: RawFd) {
    assert_eq!(open_fds(fd1), [fd1, fd2]);

    let outcome = unsafe {
        exechelp::Closer::new(&ProbeEnumerator)
            .keep_fds(&[fd2])
            .close_from(fd1)
    };

    assert_eq!(outcome, exechelp::Scan::Complete);
    assert_eq!(open_fds(fd1), [fd2]);
}

fn close_below_first_test(fd1: RawFd, fd2: RawFd, _fd3: RawFd) {
    unsafe {
        exechelp::close_all_from(fd2, &[]);
    }

    assert!(is_fd_open(fd1));
    assert!(!is_fd_open(fd2));
}

fn close_in_forked_child_test(fd1: RawFd, fd2: RawFd, _fd3: RawFd) {
    // Selected in the parent, so the child never takes the selection lock
    let enumerator = exechelp::default_enumerator();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);

    if pid == 0 {
        unsafe {
            exechelp::Closer::new(enumerator)
                .keep_fds(&[fd2])
                .close_from(fd1);
            let ok = !is_fd_open(fd1) && is_fd_open(fd2);
            libc::_exit(if ok { 0 } else { 1 });
        }
    }

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);

    // The parent's table is untouched
    assert_eq!(open_fds(fd1), [fd1, fd2]);
}

#[test]
fn run_tests() {
    // Run all tests here because these tests can't be run in parallel

    run_basic_test(enumerate_test);

    run_basic_test(count_test);

    run_basic_test(close_fds_test);

    run_basic_test(close_fds_keep1_test);
    run_basic_test(close_fds_keep2_test);
    run_basic_test(close_fds_probe_test);

    run_basic_test(close_below_first_test);

    run_basic_test(close_in_forked_child_test);
}
