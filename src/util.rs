use std::io;
use std::os::unix::io::RawFd;

/// What `close_all_from()` needs to know about a keep-list before it starts closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepInfo {
    /// Largest descriptor in the list (`RawFd::MIN` if the list is empty).
    pub max: RawFd,
    /// Whether the list is in ascending order.
    pub sorted: bool,
}

pub fn inspect_keep_fds(keep_fds: &[RawFd]) -> KeepInfo {
    let mut max = RawFd::MIN;
    let mut last_fd = RawFd::MIN;
    let mut sorted = true;

    for &fd in keep_fds {
        if fd > max {
            max = fd;
        } else if last_fd > fd {
            sorted = false;
        }

        last_fd = fd;
    }

    KeepInfo { max, sorted }
}

/// Check whether `fd` is in `keep_fds`.
///
/// Descriptors must be queried in ascending order. If the list is sorted, the part of it below
/// `fd` is dropped from the front of the slice so later lookups only look at what is left; the
/// caller's original list is never modified.
pub fn check_should_keep(keep_fds: &mut &[RawFd], fd: RawFd, sorted: bool) -> bool {
    if sorted {
        match keep_fds.iter().position(|&x| x >= fd) {
            Some(index) => *keep_fds = &keep_fds[index..],
            None => *keep_fds = &[],
        }

        keep_fds.first() == Some(&fd)
    } else {
        keep_fds.contains(&fd)
    }
}

#[cfg(target_os = "linux")]
pub fn is_wsl_1() -> bool {
    use std::sync::atomic::{AtomicU8, Ordering};

    // 0=no, 1=yes, 2=not checked yet
    static IS_WSL1: AtomicU8 = AtomicU8::new(2);

    match IS_WSL1.load(Ordering::Relaxed) {
        1 => true,
        0 => false,
        _ => {
            let mut uname: libc::utsname = unsafe { std::mem::zeroed() };
            if unsafe { libc::uname(&mut uname) } != 0 {
                return false;
            }

            let release_len = uname
                .release
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(uname.release.len());

            // `c_char` may be signed, so view the release string as bytes
            let release = unsafe {
                std::slice::from_raw_parts(uname.release.as_ptr() as *const u8, release_len)
            };

            // WSL 1 kernels report "...-Microsoft"; WSL 2 reports "...-microsoft-standard"
            let is_wsl1 = release.ends_with(b"Microsoft");
            IS_WSL1.store(is_wsl1 as u8, Ordering::Relaxed);

            is_wsl1
        }
    }
}

#[inline]
pub fn is_fd_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

/// Turn a `-1` return value into the current `errno`.
#[inline]
pub fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Set or clear `FD_CLOEXEC`, skipping the second syscall if the flag is already right.
///
/// Only async-signal-safe calls are made, so this may run in a freshly forked child.
pub fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;

    let new_flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };

    if new_flags != flags {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) })?;
    }

    Ok(())
}

/// Parse a directory entry name such as `b"17"` into a descriptor number.
pub fn parse_fd_name<I: Iterator<Item = u8>>(it: I) -> Option<RawFd> {
    let mut num: RawFd = 0;
    let mut seen_any = false;

    for ch in it {
        if !ch.is_ascii_digit() {
            return None;
        }

        num = num.checked_mul(10)?.checked_add((ch - b'0') as RawFd)?;
        seen_any = true;
    }

    if seen_any {
        Some(num)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_fd<F: FnOnce(RawFd)>(f: F) {
        let fd = unsafe { libc::open(b"/\0".as_ptr() as *const _, libc::O_RDONLY) };
        assert!(fd >= 0);

        f(fd);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_inspect_keep_fds() {
        assert_eq!(
            inspect_keep_fds(&[]),
            KeepInfo {
                max: RawFd::MIN,
                sorted: true
            }
        );
        assert_eq!(inspect_keep_fds(&[0, 1]), KeepInfo { max: 1, sorted: true });
        assert_eq!(inspect_keep_fds(&[1, 0]), KeepInfo { max: 1, sorted: false });
        assert_eq!(
            inspect_keep_fds(&[20, 23, 24]),
            KeepInfo {
                max: 24,
                sorted: true
            }
        );
        assert_eq!(
            inspect_keep_fds(&[24, 20, 23]),
            KeepInfo {
                max: 24,
                sorted: false
            }
        );
    }

    #[test]
    fn test_check_should_keep_sorted() {
        let original: &[RawFd] = &[0, 1, 5, 8, 10];
        let mut keep_fds = original;

        assert!(check_should_keep(&mut keep_fds, 0, true));
        assert!(check_should_keep(&mut keep_fds, 1, true));
        assert_eq!(keep_fds, &[1, 5, 8, 10]);

        assert!(!check_should_keep(&mut keep_fds, 2, true));
        assert_eq!(keep_fds, &[5, 8, 10]);

        assert!(check_should_keep(&mut keep_fds, 5, true));
        assert!(!check_should_keep(&mut keep_fds, 6, true));
        assert_eq!(keep_fds, &[8, 10]);

        assert!(!check_should_keep(&mut keep_fds, 11, true));
        assert!(keep_fds.is_empty());

        // The caller's list is untouched
        assert_eq!(original, &[0, 1, 5, 8, 10]);
    }

    #[test]
    fn test_check_should_keep_not_sorted() {
        let mut keep_fds: &[RawFd] = &[24, 20, 23];

        assert!(!check_should_keep(&mut keep_fds, 3, false));
        assert!(check_should_keep(&mut keep_fds, 20, false));
        assert!(!check_should_keep(&mut keep_fds, 21, false));
        assert!(check_should_keep(&mut keep_fds, 24, false));
        assert_eq!(keep_fds, &[24, 20, 23]);
    }

    #[test]
    fn test_parse_fd_name() {
        assert_eq!(parse_fd_name(b"0".iter().cloned()), Some(0));
        assert_eq!(parse_fd_name(b"1423".iter().cloned()), Some(1423));

        assert_eq!(parse_fd_name(b".".iter().cloned()), None);
        assert_eq!(parse_fd_name(b"..".iter().cloned()), None);
        assert_eq!(parse_fd_name(b"-1".iter().cloned()), None);
        assert_eq!(parse_fd_name(b"".iter().cloned()), None);

        let too_big = format!("{}", RawFd::MAX as u32 + 1);
        assert_eq!(parse_fd_name(too_big.bytes()), None);
    }

    #[test]
    fn test_is_fd_valid() {
        assert!(!is_fd_valid(-1));
        assert!(!is_fd_valid(RawFd::MAX));

        with_fd(|fd| {
            assert!(is_fd_valid(fd));
        });
    }

    #[test]
    fn test_set_cloexec() {
        assert!(set_cloexec(-1, true).is_err());

        fn is_cloexec(fd: RawFd) -> bool {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags >= 0);
            flags & libc::FD_CLOEXEC == libc::FD_CLOEXEC
        }

        with_fd(|fd| {
            assert!(!is_cloexec(fd));
            set_cloexec(fd, true).unwrap();
            assert!(is_cloexec(fd));
            set_cloexec(fd, false).unwrap();
            assert!(!is_cloexec(fd));
        });
    }
}
