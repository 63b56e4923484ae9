use std::io;
use std::os::unix::io::RawFd;

use crate::{sys, util};

#[cfg(target_os = "linux")]
type RawDirent = libc::dirent64;
#[cfg(target_os = "linux")]
#[inline]
unsafe fn getdents(fd: RawFd, buf: &mut [u8]) -> isize {
    libc::syscall(
        libc::SYS_getdents64,
        fd as libc::c_uint,
        buf.as_mut_ptr(),
        buf.len(),
    ) as isize
}

#[cfg(target_os = "freebsd")]
type RawDirent = sys::dirent;
#[cfg(target_os = "freebsd")]
#[inline]
unsafe fn getdents(fd: RawFd, buf: &mut [u8]) -> isize {
    sys::getdirentries(
        fd,
        buf.as_mut_ptr() as *mut libc::c_char,
        buf.len(),
        std::ptr::null_mut(),
    ) as isize
}

#[cfg(target_os = "macos")]
type RawDirent = libc::dirent;
#[cfg(target_os = "macos")]
#[inline]
unsafe fn getdents(fd: RawFd, buf: &mut [u8]) -> isize {
    let mut offset: libc::off_t = 0;
    libc::syscall(
        sys::SYS_GETDIRENTRIES64,
        fd,
        buf.as_mut_ptr(),
        buf.len(),
        &mut offset,
    ) as isize
}

const DIRENT_BUF_SIZE: usize = 4 * std::mem::size_of::<RawDirent>();

// getdents() hands back packed records that we reinterpret in place
#[repr(C, align(8))]
struct DirentBuf([u8; DIRENT_BUF_SIZE]);

/// Streams descriptor numbers out of the per-process descriptor directory.
///
/// Entries are read in small batches into a fixed buffer on the stack, so the set of live
/// descriptors may grow without bound without any allocation. Everything here is
/// async-signal-safe, which lets the spawner use it between `fork()` and `exec()`.
pub struct DirFdIter {
    minfd: RawFd,
    dirfd: RawFd,
    dirents: DirentBuf,
    dirent_nbytes: usize,
    dirent_offset: usize,
}

impl DirFdIter {
    pub fn open(minfd: RawFd) -> Option<Self> {
        #[cfg(target_os = "linux")]
        {
            // getdents64() on WSL 1 returns entries out of order and skips some
            if util::is_wsl_1() {
                return None;
            }
        }

        #[cfg(target_os = "freebsd")]
        {
            // /dev/fd is only accurate when fdescfs is mounted on it, in which case it lives on a
            // different device than /dev
            let mut dev_stat: libc::stat = unsafe { std::mem::zeroed() };
            let mut devfd_stat: libc::stat = unsafe { std::mem::zeroed() };

            let accurate = unsafe {
                libc::stat(b"/dev\0".as_ptr() as *const libc::c_char, &mut dev_stat) == 0
                    && libc::stat(sys::SELF_FD_DIR.as_ptr() as *const libc::c_char, &mut devfd_stat)
                        == 0
                    && dev_stat.st_dev != devfd_stat.st_dev
            };

            if !accurate {
                return None;
            }
        }

        let dirfd = unsafe {
            libc::open(
                sys::SELF_FD_DIR.as_ptr() as *const libc::c_char,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };

        if dirfd < 0 {
            return None;
        }

        Some(Self {
            minfd,
            dirfd,
            dirents: DirentBuf([0; DIRENT_BUF_SIZE]),
            dirent_nbytes: 0,
            dirent_offset: 0,
        })
    }

    unsafe fn entry_at(&self, offset: usize) -> (Option<RawFd>, usize) {
        #[allow(clippy::cast_ptr_alignment)]
        let entry = &*(self.dirents.0.as_ptr().add(offset) as *const RawDirent);

        let fd = util::parse_fd_name(
            entry
                .d_name
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8),
        );

        (fd, entry.d_reclen as usize)
    }

    /// Return the next open descriptor `>= minfd`, skipping the directory descriptor itself.
    ///
    /// An error means the directory stream can no longer be trusted; the caller should fall back
    /// to probing from the last descriptor it saw.
    pub fn next(&mut self) -> io::Result<Option<RawFd>> {
        loop {
            if self.dirent_offset >= self.dirent_nbytes {
                let nbytes = unsafe { getdents(self.dirfd, &mut self.dirents.0) };

                if nbytes < 0 {
                    return Err(io::Error::last_os_error());
                } else if nbytes == 0 {
                    return Ok(None);
                }

                self.dirent_nbytes = nbytes as usize;
                self.dirent_offset = 0;
            }

            let (fd, reclen) = unsafe { self.entry_at(self.dirent_offset) };

            if reclen == 0 {
                // A zero-length record would loop forever
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            self.dirent_offset += reclen;

            // "." and ".." don't parse
            if let Some(fd) = fd {
                if fd >= self.minfd && fd != self.dirfd {
                    return Ok(Some(fd));
                }
            }
        }
    }
}

impl Drop for DirFdIter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.dirfd);
        }
    }
}
