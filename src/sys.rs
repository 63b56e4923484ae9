#[cfg(target_os = "macos")]
pub const SYS_GETDIRENTRIES64: libc::c_int = 344;

#[cfg(target_os = "freebsd")]
extern "C" {
    pub fn getdirentries(
        fd: libc::c_int,
        buf: *mut libc::c_char,
        nbytes: libc::size_t,
        basep: *mut libc::off_t,
    ) -> libc::ssize_t;
}

#[cfg(target_os = "freebsd")]
#[repr(C)]
pub struct dirent {
    pub d_fileno: libc::ino_t,
    pub d_off: libc::off_t,
    pub d_reclen: u16,
    pub d_type: u8,
    d_pad0: u8,
    pub d_namlen: u16,
    d_pad1: u16,
    pub d_name: [libc::c_char; 256],
}

/// Path of the directory listing this process's open descriptors, NUL-terminated.
#[cfg(target_os = "linux")]
pub const SELF_FD_DIR: &[u8] = b"/proc/self/fd\0";

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub const SELF_FD_DIR: &[u8] = b"/dev/fd\0";

/// Device that `Discard` redirections are wired to.
pub const DEV_NULL: &[u8] = b"/dev/null\0";
