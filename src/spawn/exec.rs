use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use crate::{Error, Result};

/// An owned, NULL-terminated array of C strings, ready to hand to `execve()`.
///
/// Everything is built in the parent so the child only has to read it.
pub struct ExecVec {
    items: Vec<CString>,
    // Always NULL terminated
    ptrs: Vec<*const libc::c_char>,
}

impl ExecVec {
    pub fn empty() -> Self {
        Self {
            items: vec![],
            ptrs: vec![ptr::null()],
        }
    }

    pub fn push(&mut self, item: CString) {
        let last = self.ptrs.len() - 1;
        // The pointer stays valid when `item` moves into `items`: it points into the heap buffer
        self.ptrs[last] = item.as_ptr();
        self.ptrs.push(ptr::null());
        self.items.push(item);
    }

    pub fn push_os(&mut self, item: &OsStr) -> Result<()> {
        self.push(to_cstring(item)?);
        Ok(())
    }

    /// Add a `KEY=VALUE` environment entry.
    pub fn push_env(&mut self, key: &OsStr, value: &OsStr) -> Result<()> {
        if key.is_empty() || key.as_bytes().contains(&b'=') {
            return Err(Error::InvalidArgument(
                "environment variable name is empty or contains '='",
            ));
        }

        let mut entry = OsString::with_capacity(key.len() + value.len() + 1);
        entry.push(key);
        entry.push("=");
        entry.push(value);
        self.push_os(&entry)
    }

    pub fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

pub fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::InvalidArgument("string contains a NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_exec_vec_is_null_terminated() {
        let mut argv = ExecVec::empty();
        assert!(unsafe { *argv.as_ptr() }.is_null());

        argv.push_os(OsStr::new("/bin/true")).unwrap();
        argv.push_os(OsStr::new("--server")).unwrap();
        assert_eq!(argv.len(), 2);

        let ptrs = unsafe { std::slice::from_raw_parts(argv.as_ptr(), 3) };
        assert_eq!(unsafe { CStr::from_ptr(ptrs[0]) }.to_bytes(), b"/bin/true");
        assert_eq!(unsafe { CStr::from_ptr(ptrs[1]) }.to_bytes(), b"--server");
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn test_env_entries() {
        let mut envp = ExecVec::empty();
        envp.push_env(OsStr::new("LANG"), OsStr::new("C")).unwrap();
        assert_eq!(unsafe { CStr::from_ptr(*envp.as_ptr()) }.to_bytes(), b"LANG=C");

        assert!(envp.push_env(OsStr::new(""), OsStr::new("x")).is_err());
        assert!(envp.push_env(OsStr::new("A=B"), OsStr::new("x")).is_err());
        assert!(envp.push_os(OsStr::new("nul\0byte")).is_err());
        assert_eq!(envp.len(), 1);
    }
}
