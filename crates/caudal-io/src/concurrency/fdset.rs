//! `select` plumbing for the blocking schedulers.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// A wrapper around `libc::fd_set`.
#[derive(Clone, Copy)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    /// An empty set.
    pub fn new() -> Self {
        // SAFETY: fd_set is a plain bitmask; FD_ZERO initialises it.
        unsafe {
            let mut raw: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut raw);
            Self { raw }
        }
    }

    /// Add a descriptor.
    pub fn set(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize);
        unsafe { libc::FD_SET(fd, &mut self.raw) }
    }

    /// Remove a descriptor.
    pub fn clear(&mut self, fd: RawFd) {
        unsafe { libc::FD_CLR(fd, &mut self.raw) }
    }

    /// Whether a descriptor is in the set.
    pub fn contains(&self, fd: RawFd) -> bool {
        let mut copy = self.raw;
        unsafe { libc::FD_ISSET(fd, &mut copy) }
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// `select` over optional read and write sets.
///
/// `EINTR` is retried with the timeout rebuilt. Returns the number of ready
/// descriptors; the sets are updated in place.
pub fn select(
    nfds: RawFd,
    read: Option<&mut FdSet>,
    write: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let read_ptr = read.map_or(std::ptr::null_mut(), |s| &mut s.raw as *mut libc::fd_set);
    let write_ptr = write.map_or(std::ptr::null_mut(), |s| &mut s.raw as *mut libc::fd_set);
    loop {
        let mut tv = timeout.map(|t| libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |t| t as *mut libc::timeval);
        // SAFETY: the pointers come from live FdSets or are null.
        let n = unsafe { libc::select(nfds + 1, read_ptr, write_ptr, std::ptr::null_mut(), tv_ptr) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::fdio;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn set_operations() {
        let mut set = FdSet::new();
        assert!(!set.contains(0));
        set.set(5);
        assert!(set.contains(5));
        set.clear(5);
        assert!(!set.contains(5));
    }

    #[test]
    fn select_reports_readable_pipe() {
        let (r, w) = pipe();
        fdio::write_all(w.as_raw_fd(), &[1]).unwrap();
        let mut read = FdSet::new();
        read.set(r.as_raw_fd());
        let n = select(r.as_raw_fd(), Some(&mut read), None, None).unwrap();
        assert_eq!(n, 1);
        assert!(read.contains(r.as_raw_fd()));
    }

    #[test]
    fn zero_timeout_returns_immediately() {
        let (r, _w) = pipe();
        let mut read = FdSet::new();
        read.set(r.as_raw_fd());
        let n = select(
            r.as_raw_fd(),
            Some(&mut read),
            None,
            Some(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(n, 0);
    }
}
