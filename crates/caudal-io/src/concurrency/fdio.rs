//! Exact-length reads and writes on raw file descriptors.
//!
//! Pipe-based semaphores and the control command channel speak fixed-size
//! records over pipes; short transfers are completed here and `EINTR` is
//! retried, so callers see all-or-nothing semantics.

use std::io;
use std::os::fd::RawFd;

/// Write the whole buffer to `fd`, retrying on `EINTR`.
pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let rest = &buf[done..];
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe wrote zero"));
        }
        done += n as usize;
    }
    Ok(())
}

/// Fill the whole buffer from `fd`, retrying on `EINTR`.
///
/// A closed writing end surfaces as `UnexpectedEof`.
pub fn read_exact(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let rest = &mut buf[done..];
        let n = unsafe { libc::read(fd, rest.as_mut_ptr().cast(), rest.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed while reading",
            ));
        }
        done += n as usize;
    }
    Ok(())
}
