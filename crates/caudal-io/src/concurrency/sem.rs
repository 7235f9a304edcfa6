//! Semaphores with optional message payloads.
//!
//! In process mode the primitive is a pipe pair: a post writes N bytes, a
//! wait reads N bytes, and a small message can ride along in the stream.
//! The thread backend reproduces that contract with a mutex, a condvar, a
//! counter and a FIFO byte buffer. Messages are delivered in post order in
//! both backends.

use super::ConcurrencyMode;
use super::fdio;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};

/// Largest message payload a semaphore carries, in bytes.
pub const MAX_MESSAGE: usize = 16;

/// A counting semaphore shared between workers.
///
/// Clones refer to the same semaphore. In process mode the pipe descriptors
/// are inherited across `fork`, so a clone captured before spawning a worker
/// stays connected to it.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

enum Inner {
    Pipe {
        read: Mutex<Option<OwnedFd>>,
        write: Mutex<Option<OwnedFd>>,
    },
    Cond(CondSem),
}

struct CondSem {
    state: Mutex<SemState>,
    cond: Condvar,
}

#[derive(Default)]
struct SemState {
    count: usize,
    msgs: Vec<u8>,
}

impl Semaphore {
    /// Create a semaphore with count 0 for the given mode.
    pub fn new(mode: ConcurrencyMode) -> io::Result<Self> {
        let inner = match mode {
            ConcurrencyMode::Processes => {
                let mut fds = [0i32; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: pipe() returned two fresh descriptors we own.
                let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
                Inner::Pipe {
                    read: Mutex::new(Some(r)),
                    write: Mutex::new(Some(w)),
                }
            }
            ConcurrencyMode::Threads => Inner::Cond(CondSem {
                state: Mutex::new(SemState::default()),
                cond: Condvar::new(),
            }),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Raise the count by `n`, waking up to `n` waiters.
    pub fn post(&self, n: usize) -> io::Result<()> {
        match &*self.inner {
            Inner::Pipe { write, .. } => {
                let guard = write.lock().unwrap();
                let fd = guard.as_ref().ok_or_else(closed)?.as_raw_fd();
                fdio::write_all(fd, &vec![0u8; n])
            }
            Inner::Cond(sem) => {
                let mut state = sem.state.lock().unwrap();
                state.count += n;
                sem.cond.notify_all();
                Ok(())
            }
        }
    }

    /// Take `n` units, blocking until they are available.
    pub fn wait(&self, n: usize) -> io::Result<()> {
        match &*self.inner {
            Inner::Pipe { read, .. } => {
                let guard = read.lock().unwrap();
                let fd = guard.as_ref().ok_or_else(closed)?.as_raw_fd();
                let mut sink = vec![0u8; n];
                fdio::read_exact(fd, &mut sink)
            }
            Inner::Cond(sem) => {
                let mut state = sem.state.lock().unwrap();
                for _ in 0..n {
                    while state.count == 0 {
                        state = sem.cond.wait(state).unwrap();
                    }
                    state.count -= 1;
                }
                Ok(())
            }
        }
    }

    /// Post one unit carrying a message of up to [`MAX_MESSAGE`] bytes.
    pub fn post_msg(&self, msg: &[u8]) -> io::Result<()> {
        assert!(msg.len() <= MAX_MESSAGE, "semaphore message too large");
        match &*self.inner {
            Inner::Pipe { write, .. } => {
                let guard = write.lock().unwrap();
                let fd = guard.as_ref().ok_or_else(closed)?.as_raw_fd();
                fdio::write_all(fd, msg)
            }
            Inner::Cond(sem) => {
                let mut state = sem.state.lock().unwrap();
                if state.msgs.len() + msg.len() > MAX_MESSAGE {
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        "semaphore message buffer overflow",
                    ));
                }
                state.msgs.extend_from_slice(msg);
                state.count += 1;
                sem.cond.notify_all();
                Ok(())
            }
        }
    }

    /// Wait for one unit and read its message into `msg`.
    ///
    /// The message length must match what the poster sent; the pipe backend
    /// treats the payload as a byte stream, the thread backend as a FIFO.
    pub fn wait_msg(&self, msg: &mut [u8]) -> io::Result<()> {
        assert!(msg.len() <= MAX_MESSAGE, "semaphore message too large");
        match &*self.inner {
            Inner::Pipe { read, .. } => {
                let guard = read.lock().unwrap();
                let fd = guard.as_ref().ok_or_else(closed)?.as_raw_fd();
                fdio::read_exact(fd, msg)
            }
            Inner::Cond(sem) => {
                let mut state = sem.state.lock().unwrap();
                while state.count == 0 {
                    state = sem.cond.wait(state).unwrap();
                }
                if state.msgs.len() < msg.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "semaphore message buffer underflow",
                    ));
                }
                msg.copy_from_slice(&state.msgs[..msg.len()]);
                let len = msg.len();
                state.msgs.drain(..len);
                state.count -= 1;
                Ok(())
            }
        }
    }

    /// Declare that this worker will never post: closes the write end in
    /// process mode so waiters see EOF if everyone stops posting.
    pub fn never_post(&self) {
        if let Inner::Pipe { write, .. } = &*self.inner {
            *write.lock().unwrap() = None;
        }
    }

    /// Declare that this worker will never wait: closes the read end in
    /// process mode.
    pub fn never_wait(&self) {
        if let Inner::Pipe { read, .. } = &*self.inner {
            *read.lock().unwrap() = None;
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "semaphore end closed")
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.inner {
            Inner::Pipe { .. } => "pipe",
            Inner::Cond(_) => "condvar",
        };
        f.debug_struct("Semaphore").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn thread_mode_counts() {
        let sem = Semaphore::new(ConcurrencyMode::Threads).unwrap();
        sem.post(3).unwrap();
        sem.wait(2).unwrap();
        sem.wait(1).unwrap();
    }

    #[test]
    fn thread_mode_blocks_until_post() {
        let sem = Semaphore::new(ConcurrencyMode::Threads).unwrap();
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait(1).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post(1).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn messages_arrive_in_post_order() {
        for mode in [ConcurrencyMode::Threads, ConcurrencyMode::Processes] {
            let sem = Semaphore::new(mode).unwrap();
            sem.post_msg(&[1, 2]).unwrap();
            sem.post_msg(&[3, 4]).unwrap();
            let mut a = [0u8; 2];
            let mut b = [0u8; 2];
            sem.wait_msg(&mut a).unwrap();
            sem.wait_msg(&mut b).unwrap();
            assert_eq!(a, [1, 2]);
            assert_eq!(b, [3, 4]);
        }
    }

    #[test]
    fn pipe_mode_counts_within_one_process() {
        let sem = Semaphore::new(ConcurrencyMode::Processes).unwrap();
        sem.post(2).unwrap();
        sem.wait(1).unwrap();
        sem.wait(1).unwrap();
    }

    #[test]
    fn thread_mode_message_overflow_is_detected() {
        let sem = Semaphore::new(ConcurrencyMode::Threads).unwrap();
        sem.post_msg(&[0u8; MAX_MESSAGE]).unwrap();
        assert!(sem.post_msg(&[1]).is_err());
    }
}
