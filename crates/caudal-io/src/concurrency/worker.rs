//! Worker spawning for both concurrency backends.
//!
//! A worker is a function that runs to completion and reports an
//! [`ExitStatus`]. In thread mode it is a named thread; in process mode it
//! is a forked child that turns the status into its process exit code, so
//! the supervisor can recover the failure kind from `waitpid`.

use super::ConcurrencyMode;
use crate::ExitStatus;
use std::io;
use std::thread;

/// Handle to a spawned worker.
pub struct WorkerHandle {
    inner: HandleInner,
}

enum HandleInner {
    Thread(Option<thread::JoinHandle<ExitStatus>>),
    Process(libc::pid_t),
}

/// Spawn a worker in the given mode.
///
/// With `mask_signals`, all signals are blocked across the spawn so the new
/// worker inherits a full mask and signals keep landing on the supervising
/// worker. Backend-owned callback threads must be spawned this way.
pub fn spawn<F>(
    mode: ConcurrencyMode,
    name: &str,
    mask_signals: bool,
    f: F,
) -> io::Result<WorkerHandle>
where
    F: FnOnce() -> ExitStatus + Send + 'static,
{
    match mode {
        ConcurrencyMode::Processes => {
            // SAFETY: the child calls only the worker body and `_exit`; the
            // parent keeps full ownership of the handle.
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                return Err(io::Error::last_os_error());
            }
            if pid == 0 {
                let status = f();
                unsafe { libc::_exit(status.code()) };
            }
            Ok(WorkerHandle {
                inner: HandleInner::Process(pid),
            })
        }
        ConcurrencyMode::Threads => {
            let old_mask = if mask_signals { Some(block_all_signals()?) } else { None };
            let handle = thread::Builder::new().name(name.to_string()).spawn(f);
            if let Some(mask) = old_mask {
                restore_signals(&mask);
            }
            Ok(WorkerHandle {
                inner: HandleInner::Thread(Some(handle?)),
            })
        }
    }
}

/// Spawn the callback worker under the routing policy.
///
/// Callback audio APIs generally cannot run in a forked child, so in
/// process mode the *calling* process becomes the callback worker and the
/// rest of initialisation continues in the child: this function returns
/// `Ok(None)` in a fresh fork child while the original process runs `f` to
/// completion and exits with its status. In thread mode `f` runs on a
/// signal-masked thread and the handle is returned.
pub fn spawn_callback_worker<F>(mode: ConcurrencyMode, f: F) -> io::Result<Option<WorkerHandle>>
where
    F: FnOnce() -> ExitStatus + Send + 'static,
{
    match mode {
        ConcurrencyMode::Processes => {
            // SAFETY: see `spawn`; the roles are swapped on purpose.
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                return Err(io::Error::last_os_error());
            }
            if pid != 0 {
                let status = f();
                unsafe { libc::_exit(status.code()) };
            }
            Ok(None)
        }
        ConcurrencyMode::Threads => Ok(Some(spawn(mode, "caudal-callback", true, f)?)),
    }
}

impl WorkerHandle {
    /// Wait for the worker to finish and return its status.
    ///
    /// A panicked thread or a signal-killed process reads as
    /// [`ExitStatus::Other`].
    pub fn join(mut self) -> ExitStatus {
        match &mut self.inner {
            HandleInner::Thread(handle) => match handle.take() {
                Some(h) => h.join().unwrap_or(ExitStatus::Other),
                None => ExitStatus::Other,
            },
            HandleInner::Process(pid) => {
                let mut status: libc::c_int = 0;
                loop {
                    let r = unsafe { libc::waitpid(*pid, &mut status, 0) };
                    if r == -1 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        return ExitStatus::Other;
                    }
                    break;
                }
                if libc::WIFEXITED(status) {
                    ExitStatus::from_code(libc::WEXITSTATUS(status))
                } else {
                    ExitStatus::Other
                }
            }
        }
    }

    /// Request termination. Process workers get SIGTERM; thread workers are
    /// expected to observe a cooperative stop flag.
    pub fn terminate(&self) {
        if let HandleInner::Process(pid) = self.inner {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn block_all_signals() -> io::Result<libc::sigset_t> {
    unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        if libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

fn restore_signals(old: &libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, old, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_worker_reports_status() {
        let h = spawn(ConcurrencyMode::Threads, "t", false, || ExitStatus::Underflow).unwrap();
        assert_eq!(h.join(), ExitStatus::Underflow);
    }

    #[test]
    fn masked_spawn_restores_mask() {
        let h = spawn(ConcurrencyMode::Threads, "masked", true, || ExitStatus::Ok).unwrap();
        assert_eq!(h.join(), ExitStatus::Ok);
        // The spawning thread's mask must be back to normal: blocking a
        // signal again must not fail.
        let mask = block_all_signals().unwrap();
        restore_signals(&mask);
    }
}
