//! Best-effort realtime scheduling.

/// Place the calling worker in the `SCHED_FIFO` class at `priority`.
///
/// Failure (usually missing privileges) is reported and ignored; the engine
/// keeps running at normal priority.
pub fn set_realtime(priority: i32, who: &str) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: plain syscall on the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        tracing::warn!(
            worker = who,
            priority,
            error = %std::io::Error::last_os_error(),
            "could not enter realtime scheduling class"
        );
    } else {
        tracing::debug!(worker = who, priority, "realtime scheduling enabled");
    }
}
