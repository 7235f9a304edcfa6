//! Engine configuration.

use crate::concurrency::ConcurrencyMode;

/// Tunables of the I/O engine.
///
/// Everything here is decided at startup; nothing is reconfigurable while
/// the engine runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Thread or process workers.
    pub concurrency: ConcurrencyMode,
    /// Allow the input scheduler to fall back to poll mode when every
    /// clocked input is badly aligned. When false, such configurations fail
    /// at init.
    pub allow_poll_mode: bool,
    /// Monitor the sample clock of one input device and abort on >2 % drift.
    pub monitor_rate: bool,
    /// `SCHED_FIFO` priority for the workers, if any. Failure to elevate is
    /// reported but never fatal.
    pub realtime_priority: Option<i32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyMode::Threads,
            allow_poll_mode: true,
            monitor_rate: false,
            realtime_priority: None,
        }
    }
}
