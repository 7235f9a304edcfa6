//! Sample-clock sanity monitoring.
//!
//! One clocked input descriptor is elected at init. Starting when its first
//! partition completes, the monitor accumulates delivered frames; once at
//! least one second's worth has arrived and a partition boundary is
//! reached, the measured rate must sit within ±2 % of nominal or the engine
//! aborts. The window then resets and measurement continues.

use crate::{Error, Result};
use std::os::fd::RawFd;
use std::time::Instant;

/// Tolerated relative deviation of the measured rate.
const TOLERANCE: f64 = 0.02;

pub(crate) struct RateMonitor {
    fd: RawFd,
    nominal: usize,
    frames: usize,
    start: Option<Instant>,
}

impl RateMonitor {
    pub fn new(fd: RawFd, nominal: usize) -> Self {
        Self {
            fd,
            nominal,
            frames: 0,
            start: None,
        }
    }

    /// The descriptor being monitored.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Feed one successful read: `frames` newly delivered frames and
    /// whether the subdevice just completed its partition.
    pub fn on_read(&mut self, frames: usize, partition_complete: bool) -> Result<()> {
        let Some(start) = self.start else {
            // Timing starts at the first completed partition so device
            // start-up cost stays out of the measurement.
            if partition_complete {
                self.start = Some(Instant::now());
            }
            return Ok(());
        };

        self.frames += frames;
        if self.frames < self.nominal || !partition_complete {
            return Ok(());
        }

        let elapsed = start.elapsed().as_secs_f64();
        let measured = self.frames as f64 / elapsed;
        tracing::debug!(
            measured_hz = measured,
            frames = self.frames,
            elapsed_s = elapsed,
            "measured sample rate"
        );
        let nominal = self.nominal as f64;
        if measured < nominal * (1.0 - TOLERANCE) || measured > nominal / (1.0 - TOLERANCE) {
            return Err(Error::RateDrift {
                nominal: self.nominal,
                measured,
            });
        }
        self.frames = 0;
        self.start = None;
        Ok(())
    }
}
