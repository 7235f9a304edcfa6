//! The blocking output scheduler.
//!
//! Mirrors the input scheduler with write readiness: apply the delay stage
//! before any byte leaves, mute exactly the slice being written, write at
//! most one device block plus the residual per call, and on the final
//! partition shrink every subdevice's quantum to the recorded residual.
//! Priming rounds (`iodelay_fill`) push silence to the clocked outputs
//! before the stream starts, building up the device-side latency cushion.

use crate::concurrency::fdset::{self, FdSet};
use crate::concurrency::Semaphore;
use crate::control::{self, CommandTarget};
use crate::engine::IoBuffers;
use crate::shared::{SharedArea, UNSET};
use crate::subdev::Subdev;
use crate::{Direction, Error, Result};
use caudal_core::BufferFormat;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// What a partition write ended with.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OutputFlow {
    /// More partitions to come.
    Continue,
    /// Every output subdevice has finished; the stream is over.
    Finished,
}

pub(crate) struct OutputScheduler {
    pub devs: Vec<Subdev>,
    pub shared: Arc<SharedArea>,
    pub bufs: Arc<IoBuffers>,
    pub format: BufferFormat,
    pub request_fd: RawFd,
    pub reply_fd: RawFd,
    pub targets: Vec<CommandTarget>,
    /// Every blocking module, for the global stop on the last partition.
    pub modules: Vec<Arc<dyn crate::backend::IoBackend>>,
    /// Posted by the callback side once all outputs report finished.
    pub finish: Semaphore,
    pub isfirst: bool,
    pub islast: bool,
    pub buf_index: i64,
    pub curbuf: usize,
    scratch: Vec<usize>,
}

impl OutputScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devs: Vec<Subdev>,
        shared: Arc<SharedArea>,
        bufs: Arc<IoBuffers>,
        format: BufferFormat,
        request_fd: RawFd,
        reply_fd: RawFd,
        targets: Vec<CommandTarget>,
        modules: Vec<Arc<dyn crate::backend::IoBackend>>,
        finish: Semaphore,
    ) -> Self {
        Self {
            devs,
            shared,
            bufs,
            format,
            request_fd,
            reply_fd,
            targets,
            modules,
            finish,
            isfirst: true,
            islast: false,
            buf_index: 0,
            curbuf: 0,
            scratch: Vec::new(),
        }
    }

    /// Write one partition to the fd output subdevices.
    ///
    /// `iodelay_fill` marks a priming round: only clocked outputs are
    /// written, the partition counter does not advance, and `synch` (if
    /// given) is posted once the first write set went through so the input
    /// worker can start against a pre-filled device ring.
    pub fn write_partition(
        &mut self,
        iodelay_fill: bool,
        mut synch: Option<&Semaphore>,
    ) -> Result<OutputFlow> {
        let ca = self.shared.get();
        if ca.abort() {
            return Err(Error::Worker(crate::ExitStatus::Other));
        }

        // Entering the last partition: the write quantum shrinks to the
        // smaller of the two paths' residuals.
        if (ca.frames_left() != UNSET && self.buf_index == ca.lastbuf_index())
            || (ca.cb_frames_left() != UNSET && self.buf_index == ca.cb_lastbuf_index())
        {
            let mut frames = ca.frames_left();
            let cb_frames = ca.cb_frames_left();
            if frames == UNSET || (cb_frames != UNSET && cb_frames < frames) {
                frames = cb_frames;
            }
            for dev in &mut self.devs {
                dev.buf_size = frames as usize * dev.frame_size();
                dev.buf_left = dev.buf_size;
            }
            self.islast = true;
        }

        // SAFETY: the output worker owns the current output slot between
        // the filter hand-off and the next slot-reuse credit.
        let buf = unsafe { self.bufs.slot_mut(Direction::Output, self.curbuf) };
        self.curbuf ^= 1;

        // Output delay is pre-applied: the device must see delayed samples.
        for dev in &mut self.devs {
            dev.apply_delay(ca, buf, &self.format);
        }

        let mut pending = FdSet::new();
        let mut fdmax = self.request_fd;
        let mut devs_left = 0usize;
        for dev in &self.devs {
            if iodelay_fill && !dev.uses_clock {
                continue;
            }
            pending.set(dev.fd);
            fdmax = fdmax.max(dev.fd);
            devs_left += 1;
        }

        while devs_left > 0 {
            let mut writefds = pending;
            let mut readfds = FdSet::new();
            readfds.set(self.request_fd);
            fdset::select(fdmax, Some(&mut readfds), Some(&mut writefds), None)?;

            if readfds.contains(self.request_fd) {
                control::service_command(self.request_fd, self.reply_fd, &self.targets)?;
            }

            for dev in &mut self.devs {
                if !writefds.contains(dev.fd) || !pending.contains(dev.fd) {
                    continue;
                }
                // One device block plus the residual per call keeps
                // ring-buffer style devices from rejecting large writes.
                let write_size = if dev.block_size > 0 && dev.buf_left > dev.block_size {
                    dev.block_size + dev.buf_left % dev.block_size
                } else {
                    dev.buf_left
                };
                let done = dev.buf_size - dev.buf_left;
                dev.apply_mute(ca, buf, done, write_size, &mut self.scratch);
                let start = dev.region.offset + done;
                match dev.backend.write(dev.fd, &buf[start..start + write_size]) {
                    Ok(n) => dev.buf_left -= n,
                    Err(e) => write_error(dev.backend.name(), &e)?,
                }
                if dev.buf_left == 0 {
                    dev.buf_left = dev.buf_size;
                    devs_left -= 1;
                    pending.clear(dev.fd);
                }
            }

            if let Some(sem) = synch.take() {
                sem.post(1)
                    .map_err(|e| Error::Internal(format!("start sync: {e}")))?;
                std::thread::yield_now();
            }
            if !iodelay_fill && self.isfirst {
                self.isfirst = false;
                for module in &self.modules {
                    module.start(Direction::Output).map_err(|e| {
                        Error::Internal(format!("{} failed to start: {e}", module.name()))
                    })?;
                }
            }
        }

        if iodelay_fill {
            return Ok(OutputFlow::Continue);
        }

        if self.islast {
            for module in &self.modules {
                module.synch_stop();
                module.stop(Direction::Output);
            }
            ca.set_blocking_stopped();
            for dev in &self.devs {
                ca.set_finished(Direction::Output, dev.index);
            }
            if !ca.all_finished(Direction::Output) {
                // Callback outputs are still draining; their FINISHED event
                // posts the semaphore.
                self.finish
                    .wait(1)
                    .map_err(|e| Error::Internal(format!("finish wait: {e}")))?;
                if ca.abort() {
                    return Err(Error::Worker(crate::ExitStatus::Other));
                }
            }
            tracing::info!("finished");
            return Ok(OutputFlow::Finished);
        }

        self.buf_index += 1;
        Ok(OutputFlow::Continue)
    }
}

/// Map a failed write to the engine's error taxonomy.
fn write_error(backend: &str, e: &io::Error) -> Result<()> {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(()),
        io::ErrorKind::BrokenPipe => Err(Error::Underflow {
            backend: backend.to_string(),
        }),
        _ => Err(Error::Io(io::Error::new(e.kind(), e.to_string()))),
    }
}
