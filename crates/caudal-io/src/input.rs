//! The blocking input scheduler.
//!
//! Drives every fd-based input subdevice through one partition: build a
//! readiness set over all input descriptors plus the control pipe, select,
//! read every ready descriptor until each clocked subdevice has delivered
//! exactly one partition, then run mute and delay over the completed
//! regions. In poll mode the select runs with a zero timeout behind a
//! calibrated pre-sleep, and clocked descriptors that readiness cannot be
//! trusted for are serviced unconditionally.

use crate::concurrency::fdset::{self, FdSet};
use crate::concurrency::Semaphore;
use crate::control::{self, CommandTarget};
use crate::engine::IoBuffers;
use crate::rate::RateMonitor;
use crate::shared::{SharedArea, UNSET};
use crate::subdev::Subdev;
use crate::{Direction, Error, Result};
use caudal_core::BufferFormat;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// First byte of the callback service-channel start message.
pub(crate) const CB_MSG_START: u8 = 1;

/// What a partition read ended with.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InputFlow {
    /// The partition is complete; the filter may run.
    Continue,
    /// The stream is past its last partition; input backends are stopped.
    Stopped,
}

pub(crate) struct InputScheduler {
    pub devs: Vec<Subdev>,
    pub shared: Arc<SharedArea>,
    pub bufs: Arc<IoBuffers>,
    pub format: BufferFormat,
    pub partition: usize,
    pub rate: usize,
    pub poll_mode: bool,
    /// Smallest clocked device block in frames; 0 when unknown.
    pub min_block: usize,
    pub request_fd: RawFd,
    pub reply_fd: RawFd,
    pub targets: Vec<CommandTarget>,
    pub monitor: Option<RateMonitor>,
    /// Posts the start message to the callback service loop on first call.
    pub callback_start: Option<Semaphore>,
    /// Every blocking module, for global start/stop.
    pub modules: Vec<Arc<dyn crate::backend::IoBackend>>,
    pub isfirst: bool,
    pub buf_index: i64,
    pub curbuf: usize,
    scratch: Vec<usize>,
}

impl InputScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devs: Vec<Subdev>,
        shared: Arc<SharedArea>,
        bufs: Arc<IoBuffers>,
        format: BufferFormat,
        partition: usize,
        rate: usize,
        poll_mode: bool,
        min_block: usize,
        request_fd: RawFd,
        reply_fd: RawFd,
        targets: Vec<CommandTarget>,
        monitor: Option<RateMonitor>,
        callback_start: Option<Semaphore>,
        modules: Vec<Arc<dyn crate::backend::IoBackend>>,
    ) -> Self {
        Self {
            devs,
            shared,
            bufs,
            format,
            partition,
            rate,
            poll_mode,
            min_block,
            request_fd,
            reply_fd,
            targets,
            monitor,
            callback_start,
            modules,
            isfirst: true,
            buf_index: 0,
            curbuf: 0,
            scratch: Vec::new(),
        }
    }

    /// Read one partition from every fd input subdevice.
    pub fn read_partition(&mut self) -> Result<InputFlow> {
        let ca = self.shared.get();
        if ca.abort() {
            return Err(Error::Worker(crate::ExitStatus::Other));
        }

        // Past the last partition on either path: stop and let the output
        // worker finish the stream.
        if (ca.frames_left() != UNSET && self.buf_index == ca.lastbuf_index() + 1)
            || (ca.cb_frames_left() != UNSET && self.buf_index == ca.cb_lastbuf_index() + 1)
        {
            for module in &self.modules {
                module.stop(Direction::Input);
            }
            return Ok(InputFlow::Stopped);
        }

        if self.isfirst {
            self.isfirst = false;
            if let Some(cb) = &self.callback_start {
                cb.post_msg(&[CB_MSG_START])
                    .map_err(|e| Error::Internal(format!("callback start: {e}")))?;
            }
            for module in &self.modules {
                module.start(Direction::Input).map_err(|e| {
                    Error::Internal(format!("{} failed to start: {e}", module.name()))
                })?;
                module.synch_start().map_err(|e| {
                    Error::Internal(format!("{} failed to start: {e}", module.name()))
                })?;
            }
        }

        // SAFETY: the input worker owns the fd regions of the current input
        // slot for this partition; the hand-off semaphores sequence reuse.
        let buf = unsafe { self.bufs.slot_mut(Direction::Input, self.curbuf) };
        self.curbuf ^= 1;

        let mut pending = FdSet::new();
        let mut fdmax = self.request_fd;
        for dev in &self.devs {
            pending.set(dev.fd);
            fdmax = fdmax.max(dev.fd);
        }
        let mut devs_left = self.devs.len();
        let mut minleft = self.partition;
        let mut firstloop = true;

        while devs_left > 0 {
            let mut readfds = pending;
            readfds.set(self.request_fd);

            let timeout = if self.poll_mode {
                if !firstloop {
                    self.poll_sleep(minleft);
                }
                Some(Duration::ZERO)
            } else {
                None
            };
            fdset::select(fdmax, Some(&mut readfds), None, timeout)?;

            // Readiness cannot be trusted at partition granularity for
            // badly aligned or poll-mode devices: service pending clocked
            // descriptors unconditionally.
            for dev in &self.devs {
                if dev.uses_clock
                    && pending.contains(dev.fd)
                    && !readfds.contains(dev.fd)
                    && (self.poll_mode || dev.bad_alignment)
                {
                    readfds.set(dev.fd);
                }
            }

            if readfds.contains(self.request_fd) {
                control::service_command(self.request_fd, self.reply_fd, &self.targets)?;
            }

            for dev in &mut self.devs {
                if !readfds.contains(dev.fd) || !pending.contains(dev.fd) {
                    continue;
                }
                let done = dev.buf_size - dev.buf_left;
                let start = dev.region.offset + done;
                match dev.backend.read(dev.fd, &mut buf[start..start + dev.buf_left]) {
                    Ok(0) => {
                        // End of stream: zero the remainder of this
                        // subdevice's region and record the residual.
                        if dev.interleaved {
                            buf[start..start + dev.buf_left].fill(0);
                        } else {
                            let per_chan = dev.buf_size / dev.channels.open_channels;
                            let left = dev.buf_left / dev.channels.open_channels;
                            for n in 1..=dev.channels.open_channels {
                                let end = dev.region.offset + n * per_chan;
                                buf[end - left..end].fill(0);
                            }
                        }
                        devs_left -= 1;
                        pending.clear(dev.fd);
                        let frames = done / dev.frame_size();
                        ca.note_short_read(frames as i64, self.buf_index);
                        tracing::info!(
                            backend = dev.backend.name(),
                            frames,
                            partition = self.buf_index,
                            "input end of stream"
                        );
                    }
                    Ok(n) => {
                        dev.buf_left -= n;
                        if let Some(monitor) = &mut self.monitor {
                            if monitor.fd() == dev.fd {
                                let frames = n / dev.frame_size();
                                monitor.on_read(frames, dev.buf_left == 0)?;
                            }
                        }
                        if dev.uses_clock {
                            minleft = minleft.min(dev.buf_left / dev.frame_size());
                        }
                        if dev.buf_left == 0 {
                            dev.buf_left = dev.buf_size;
                            devs_left -= 1;
                            pending.clear(dev.fd);
                        }
                    }
                    Err(e) => read_error(dev.backend.name(), &e)?,
                }
            }
            firstloop = false;
        }

        for dev in &mut self.devs {
            dev.apply_mute(ca, buf, 0, dev.buf_size, &mut self.scratch);
            dev.apply_delay(ca, buf, &self.format);
        }

        self.buf_index += 1;
        Ok(InputFlow::Continue)
    }

    /// Calibrated pre-sleep for poll mode: sleep roughly one device block
    /// (or what is left of the partition), bucketed to trade timer
    /// resolution against wake-up latency.
    fn poll_sleep(&self, minleft: usize) {
        let mut usec = minleft as u64 * 1_000_000 / self.rate as u64;
        if self.min_block > 0 {
            usec = usec.min(self.min_block as u64 * 1_000_000 / self.rate as u64);
        }
        if usec > 40_000 {
            std::thread::sleep(Duration::from_micros(usec));
        } else if usec > 20_000 {
            std::thread::sleep(Duration::from_millis(10));
        } else if usec > 2_050 {
            std::thread::sleep(Duration::from_millis(2));
        } else if usec > 50 {
            std::thread::sleep(Duration::from_micros(usec - 50));
        }
    }
}

/// Map a failed read to the engine's error taxonomy. `Interrupted` and
/// `WouldBlock` are transient; everything else is fatal.
fn read_error(backend: &str, e: &io::Error) -> Result<()> {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(()),
        _ if e.raw_os_error() == Some(libc::EIO) => Err(Error::InvalidInput {
            backend: backend.to_string(),
        }),
        // With linked duplex devices a broken pipe on the input side almost
        // always means the output underflowed.
        io::ErrorKind::BrokenPipe => Err(Error::Underflow {
            backend: backend.to_string(),
        }),
        _ => Err(Error::Io(io::Error::new(e.kind(), e.to_string()))),
    }
}
