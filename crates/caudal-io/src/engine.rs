//! Engine assembly: initialisation, the common buffers and the run loop.
//!
//! Initialisation follows a strict order. Callback backends are brought up
//! first, inside the dedicated callback worker (in process mode that worker
//! *is* the calling process and init continues in a fork child; callback
//! audio APIs do not survive being run in a forked child). The blocking
//! subdevices are opened next, the buffer-format calculator lays out the
//! common buffers over all subdevices of both kinds, and the double-
//! buffered byte regions are allocated from the shared allocator. The
//! callback worker then attaches them (by System V id in process mode) and
//! the engine is ready to run.
//!
//! [`Engine::run`] is the supervising pipeline: the output worker primes
//! the clocked outputs with two partitions of silence, the calling worker
//! reads input partitions and runs the filter between `read_partition` and
//! `write_partition`, and semaphore credits keep both the fd path and the
//! callback path within the two-slot buffer window.

use crate::backend::{CallbackRegistration, CallbackToken, IoBackend};
use crate::callback::{CallbackHub, build_cb_subdev};
use crate::concurrency::{
    ConcurrencyMode, Semaphore, SharedRegion, realtime, worker, worker::WorkerHandle,
};
use crate::config::EngineConfig;
use crate::control::{CommandTarget, Control, ControlPipes};
use crate::input::{InputFlow, InputScheduler};
use crate::output::{OutputFlow, OutputScheduler};
use crate::rate::RateMonitor;
use crate::shared::{MAX_SUBDEVS, SharedArea};
use crate::subdev::{Subdev, SubdevSpec};
use crate::{Direction, Error, ExitStatus, Result};
use caudal_core::BufferFormat;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// Callback service-channel messages.
const CB_MSG_STOP: u8 = 2;
const CB_MSG_SHUTDOWN: u8 = 3;

/// The double-buffered common I/O byte regions of both directions.
///
/// Laid out as `[in slot 0][in slot 1][out slot 0][out slot 1]` inside one
/// shared allocation, so a forked worker can attach the whole thing by id.
pub(crate) struct IoBuffers {
    region: SharedRegion,
    sizes: [usize; 2],
}

impl IoBuffers {
    pub fn allocate(mode: ConcurrencyMode, in_bytes: usize, out_bytes: usize) -> io::Result<Self> {
        let region = SharedRegion::anonymous(mode, 2 * in_bytes + 2 * out_bytes)?;
        Ok(Self {
            region,
            sizes: [in_bytes, out_bytes],
        })
    }

    pub fn allocate_with_id(in_bytes: usize, out_bytes: usize) -> io::Result<(i32, Self)> {
        let (id, region) =
            SharedRegion::with_id(ConcurrencyMode::Processes, 2 * in_bytes + 2 * out_bytes)?;
        Ok((
            id,
            Self {
                region,
                sizes: [in_bytes, out_bytes],
            },
        ))
    }

    pub fn attach(id: i32, in_bytes: usize, out_bytes: usize) -> io::Result<Self> {
        let region = SharedRegion::attach(id, 2 * in_bytes + 2 * out_bytes)?;
        Ok(Self {
            region,
            sizes: [in_bytes, out_bytes],
        })
    }

    fn offset(&self, dir: Direction, slot: usize) -> usize {
        debug_assert!(slot < 2);
        match dir {
            Direction::Input => slot * self.sizes[0],
            Direction::Output => 2 * self.sizes[0] + slot * self.sizes[1],
        }
    }

    /// One slot of one direction, mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to this slot (or to disjoint
    /// subdevice regions within it) under the engine's partition protocol.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, dir: Direction, slot: usize) -> &mut [u8] {
        let ptr = self.region.as_ptr();
        // SAFETY: offset and size stay inside the allocation; aliasing is
        // the caller's contract.
        unsafe {
            std::slice::from_raw_parts_mut(ptr.add(self.offset(dir, slot)), self.sizes[dir.index()])
        }
    }

    /// One slot of one direction, read-only.
    ///
    /// # Safety
    ///
    /// No worker may be writing this slot concurrently.
    pub unsafe fn slot_ref(&self, dir: Direction, slot: usize) -> &[u8] {
        let ptr = self.region.as_ptr();
        // SAFETY: as above.
        unsafe {
            std::slice::from_raw_parts(ptr.add(self.offset(dir, slot)), self.sizes[dir.index()])
        }
    }
}

/// The partition window handed to the filter stage.
pub struct FilterIo<'a> {
    /// The completed input partition, mute and delay already applied.
    pub input: &'a [u8],
    /// The output partition to produce.
    pub output: &'a mut [u8],
    /// Index of this partition, starting at 0.
    pub partition_index: usize,
    /// Layout of the input buffer.
    pub input_format: &'a BufferFormat,
    /// Layout of the output buffer.
    pub output_format: &'a BufferFormat,
}

struct CallbackSide {
    pipe_s: Semaphore,
    pipe_r: Semaphore,
    worker: Option<WorkerHandle>,
    hub: Arc<CallbackHub>,
}

/// The I/O engine.
///
/// Built once with [`Engine::init`]; [`Engine::run`] consumes it and blocks
/// until the stream completes or fails.
pub struct Engine {
    cfg: EngineConfig,
    partition: usize,
    rate: usize,
    shared: Arc<SharedArea>,
    bufs: Arc<IoBuffers>,
    formats: [BufferFormat; 2],
    input: InputScheduler,
    output: OutputScheduler,
    n_cb: [usize; 2],
    min_block: [usize; 2],
    poll_mode: bool,
    cb: Option<CallbackSide>,
    /// Partition-complete signals from the callback side, per direction.
    ready: [Semaphore; 2],
    /// Filter progress credits towards the callback side, per direction.
    filter_credit: [Semaphore; 2],
    /// Filter-to-output hand-off for the blocking path.
    filter_ready: Semaphore,
    /// Slot-reuse credits from the blocking output worker.
    credits: Semaphore,
    /// Posted by the output worker after the first priming write set.
    start_sync: Semaphore,
    /// Posted once every output subdevice has finished.
    finish: Semaphore,
    /// Keeps the control pipes open for the schedulers' raw descriptors.
    _pipes: Arc<ControlPipes>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Bring up the engine: open every subdevice, lay out and allocate the
    /// common buffers, decide poll mode. Returns the engine and the control
    /// handle for runtime parameter changes.
    ///
    /// In process mode with callback backends, the calling process becomes
    /// the callback worker and this function returns in a fork child; see
    /// the module documentation.
    pub fn init(
        cfg: EngineConfig,
        partition: usize,
        rate: usize,
        inputs: Vec<SubdevSpec>,
        outputs: Vec<SubdevSpec>,
    ) -> Result<(Engine, Control)> {
        if partition == 0 || rate == 0 {
            return Err(Error::Config("partition and rate must be non-zero".into()));
        }
        if inputs.is_empty() || outputs.is_empty() {
            return Err(Error::Config(
                "at least one input and one output subdevice are required".into(),
            ));
        }
        if inputs.len() > MAX_SUBDEVS || outputs.len() > MAX_SUBDEVS {
            return Err(Error::Config(format!(
                "too many subdevices (max {MAX_SUBDEVS} per direction)"
            )));
        }
        let mode = cfg.concurrency;
        let specs: [&Vec<SubdevSpec>; 2] = [&inputs, &outputs];

        let shared = Arc::new(SharedArea::new(mode)?);
        let ca = shared.get();
        for dir in crate::DIRECTIONS {
            ca.set_n_subdevs(dir, specs[dir.index()].len());
            for spec in specs[dir.index()] {
                for binding in &spec.channels {
                    if binding.physical >= caudal_core::MAX_CHANNELS {
                        return Err(Error::Config(format!(
                            "physical channel {} out of range",
                            binding.physical
                        )));
                    }
                    if binding.direct_mapping {
                        ca.set_direct(dir, binding.physical);
                        ca.set_delay(dir, binding.physical, binding.initial_delay);
                        ca.set_muted(dir, binding.physical, binding.muted);
                    }
                }
            }
        }

        let ready = [Semaphore::new(mode)?, Semaphore::new(mode)?];
        let filter_credit = [Semaphore::new(mode)?, Semaphore::new(mode)?];
        let ready_wait = [Semaphore::new(mode)?, Semaphore::new(mode)?];
        let finish = Semaphore::new(mode)?;
        let filter_ready = Semaphore::new(mode)?;
        let credits = Semaphore::new(mode)?;
        let start_sync = Semaphore::new(mode)?;

        let any_callback = specs
            .iter()
            .any(|s| s.iter().any(|d| d.backend.is_callback()));

        // Bring up the callback worker before anything else; its init
        // result arrives as a semaphore message.
        let cb = if any_callback {
            let pipe_s = Semaphore::new(mode)?;
            let pipe_r = Semaphore::new(mode)?;
            let hub = Arc::new(CallbackHub::new(
                Arc::clone(&shared),
                [ready[0].clone(), ready[1].clone()],
                [filter_credit[0].clone(), filter_credit[1].clone()],
                ready_wait,
                finish.clone(),
            ));
            let cb_specs: [Vec<(usize, SubdevSpec)>; 2] = [
                collect_callback_specs(&inputs),
                collect_callback_specs(&outputs),
            ];
            let worker_handle = {
                let hub = Arc::clone(&hub);
                let shared = Arc::clone(&shared);
                let pipe_s = pipe_s.clone();
                let pipe_r = pipe_r.clone();
                let rt_prio = cfg.realtime_priority;
                worker::spawn_callback_worker(mode, move || {
                    callback_worker_main(
                        hub, shared, mode, cb_specs, partition, rate, rt_prio, pipe_s, pipe_r,
                    )
                })?
            };
            pipe_r.never_post();
            pipe_s.never_wait();
            let mut ok = [0u8; 1];
            pipe_r
                .wait_msg(&mut ok)
                .map_err(|e| Error::Internal(format!("callback init handshake: {e}")))?;
            if ok[0] == 0 {
                return Err(Error::Config(
                    "callback backend initialisation failed".into(),
                ));
            }
            Some(CallbackSide {
                pipe_s,
                pipe_r,
                worker: worker_handle,
                hub,
            })
        } else {
            None
        };

        let pipes = Arc::new(ControlPipes::new()?);

        // Open the blocking subdevices.
        let mut fd_devs: [Vec<Subdev>; 2] = [Vec::new(), Vec::new()];
        let mut min_block = [0usize; 2];
        let mut monitor: Option<RateMonitor> = None;
        for dir in crate::DIRECTIONS {
            for (index, spec) in specs[dir.index()].iter().enumerate() {
                if spec.backend.is_callback() {
                    continue;
                }
                let raw_layout = spec.layout(true);
                let init = spec.backend.init(
                    &crate::backend::SubdevParams {
                        dir,
                        channels: &raw_layout,
                        format: spec.format,
                        rate,
                        partition,
                    },
                    None,
                )?;
                let Some(fd) = init.fd else {
                    return Err(Error::BackendInit {
                        backend: spec.backend.name().to_string(),
                        dir,
                        reason: "blocking backend returned no descriptor".into(),
                    });
                };
                let bsf = init.block_size_frames;
                let bad_alignment = spec.uses_clock && bsf != 0 && partition % bsf != 0;
                if spec.uses_clock && bsf != 0 && (min_block[dir.index()] == 0 || bsf < min_block[dir.index()])
                {
                    min_block[dir.index()] = bsf;
                }
                if dir == Direction::Input
                    && cfg.monitor_rate
                    && monitor.is_none()
                    && spec.uses_clock
                {
                    monitor = Some(RateMonitor::new(fd, rate));
                }
                let channels = spec.layout(init.interleaved);
                let block_size = bsf * channels.frame_bytes();
                fd_devs[dir.index()].push(Subdev {
                    index,
                    dir,
                    backend: Arc::clone(&spec.backend),
                    fd,
                    uses_clock: spec.uses_clock,
                    interleaved: init.interleaved,
                    bad_alignment,
                    block_size_frames: bsf,
                    block_size,
                    channels,
                    partition,
                    region: caudal_core::Region::default(),
                    buf_size: 0,
                    buf_left: 0,
                    db: spec.delay_buffers(partition),
                });
            }
        }

        // Lay out the common buffers over every subdevice of both kinds, in
        // registry order. Callback metadata comes from the shared area.
        let mut formats: Vec<BufferFormat> = Vec::with_capacity(2);
        for dir in crate::DIRECTIONS {
            let mut list = Vec::new();
            for (index, spec) in specs[dir.index()].iter().enumerate() {
                if spec.backend.is_callback() {
                    let Some((_, interleaved)) = ca.cb_meta(dir, index) else {
                        return Err(Error::Internal(
                            "callback subdevice metadata missing after init".into(),
                        ));
                    };
                    list.push((spec.layout(interleaved), interleaved));
                } else {
                    let dev = fd_devs[dir.index()]
                        .iter()
                        .find(|d| d.index == index)
                        .expect("blocking subdevice missing from registry");
                    list.push((dev.channels.clone(), dev.interleaved));
                }
            }
            let (format, regions) = BufferFormat::compute(partition, &list)?;
            for (index, region) in regions.iter().enumerate() {
                ca.publish_region(dir, index, *region);
                if let Some(dev) = fd_devs[dir.index()].iter_mut().find(|d| d.index == index) {
                    dev.region = *region;
                    dev.buf_size = region.size;
                    dev.buf_left = region.size;
                }
            }
            ca.publish_format(dir, &format);
            formats.push(format);
        }
        let formats: [BufferFormat; 2] = match formats.try_into() {
            Ok(f) => f,
            Err(_) => unreachable!(),
        };

        // Allocate the double-buffered common regions from the shared
        // allocator; in process mode the id travels through the shared area
        // so the callback worker can attach.
        let bufs = match mode {
            ConcurrencyMode::Processes => {
                let (id, bufs) =
                    IoBuffers::allocate_with_id(formats[0].n_bytes, formats[1].n_bytes)?;
                ca.set_buffer_id(id);
                Arc::new(bufs)
            }
            ConcurrencyMode::Threads => Arc::new(IoBuffers::allocate(
                mode,
                formats[0].n_bytes,
                formats[1].n_bytes,
            )?),
        };

        if let Some(cb) = &cb {
            if mode == ConcurrencyMode::Threads {
                cb.hub.attach_buffers(Arc::clone(&bufs));
            }
            cb.pipe_s
                .post_msg(&[1])
                .map_err(|e| Error::Internal(format!("buffer attach handshake: {e}")))?;
            let mut ok = [0u8; 1];
            cb.pipe_r
                .wait_msg(&mut ok)
                .map_err(|e| Error::Internal(format!("buffer attach handshake: {e}")))?;
            if ok[0] == 0 {
                return Err(Error::Internal(
                    "callback worker could not attach the I/O buffers".into(),
                ));
            }
        }

        // Poll-mode decision: only meaningful when some clocked blocking
        // input exists and none of them can be trusted with readiness.
        let mut any_clocked = false;
        let mut all_bad = true;
        for dev in &fd_devs[0] {
            if dev.uses_clock {
                any_clocked = true;
                if !dev.bad_alignment {
                    all_bad = false;
                }
            }
        }
        let poll_mode = any_clocked && all_bad;
        if poll_mode {
            if !cfg.allow_poll_mode {
                return Err(Error::Config(
                    "sound input hardware requires poll mode but the configuration forbids it"
                        .into(),
                ));
            }
            tracing::info!("input poll mode activated");
        }

        // Command dispatch tables and the deduplicated blocking module set.
        let mut targets: [Vec<CommandTarget>; 2] = [Vec::new(), Vec::new()];
        for dir in crate::DIRECTIONS {
            for (index, spec) in specs[dir.index()].iter().enumerate() {
                let fd = fd_devs[dir.index()]
                    .iter()
                    .find(|d| d.index == index)
                    .map(|d| d.fd);
                targets[dir.index()].push((fd, Arc::clone(&spec.backend)));
            }
        }
        let mut fd_modules: Vec<Arc<dyn IoBackend>> = Vec::new();
        for dir in crate::DIRECTIONS {
            for spec in specs[dir.index()] {
                if spec.backend.is_callback() {
                    continue;
                }
                if !fd_modules.iter().any(|m| Arc::ptr_eq(m, &spec.backend)) {
                    fd_modules.push(Arc::clone(&spec.backend));
                }
            }
        }

        let n_cb = [
            inputs.iter().filter(|s| s.backend.is_callback()).count(),
            outputs.iter().filter(|s| s.backend.is_callback()).count(),
        ];
        let [in_devs, out_devs] = fd_devs;
        let [in_targets, out_targets] = targets;

        let input = InputScheduler::new(
            in_devs,
            Arc::clone(&shared),
            Arc::clone(&bufs),
            formats[0].clone(),
            partition,
            rate,
            poll_mode,
            min_block[0],
            pipes.request[0].read.as_raw_fd(),
            pipes.reply[0].write.as_raw_fd(),
            in_targets,
            monitor,
            cb.as_ref().map(|c| c.pipe_s.clone()),
            fd_modules.clone(),
        );
        let output = OutputScheduler::new(
            out_devs,
            Arc::clone(&shared),
            Arc::clone(&bufs),
            formats[1].clone(),
            pipes.request[1].read.as_raw_fd(),
            pipes.reply[1].write.as_raw_fd(),
            out_targets,
            fd_modules,
            finish.clone(),
        );

        let control = Control::new(
            mode,
            Arc::clone(&shared),
            Arc::clone(&pipes),
            [inputs.len(), outputs.len()],
        )?;

        let engine = Engine {
            cfg,
            partition,
            rate,
            shared,
            bufs,
            formats,
            input,
            output,
            n_cb,
            min_block,
            poll_mode,
            cb,
            ready,
            filter_credit,
            filter_ready,
            credits,
            start_sync,
            finish,
            _pipes: pipes,
        };
        Ok((engine, control))
    }

    /// The engine's partition size in frames.
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// The engine's sample rate in Hz.
    pub fn rate(&self) -> usize {
        self.rate
    }

    /// The byte layout of one direction's common buffer.
    pub fn buffer_format(&self, dir: Direction) -> &BufferFormat {
        &self.formats[dir.index()]
    }

    /// The smallest clocked device block across both paths, if any device
    /// reported one. A sane upper bound for the filter's processing chunk.
    pub fn min_block_size(&self) -> Option<usize> {
        let ca = self.shared.get();
        let mut result: Option<usize> = None;
        for dir in crate::DIRECTIONS {
            for candidate in [self.min_block[dir.index()], ca.cb_min_block(dir)] {
                if candidate != 0 {
                    result = Some(result.map_or(candidate, |r| r.min(candidate)));
                }
            }
        }
        result
    }

    /// Whether the input scheduler runs in poll mode.
    pub fn input_poll_mode(&self) -> bool {
        self.poll_mode
    }

    /// Tell the callback service loop to start its backends. `run` does
    /// this on the first partition; it is exposed for external schedulers.
    pub fn trigger_callback_io(&self) -> Result<()> {
        if let Some(cb) = &self.cb {
            cb.pipe_s
                .post_msg(&[crate::input::CB_MSG_START])
                .map_err(|e| Error::Internal(format!("callback start: {e}")))?;
        }
        Ok(())
    }

    /// Run the stream to completion.
    ///
    /// `filter` is invoked once per partition between input and output,
    /// with the completed input slot and the output slot to produce. In
    /// process mode the filter runs in the input worker's process; state it
    /// captures is not shared back.
    pub fn run<F>(mut self, mut filter: F) -> Result<()>
    where
        F: FnMut(FilterIo<'_>) + Send + 'static,
    {
        let n_fd_out = self.output.devs.len();
        let [n_cb_in, n_cb_out] = self.n_cb;
        let mode = self.cfg.concurrency;

        // Initial credits: the callback input side may fill both slots
        // minus one before the filter has consumed anything; the filter may
        // run two partitions ahead of either output drain.
        if n_cb_in > 0 {
            post(&self.filter_credit[0], 1)?;
        }
        if n_cb_out > 0 {
            post(&self.ready[1], 2)?;
        }
        if n_fd_out > 0 {
            post(&self.credits, 2)?;
        }

        let out_worker = if n_fd_out > 0 {
            let sched = std::mem::replace(
                &mut self.output,
                OutputScheduler::new(
                    Vec::new(),
                    Arc::clone(&self.shared),
                    Arc::clone(&self.bufs),
                    self.formats[1].clone(),
                    -1,
                    -1,
                    Vec::new(),
                    Vec::new(),
                    self.finish.clone(),
                ),
            );
            let filter_ready = self.filter_ready.clone();
            let credits = self.credits.clone();
            let start_sync = self.start_sync.clone();
            let shared = Arc::clone(&self.shared);
            Some(worker::spawn(mode, "caudal-output", false, move || {
                output_worker_main(sched, &filter_ready, &credits, &start_sync, &shared)
            })?)
        } else {
            None
        };

        let loop_result = self.input_filter_loop(&mut filter, n_fd_out, n_cb_in, n_cb_out);

        if loop_result.is_err() {
            self.shared.get().set_abort();
            // Unwedge the output worker if it is waiting for a hand-off.
            let _ = self.filter_ready.post(2);
        }

        let out_status = out_worker.map(WorkerHandle::join);

        let mut finish_error: Option<Error> = None;
        if n_fd_out == 0 && loop_result.is_ok() {
            // Pure callback output: completion is signalled by the hub.
            if let Err(e) = self.finish_wait() {
                finish_error = Some(e);
            }
        }

        // Shut the callback service loop down: release parked workers, stop
        // the backends, then end the loop.
        if let Some(cb) = self.cb.take() {
            cb.hub.release_for_shutdown();
            let _ = cb.pipe_s.post_msg(&[CB_MSG_STOP]);
            let mut ack = [0u8; 1];
            let _ = cb.pipe_r.wait_msg(&mut ack);
            let _ = cb.pipe_s.post_msg(&[CB_MSG_SHUTDOWN]);
            if let Some(handle) = cb.worker {
                let status = handle.join();
                if status != ExitStatus::Ok {
                    tracing::warn!(?status, "callback worker exited abnormally");
                }
            }
            if let Some(err) = cb.hub.take_error() {
                return Err(err);
            }
        }

        loop_result?;
        if let Some(err) = finish_error {
            return Err(err);
        }
        match out_status {
            None | Some(ExitStatus::Ok) => Ok(()),
            Some(status) => Err(Error::Worker(status)),
        }
    }

    fn finish_wait(&self) -> Result<()> {
        self.finish
            .wait(1)
            .map_err(|e| Error::Internal(format!("finish wait: {e}")))?;
        if self.shared.get().abort() {
            return Err(Error::Worker(ExitStatus::Other));
        }
        Ok(())
    }

    fn input_filter_loop<F>(
        &mut self,
        filter: &mut F,
        n_fd_out: usize,
        n_cb_in: usize,
        n_cb_out: usize,
    ) -> Result<()>
    where
        F: FnMut(FilterIo<'_>),
    {
        if n_fd_out > 0 {
            // Wait for the output worker's first priming write so linked
            // devices start against a pre-filled ring.
            self.start_sync
                .wait(1)
                .map_err(|e| Error::Internal(format!("start sync: {e}")))?;
        }
        let mut partition_index: usize = 0;
        loop {
            match self.input.read_partition()? {
                InputFlow::Stopped => return Ok(()),
                InputFlow::Continue => {}
            }
            if n_cb_in > 0 {
                wait(&self.ready[0], 1)?;
            }
            if n_cb_out > 0 {
                wait(&self.ready[1], 1)?;
            }
            let slot = partition_index % 2;
            // SAFETY: the input slot is complete (read_partition plus the
            // callback ready signal); the output slot is free (slot-reuse
            // credits). No other worker touches either until handed off.
            let (input, output) = unsafe {
                (
                    self.bufs.slot_ref(Direction::Input, slot),
                    self.bufs.slot_mut(Direction::Output, slot),
                )
            };
            filter(FilterIo {
                input,
                output,
                partition_index,
                input_format: &self.formats[0],
                output_format: &self.formats[1],
            });
            if n_cb_in > 0 {
                post(&self.filter_credit[0], 1)?;
            }
            if n_cb_out > 0 {
                post(&self.filter_credit[1], 1)?;
            }
            if n_fd_out > 0 {
                post(&self.filter_ready, 1)?;
                wait(&self.credits, 1)?;
            }
            partition_index += 1;
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // An engine dropped without running still owns a parked callback
        // service loop; end it so thread-mode embedders do not leak it.
        if let Some(cb) = self.cb.take() {
            let _ = cb.pipe_s.post_msg(&[CB_MSG_SHUTDOWN]);
            if let Some(handle) = cb.worker {
                let _ = handle.join();
            }
        }
    }
}

fn post(sem: &Semaphore, n: usize) -> Result<()> {
    sem.post(n)
        .map_err(|e| Error::Internal(format!("semaphore post: {e}")))
}

fn wait(sem: &Semaphore, n: usize) -> Result<()> {
    sem.wait(n)
        .map_err(|e| Error::Internal(format!("semaphore wait: {e}")))
}

fn output_worker_main(
    mut sched: OutputScheduler,
    filter_ready: &Semaphore,
    credits: &Semaphore,
    start_sync: &Semaphore,
    shared: &Arc<SharedArea>,
) -> ExitStatus {
    let result = (|| -> Result<()> {
        // Two priming rounds queue two partitions of silence on the clocked
        // outputs before the stream starts. The start sync fires on the
        // second round, once both buffer slots have been drained, so the
        // filter can never catch a priming write still in flight.
        sched.write_partition(true, None)?;
        sched.write_partition(true, Some(start_sync))?;
        loop {
            filter_ready
                .wait(1)
                .map_err(|e| Error::Internal(format!("hand-off wait: {e}")))?;
            if shared.get().abort() {
                return Err(Error::Worker(ExitStatus::Other));
            }
            match sched.write_partition(false, None)? {
                OutputFlow::Finished => return Ok(()),
                OutputFlow::Continue => {}
            }
            credits
                .post(1)
                .map_err(|e| Error::Internal(format!("credit post: {e}")))?;
        }
    })();
    match result {
        Ok(()) => ExitStatus::Ok,
        Err(e) => {
            tracing::error!(error = %e, "output worker failed");
            shared.get().set_abort();
            e.exit_status()
        }
    }
}

fn collect_callback_specs(specs: &[SubdevSpec]) -> Vec<(usize, SubdevSpec)> {
    specs
        .iter()
        .enumerate()
        .filter(|(_, s)| s.backend.is_callback())
        .map(|(i, s)| (i, s.clone()))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn callback_worker_main(
    hub: Arc<CallbackHub>,
    shared: Arc<SharedArea>,
    mode: ConcurrencyMode,
    cb_specs: [Vec<(usize, SubdevSpec)>; 2],
    partition: usize,
    rate: usize,
    rt_prio: Option<i32>,
    pipe_s: Semaphore,
    pipe_r: Semaphore,
) -> ExitStatus {
    pipe_r.never_wait();
    pipe_s.never_post();

    let init_result = init_callback_subdevs(&hub, &shared, &cb_specs, partition, rate);
    if let Err(e) = &init_result {
        tracing::error!(error = %e, "callback subdevice initialisation failed");
    }
    if pipe_r.post_msg(&[init_result.is_ok() as u8]).is_err() {
        return ExitStatus::Other;
    }
    if init_result.is_err() {
        return ExitStatus::Other;
    }

    let mut msg = [0u8; 1];
    if pipe_s.wait_msg(&mut msg).is_err() {
        return ExitStatus::Other;
    }
    let attach_result = (|| -> Result<()> {
        if mode == ConcurrencyMode::Processes {
            let ca = shared.get();
            let bufs = IoBuffers::attach(
                ca.buffer_id(),
                ca.format_bytes(Direction::Input),
                ca.format_bytes(Direction::Output),
            )?;
            hub.attach_buffers(Arc::new(bufs));
        }
        // In thread mode the initialising side installed the shared heap
        // buffers before posting the trigger.
        Ok(())
    })();
    if let Err(e) = &attach_result {
        tracing::error!(error = %e, "callback worker could not attach I/O buffers");
    }
    if pipe_r.post_msg(&[attach_result.is_ok() as u8]).is_err() || attach_result.is_err() {
        return ExitStatus::Other;
    }

    if let Some(prio) = rt_prio {
        realtime::set_realtime(prio, "callback");
    }

    let mut modules: Vec<Arc<dyn IoBackend>> = Vec::new();
    for side in &cb_specs {
        for (_, spec) in side {
            if !modules.iter().any(|m| Arc::ptr_eq(m, &spec.backend)) {
                modules.push(Arc::clone(&spec.backend));
            }
        }
    }

    // The service loop is always-on: it ends only on an explicit shutdown
    // message or a broken channel.
    loop {
        let mut msg = [0u8; 1];
        if pipe_s.wait_msg(&mut msg).is_err() {
            return ExitStatus::Other;
        }
        match msg[0] {
            crate::input::CB_MSG_START => {
                for module in &modules {
                    if let Err(e) = module.synch_start() {
                        tracing::error!(module = module.name(), error = %e, "failed to start callback module");
                        hub.fail(Error::Internal(format!(
                            "{} failed to start: {e}",
                            module.name()
                        )));
                        return ExitStatus::Other;
                    }
                }
            }
            CB_MSG_STOP => {
                for module in &modules {
                    module.synch_stop();
                }
                if pipe_r.post_msg(&[1]).is_err() {
                    return ExitStatus::Other;
                }
            }
            CB_MSG_SHUTDOWN => return ExitStatus::Ok,
            other => {
                tracing::error!(msg = other, "invalid callback service message");
                return ExitStatus::Other;
            }
        }
    }
}

fn init_callback_subdevs(
    hub: &Arc<CallbackHub>,
    shared: &Arc<SharedArea>,
    cb_specs: &[Vec<(usize, SubdevSpec)>; 2],
    partition: usize,
    rate: usize,
) -> Result<()> {
    let ca = shared.get();
    for dir in crate::DIRECTIONS {
        for (index, spec) in &cb_specs[dir.index()] {
            let registration = CallbackRegistration {
                hub: Arc::clone(hub),
                token: CallbackToken {
                    dir,
                    index: *index,
                },
            };
            let raw_layout = spec.layout(true);
            let init = spec.backend.init(
                &crate::backend::SubdevParams {
                    dir,
                    channels: &raw_layout,
                    format: spec.format,
                    rate,
                    partition,
                },
                Some(registration),
            )?;
            if init.fd.is_some() {
                return Err(Error::BackendInit {
                    backend: spec.backend.name().to_string(),
                    dir,
                    reason: "callback backend returned a descriptor".into(),
                });
            }
            let bsf = init.block_size_frames;
            if bsf == 0 || partition % bsf != 0 {
                return Err(Error::Config(format!(
                    "partition {partition} is not divisible by the callback block size {bsf}"
                )));
            }
            let channels = spec.layout(init.interleaved);
            if init.interleaved && channels.open_channels != channels.used_channels() {
                return Err(Error::Config(
                    "interleaved callback subdevices must use every opened channel".into(),
                ));
            }
            ca.set_cb_meta(dir, *index, bsf, init.interleaved);
            if spec.uses_clock {
                ca.update_cb_min_block(dir, bsf);
            }
            hub.register(build_cb_subdev(
                dir,
                *index,
                channels,
                partition,
                bsf,
                init.interleaved,
                spec.delay_buffers(partition),
            ));
        }
    }
    Ok(())
}
