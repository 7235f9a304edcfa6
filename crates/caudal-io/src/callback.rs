//! The callback scheduler.
//!
//! Callback backends own their realtime threads; the engine only ever runs
//! inside their invocations of [`CallbackHub::process`]. Each invocation
//! marshals device blocks between the backend's buffers and the common I/O
//! buffers, and the last subdevice to complete a partition releases every
//! other backend thread parked on the per-direction rendezvous barrier.
//! The barrier is a mutex plus a ready-wait semaphore plus a waiter count:
//! early arrivers bump the count and park; the last arriver resets every
//! subdevice, advances the partition counter, signals the filter side and
//! posts the semaphore once per waiter.
//!
//! The IN and OUT barriers are independent and never nested.

use crate::backend::{CallbackControl, CallbackEvent, CallbackRead, CallbackToken, CallbackWrite};
use crate::concurrency::Semaphore;
use crate::engine::IoBuffers;
use crate::shared::{CommArea, SharedArea, UNSET};
use crate::{Direction, Error, Result};
use caudal_core::{ChannelLayout, DelayBuffer, Region, mute_region};
use std::sync::{Arc, Mutex, OnceLock};

/// Runtime state of one callback subdevice.
pub(crate) struct CbSubdev {
    pub index: usize,
    pub dir: Direction,
    pub block_size_frames: usize,
    pub interleaved: bool,
    pub channels: ChannelLayout,
    pub partition: usize,
    pub region: Region,
    pub buf_size: usize,
    pub buf_left: usize,
    pub curbuf: usize,
    pub iodelay_fill: usize,
    pub frames_left: i64,
    pub db: Vec<Option<DelayBuffer>>,
    /// Byte offset and sample spacing per used channel, resolved when the
    /// common buffers attach.
    pub slots: Vec<(usize, usize)>,
    scratch: Vec<usize>,
}

impl CbSubdev {
    fn collect_muted(&mut self, ca: &CommArea) {
        self.scratch.clear();
        for (i, &name) in self.channels.names.iter().enumerate() {
            if ca.is_muted(self.dir, name) {
                self.scratch.push(self.channels.selection[i]);
            }
        }
    }

    /// Mute the window `[offset, offset + len)` of this subdevice's region.
    fn apply_mute(&mut self, ca: &CommArea, buf: &mut [u8], offset: usize, len: usize) {
        self.collect_muted(ca);
        if self.scratch.is_empty() {
            return;
        }
        let region = &mut buf[self.region.offset..self.region.offset + self.region.size];
        mute_region(
            &self.channels,
            self.interleaved,
            self.partition,
            &self.scratch,
            region,
            offset,
            len,
        );
    }

    fn apply_delay(&mut self, ca: &CommArea, buf: &mut [u8]) {
        let bytes = self.channels.format.bytes();
        for (i, db) in self.db.iter_mut().enumerate() {
            let Some(db) = db else { continue };
            let name = self.channels.names[i];
            let (offset, spacing) = self.slots[i];
            let new_delay = ca.delay(self.dir, name);
            db.update(&mut buf[offset..], bytes, spacing, new_delay);
        }
    }
}

struct DirInner {
    devs: Vec<CbSubdev>,
    waiting: usize,
}

struct DirState {
    inner: Mutex<DirInner>,
    ready_wait: Semaphore,
}

impl DirState {
    /// Release every parked worker. Called with the lock held.
    fn release_waiters(&self, inner: &mut DirInner) {
        if inner.waiting > 0 {
            let _ = self.ready_wait.post(inner.waiting);
            inner.waiting = 0;
        }
    }
}

/// The engine's callback-side scheduler.
///
/// Shared with every callback backend; all methods take `&self`.
pub struct CallbackHub {
    shared: Arc<SharedArea>,
    dirs: [DirState; 2],
    buffers: OnceLock<Arc<IoBuffers>>,
    /// Partition-complete signals towards the filter loop, per direction.
    ready: [Semaphore; 2],
    /// Credits from the filter loop: how many partitions it has consumed
    /// (input side) or produced (output side). The rendezvous waits here
    /// before advancing, which stops clock-less callback backends from
    /// lapping the filter over the double buffer.
    filter_credit: [Semaphore; 2],
    finish: Semaphore,
    error: Mutex<Option<Error>>,
}

impl CallbackHub {
    pub(crate) fn new(
        shared: Arc<SharedArea>,
        ready: [Semaphore; 2],
        filter_credit: [Semaphore; 2],
        ready_wait: [Semaphore; 2],
        finish: Semaphore,
    ) -> Self {
        let [rw_in, rw_out] = ready_wait;
        Self {
            shared,
            dirs: [
                DirState {
                    inner: Mutex::new(DirInner {
                        devs: Vec::new(),
                        waiting: 0,
                    }),
                    ready_wait: rw_in,
                },
                DirState {
                    inner: Mutex::new(DirInner {
                        devs: Vec::new(),
                        waiting: 0,
                    }),
                    ready_wait: rw_out,
                },
            ],
            buffers: OnceLock::new(),
            ready,
            filter_credit,
            finish,
            error: Mutex::new(None),
        }
    }

    pub(crate) fn register(&self, dev: CbSubdev) {
        let mut inner = self.dirs[dev.dir.index()].inner.lock().unwrap();
        inner.devs.push(dev);
    }

    /// Resolve buffer geometry once the common buffers exist. Regions and
    /// channel slots are read from the shared area, where the initialising
    /// side published them before signalling the attach.
    pub(crate) fn attach_buffers(&self, bufs: Arc<IoBuffers>) {
        let ca = self.shared.get();
        for dir in crate::DIRECTIONS {
            let mut inner = self.dirs[dir.index()].inner.lock().unwrap();
            for dev in &mut inner.devs {
                dev.region = ca.region(dir, dev.index);
                dev.buf_size = dev.region.size;
                dev.buf_left = match dir {
                    Direction::Input => dev.buf_size,
                    Direction::Output => 0,
                };
                dev.slots = dev
                    .channels
                    .names
                    .iter()
                    .map(|&name| {
                        ca.channel_slot(dir, name)
                            .expect("mapped channel missing from shared format")
                    })
                    .collect();
            }
        }
        let _ = self.buffers.set(bufs);
    }

    /// Record a fatal callback-side failure and unwedge every worker.
    pub(crate) fn fail(&self, err: Error) {
        tracing::error!(error = %err, "callback scheduler failure");
        *self.error.lock().unwrap() = Some(err);
        let ca = self.shared.get();
        ca.set_abort();
        // Credits first: a rendezvous caller may be blocked on them while
        // holding the direction lock.
        for dir in crate::DIRECTIONS {
            let _ = self.filter_credit[dir.index()].post(crate::shared::MAX_SUBDEVS);
        }
        for dir in crate::DIRECTIONS {
            let state = &self.dirs[dir.index()];
            let mut inner = state.inner.lock().unwrap();
            state.release_waiters(&mut inner);
            drop(inner);
            let _ = self.ready[dir.index()].post(crate::shared::MAX_SUBDEVS);
        }
        let _ = self.finish.post(1);
    }

    /// Release callback workers that may be parked on filter credits during
    /// shutdown, so their backends can observe their stop flags.
    pub(crate) fn release_for_shutdown(&self) {
        for dir in crate::DIRECTIONS {
            let _ = self.filter_credit[dir.index()].post(1024);
        }
    }

    /// Take the recorded failure, if any.
    pub(crate) fn take_error(&self) -> Option<Error> {
        self.error.lock().unwrap().take()
    }

    fn buffers(&self) -> Result<&Arc<IoBuffers>> {
        self.buffers
            .get()
            .ok_or_else(|| Error::Internal("callback before buffer attach".into()))
    }

    /// One backend invocation: exchange blocks and run the rendezvous.
    ///
    /// See [`CallbackEvent`] for the event semantics. The return value
    /// steers the backend's shutdown: [`CallbackControl::Final`] carries the
    /// payload frames of the final partial block.
    pub fn process(
        &self,
        inputs: &[CallbackRead<'_>],
        outputs: &mut [CallbackWrite<'_, '_>],
        frame_count: usize,
        event: CallbackEvent,
    ) -> Result<CallbackControl> {
        let ca = self.shared.get();
        match event {
            CallbackEvent::LastInput => {
                ca.note_cb_last_input(frame_count as i64);
                return Ok(CallbackControl::Continue);
            }
            CallbackEvent::Finished => {
                for w in outputs.iter() {
                    ca.set_finished(Direction::Output, w.token.index);
                }
                for dir in crate::DIRECTIONS {
                    let state = &self.dirs[dir.index()];
                    let mut inner = state.inner.lock().unwrap();
                    state.release_waiters(&mut inner);
                }
                if ca.all_finished(Direction::Output) {
                    tracing::info!("finished");
                    let _ = self.finish.post(1);
                }
                return Ok(CallbackControl::Stop);
            }
            CallbackEvent::Error => {
                let err = Error::Internal("callback I/O module reported an error".into());
                self.fail(Error::Internal(
                    "callback I/O module reported an error".into(),
                ));
                return Err(err);
            }
            CallbackEvent::Normal => {}
        }
        if frame_count == 0 {
            let err = Error::Internal("callback with zero frame count".into());
            self.fail(Error::Internal("callback with zero frame count".into()));
            return Err(err);
        }

        if !inputs.is_empty() {
            self.process_inputs(ca, inputs, frame_count)?;
        }
        if !outputs.is_empty() {
            return self.process_outputs(ca, outputs, frame_count);
        }
        Ok(CallbackControl::Continue)
    }

    fn process_inputs(
        &self,
        ca: &CommArea,
        inputs: &[CallbackRead<'_>],
        frame_count: usize,
    ) -> Result<()> {
        let bufs = Arc::clone(self.buffers()?);
        let state = &self.dirs[Direction::Input.index()];
        let mut inner = state.inner.lock().unwrap();

        for read in inputs {
            let dev = dev_mut(&mut inner.devs, read.token)?;
            if frame_count != dev.block_size_frames {
                let err = format!(
                    "unexpected callback block alignment (got {frame_count}, expected {})",
                    dev.block_size_frames
                );
                drop(inner);
                self.fail(Error::Internal(err.clone()));
                return Err(Error::Internal(err));
            }
            // SAFETY: callback input subdevices own their regions of the
            // current input slot; the rendezvous sequences slot reuse.
            let buf = unsafe { bufs.slot_mut(Direction::Input, dev.curbuf) };
            copy_in(dev, read.planes, frame_count, buf)?;
            if dev.buf_left == 0 {
                dev.curbuf ^= 1;
                dev.apply_mute(ca, buf, 0, dev.buf_size);
                dev.apply_delay(ca, buf);
            }
        }

        // Rendezvous: the caller whose first subdevice completed checks
        // whether the whole direction is done with this partition.
        let first_done = dev_mut(&mut inner.devs, inputs[0].token)?.buf_left == 0;
        if first_done {
            if inner.devs.iter().all(|d| d.buf_left == 0) {
                // The filter must be done with the slot the next partition
                // lands in before anyone writes there again.
                self.filter_credit[Direction::Input.index()]
                    .wait(1)
                    .map_err(|e| Error::Internal(format!("filter credit wait failed: {e}")))?;
                for d in &mut inner.devs {
                    d.buf_left = d.buf_size;
                }
                ca.advance_cb_buf_index(Direction::Input);
                let _ = self.ready[Direction::Input.index()].post(1);
                state.release_waiters(&mut inner);
            } else {
                inner.waiting += 1;
                drop(inner);
                state
                    .ready_wait
                    .wait(1)
                    .map_err(|e| Error::Internal(format!("rendezvous wait failed: {e}")))?;
            }
        }
        Ok(())
    }

    fn process_outputs(
        &self,
        ca: &CommArea,
        outputs: &mut [CallbackWrite<'_, '_>],
        frame_count: usize,
    ) -> Result<CallbackControl> {
        let bufs = Arc::clone(self.buffers()?);
        let state = &self.dirs[Direction::Output.index()];
        let mut inner = state.inner.lock().unwrap();

        // Rendezvous first: a caller arriving with a drained partition and
        // no priming left either advances the partition or parks until the
        // rest of the direction catches up.
        {
            let dev0 = dev_mut(&mut inner.devs, outputs[0].token)?;
            if dev0.buf_left == 0 && dev0.iodelay_fill == 0 {
                if inner
                    .devs
                    .iter()
                    .all(|d| d.buf_left == 0 && d.iodelay_fill == 0)
                {
                    // Wait for the filter to have produced the partition
                    // about to be drained.
                    self.filter_credit[Direction::Output.index()]
                        .wait(1)
                        .map_err(|e| Error::Internal(format!("filter credit wait failed: {e}")))?;
                    for d in &mut inner.devs {
                        d.buf_left = d.buf_size;
                    }
                    ca.advance_cb_buf_index(Direction::Output);
                    let _ = self.ready[Direction::Output.index()].post(1);
                    state.release_waiters(&mut inner);
                } else {
                    inner.waiting += 1;
                    drop(inner);
                    state
                        .ready_wait
                        .wait(1)
                        .map_err(|e| Error::Internal(format!("rendezvous wait failed: {e}")))?;
                    inner = state.inner.lock().unwrap();
                }
            }
        }

        for write in outputs.iter_mut() {
            let dev = dev_mut(&mut inner.devs, write.token)?;
            if frame_count != dev.block_size_frames {
                let err = format!(
                    "unexpected callback block alignment (got {frame_count}, expected {})",
                    dev.block_size_frames
                );
                drop(inner);
                self.fail(Error::Internal(err.clone()));
                return Err(Error::Internal(err));
            }
            if dev.iodelay_fill > 0 {
                for plane in write.planes.iter_mut() {
                    plane.fill(0);
                }
                dev.iodelay_fill -= 1;
                continue;
            }
            // SAFETY: callback output subdevices own their regions of the
            // current output slot; the rendezvous sequences slot reuse.
            let buf = unsafe { bufs.slot_mut(Direction::Output, dev.curbuf) };
            if dev.buf_left == dev.buf_size {
                dev.apply_delay(ca, buf);
            }
            let count = frame_count * dev.channels.used_channels() * dev.channels.format.bytes();
            let done = dev.buf_size - dev.buf_left;
            dev.apply_mute(ca, buf, done, count);
            copy_out(dev, write.planes, frame_count, buf)?;
            if dev.buf_left == 0 {
                dev.curbuf ^= 1;
            }
        }

        // Last-block countdown, steered by this backend's first output
        // subdevice. The earliest recorded last index wins.
        let buf_index = ca
            .cb_buf_index(Direction::Input)
            .max(ca.cb_buf_index(Direction::Output));
        let dev0 = dev_mut(&mut inner.devs, outputs[0].token)?;
        if dev0.frames_left == UNSET {
            let frames_left = ca.frames_left();
            let cb_frames_left = ca.cb_frames_left();
            let at_last = (frames_left != UNSET && buf_index == ca.lastbuf_index() + 1)
                || (cb_frames_left != UNSET && buf_index == ca.cb_lastbuf_index() + 1);
            if at_last {
                if cb_frames_left != UNSET && (frames_left == UNSET || frames_left > cb_frames_left)
                {
                    ca.adopt_cb_frames_left();
                }
                dev0.frames_left = ca.frames_left();
            }
        }
        if dev0.frames_left != UNSET {
            if dev0.frames_left > dev0.block_size_frames as i64 {
                dev0.frames_left -= dev0.block_size_frames as i64;
                return Ok(CallbackControl::Continue);
            }
            if dev0.frames_left == 0 {
                return Ok(CallbackControl::Stop);
            }
            return Ok(CallbackControl::Final(dev0.frames_left as usize));
        }
        Ok(CallbackControl::Continue)
    }
}

fn dev_mut<'a>(devs: &'a mut [CbSubdev], token: CallbackToken) -> Result<&'a mut CbSubdev> {
    devs.iter_mut()
        .find(|d| d.index == token.index)
        .ok_or_else(|| Error::Internal(format!("unknown callback subdevice {}", token.index)))
}

/// Copy one device block from the backend's planes into the common buffer.
fn copy_in(dev: &mut CbSubdev, planes: &[&[u8]], frame_count: usize, buf: &mut [u8]) -> Result<()> {
    let used = dev.channels.used_channels();
    let bytes = dev.channels.format.bytes();
    let count = frame_count * used * bytes;
    let done = dev.buf_size - dev.buf_left;
    if dev.interleaved {
        let [plane] = planes else {
            return Err(Error::Internal("interleaved input expects one plane".into()));
        };
        let dst = &mut buf[dev.region.offset + done..dev.region.offset + done + count];
        dst.copy_from_slice(&plane[..count]);
    } else {
        if planes.len() != used {
            return Err(Error::Internal("planar input expects one plane per channel".into()));
        }
        let per_chan = count / used;
        let chan_stride = dev.partition * bytes;
        let mut dst = dev.region.offset + done / used;
        for plane in planes {
            buf[dst..dst + per_chan].copy_from_slice(&plane[..per_chan]);
            dst += chan_stride;
        }
    }
    dev.buf_left -= count;
    Ok(())
}

/// Copy one device block from the common buffer into the backend's planes.
fn copy_out(
    dev: &mut CbSubdev,
    planes: &mut [&mut [u8]],
    frame_count: usize,
    buf: &[u8],
) -> Result<()> {
    let used = dev.channels.used_channels();
    let bytes = dev.channels.format.bytes();
    let count = frame_count * used * bytes;
    let done = dev.buf_size - dev.buf_left;
    if dev.interleaved {
        let [plane] = planes else {
            return Err(Error::Internal("interleaved output expects one plane".into()));
        };
        let src = &buf[dev.region.offset + done..dev.region.offset + done + count];
        plane[..count].copy_from_slice(src);
    } else {
        if planes.len() != used {
            return Err(Error::Internal(
                "planar output expects one plane per channel".into(),
            ));
        }
        let per_chan = count / used;
        let chan_stride = dev.partition * bytes;
        let mut src = dev.region.offset + done / used;
        for plane in planes.iter_mut() {
            plane[..per_chan].copy_from_slice(&buf[src..src + per_chan]);
            src += chan_stride;
        }
    }
    dev.buf_left -= count;
    Ok(())
}

/// Build the runtime state of one callback subdevice. Regions and channel
/// slots stay empty until [`CallbackHub::attach_buffers`] resolves them.
pub(crate) fn build_cb_subdev(
    dir: Direction,
    index: usize,
    channels: ChannelLayout,
    partition: usize,
    block_size_frames: usize,
    interleaved: bool,
    db: Vec<Option<DelayBuffer>>,
) -> CbSubdev {
    let iodelay_fill = match dir {
        Direction::Input => 0,
        Direction::Output => 2 * partition / block_size_frames - 2,
    };
    CbSubdev {
        index,
        dir,
        block_size_frames,
        interleaved,
        channels,
        partition,
        region: Region::default(),
        buf_size: 0,
        buf_left: 0,
        curbuf: 0,
        iodelay_fill,
        frames_left: UNSET,
        db,
        slots: Vec::new(),
        scratch: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyMode;
    use crate::engine::IoBuffers;
    use caudal_core::{BufferFormat, SampleFormat};

    fn sem() -> Semaphore {
        Semaphore::new(ConcurrencyMode::Threads).unwrap()
    }

    fn stereo(names: [usize; 2]) -> ChannelLayout {
        ChannelLayout {
            open_channels: 2,
            names: names.to_vec(),
            selection: vec![0, 1],
            format: SampleFormat::s16_le(),
        }
    }

    /// Two callback input subdevices, each presented by its own thread:
    /// the barrier must release exactly both per round and the partition
    /// counter must advance by one per round, never skipping.
    #[test]
    fn rendezvous_releases_all_and_never_skips() {
        let partition = 8;
        let rounds = 50;
        let shared = Arc::new(SharedArea::new(ConcurrencyMode::Threads).unwrap());
        let ready_in = sem();
        let credit_in = sem();
        // Stand in for the filter loop: grant enough consumption credits up
        // front for every round.
        credit_in.post(rounds).unwrap();
        let hub = Arc::new(CallbackHub::new(
            Arc::clone(&shared),
            [ready_in.clone(), sem()],
            [credit_in, sem()],
            [sem(), sem()],
            sem(),
        ));

        let layouts = [stereo([0, 1]), stereo([2, 3])];
        let subdevs: Vec<(ChannelLayout, bool)> =
            layouts.iter().map(|l| (l.clone(), true)).collect();
        let (fmt, regions) = BufferFormat::compute(partition, &subdevs).unwrap();
        let ca = shared.get();
        ca.publish_format(Direction::Input, &fmt);
        for (i, r) in regions.iter().enumerate() {
            ca.publish_region(Direction::Input, i, *r);
        }

        for (i, l) in layouts.iter().enumerate() {
            hub.register(build_cb_subdev(
                Direction::Input,
                i,
                l.clone(),
                partition,
                partition,
                true,
                vec![None, None],
            ));
        }
        let bufs = Arc::new(
            IoBuffers::allocate(ConcurrencyMode::Threads, fmt.n_bytes, 64).unwrap(),
        );
        hub.attach_buffers(Arc::clone(&bufs));

        let mut workers = Vec::new();
        for index in 0..2 {
            let hub = Arc::clone(&hub);
            workers.push(std::thread::spawn(move || {
                let block = vec![1u8; partition * 2 * 2];
                for _ in 0..rounds {
                    let planes: [&[u8]; 1] = [&block];
                    let read = CallbackRead {
                        token: CallbackToken {
                            dir: Direction::Input,
                            index,
                        },
                        planes: &planes,
                    };
                    let ctl = hub
                        .process(&[read], &mut [], partition, CallbackEvent::Normal)
                        .unwrap();
                    assert_eq!(ctl, CallbackControl::Continue);
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(ca.cb_buf_index(Direction::Input), rounds as i64);
        // The filter side received exactly one signal per round.
        ready_in.wait(rounds).unwrap();
    }
}
