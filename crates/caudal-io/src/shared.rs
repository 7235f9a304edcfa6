//! The shared communication area.
//!
//! One zero-initialised block, visible to every worker regardless of
//! concurrency mode, carries all cross-worker state: the last-block
//! counters of both scheduling paths, per-channel mute and delay words,
//! per-subdevice finished flags, and the buffer geometry a late-attaching
//! callback worker needs. All counters are monotone (only ever tightened)
//! and every field is an atomic, so plain shared references are sound in
//! both modes.

use crate::Direction;
use crate::concurrency::{ConcurrencyMode, SharedRegion};
use caudal_core::{MAX_CHANNELS, Region};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};

/// Highest number of subdevices per direction.
pub const MAX_SUBDEVS: usize = 32;

/// Sentinel for "not recorded yet" in the last-block counters.
pub(crate) const UNSET: i64 = -1;

const ORD: Ordering = Ordering::SeqCst;

/// Geometry of one direction's common buffer, as mirrored in the shared
/// area for workers that attach late.
#[repr(C)]
struct RawFormat {
    n_bytes: AtomicU32,
    /// Sample spacing per physical channel; 0 marks an unmapped channel.
    slot_spacing: [AtomicU32; MAX_CHANNELS],
    slot_offset: [AtomicU32; MAX_CHANNELS],
}

#[repr(C)]
struct RawRegion {
    offset: AtomicU32,
    size: AtomicU32,
}

#[repr(C)]
struct CbMeta {
    present: AtomicBool,
    interleaved: AtomicBool,
    block_size_frames: AtomicU32,
}

/// The communication area proper. Lives inside a [`SharedRegion`] and is
/// only ever accessed through shared references.
#[repr(C)]
pub(crate) struct CommArea {
    abort: AtomicBool,
    blocking_stopped: AtomicBool,
    frames_left: AtomicI64,
    lastbuf_index: AtomicI64,
    cb_frames_left: AtomicI64,
    cb_lastbuf_index: AtomicI64,
    cb_buf_index: [AtomicI64; 2],
    buffer_id: AtomicI32,
    n_subdevs: [AtomicU32; 2],
    cb_min_block: [AtomicU32; 2],
    muted: [[AtomicBool; MAX_CHANNELS]; 2],
    direct: [[AtomicBool; MAX_CHANNELS]; 2],
    delay: [[AtomicU32; MAX_CHANNELS]; 2],
    finished: [[AtomicBool; MAX_SUBDEVS]; 2],
    cb_meta: [[CbMeta; MAX_SUBDEVS]; 2],
    regions: [[RawRegion; MAX_SUBDEVS]; 2],
    formats: [RawFormat; 2],
}

/// Owner of the communication area's backing region.
pub(crate) struct SharedArea {
    region: SharedRegion,
}

impl SharedArea {
    pub fn new(mode: ConcurrencyMode) -> std::io::Result<Self> {
        let region = SharedRegion::anonymous(mode, std::mem::size_of::<CommArea>())?;
        let area = Self { region };
        let ca = area.get();
        ca.frames_left.store(UNSET, ORD);
        ca.lastbuf_index.store(UNSET, ORD);
        ca.cb_frames_left.store(UNSET, ORD);
        ca.cb_lastbuf_index.store(UNSET, ORD);
        ca.buffer_id.store(-1, ORD);
        Ok(area)
    }

    /// The communication area. The region is zero-initialised, which is a
    /// valid bit pattern for every field.
    pub fn get(&self) -> &CommArea {
        // SAFETY: the region is at least as large as CommArea, suitably
        // aligned (page or 64-byte), and all fields are atomics.
        unsafe { &*self.region.as_ptr().cast::<CommArea>() }
    }
}

impl CommArea {
    // ----- last-block controller ------------------------------------------

    pub fn frames_left(&self) -> i64 {
        self.frames_left.load(ORD)
    }

    pub fn cb_frames_left(&self) -> i64 {
        self.cb_frames_left.load(ORD)
    }

    pub fn lastbuf_index(&self) -> i64 {
        self.lastbuf_index.load(ORD)
    }

    pub fn cb_lastbuf_index(&self) -> i64 {
        self.cb_lastbuf_index.load(ORD)
    }

    /// Record a short read on the blocking path: `frames` of payload in
    /// partition `index`. Both counters only tighten.
    pub fn note_short_read(&self, frames: i64, index: i64) {
        tighten(&self.frames_left, frames);
        tighten(&self.lastbuf_index, index);
    }

    /// Record a LAST_INPUT event on the callback path.
    pub fn note_cb_last_input(&self, frames: i64) {
        tighten(&self.cb_frames_left, frames);
        tighten(&self.cb_lastbuf_index, self.cb_buf_index(Direction::Input));
    }

    /// Adopt the callback residual as the authoritative global residual.
    pub fn adopt_cb_frames_left(&self) {
        tighten(&self.frames_left, self.cb_frames_left.load(ORD));
    }

    pub fn cb_buf_index(&self, dir: Direction) -> i64 {
        self.cb_buf_index[dir.index()].load(ORD)
    }

    pub fn advance_cb_buf_index(&self, dir: Direction) -> i64 {
        self.cb_buf_index[dir.index()].fetch_add(1, ORD) + 1
    }

    // ----- run state ------------------------------------------------------

    pub fn abort(&self) -> bool {
        self.abort.load(ORD)
    }

    pub fn set_abort(&self) {
        self.abort.store(true, ORD);
    }

    pub fn set_blocking_stopped(&self) {
        self.blocking_stopped.store(true, ORD);
    }

    #[allow(dead_code)]
    pub fn blocking_stopped(&self) -> bool {
        self.blocking_stopped.load(ORD)
    }

    // ----- control state --------------------------------------------------

    pub fn is_muted(&self, dir: Direction, channel: usize) -> bool {
        self.muted[dir.index()][channel].load(ORD)
    }

    pub fn set_muted(&self, dir: Direction, channel: usize, muted: bool) {
        self.muted[dir.index()][channel].store(muted, ORD);
    }

    pub fn toggle_muted(&self, dir: Direction, channel: usize) {
        self.muted[dir.index()][channel].fetch_xor(true, ORD);
    }

    pub fn delay(&self, dir: Direction, channel: usize) -> usize {
        self.delay[dir.index()][channel].load(ORD) as usize
    }

    pub fn set_delay(&self, dir: Direction, channel: usize, delay: usize) {
        self.delay[dir.index()][channel].store(delay as u32, ORD);
    }

    pub fn is_direct(&self, dir: Direction, channel: usize) -> bool {
        self.direct[dir.index()][channel].load(ORD)
    }

    pub fn set_direct(&self, dir: Direction, channel: usize) {
        self.direct[dir.index()][channel].store(true, ORD);
    }

    // ----- subdevice registry ---------------------------------------------

    pub fn set_n_subdevs(&self, dir: Direction, n: usize) {
        self.n_subdevs[dir.index()].store(n as u32, ORD);
    }

    pub fn set_finished(&self, dir: Direction, index: usize) {
        self.finished[dir.index()][index].store(true, ORD);
    }

    /// Whether every subdevice of the direction has reported end of stream.
    pub fn all_finished(&self, dir: Direction) -> bool {
        let n = self.n_subdevs[dir.index()].load(ORD) as usize;
        (0..n).all(|i| self.finished[dir.index()][i].load(ORD))
    }

    // ----- callback init metadata -----------------------------------------

    pub fn set_cb_meta(&self, dir: Direction, index: usize, block_size_frames: usize, interleaved: bool) {
        let meta = &self.cb_meta[dir.index()][index];
        meta.block_size_frames.store(block_size_frames as u32, ORD);
        meta.interleaved.store(interleaved, ORD);
        meta.present.store(true, ORD);
    }

    pub fn cb_meta(&self, dir: Direction, index: usize) -> Option<(usize, bool)> {
        let meta = &self.cb_meta[dir.index()][index];
        if !meta.present.load(ORD) {
            return None;
        }
        Some((
            meta.block_size_frames.load(ORD) as usize,
            meta.interleaved.load(ORD),
        ))
    }

    pub fn update_cb_min_block(&self, dir: Direction, block_size_frames: usize) {
        let cell = &self.cb_min_block[dir.index()];
        let new = block_size_frames as u32;
        let _ = cell.fetch_update(ORD, ORD, |cur| {
            if cur == 0 || new < cur { Some(new) } else { None }
        });
    }

    pub fn cb_min_block(&self, dir: Direction) -> usize {
        self.cb_min_block[dir.index()].load(ORD) as usize
    }

    // ----- buffer geometry ------------------------------------------------

    pub fn set_buffer_id(&self, id: i32) {
        self.buffer_id.store(id, ORD);
    }

    pub fn buffer_id(&self) -> i32 {
        self.buffer_id.load(ORD)
    }

    pub fn publish_region(&self, dir: Direction, index: usize, region: Region) {
        let raw = &self.regions[dir.index()][index];
        raw.offset.store(region.offset as u32, ORD);
        raw.size.store(region.size as u32, ORD);
    }

    pub fn region(&self, dir: Direction, index: usize) -> Region {
        let raw = &self.regions[dir.index()][index];
        Region {
            offset: raw.offset.load(ORD) as usize,
            size: raw.size.load(ORD) as usize,
        }
    }

    pub fn publish_format(&self, dir: Direction, format: &caudal_core::BufferFormat) {
        let raw = &self.formats[dir.index()];
        raw.n_bytes.store(format.n_bytes as u32, ORD);
        for (ch, slot) in format.channels() {
            raw.slot_offset[ch].store(slot.byte_offset as u32, ORD);
            raw.slot_spacing[ch].store(slot.sample_spacing as u32, ORD);
        }
    }

    pub fn format_bytes(&self, dir: Direction) -> usize {
        self.formats[dir.index()].n_bytes.load(ORD) as usize
    }

    /// Byte offset and sample spacing of a mapped physical channel.
    pub fn channel_slot(&self, dir: Direction, channel: usize) -> Option<(usize, usize)> {
        let raw = &self.formats[dir.index()];
        let spacing = raw.slot_spacing[channel].load(ORD) as usize;
        if spacing == 0 {
            return None;
        }
        Some((raw.slot_offset[channel].load(ORD) as usize, spacing))
    }
}

/// Lower `cell` to `value`, treating the sentinel as "no value yet".
fn tighten(cell: &AtomicI64, value: i64) {
    let _ = cell.fetch_update(ORD, ORD, |cur| {
        if cur == UNSET || value < cur {
            Some(value)
        } else {
            None
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> SharedArea {
        SharedArea::new(ConcurrencyMode::Threads).unwrap()
    }

    #[test]
    fn counters_start_unset() {
        let a = area();
        assert_eq!(a.get().frames_left(), UNSET);
        assert_eq!(a.get().lastbuf_index(), UNSET);
        assert_eq!(a.get().cb_frames_left(), UNSET);
    }

    #[test]
    fn counters_only_tighten() {
        let a = area();
        let ca = a.get();
        ca.note_short_read(100, 7);
        ca.note_short_read(250, 9);
        assert_eq!(ca.frames_left(), 100);
        assert_eq!(ca.lastbuf_index(), 7);
        ca.note_short_read(40, 3);
        assert_eq!(ca.frames_left(), 40);
        assert_eq!(ca.lastbuf_index(), 3);
    }

    #[test]
    fn mute_toggles() {
        let a = area();
        let ca = a.get();
        assert!(!ca.is_muted(Direction::Output, 0));
        ca.toggle_muted(Direction::Output, 0);
        assert!(ca.is_muted(Direction::Output, 0));
        ca.toggle_muted(Direction::Output, 0);
        assert!(!ca.is_muted(Direction::Output, 0));
    }

    #[test]
    fn finished_tracking() {
        let a = area();
        let ca = a.get();
        ca.set_n_subdevs(Direction::Output, 2);
        assert!(!ca.all_finished(Direction::Output));
        ca.set_finished(Direction::Output, 0);
        assert!(!ca.all_finished(Direction::Output));
        ca.set_finished(Direction::Output, 1);
        assert!(ca.all_finished(Direction::Output));
    }

    #[test]
    fn format_mirror_roundtrip() {
        use caudal_core::{BufferFormat, ChannelLayout, SampleFormat};
        let lay = ChannelLayout {
            open_channels: 2,
            names: vec![0, 1],
            selection: vec![0, 1],
            format: SampleFormat::s16_le(),
        };
        let (fmt, regions) = BufferFormat::compute(64, &[(lay, true)]).unwrap();
        let a = area();
        let ca = a.get();
        ca.publish_format(Direction::Input, &fmt);
        ca.publish_region(Direction::Input, 0, regions[0]);
        assert_eq!(ca.format_bytes(Direction::Input), fmt.n_bytes);
        assert_eq!(ca.channel_slot(Direction::Input, 1), Some((2, 2)));
        assert_eq!(ca.channel_slot(Direction::Input, 5), None);
        assert_eq!(ca.region(Direction::Input, 0), regions[0]);
    }
}
