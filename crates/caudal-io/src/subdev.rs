//! Subdevice specifications and runtime state.

use crate::backend::IoBackend;
use crate::shared::CommArea;
use crate::Direction;
use caudal_core::{BufferFormat, ChannelLayout, DelayBuffer, Region, SampleFormat, mute_region};
use std::os::fd::RawFd;
use std::sync::Arc;

/// How one engine channel maps onto a physical channel of a subdevice.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    /// Global physical channel id.
    pub physical: usize,
    /// Index within a device frame (interleaved devices).
    pub selection: usize,
    /// Delay in samples applied from the first partition.
    pub initial_delay: usize,
    /// Upper bound for runtime delay changes.
    pub max_delay: usize,
    /// Whether the channel starts muted.
    pub muted: bool,
    /// True when exactly one virtual channel feeds this physical channel;
    /// only then does the engine own a delay buffer for it. Shared channels
    /// are delayed upstream by the filter stage.
    pub direct_mapping: bool,
}

impl ChannelBinding {
    /// A directly mapped channel at frame slot `physical`.
    pub fn direct(physical: usize) -> Self {
        Self {
            physical,
            selection: physical,
            initial_delay: 0,
            max_delay: 0,
            muted: false,
            direct_mapping: true,
        }
    }

    /// Override the frame slot.
    pub fn with_selection(mut self, selection: usize) -> Self {
        self.selection = selection;
        self
    }

    /// Configure the initial delay and its upper bound.
    pub fn with_delay(mut self, initial: usize, max: usize) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Start with the channel muted.
    pub fn start_muted(mut self) -> Self {
        self.muted = true;
        self
    }

    /// Mark the channel as fed by multiple virtual channels.
    pub fn shared(mut self) -> Self {
        self.direct_mapping = false;
        self
    }
}

/// Specification of one subdevice to open.
#[derive(Clone)]
pub struct SubdevSpec {
    /// The backend module that owns the device.
    pub backend: Arc<dyn IoBackend>,
    /// Channels the backend opens on the device.
    pub open_channels: usize,
    /// The channels the engine uses, in slot order.
    pub channels: Vec<ChannelBinding>,
    /// Sample format exchanged with the device.
    pub format: SampleFormat,
    /// Whether the device clock drives the schedule.
    pub uses_clock: bool,
}

impl SubdevSpec {
    /// The channel layout this spec describes, normalized for the access
    /// mode the backend reported.
    pub(crate) fn layout(&self, interleaved: bool) -> ChannelLayout {
        let layout = ChannelLayout {
            open_channels: self.open_channels,
            names: self.channels.iter().map(|c| c.physical).collect(),
            selection: self.channels.iter().map(|c| c.selection).collect(),
            format: self.format,
        };
        if interleaved {
            layout
        } else {
            layout.normalized_planar()
        }
    }

    /// Build the per-channel delay buffers for this spec.
    pub(crate) fn delay_buffers(&self, partition: usize) -> Vec<Option<DelayBuffer>> {
        self.channels
            .iter()
            .map(|c| {
                if c.direct_mapping {
                    Some(DelayBuffer::new(
                        partition,
                        c.initial_delay,
                        c.max_delay,
                        self.format,
                    ))
                } else {
                    None
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for SubdevSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubdevSpec")
            .field("backend", &self.backend.name())
            .field("open_channels", &self.open_channels)
            .field("channels", &self.channels)
            .field("uses_clock", &self.uses_clock)
            .finish()
    }
}

/// Runtime state of one blocking (fd-driven) subdevice.
pub(crate) struct Subdev {
    pub index: usize,
    pub dir: Direction,
    pub backend: Arc<dyn IoBackend>,
    pub fd: RawFd,
    pub uses_clock: bool,
    pub interleaved: bool,
    pub bad_alignment: bool,
    pub block_size_frames: usize,
    /// Device block size in bytes; 0 when the device has no native block.
    pub block_size: usize,
    pub channels: ChannelLayout,
    pub partition: usize,
    pub region: Region,
    /// Bytes exchanged per partition; shrinks on the final partition.
    pub buf_size: usize,
    /// Bytes still to move this partition.
    pub buf_left: usize,
    pub db: Vec<Option<DelayBuffer>>,
}

impl Subdev {
    /// Bytes per device frame.
    pub fn frame_size(&self) -> usize {
        self.channels.frame_bytes()
    }

    /// Collect the frame slots of currently muted channels into `out`.
    pub fn collect_muted(&self, ca: &CommArea, out: &mut Vec<usize>) {
        out.clear();
        for (i, &name) in self.channels.names.iter().enumerate() {
            if ca.is_muted(self.dir, name) {
                out.push(self.channels.selection[i]);
            }
        }
    }

    /// Apply the mute engine over `[offset, offset + len)` of this
    /// subdevice's region inside the direction buffer.
    pub fn apply_mute(
        &self,
        ca: &CommArea,
        buf: &mut [u8],
        offset: usize,
        len: usize,
        scratch: &mut Vec<usize>,
    ) {
        self.collect_muted(ca, scratch);
        if scratch.is_empty() {
            return;
        }
        let region = &mut buf[self.region.offset..self.region.offset + self.region.size];
        mute_region(
            &self.channels,
            self.interleaved,
            self.partition,
            scratch,
            region,
            offset,
            len,
        );
    }

    /// Run every direct-mapped channel of this subdevice through its delay
    /// buffer, picking up delay changes from the shared area.
    pub fn apply_delay(&mut self, ca: &CommArea, buf: &mut [u8], format: &BufferFormat) {
        let bytes = self.channels.format.bytes();
        for (i, db) in self.db.iter_mut().enumerate() {
            let Some(db) = db else { continue };
            let name = self.channels.names[i];
            let slot = format
                .channel(name)
                .expect("mapped channel missing from buffer format");
            let new_delay = ca.delay(self.dir, name);
            db.update(
                &mut buf[slot.byte_offset..],
                bytes,
                slot.sample_spacing,
                new_delay,
            );
        }
    }
}
