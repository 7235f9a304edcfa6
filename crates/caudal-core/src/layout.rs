//! Channel layouts and the common-buffer format calculator.
//!
//! Every subdevice of one direction shares a single flat byte buffer. The
//! calculator walks the ordered subdevice list once and records, for every
//! physical channel, where its samples live (`byte_offset`) and how far
//! apart consecutive samples are (`sample_spacing`). Interleaved subdevices
//! contribute one region of `open_channels × frames` samples with spacing
//! `open_channels`; planar subdevices contribute one contiguous sub-region
//! per used channel with spacing 1. The running total is padded to
//! [`ALIGNMENT`] after every subdevice.

use crate::format::SampleFormat;
use thiserror::Error;

/// Highest number of physical channels per direction.
pub const MAX_CHANNELS: usize = 64;

/// Byte alignment of every subdevice region and of the total buffer size.
pub const ALIGNMENT: usize = 32;

/// Errors from buffer-format computation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// A physical channel id is outside `[0, MAX_CHANNELS)`.
    #[error("physical channel {0} out of range (max {MAX_CHANNELS})")]
    ChannelOutOfRange(usize),

    /// Two subdevices claim the same physical channel.
    #[error("physical channel {0} mapped by more than one subdevice")]
    DuplicateChannel(usize),

    /// A frame index points outside the opened channel count.
    #[error("channel selection {selection} out of range for {open} open channels")]
    SelectionOutOfRange {
        /// The offending frame index.
        selection: usize,
        /// Channels opened on the device.
        open: usize,
    },

    /// More channels used than opened.
    #[error("{used} used channels exceed {open} open channels")]
    UsedExceedsOpen {
        /// Channels the engine uses.
        used: usize,
        /// Channels opened on the device.
        open: usize,
    },

    /// A subdevice maps no channels at all.
    #[error("subdevice maps no channels")]
    Empty,
}

/// The channel mapping of one subdevice.
#[derive(Debug, Clone)]
pub struct ChannelLayout {
    /// Channels the backend opens on the device.
    pub open_channels: usize,
    /// Physical channel id per used slot.
    pub names: Vec<usize>,
    /// Index within a device frame per used slot (interleaved devices).
    pub selection: Vec<usize>,
    /// Sample format of every channel of this subdevice.
    pub format: SampleFormat,
}

impl ChannelLayout {
    /// Channels the engine actually uses.
    pub fn used_channels(&self) -> usize {
        self.names.len()
    }

    /// Bytes per device frame (all open channels).
    pub fn frame_bytes(&self) -> usize {
        self.open_channels * self.format.bytes()
    }

    /// Rewrite the layout for planar access: the device is opened with
    /// exactly the used channels and the selection becomes the identity.
    pub fn normalized_planar(mut self) -> Self {
        self.open_channels = self.names.len();
        self.selection = (0..self.names.len()).collect();
        self
    }

    fn validate(&self) -> Result<(), LayoutError> {
        let used = self.used_channels();
        if used == 0 {
            return Err(LayoutError::Empty);
        }
        if used > self.open_channels {
            return Err(LayoutError::UsedExceedsOpen {
                used,
                open: self.open_channels,
            });
        }
        for &sel in &self.selection {
            if sel >= self.open_channels {
                return Err(LayoutError::SelectionOutOfRange {
                    selection: sel,
                    open: self.open_channels,
                });
            }
        }
        Ok(())
    }
}

/// Where one physical channel lives inside the common buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSlot {
    /// Byte offset of the channel's first sample.
    pub byte_offset: usize,
    /// Distance between consecutive samples, in samples.
    pub sample_spacing: usize,
    /// Sample format of the channel.
    pub format: SampleFormat,
}

/// One subdevice's byte region inside the common buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    /// First byte of the region.
    pub offset: usize,
    /// Region length in bytes (one partition's worth).
    pub size: usize,
}

/// The flat byte layout of one direction's common I/O buffer.
#[derive(Debug, Clone)]
pub struct BufferFormat {
    /// Samples per channel per partition.
    pub frames: usize,
    /// Total used channels across all subdevices.
    pub n_channels: usize,
    /// Total buffer size in bytes, a multiple of [`ALIGNMENT`].
    pub n_bytes: usize,
    slots: Vec<Option<ChannelSlot>>,
}

impl BufferFormat {
    /// Compute the layout for an ordered list of subdevices.
    ///
    /// Each entry is a channel layout plus its access mode (`true` for
    /// interleaved). Planar layouts are expected to be normalized with
    /// [`ChannelLayout::normalized_planar`]. Returns the format together
    /// with every subdevice's region, in input order.
    pub fn compute(
        frames: usize,
        subdevs: &[(ChannelLayout, bool)],
    ) -> Result<(Self, Vec<Region>), LayoutError> {
        let mut slots: Vec<Option<ChannelSlot>> = vec![None; MAX_CHANNELS];
        let mut regions = Vec::with_capacity(subdevs.len());
        let mut n_bytes = 0usize;
        let mut n_channels = 0usize;

        for (layout, interleaved) in subdevs {
            layout.validate()?;
            let bytes = layout.format.bytes();
            let offset = n_bytes;
            n_channels += layout.used_channels();

            for (i, &ch) in layout.names.iter().enumerate() {
                if ch >= MAX_CHANNELS {
                    return Err(LayoutError::ChannelOutOfRange(ch));
                }
                if slots[ch].is_some() {
                    return Err(LayoutError::DuplicateChannel(ch));
                }
                if *interleaved {
                    slots[ch] = Some(ChannelSlot {
                        byte_offset: n_bytes + layout.selection[i] * bytes,
                        sample_spacing: layout.open_channels,
                        format: layout.format,
                    });
                } else {
                    slots[ch] = Some(ChannelSlot {
                        byte_offset: n_bytes,
                        sample_spacing: 1,
                        format: layout.format,
                    });
                    n_bytes += bytes * frames;
                }
            }

            let size = layout.open_channels * bytes * frames;
            if *interleaved {
                n_bytes += size;
            }
            if n_bytes % ALIGNMENT != 0 {
                n_bytes += ALIGNMENT - n_bytes % ALIGNMENT;
            }
            regions.push(Region { offset, size });
        }

        Ok((
            Self {
                frames,
                n_channels,
                n_bytes,
                slots,
            },
            regions,
        ))
    }

    /// Look up the slot of a physical channel, if it is mapped.
    pub fn channel(&self, physical: usize) -> Option<&ChannelSlot> {
        self.slots.get(physical).and_then(|s| s.as_ref())
    }

    /// Iterate over all mapped physical channels.
    pub fn channels(&self) -> impl Iterator<Item = (usize, &ChannelSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(ch, s)| s.as_ref().map(|s| (ch, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(open: usize, names: &[usize], format: SampleFormat) -> ChannelLayout {
        ChannelLayout {
            open_channels: open,
            names: names.to_vec(),
            selection: (0..names.len()).collect(),
            format,
        }
    }

    #[test]
    fn interleaved_stereo() {
        let (fmt, regions) =
            BufferFormat::compute(64, &[(layout(2, &[0, 1], SampleFormat::s16_le()), true)])
                .unwrap();
        assert_eq!(regions[0], Region { offset: 0, size: 256 });
        assert_eq!(fmt.n_bytes % ALIGNMENT, 0);
        let c0 = fmt.channel(0).unwrap();
        let c1 = fmt.channel(1).unwrap();
        assert_eq!(c0.byte_offset, 0);
        assert_eq!(c1.byte_offset, 2);
        assert_eq!(c0.sample_spacing, 2);
        assert!(fmt.channel(2).is_none());
    }

    #[test]
    fn planar_regions_are_contiguous() {
        let lay = layout(2, &[3, 5], SampleFormat::s32_le()).normalized_planar();
        let (fmt, regions) = BufferFormat::compute(16, &[(lay, false)]).unwrap();
        let c3 = fmt.channel(3).unwrap();
        let c5 = fmt.channel(5).unwrap();
        assert_eq!(c3.sample_spacing, 1);
        assert_eq!(c5.byte_offset, c3.byte_offset + 4 * 16);
        assert_eq!(regions[0].size, 2 * 4 * 16);
    }

    #[test]
    fn subdevices_are_padded_apart() {
        let a = layout(1, &[0], SampleFormat::s24_3le());
        let b = layout(1, &[1], SampleFormat::s24_3le());
        // 10 frames of 3 bytes = 30 bytes, padded to 32.
        let (fmt, regions) = BufferFormat::compute(10, &[(a, true), (b, true)]).unwrap();
        assert_eq!(regions[0].offset, 0);
        assert_eq!(regions[1].offset, 32);
        assert_eq!(fmt.n_bytes, 64);
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let a = layout(1, &[0], SampleFormat::s16_le());
        let b = layout(1, &[0], SampleFormat::s16_le());
        assert_eq!(
            BufferFormat::compute(8, &[(a, true), (b, true)]).unwrap_err(),
            LayoutError::DuplicateChannel(0)
        );
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        let a = layout(1, &[MAX_CHANNELS], SampleFormat::s16_le());
        assert_eq!(
            BufferFormat::compute(8, &[(a, true)]).unwrap_err(),
            LayoutError::ChannelOutOfRange(MAX_CHANNELS)
        );
    }

    #[test]
    fn used_beyond_open_is_rejected() {
        let a = layout(1, &[0, 1], SampleFormat::s16_le());
        assert!(matches!(
            BufferFormat::compute(8, &[(a, true)]).unwrap_err(),
            LayoutError::UsedExceedsOpen { used: 2, open: 1 }
        ));
    }

    #[test]
    fn channel_fits_inside_region() {
        let subdevs = [
            (layout(4, &[0, 2], SampleFormat::s16_le()), true),
            (
                layout(2, &[1, 7], SampleFormat::f32_ne()).normalized_planar(),
                false,
            ),
        ];
        let frames = 48;
        let (fmt, regions) = BufferFormat::compute(frames, &subdevs).unwrap();
        for (i, (lay, _)) in subdevs.iter().enumerate() {
            for &ch in &lay.names {
                let slot = fmt.channel(ch).unwrap();
                let bytes = slot.format.bytes();
                let last = slot.byte_offset + slot.sample_spacing * (frames - 1) * bytes + bytes;
                assert!(last <= regions[i].offset + regions[i].size);
            }
        }
    }
}
