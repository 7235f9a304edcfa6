//! In-place channel muting.
//!
//! Muting zeroes every sample of the selected channels inside a byte window
//! of a subdevice's buffer region, without touching any other channel. The
//! window may start or end mid-frame on interleaved devices; only the bytes
//! of muted samples that fall inside the window are cleared, so repeated
//! partial writes of the same partition stay consistent.

use crate::layout::ChannelLayout;

/// Zero the muted channels of one subdevice region in place.
///
/// * `layout`: the subdevice's channel layout (planar layouts normalized).
/// * `interleaved`: the region's access mode.
/// * `partition`: samples per channel per partition.
/// * `muted`: for interleaved regions, the frame indices
///   (`channel_selection`) of the muted channels; for planar regions, the
///   used-slot indices. May be in any order.
/// * `region`: the subdevice's full byte region for this partition.
/// * `offset`, `len`: the byte window being muted, relative to the region
///   start. For planar regions the window spans all channels and is scaled
///   down per channel.
pub fn mute_region(
    layout: &ChannelLayout,
    interleaved: bool,
    partition: usize,
    muted: &[usize],
    region: &mut [u8],
    offset: usize,
    len: usize,
) {
    if muted.is_empty() || len == 0 {
        return;
    }
    let bytes = layout.format.bytes();
    debug_assert!(matches!(bytes, 1 | 2 | 3 | 4 | 8));

    if !interleaved {
        // One contiguous sub-range per muted channel. The window is given
        // across all channels, so scale it down to one channel's share.
        let chan_bytes = partition * bytes;
        let start = offset / layout.open_channels;
        let span = len / layout.open_channels;
        for &c in muted {
            let base = c * chan_bytes;
            region[base + start..base + start + span].fill(0);
        }
        return;
    }

    // Interleaved: walk the frames the window overlaps and zero the
    // intersection of every muted sample with the window. Handles partial
    // frames at the head and the tail in the same pass.
    let frame = layout.frame_bytes();
    let end = offset + len;
    let first = offset / frame;
    let last = (end - 1) / frame;
    for f in first..=last {
        let base = f * frame;
        for &sel in muted {
            let s = base + sel * bytes;
            let e = s + bytes;
            let lo = s.max(offset);
            let hi = e.min(end);
            if lo < hi {
                region[lo..hi].fill(0);
            }
        }
    }
}
