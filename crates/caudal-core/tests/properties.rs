//! Property-based tests for the buffer primitives.
//!
//! Uses proptest to check the layout calculator, the delay buffer and the
//! mute engine against their universal invariants: layouts never overlap,
//! zero delay is the identity, an impulse moves by exactly the configured
//! delay, muting is idempotent and touches only the selected channels.

use caudal_core::{
    ALIGNMENT, BufferFormat, ChannelLayout, DelayBuffer, MAX_CHANNELS, SampleFormat, mute_region,
};
use proptest::prelude::*;

fn arb_format() -> impl Strategy<Value = SampleFormat> {
    prop_oneof![
        Just(SampleFormat::new(1, false, caudal_core::Endianness::Little).unwrap()),
        Just(SampleFormat::s16_le()),
        Just(SampleFormat::s24_3le()),
        Just(SampleFormat::s32_le()),
        Just(SampleFormat::f64_ne()),
    ]
}

/// A random set of subdevices with disjoint channel names.
fn arb_subdevs() -> impl Strategy<Value = Vec<(ChannelLayout, bool)>> {
    proptest::collection::vec(
        (1usize..=4, 0usize..=2, arb_format(), any::<bool>()),
        1..=4,
    )
    .prop_map(|descs| {
        let mut next_channel = 0usize;
        let mut out = Vec::new();
        for (used, extra_open, format, interleaved) in descs {
            if next_channel + used > MAX_CHANNELS {
                break;
            }
            let names: Vec<usize> = (next_channel..next_channel + used).collect();
            next_channel += used;
            let open = used + if interleaved { extra_open } else { 0 };
            let selection: Vec<usize> = (0..used).collect();
            let layout = ChannelLayout {
                open_channels: open,
                names,
                selection,
                format,
            };
            let layout = if interleaved {
                layout
            } else {
                layout.normalized_planar()
            };
            out.push((layout, interleaved));
        }
        out
    })
    .prop_filter("at least one subdevice", |v| !v.is_empty())
}

proptest! {
    /// Layout uniqueness: no two physical channels overlap anywhere in the
    /// partition, and the total size is aligned.
    #[test]
    fn layout_channels_never_overlap(
        subdevs in arb_subdevs(),
        frames in 1usize..=64,
    ) {
        let (fmt, regions) = BufferFormat::compute(frames, &subdevs).unwrap();
        prop_assert_eq!(fmt.n_bytes % ALIGNMENT, 0);

        let mut claimed = vec![false; fmt.n_bytes];
        for (ch, slot) in fmt.channels() {
            let bytes = slot.format.bytes();
            for i in 0..frames {
                let start = slot.byte_offset + i * slot.sample_spacing * bytes;
                for b in start..start + bytes {
                    prop_assert!(!claimed[b], "channel {} overlaps at byte {}", ch, b);
                    claimed[b] = true;
                }
            }
        }

        // Every channel's last sample stays inside its subdevice's region.
        for (i, (lay, _)) in subdevs.iter().enumerate() {
            for &ch in &lay.names {
                let slot = fmt.channel(ch).unwrap();
                let bytes = slot.format.bytes();
                let last = slot.byte_offset + slot.sample_spacing * (frames - 1) * bytes + bytes;
                prop_assert!(last <= regions[i].offset + regions[i].size);
            }
        }
    }

    /// Delay identity: with delay 0 the update returns the input unchanged.
    #[test]
    fn delay_zero_is_identity(
        partition in 1usize..=128,
        max_delay in 0usize..=64,
        rounds in 1usize..=4,
        seed in any::<u64>(),
    ) {
        let fmt = SampleFormat::new(1, false, caudal_core::Endianness::Little).unwrap();
        let mut db = DelayBuffer::new(partition, 0, max_delay, fmt);
        let mut state = seed;
        for _ in 0..rounds {
            let mut buf: Vec<u8> = (0..partition)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (state >> 56) as u8
                })
                .collect();
            let orig = buf.clone();
            db.update(&mut buf, 1, 1, 0);
            prop_assert_eq!(buf, orig);
        }
    }

    /// Delay composition: a unit impulse at sample k comes out at k + d.
    #[test]
    fn delay_moves_impulse_by_d(
        partition in 1usize..=64,
        d in 0usize..=64,
        k in 0usize..=63,
    ) {
        let max_delay = 64;
        let fmt = SampleFormat::new(1, false, caudal_core::Endianness::Little).unwrap();
        let mut db = DelayBuffer::new(partition, d, max_delay, fmt);

        // Stream enough partitions to cover the impulse plus its delay.
        let total = (k + d) / partition + 2;
        let mut observed = Vec::new();
        for p in 0..total {
            let mut buf: Vec<u8> = (0..partition)
                .map(|i| if p * partition + i == k { 1 } else { 0 })
                .collect();
            db.update(&mut buf, 1, 1, d);
            observed.extend(buf);
        }
        for (i, &v) in observed.iter().enumerate() {
            let expected = if i == k + d { 1 } else { 0 };
            prop_assert_eq!(v, expected, "sample {} with d={} k={}", i, d, k);
        }
    }

    /// Mute idempotence and selectivity on interleaved regions with both
    /// aligned and misaligned windows.
    #[test]
    fn mute_is_idempotent_and_selective(
        open in 1usize..=6,
        partition in 1usize..=32,
        fmt in arb_format(),
        mute_mask in any::<u8>(),
        window_seed in any::<u16>(),
    ) {
        let used = open;
        let layout = ChannelLayout {
            open_channels: open,
            names: (0..used).collect(),
            selection: (0..used).collect(),
            format: fmt,
        };
        let bytes = fmt.bytes();
        let size = open * bytes * partition;
        let muted: Vec<usize> = (0..used).filter(|c| mute_mask & (1 << c) != 0).collect();

        let offset = (window_seed as usize) % size;
        let len = ((window_seed as usize >> 4) % (size - offset)).max(1);

        let mut buf: Vec<u8> = (0..size).map(|i| (i % 253 + 1) as u8).collect();
        let orig = buf.clone();

        mute_region(&layout, true, partition, &muted, &mut buf, offset, len);
        let once = buf.clone();
        mute_region(&layout, true, partition, &muted, &mut buf, offset, len);
        prop_assert_eq!(&buf, &once, "muting twice must equal muting once");

        let frame = open * bytes;
        for (i, (&got, &was)) in once.iter().zip(orig.iter()).enumerate() {
            let in_window = i >= offset && i < offset + len;
            let chan = (i % frame) / bytes;
            if in_window && muted.contains(&chan) {
                prop_assert_eq!(got, 0, "muted byte {} must be zero", i);
            } else {
                prop_assert_eq!(got, was, "unmuted byte {} must be untouched", i);
            }
        }
    }

    /// Mute selectivity on planar regions with frame-aligned windows.
    #[test]
    fn planar_mute_is_selective(
        used in 1usize..=6,
        partition in 1usize..=32,
        fmt in arb_format(),
        mute_mask in any::<u8>(),
    ) {
        let layout = ChannelLayout {
            open_channels: used,
            names: (0..used).collect(),
            selection: (0..used).collect(),
            format: fmt,
        };
        let bytes = fmt.bytes();
        let chan_bytes = partition * bytes;
        let size = used * chan_bytes;
        let muted: Vec<usize> = (0..used).filter(|c| mute_mask & (1 << c) != 0).collect();

        let mut buf: Vec<u8> = (0..size).map(|i| (i % 253 + 1) as u8).collect();
        let orig = buf.clone();
        mute_region(&layout, false, partition, &muted, &mut buf, 0, size);

        for c in 0..used {
            let range = c * chan_bytes..(c + 1) * chan_bytes;
            if muted.contains(&c) {
                prop_assert!(buf[range].iter().all(|&b| b == 0));
            } else {
                prop_assert_eq!(&buf[range.clone()], &orig[range]);
            }
        }
    }
}
