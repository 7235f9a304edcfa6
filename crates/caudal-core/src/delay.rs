//! Per-channel delay buffers.
//!
//! A [`DelayBuffer`] is a circular byte buffer with distinct read and write
//! heads. Once per partition the engine calls [`DelayBuffer::update`], which
//! consumes one partition of strided input samples from a buffer region and
//! writes the delayed samples back in place. Delay changes are applied as a
//! step at the partition boundary, rounded to whole samples; subsample delay
//! is handled upstream.

use crate::format::SampleFormat;

/// Circular delay buffer for one channel.
///
/// Capacity is `partition + max_delay` samples, so any delay in
/// `[0, max_delay]` can be served while a full partition streams through.
/// With delay 0 the update is the identity. History is recorded even at
/// delay 0, so a later delay increase replays the samples that were live
/// when the change happened.
#[derive(Debug, Clone)]
pub struct DelayBuffer {
    ring: Vec<u8>,
    bytes: usize,
    partition: usize,
    cap: usize,
    max_delay: usize,
    write: usize,
    delay: usize,
}

impl DelayBuffer {
    /// Create a buffer for `partition`-sample updates with an initial delay
    /// and a hard upper bound. The initial delay is clamped to the bound.
    ///
    /// # Panics
    ///
    /// Panics if `partition` is 0.
    pub fn new(
        partition: usize,
        initial_delay: usize,
        max_delay: usize,
        format: SampleFormat,
    ) -> Self {
        assert!(partition > 0, "partition must be > 0");
        let bytes = format.bytes();
        let cap = partition + max_delay;
        Self {
            ring: vec![0u8; cap * bytes],
            bytes,
            partition,
            cap,
            max_delay,
            write: 0,
            delay: initial_delay.min(max_delay),
        }
    }

    /// The hard delay bound in samples.
    pub fn max_delay(&self) -> usize {
        self.max_delay
    }

    /// The delay currently in effect, in samples.
    pub fn delay(&self) -> usize {
        self.delay
    }

    /// Run one partition through the delay.
    ///
    /// `buf` holds the channel's samples starting at its first sample, one
    /// every `sample_spacing` samples, `bytes_per_sample` bytes each.
    /// `new_delay` is clamped to `[0, max_delay]` and takes effect for the
    /// whole partition.
    pub fn update(
        &mut self,
        buf: &mut [u8],
        bytes_per_sample: usize,
        sample_spacing: usize,
        new_delay: usize,
    ) {
        debug_assert_eq!(bytes_per_sample, self.bytes);
        self.delay = new_delay.min(self.max_delay);

        let bytes = self.bytes;
        let stride = sample_spacing * bytes;
        let mut pos = 0usize;
        for _ in 0..self.partition {
            let w = self.write * bytes;
            self.ring[w..w + bytes].copy_from_slice(&buf[pos..pos + bytes]);
            let r = ((self.write + self.cap - self.delay) % self.cap) * bytes;
            buf[pos..pos + bytes].copy_from_slice(&self.ring[r..r + bytes]);
            self.write = (self.write + 1) % self.cap;
            pos += stride;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt1() -> SampleFormat {
        SampleFormat::new(1, false, crate::format::Endianness::Little).unwrap()
    }

    #[test]
    fn zero_delay_is_identity() {
        let mut db = DelayBuffer::new(8, 0, 16, fmt1());
        let mut buf: Vec<u8> = (1..=8).collect();
        let orig = buf.clone();
        db.update(&mut buf, 1, 1, 0);
        assert_eq!(buf, orig);
    }

    #[test]
    fn fixed_delay_shifts_by_d() {
        let mut db = DelayBuffer::new(4, 3, 8, fmt1());
        let mut a = vec![1, 2, 3, 4];
        db.update(&mut a, 1, 1, 3);
        assert_eq!(a, vec![0, 0, 0, 1]);
        let mut b = vec![5, 6, 7, 8];
        db.update(&mut b, 1, 1, 3);
        assert_eq!(b, vec![2, 3, 4, 5]);
    }

    #[test]
    fn delay_change_replays_history() {
        // Run an impulse through at delay 0, then raise the delay: the
        // history recorded at delay 0 must surface again. The impulse sits
        // at absolute sample 0, so with delay 6 it reappears at absolute
        // sample 6, which is index 2 of the second partition.
        let mut db = DelayBuffer::new(4, 0, 8, fmt1());
        let mut a = vec![9, 0, 0, 0];
        db.update(&mut a, 1, 1, 0);
        assert_eq!(a, vec![9, 0, 0, 0]);
        let mut b = vec![0, 0, 0, 0];
        db.update(&mut b, 1, 1, 6);
        assert_eq!(b, vec![0, 0, 9, 0]);
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let mut db = DelayBuffer::new(4, 0, 2, fmt1());
        let mut a = vec![1, 2, 3, 4];
        db.update(&mut a, 1, 1, 100);
        assert_eq!(db.delay(), 2);
        assert_eq!(a, vec![0, 0, 1, 2]);
    }

    #[test]
    fn strided_multibyte_samples() {
        // Two interleaved 2-byte channels; delay only operates on ours.
        let fmt = SampleFormat::s16_le();
        let mut db = DelayBuffer::new(3, 1, 4, fmt);
        // Frames: [aa bb][cc dd][ee ff] for channel 0, other channel 0xff.
        let mut buf = vec![
            0xaa, 0xbb, 0xff, 0xff, //
            0xcc, 0xdd, 0xff, 0xff, //
            0xee, 0xf0, 0xff, 0xff,
        ];
        db.update(&mut buf, 2, 2, 1);
        assert_eq!(&buf[0..2], &[0, 0]);
        assert_eq!(&buf[4..6], &[0xaa, 0xbb]);
        assert_eq!(&buf[8..10], &[0xcc, 0xdd]);
        // Other channel untouched.
        assert_eq!(&buf[2..4], &[0xff, 0xff]);
        assert_eq!(&buf[6..8], &[0xff, 0xff]);
        assert_eq!(&buf[10..12], &[0xff, 0xff]);
    }
}
