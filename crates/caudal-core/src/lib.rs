//! Core buffer primitives for the caudal audio I/O engine.
//!
//! This crate holds the pure, syscall-free building blocks the engine
//! schedules around:
//!
//! - [`SampleFormat`]: validated PCM sample descriptions (1/2/3/4/8 bytes,
//!   integer or float, either endianness, packed 24-in-3)
//! - [`ChannelLayout`] and [`BufferFormat`]: the flat byte layout of the
//!   common I/O buffer shared by every subdevice of one direction
//! - [`DelayBuffer`]: per-channel integer-sample delay with step changes at
//!   partition boundaries
//! - [`mute_region`]: in-place channel muting over interleaved or planar
//!   blocks, including partial frames at the window edges
//!
//! Everything here operates on plain byte slices so the engine can hand the
//! same code regions of shared memory, heap buffers, or backend staging
//! buffers. No allocations happen after construction.

pub mod delay;
pub mod format;
pub mod layout;
pub mod mute;

pub use delay::DelayBuffer;
pub use format::{Endianness, FormatError, SampleFormat};
pub use layout::{
    ALIGNMENT, BufferFormat, ChannelLayout, ChannelSlot, LayoutError, MAX_CHANNELS, Region,
};
pub use mute::mute_region;
