//! The backend module contract.
//!
//! A backend owns the actual audio API: it opens devices, hands the engine
//! either a file descriptor (blocking subdevices) or a block size (callback
//! subdevices), and moves bytes. The trait is a capability table: every
//! lifecycle hook has a default so simple backends implement only what they
//! have.
//!
//! Callback backends receive a [`CallbackRegistration`] at init: a handle to
//! the engine's [`CallbackHub`](crate::callback::CallbackHub) plus the token
//! identifying the subdevice. Their realtime thread later presents blocks
//! through [`CallbackHub::process`](crate::callback::CallbackHub::process);
//! the returned [`CallbackControl`] tells the backend when the stream is
//! over. The token is an index, not a pointer: the subdevice registry
//! lives in the hub, which breaks the subdevice/module/callback reference
//! cycle.

use crate::callback::CallbackHub;
use crate::{Direction, Result};
use caudal_core::{ChannelLayout, SampleFormat};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// What a backend reports back from subdevice init.
#[derive(Debug)]
pub struct BackendInit {
    /// The descriptor to multiplex, or `None` for callback subdevices.
    pub fd: Option<RawFd>,
    /// The device's native block size in frames; 0 if it has none.
    pub block_size_frames: usize,
    /// Whether the device block is interleaved.
    pub interleaved: bool,
}

/// Everything a backend needs to open one subdevice.
#[derive(Debug)]
pub struct SubdevParams<'a> {
    /// Direction of the subdevice.
    pub dir: Direction,
    /// Channel mapping; for interleaved devices `selection` indexes the
    /// device frame.
    pub channels: &'a ChannelLayout,
    /// Sample format the engine will exchange.
    pub format: SampleFormat,
    /// Sample rate in Hz.
    pub rate: usize,
    /// The engine's partition size in frames.
    pub partition: usize,
}

/// Identifies one callback subdevice towards the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken {
    pub(crate) dir: Direction,
    pub(crate) index: usize,
}

impl CallbackToken {
    /// Direction of the subdevice this token stands for.
    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// Registry index of the subdevice within its direction.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Handed to callback backends at init.
pub struct CallbackRegistration {
    /// The engine's callback scheduler.
    pub hub: Arc<CallbackHub>,
    /// This subdevice's identity.
    pub token: CallbackToken,
}

/// Events a callback backend reports alongside (or instead of) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    /// A regular block exchange.
    Normal,
    /// The input stream will end; `frames` carries the payload frames of
    /// the final partial block.
    LastInput,
    /// All of this backend's output subdevices have fully drained.
    Finished,
    /// The backend hit an unrecoverable error.
    Error,
}

/// What the hub tells the backend after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackControl {
    /// Keep the stream running.
    Continue,
    /// The stream ends; this many payload frames remain, less than one
    /// block. Present them, then report [`CallbackEvent::Finished`].
    Final(usize),
    /// Stop immediately; no payload remains.
    Stop,
}

/// One input subdevice's block, presented to the hub.
///
/// Interleaved subdevices pass a single plane; planar subdevices pass one
/// plane per used channel, in slot order.
pub struct CallbackRead<'a> {
    /// The subdevice's identity.
    pub token: CallbackToken,
    /// The captured sample planes.
    pub planes: &'a [&'a [u8]],
}

/// One output subdevice's block buffers, to be filled by the hub.
pub struct CallbackWrite<'a, 'b> {
    /// The subdevice's identity.
    pub token: CallbackToken,
    /// The playback sample planes.
    pub planes: &'a mut [&'b mut [u8]],
}

/// The backend capability table.
pub trait IoBackend: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Whether this backend drives subdevices through the callback path.
    fn is_callback(&self) -> bool {
        false
    }

    /// Open one subdevice. Callback backends get their registration here
    /// and must return `fd: None`.
    fn init(
        &self,
        params: &SubdevParams<'_>,
        cb: Option<CallbackRegistration>,
    ) -> Result<BackendInit>;

    /// Per-direction start, called when the owning scheduler begins.
    fn start(&self, _dir: Direction) -> Result<()> {
        Ok(())
    }

    /// Per-direction stop.
    fn stop(&self, _dir: Direction) {}

    /// Coordinated start across both directions.
    fn synch_start(&self) -> Result<()> {
        Ok(())
    }

    /// Coordinated stop across both directions.
    fn synch_stop(&self) {}

    /// Read towards the engine. POSIX semantics: `Ok(0)` is end of stream,
    /// `Interrupted`/`WouldBlock` mean retry, `BrokenPipe` means the linked
    /// output underflowed, `EIO` means the input signal is invalid.
    fn read(&self, _fd: RawFd, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not readable"))
    }

    /// Write towards the device. `BrokenPipe` is an output underflow.
    fn write(&self, _fd: RawFd, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not writable"))
    }

    /// Out-of-band command hook for the control channel.
    fn command(&self, _fd: Option<RawFd>, _cmd: &str) -> CommandReply {
        CommandReply {
            status: -1,
            message: "module does not support any commands".to_string(),
        }
    }
}

/// Status and message a backend returns from [`IoBackend::command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Backend-defined status; negative means failure.
    pub status: i32,
    /// Human-readable reply.
    pub message: String,
}
