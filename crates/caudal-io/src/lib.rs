//! Scheduling, concurrency and backend layer for the caudal audio engine.
//!
//! This crate drives the hard real-time contract of the engine: every
//! partition of N frames it consumes one block from every input subdevice
//! and emits one block to every output subdevice, or the audio underruns.
//! It couples two incompatible I/O idioms in one pipeline:
//!
//! - **blocking subdevices**: file descriptors multiplexed with `select`,
//!   driven by the input and output worker schedulers;
//! - **callback subdevices**: backends that own a realtime thread and push
//!   or pull blocks through [`callback::CallbackHub`], rendezvousing with
//!   the blocking side through the shared communication area.
//!
//! The concurrency layer is selectable between threads (shared heap,
//! mutex/condvar semaphores) and processes (fork workers, pipe semaphores,
//! shared memory) without the schedulers knowing which is active.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use caudal_core::SampleFormat;
//! use caudal_io::{ChannelBinding, Engine, EngineConfig, SubdevSpec};
//! use caudal_io::backends::file::FileBackend;
//!
//! let input = SubdevSpec {
//!     backend: Arc::new(FileBackend::reader("in.raw")),
//!     open_channels: 2,
//!     channels: vec![ChannelBinding::direct(0), ChannelBinding::direct(1)],
//!     format: SampleFormat::s16_le(),
//!     uses_clock: true,
//! };
//! let output = SubdevSpec {
//!     backend: Arc::new(FileBackend::writer("out.raw")),
//!     open_channels: 2,
//!     channels: vec![ChannelBinding::direct(0), ChannelBinding::direct(1)],
//!     format: SampleFormat::s16_le(),
//!     uses_clock: true,
//! };
//!
//! let (engine, _control) =
//!     Engine::init(EngineConfig::default(), 64, 48000, vec![input], vec![output])?;
//! engine.run(|io| {
//!     // The filter stage: here a straight pass-through.
//!     io.output.copy_from_slice(io.input);
//! })?;
//! # Ok::<(), caudal_io::Error>(())
//! ```

pub mod backend;
pub mod backends;
pub mod callback;
pub mod concurrency;
pub mod config;
pub mod control;
pub mod engine;
pub mod subdev;

mod input;
mod output;
mod rate;
mod shared;

pub use backend::{
    BackendInit, CallbackControl, CallbackEvent, CallbackRead, CallbackRegistration,
    CallbackToken, CallbackWrite, CommandReply, IoBackend, SubdevParams,
};
pub use callback::CallbackHub;
pub use concurrency::ConcurrencyMode;
pub use config::EngineConfig;
pub use control::Control;
pub use engine::{Engine, FilterIo};
pub use subdev::{ChannelBinding, SubdevSpec};

use thiserror::Error;

/// The two directions of audio flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Capture: device to engine.
    Input,
    /// Playback: engine to device.
    Output,
}

impl Direction {
    /// Array index for per-direction tables.
    pub fn index(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Both directions, input first.
pub const DIRECTIONS: [Direction; 2] = [Direction::Input, Direction::Output];

/// Stable per-kind status a worker exits with.
///
/// Process-mode workers use [`ExitStatus::code`] verbatim as their process
/// exit code, so supervisors can tell the failure kinds apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean completion.
    Ok,
    /// Unclassified fatal error.
    Other,
    /// The input signal was invalid (`EIO` from a backend).
    InvalidInput,
    /// Output buffer underflow (`EPIPE`).
    Underflow,
    /// The measured sample rate drifted more than 2 % off nominal.
    RateDrift,
}

impl ExitStatus {
    /// The stable numeric code of this status.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::Other => 1,
            ExitStatus::InvalidInput => 2,
            ExitStatus::Underflow => 3,
            ExitStatus::RateDrift => 4,
        }
    }

    /// Map a numeric code back; unknown codes read as [`ExitStatus::Other`].
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Ok,
            2 => ExitStatus::InvalidInput,
            3 => ExitStatus::Underflow,
            4 => ExitStatus::RateDrift,
            _ => ExitStatus::Other,
        }
    }
}

/// Errors of the I/O engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid engine or subdevice configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend failed to bring up a subdevice.
    #[error("{backend}: failed to initialise {dir} subdevice: {reason}")]
    BackendInit {
        /// Backend name.
        backend: String,
        /// Direction of the failing subdevice.
        dir: Direction,
        /// What went wrong.
        reason: String,
    },

    /// Invalid channel layout.
    #[error("invalid channel layout: {0}")]
    Layout(#[from] caudal_core::LayoutError),

    /// Invalid sample format.
    #[error("invalid sample format: {0}")]
    Format(#[from] caudal_core::FormatError),

    /// Plain I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend reported an invalid input signal.
    #[error("{backend}: invalid input signal")]
    InvalidInput {
        /// Backend name.
        backend: String,
    },

    /// Output ring underflow; recovery would skew the buffer relation.
    #[error("{backend}: buffer underflow")]
    Underflow {
        /// Backend name.
        backend: String,
    },

    /// The monitored input clock drifted out of tolerance.
    #[error("sample rate drift: nominal {nominal} Hz, measured {measured:.1} Hz")]
    RateDrift {
        /// Configured rate.
        nominal: usize,
        /// Measured rate.
        measured: f64,
    },

    /// A worker finished with a non-ok status.
    #[error("worker exited with status {0:?}")]
    Worker(ExitStatus),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The exit status a worker dying of this error reports.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::InvalidInput { .. } => ExitStatus::InvalidInput,
            Error::Underflow { .. } => ExitStatus::Underflow,
            Error::RateDrift { .. } => ExitStatus::RateDrift,
            Error::Worker(status) => *status,
            _ => ExitStatus::Other,
        }
    }
}

/// Convenience result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
