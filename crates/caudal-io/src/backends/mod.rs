//! Concrete backend modules.
//!
//! - [`file::FileBackend`]: blocking raw-sample files behind descriptors,
//!   the reference backend for the select-driven schedulers
//! - [`filecb::CallbackFile`]: raw-sample files driven through the
//!   callback contract by a worker thread, deterministic stand-in for
//!   callback audio servers
//! - [`cpal::CpalBackend`]: real sound hardware through the cpal library

pub mod cpal;
pub mod file;
pub mod filecb;
