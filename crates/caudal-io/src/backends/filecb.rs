//! Callback-driven file backend.
//!
//! Drives a plain raw-sample file through the callback contract the way a
//! pro-audio server would: a worker thread (spawned with all signals
//! masked) reads or writes one device block at a time and presents it to
//! the callback hub. End of an input file raises the LAST_INPUT event with
//! the residual payload frames of the current partition; an output file is
//! closed with the FINISHED event once the hub's return value says the
//! stream is drained. Deterministic, so it stands in for callback servers
//! in tests and offline processing.

use crate::backend::{
    BackendInit, CallbackControl, CallbackEvent, CallbackRead, CallbackRegistration,
    CallbackToken, CallbackWrite, IoBackend, SubdevParams,
};
use crate::callback::CallbackHub;
use crate::concurrency::{ConcurrencyMode, worker};
use crate::{Direction, Error, ExitStatus, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Writer,
}

struct Prepared {
    file: File,
    hub: Arc<CallbackHub>,
    token: CallbackToken,
    frame_size: usize,
    block_size_frames: usize,
    partition: usize,
}

/// One raw-sample file served through the callback scheduler.
pub struct CallbackFile {
    path: PathBuf,
    role: Role,
    block_size_frames: usize,
    prepared: Mutex<Option<Prepared>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<worker::WorkerHandle>>,
}

impl CallbackFile {
    /// A callback input fed from the file.
    pub fn reader(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Role::Reader)
    }

    /// A callback output draining into the file.
    pub fn writer(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Role::Writer)
    }

    fn new(path: impl Into<PathBuf>, role: Role) -> Self {
        Self {
            path: path.into(),
            role,
            block_size_frames: 0,
            prepared: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Exchange blocks of this many frames instead of whole partitions.
    /// Must divide the partition size.
    pub fn with_block_size(mut self, frames: usize) -> Self {
        self.block_size_frames = frames;
        self
    }

    fn expected_dir(&self) -> Direction {
        match self.role {
            Role::Reader => Direction::Input,
            Role::Writer => Direction::Output,
        }
    }
}

impl IoBackend for CallbackFile {
    fn name(&self) -> &str {
        "filecb"
    }

    fn is_callback(&self) -> bool {
        true
    }

    fn init(
        &self,
        params: &SubdevParams<'_>,
        cb: Option<CallbackRegistration>,
    ) -> Result<BackendInit> {
        let Some(registration) = cb else {
            return Err(Error::Internal(
                "callback backend initialised without a registration".into(),
            ));
        };
        if params.dir != self.expected_dir() {
            return Err(Error::BackendInit {
                backend: self.name().to_string(),
                dir: params.dir,
                reason: format!("file opened for {}", self.expected_dir()),
            });
        }
        let file = match self.role {
            Role::Reader => File::open(&self.path),
            Role::Writer => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path),
        }
        .map_err(|e| Error::BackendInit {
            backend: self.name().to_string(),
            dir: params.dir,
            reason: format!("{}: {e}", self.path.display()),
        })?;

        let block_size_frames = if self.block_size_frames == 0 {
            params.partition
        } else {
            self.block_size_frames
        };
        let frame_size = params.channels.open_channels * params.format.bytes();
        *self.prepared.lock().unwrap() = Some(Prepared {
            file,
            hub: registration.hub,
            token: registration.token,
            frame_size,
            block_size_frames,
            partition: params.partition,
        });
        tracing::debug!(
            path = %self.path.display(),
            dir = %params.dir,
            block_size_frames,
            "callback file subdevice open"
        );
        Ok(BackendInit {
            fd: None,
            block_size_frames,
            interleaved: true,
        })
    }

    fn synch_start(&self) -> Result<()> {
        let Some(prepared) = self.prepared.lock().unwrap().take() else {
            return Err(Error::Internal("callback file started before init".into()));
        };
        let stop = Arc::clone(&self.stop);
        let role = self.role;
        let handle = worker::spawn(ConcurrencyMode::Threads, "filecb", true, move || {
            match role {
                Role::Reader => input_worker(prepared, &stop),
                Role::Writer => output_worker(prepared, &stop),
            }
        })?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn synch_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let status = handle.join();
            if status != ExitStatus::Ok {
                tracing::warn!(?status, "callback file worker exited abnormally");
            }
        }
    }
}

/// Read blocks and present them until the file runs dry, then finish the
/// partition with silence and idle until stopped.
fn input_worker(mut st: Prepared, stop: &AtomicBool) -> ExitStatus {
    let block_bytes = st.block_size_frames * st.frame_size;
    let blocks_per_partition = st.partition / st.block_size_frames;
    let mut buf = vec![0u8; block_bytes];
    let mut block_in_partition = 0usize;
    let mut eof = false;
    let mut eof_reported = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            return ExitStatus::Ok;
        }
        buf.fill(0);
        let mut got = 0usize;
        while !eof && got < block_bytes {
            match st.file.read(&mut buf[got..]) {
                Ok(0) => eof = true,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "callback file read failed");
                    let _ = st.hub.process(&[], &mut [], 0, CallbackEvent::Error);
                    return ExitStatus::Other;
                }
            }
        }
        if eof && !eof_reported {
            eof_reported = true;
            // Announce the residual payload of the current partition; the
            // rest of the partition is delivered as silence.
            let residual = block_in_partition * st.block_size_frames + got / st.frame_size;
            if st
                .hub
                .process(&[], &mut [], residual, CallbackEvent::LastInput)
                .is_err()
            {
                return ExitStatus::Other;
            }
        }

        let planes: [&[u8]; 1] = [&buf];
        let read = CallbackRead {
            token: st.token,
            planes: &planes,
        };
        if st
            .hub
            .process(&[read], &mut [], st.block_size_frames, CallbackEvent::Normal)
            .is_err()
        {
            return ExitStatus::Other;
        }

        block_in_partition = (block_in_partition + 1) % blocks_per_partition;
        if eof && block_in_partition == 0 {
            // Final partition delivered in full; nothing left to feed.
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            return ExitStatus::Ok;
        }
    }
}

/// Pull blocks from the hub and write them out until the stream drains.
fn output_worker(mut st: Prepared, stop: &AtomicBool) -> ExitStatus {
    let block_bytes = st.block_size_frames * st.frame_size;
    let mut buf = vec![0u8; block_bytes];

    loop {
        if stop.load(Ordering::SeqCst) {
            return ExitStatus::Ok;
        }
        let control = {
            let mut planes: [&mut [u8]; 1] = [&mut buf];
            let write = CallbackWrite {
                token: st.token,
                planes: &mut planes,
            };
            st.hub
                .process(&[], &mut [write], st.block_size_frames, CallbackEvent::Normal)
        };
        match control {
            Ok(CallbackControl::Continue) => {
                if let Err(e) = st.file.write_all(&buf) {
                    tracing::error!(error = %e, "callback file write failed");
                    let _ = st.hub.process(&[], &mut [], 0, CallbackEvent::Error);
                    return ExitStatus::Other;
                }
            }
            Ok(CallbackControl::Final(frames)) => {
                let payload = frames * st.frame_size;
                if let Err(e) = st.file.write_all(&buf[..payload]) {
                    tracing::error!(error = %e, "callback file write failed");
                    let _ = st.hub.process(&[], &mut [], 0, CallbackEvent::Error);
                    return ExitStatus::Other;
                }
                return finish(&st);
            }
            Ok(CallbackControl::Stop) => return finish(&st),
            Err(_) => return ExitStatus::Other,
        }
    }
}

fn finish(st: &Prepared) -> ExitStatus {
    let mut empty: [&mut [u8]; 0] = [];
    let write = CallbackWrite {
        token: st.token,
        planes: &mut empty,
    };
    match st.hub.process(&[], &mut [write], 0, CallbackEvent::Finished) {
        Ok(_) => ExitStatus::Ok,
        Err(_) => ExitStatus::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_defaults_to_partition() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let backend = CallbackFile::reader(tmp.path());
        assert!(backend.is_callback());
        assert_eq!(backend.block_size_frames, 0);
    }
}
