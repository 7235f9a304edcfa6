//! Blocking file backend.
//!
//! Streams raw interleaved samples from or to a plain file behind a file
//! descriptor, POSIX read/write semantics and all, which makes it the
//! reference backend for the select-driven schedulers: regular files are
//! always ready, end of stream arrives as a short read, and a synthetic
//! device block size exercises the write-quantum and alignment paths.

use crate::backend::{BackendInit, CallbackRegistration, CommandReply, IoBackend, SubdevParams};
use crate::{Direction, Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Writer,
}

/// One raw-sample file serving one blocking subdevice.
pub struct FileBackend {
    path: PathBuf,
    role: Role,
    block_size_frames: usize,
    file: Mutex<Option<File>>,
}

impl FileBackend {
    /// A backend that reads the file as an input subdevice.
    pub fn reader(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: Role::Reader,
            block_size_frames: 0,
            file: Mutex::new(None),
        }
    }

    /// A backend that creates (or truncates) the file as an output
    /// subdevice.
    pub fn writer(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: Role::Writer,
            block_size_frames: 0,
            file: Mutex::new(None),
        }
    }

    /// Pretend the device has a native block of this many frames.
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

impl IoBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn init(
        &self,
        params: &SubdevParams<'_>,
        _cb: Option<CallbackRegistration>,
    ) -> Result<BackendInit> {
        if params.dir != self.expected_dir() {
            return Err(Error::BackendInit {
                backend: self.name().to_string(),
                dir: params.dir,
                reason: format!("file opened for {}", self.expected_dir()),
            });
        }
        let mut guard = self.file.lock().unwrap();
        if guard.is_some() {
            return Err(Error::BackendInit {
                backend: self.name().to_string(),
                dir: params.dir,
                reason: "subdevice already open".into(),
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
        let fd = file.as_raw_fd();
        *guard = Some(file);
        tracing::debug!(
            path = %self.path.display(),
            dir = %params.dir,
            block_size_frames = self.block_size_frames,
            "file subdevice open"
        );
        Ok(BackendInit {
            fd: Some(fd),
            block_size_frames: self.block_size_frames,
            interleaved: true,
        })
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: plain read on the descriptor the engine got from init.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: as above.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn command(&self, _fd: Option<RawFd>, cmd: &str) -> CommandReply {
        match cmd {
            "path" => CommandReply {
                status: 0,
                message: self.path.display().to_string(),
            },
            _ => CommandReply {
                status: -1,
                message: format!("unknown command '{cmd}'"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caudal_core::{ChannelLayout, SampleFormat};
    use std::io::Write as _;

    fn params(dir: Direction, channels: &ChannelLayout) -> SubdevParams<'_> {
        SubdevParams {
            dir,
            channels,
            format: SampleFormat::s16_le(),
            rate: 48000,
            partition: 64,
        }
    }

    fn stereo() -> ChannelLayout {
        ChannelLayout {
            open_channels: 2,
            names: vec![0, 1],
            selection: vec![0, 1],
            format: SampleFormat::s16_le(),
        }
    }

    #[test]
    fn reads_until_short() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 10]).unwrap();
        tmp.flush().unwrap();

        let backend = FileBackend::reader(tmp.path());
        let layout = stereo();
        let init = backend.init(&params(Direction::Input, &layout), None).unwrap();
        let fd = init.fd.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 8);
        assert_eq!(buf, [7u8; 8]);
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 2);
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn rejects_wrong_direction() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let backend = FileBackend::reader(tmp.path());
        let layout = stereo();
        assert!(backend.init(&params(Direction::Output, &layout), None).is_err());
    }

    #[test]
    fn writer_creates_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let backend = FileBackend::writer(&path);
        let layout = stereo();
        let init = backend.init(&params(Direction::Output, &layout), None).unwrap();
        let fd = init.fd.unwrap();
        assert_eq!(backend.write(fd, &[1, 2, 3, 4]).unwrap(), 4);
        drop(backend);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }
}
