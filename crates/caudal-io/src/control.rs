//! The out-of-band control channel.
//!
//! Mute toggles and delay changes are single-word writes to the shared
//! area, picked up by the schedulers at the next partition boundary.
//! Backend commands instead travel over a per-direction request/reply pipe
//! pair: the scheduler that owns the direction's descriptors services the
//! request from inside its readiness loop, so backend calls never leave the
//! worker that owns the device. A per-direction semaphore serialises
//! concurrent commanders.

use crate::backend::{CommandReply, IoBackend};
use crate::concurrency::{ConcurrencyMode, Semaphore, fdio};
use crate::shared::SharedArea;
use crate::{Direction, Error, Result};
use caudal_core::MAX_CHANNELS;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// One unidirectional pipe.
pub(crate) struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh descriptors from pipe().
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }
}

/// Request and reply pipes for both directions.
pub(crate) struct ControlPipes {
    pub request: [Pipe; 2],
    pub reply: [Pipe; 2],
}

impl ControlPipes {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            request: [Pipe::new()?, Pipe::new()?],
            reply: [Pipe::new()?, Pipe::new()?],
        })
    }
}

/// A dispatch target: the backend of one subdevice plus its descriptor.
pub(crate) type CommandTarget = (Option<RawFd>, Arc<dyn IoBackend>);

/// Handle for runtime parameter changes, cloneable and usable from any
/// thread (or, in process mode, any worker forked after init).
#[derive(Clone)]
pub struct Control {
    shared: Arc<SharedArea>,
    pipes: Arc<ControlPipes>,
    guard: [Semaphore; 2],
    n_subdevs: [usize; 2],
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control").finish_non_exhaustive()
    }
}

impl Control {
    pub(crate) fn new(
        mode: ConcurrencyMode,
        shared: Arc<SharedArea>,
        pipes: Arc<ControlPipes>,
        n_subdevs: [usize; 2],
    ) -> io::Result<Self> {
        let guard = [Semaphore::new(mode)?, Semaphore::new(mode)?];
        guard[0].post(1)?;
        guard[1].post(1)?;
        Ok(Self {
            shared,
            pipes,
            guard,
            n_subdevs,
        })
    }

    /// Flip the mute state of one physical channel. Observed by the owning
    /// scheduler at the next partition boundary.
    pub fn toggle_mute(&self, dir: Direction, channel: usize) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(Error::Config(format!("channel {channel} out of range")));
        }
        self.shared.get().toggle_muted(dir, channel);
        Ok(())
    }

    /// Change the delay of one directly mapped physical channel.
    pub fn change_delay(&self, dir: Direction, channel: usize, delay: usize) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(Error::Config(format!("channel {channel} out of range")));
        }
        if !self.shared.get().is_direct(dir, channel) {
            return Err(Error::Config(format!(
                "channel {channel} is not directly mapped; its delay is applied upstream"
            )));
        }
        self.shared.get().set_delay(dir, channel, delay);
        Ok(())
    }

    /// Send a backend-specific command to one subdevice and wait for the
    /// reply. The request is serviced by the scheduler owning the
    /// direction, between partitions.
    pub fn subdev_command(&self, dir: Direction, index: usize, cmd: &str) -> Result<CommandReply> {
        if index >= self.n_subdevs[dir.index()] {
            return Err(Error::Config(format!("subdevice index {index} out of range")));
        }
        let io = dir.index();
        self.guard[io]
            .wait(1)
            .map_err(|e| Error::Internal(format!("control guard: {e}")))?;
        let result = self.exchange(dir, index, cmd);
        self.guard[io]
            .post(1)
            .map_err(|e| Error::Internal(format!("control guard: {e}")))?;
        result
    }

    fn exchange(&self, dir: Direction, index: usize, cmd: &str) -> Result<CommandReply> {
        let io = dir.index();
        let req = self.pipes.request[io].write.as_raw_fd();
        let rep = self.pipes.reply[io].read.as_raw_fd();

        fdio::write_all(req, &(index as u32).to_ne_bytes())?;
        fdio::write_all(req, &(cmd.len() as u32).to_ne_bytes())?;
        fdio::write_all(req, cmd.as_bytes())?;

        let mut word = [0u8; 4];
        fdio::read_exact(rep, &mut word)?;
        let status = i32::from_ne_bytes(word);
        fdio::read_exact(rep, &mut word)?;
        let len = u32::from_ne_bytes(word) as usize;
        let mut msg = vec![0u8; len];
        fdio::read_exact(rep, &mut msg)?;
        Ok(CommandReply {
            status,
            message: String::from_utf8_lossy(&msg).into_owned(),
        })
    }
}

/// Service one pending command request. Called by the owning scheduler when
/// its control pipe selects readable.
pub(crate) fn service_command(
    request_fd: RawFd,
    reply_fd: RawFd,
    targets: &[CommandTarget],
) -> Result<()> {
    let mut word = [0u8; 4];
    fdio::read_exact(request_fd, &mut word)?;
    let index = u32::from_ne_bytes(word) as usize;
    fdio::read_exact(request_fd, &mut word)?;
    let len = u32::from_ne_bytes(word) as usize;
    let mut cmd = vec![0u8; len];
    fdio::read_exact(request_fd, &mut cmd)?;
    let cmd = String::from_utf8_lossy(&cmd).into_owned();

    let reply = match targets.get(index) {
        Some((fd, backend)) => backend.command(*fd, &cmd),
        None => CommandReply {
            status: -1,
            message: "invalid subdevice index".to_string(),
        },
    };

    fdio::write_all(reply_fd, &reply.status.to_ne_bytes())?;
    fdio::write_all(reply_fd, &(reply.message.len() as u32).to_ne_bytes())?;
    fdio::write_all(reply_fd, reply.message.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl IoBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn init(
            &self,
            _params: &crate::backend::SubdevParams<'_>,
            _cb: Option<crate::backend::CallbackRegistration>,
        ) -> Result<crate::backend::BackendInit> {
            unreachable!()
        }
        fn command(&self, _fd: Option<RawFd>, cmd: &str) -> CommandReply {
            CommandReply {
                status: 7,
                message: format!("echo: {cmd}"),
            }
        }
    }

    #[test]
    fn command_roundtrip() {
        let shared = Arc::new(SharedArea::new(ConcurrencyMode::Threads).unwrap());
        let pipes = Arc::new(ControlPipes::new().unwrap());
        let control =
            Control::new(ConcurrencyMode::Threads, shared, Arc::clone(&pipes), [1, 1]).unwrap();

        let io = Direction::Output.index();
        let request_fd = pipes.request[io].read.as_raw_fd();
        let reply_fd = pipes.reply[io].write.as_raw_fd();
        let server = std::thread::spawn(move || {
            let targets: Vec<CommandTarget> = vec![(None, Arc::new(Echo))];
            service_command(request_fd, reply_fd, &targets).unwrap();
        });

        let reply = control
            .subdev_command(Direction::Output, 0, "status")
            .unwrap();
        assert_eq!(reply.status, 7);
        assert_eq!(reply.message, "echo: status");
        server.join().unwrap();
    }

    #[test]
    fn rejects_bad_indices() {
        let shared = Arc::new(SharedArea::new(ConcurrencyMode::Threads).unwrap());
        let pipes = Arc::new(ControlPipes::new().unwrap());
        let control =
            Control::new(ConcurrencyMode::Threads, shared, pipes, [1, 0]).unwrap();
        assert!(control.subdev_command(Direction::Output, 0, "x").is_err());
        assert!(control.toggle_mute(Direction::Input, MAX_CHANNELS).is_err());
    }

    #[test]
    fn delay_requires_direct_mapping() {
        let shared = Arc::new(SharedArea::new(ConcurrencyMode::Threads).unwrap());
        shared.get().set_direct(Direction::Output, 3);
        let pipes = Arc::new(ControlPipes::new().unwrap());
        let control =
            Control::new(ConcurrencyMode::Threads, Arc::clone(&shared), pipes, [0, 1]).unwrap();
        assert!(control.change_delay(Direction::Output, 3, 10).is_ok());
        assert_eq!(shared.get().delay(Direction::Output, 3), 10);
        assert!(control.change_delay(Direction::Output, 4, 10).is_err());
    }
}
