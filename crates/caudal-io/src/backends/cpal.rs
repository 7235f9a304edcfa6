//! Real-hardware callback backend over cpal.
//!
//! The sound server invokes our closures on its realtime thread; this
//! backend re-blocks whatever buffer sizes arrive into the fixed device
//! block the engine registered, converts between interleaved `f32` frames
//! and the engine's byte planes, and forwards everything to the callback
//! hub. Only native `f32` is supported; sample-format conversion belongs
//! to dedicated kernels, not the I/O layer.

use crate::backend::{
    BackendInit, CallbackControl, CallbackEvent, CallbackRead, CallbackRegistration,
    CallbackToken, CallbackWrite, IoBackend, SubdevParams,
};
use crate::callback::CallbackHub;
use crate::{Direction, Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

struct Prepared {
    hub: Arc<CallbackHub>,
    token: CallbackToken,
    dir: Direction,
    channels: usize,
    rate: usize,
    block_size_frames: usize,
}

/// One cpal device direction served through the callback scheduler.
pub struct CpalBackend {
    device_name: Option<String>,
    block_size_frames: usize,
    prepared: Mutex<Option<Prepared>>,
    stream: Mutex<Option<cpal::Stream>>,
    done: Arc<AtomicBool>,
}

impl CpalBackend {
    /// Use the platform's default device.
    pub fn default_device() -> Self {
        Self {
            device_name: None,
            block_size_frames: 0,
            prepared: Mutex::new(None),
            stream: Mutex::new(None),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use the first device whose name contains `name` (case-insensitive).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            ..Self::default_device()
        }
    }

    /// Request a device block of this many frames; must divide the
    /// partition. Defaults to one partition.
    pub fn with_block_size(mut self, frames: usize) -> Self {
        self.block_size_frames = frames;
        self
    }

    fn find_device(&self, dir: Direction) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => match dir {
                Direction::Input => host.default_input_device(),
                Direction::Output => host.default_output_device(),
            }
            .ok_or_else(|| Error::Config("no default audio device".into())),
            Some(name) => {
                let needle = name.to_lowercase();
                let devices = match dir {
                    Direction::Input => host.input_devices(),
                    Direction::Output => host.output_devices(),
                }
                .map_err(|e| Error::Config(format!("device enumeration failed: {e}")))?;
                for device in devices {
                    if let Ok(n) = device.name() {
                        if n.to_lowercase().contains(&needle) {
                            return Ok(device);
                        }
                    }
                }
                Err(Error::Config(format!("no {dir} device matching '{name}'")))
            }
        }
    }
}

impl IoBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
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
        if !params.format.is_float() || params.format.bytes() != 4 {
            return Err(Error::BackendInit {
                backend: self.name().to_string(),
                dir: params.dir,
                reason: "cpal exchanges native f32 samples only".into(),
            });
        }
        let block_size_frames = if self.block_size_frames == 0 {
            params.partition
        } else {
            self.block_size_frames
        };
        *self.prepared.lock().unwrap() = Some(Prepared {
            hub: registration.hub,
            token: registration.token,
            dir: params.dir,
            channels: params.channels.open_channels,
            rate: params.rate,
            block_size_frames,
        });
        Ok(BackendInit {
            fd: None,
            block_size_frames,
            interleaved: true,
        })
    }

    fn synch_start(&self) -> Result<()> {
        let Some(prepared) = self.prepared.lock().unwrap().take() else {
            return Err(Error::Internal("cpal backend started before init".into()));
        };
        let device = self.find_device(prepared.dir)?;
        let config = cpal::StreamConfig {
            channels: prepared.channels as u16,
            sample_rate: prepared.rate as u32,
            buffer_size: cpal::BufferSize::Fixed(prepared.block_size_frames as u32),
        };
        tracing::info!(
            device = device.name().unwrap_or_else(|_| "?".into()),
            dir = %prepared.dir,
            block_size_frames = prepared.block_size_frames,
            "starting cpal stream"
        );

        let stream = match prepared.dir {
            Direction::Input => build_input(&device, &config, prepared)?,
            Direction::Output => build_output(&device, &config, prepared, Arc::clone(&self.done))?,
        };
        stream
            .play()
            .map_err(|e| Error::Internal(format!("cpal stream start: {e}")))?;
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn synch_stop(&self) {
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.pause();
        }
    }
}

fn error_callback(hub: Arc<CallbackHub>) -> impl FnMut(cpal::StreamError) {
    move |err| {
        tracing::error!(error = %err, "cpal stream error");
        let _ = hub.process(&[], &mut [], 0, CallbackEvent::Error);
    }
}

/// Capture side: accumulate whatever cpal delivers, hand the hub one
/// device block at a time.
fn build_input(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    prepared: Prepared,
) -> Result<cpal::Stream> {
    let block_samples = prepared.block_size_frames * prepared.channels;
    let mut staged: VecDeque<f32> = VecDeque::with_capacity(2 * block_samples);
    let mut block = vec![0u8; block_samples * 4];
    let hub = Arc::clone(&prepared.hub);
    let err_hub = Arc::clone(&prepared.hub);
    let token = prepared.token;
    let frames = prepared.block_size_frames;

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                staged.extend(data.iter().copied());
                while staged.len() >= block_samples {
                    for (i, sample) in staged.drain(..block_samples).enumerate() {
                        block[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
                    }
                    let planes: [&[u8]; 1] = [&block];
                    let read = CallbackRead {
                        token,
                        planes: &planes,
                    };
                    if hub
                        .process(&[read], &mut [], frames, CallbackEvent::Normal)
                        .is_err()
                    {
                        return;
                    }
                }
            },
            error_callback(err_hub),
            None,
        )
        .map_err(|e| Error::Internal(format!("cpal input stream: {e}")))
}

/// Playback side: pull device blocks from the hub on demand, emitting
/// silence once the stream has drained.
fn build_output(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    prepared: Prepared,
    done: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let block_samples = prepared.block_size_frames * prepared.channels;
    let channels = prepared.channels;
    let mut staged: VecDeque<f32> = VecDeque::with_capacity(2 * block_samples);
    let mut block = vec![0u8; block_samples * 4];
    let hub = Arc::clone(&prepared.hub);
    let err_hub = Arc::clone(&prepared.hub);
    let token = prepared.token;
    let frames = prepared.block_size_frames;

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    if staged.is_empty() {
                        if done.load(Ordering::SeqCst) {
                            *out = 0.0;
                            continue;
                        }
                        let control = {
                            let mut planes: [&mut [u8]; 1] = [&mut block];
                            let write = CallbackWrite {
                                token,
                                planes: &mut planes,
                            };
                            hub.process(&[], &mut [write], frames, CallbackEvent::Normal)
                        };
                        let valid_frames = match control {
                            Ok(CallbackControl::Continue) => frames,
                            Ok(CallbackControl::Final(n)) => n,
                            Ok(CallbackControl::Stop) => 0,
                            Err(_) => {
                                done.store(true, Ordering::SeqCst);
                                *out = 0.0;
                                continue;
                            }
                        };
                        for chunk in block[..valid_frames * channels * 4].chunks_exact(4) {
                            staged.push_back(f32::from_ne_bytes([
                                chunk[0], chunk[1], chunk[2], chunk[3],
                            ]));
                        }
                        if valid_frames < frames {
                            done.store(true, Ordering::SeqCst);
                            let mut empty: [&mut [u8]; 0] = [];
                            let finished = CallbackWrite {
                                token,
                                planes: &mut empty,
                            };
                            let _ =
                                hub.process(&[], &mut [finished], 0, CallbackEvent::Finished);
                        }
                        if staged.is_empty() {
                            *out = 0.0;
                            continue;
                        }
                    }
                    *out = staged.pop_front().unwrap_or(0.0);
                }
            },
            error_callback(err_hub),
            None,
        )
        .map_err(|e| Error::Internal(format!("cpal output stream: {e}")))
}
