//! End-to-end engine scenarios over file backends.
//!
//! Every test builds a real engine in thread mode, streams raw PCM through
//! the full scheduler pipeline and checks the produced bytes. File
//! descriptors of regular files are always ready, so these tests drive the
//! exact select/rendezvous machinery that real devices would, minus the
//! wall-clock pacing.

use caudal_core::SampleFormat;
use caudal_io::backends::file::FileBackend;
use caudal_io::backends::filecb::CallbackFile;
use caudal_io::{
    ChannelBinding, Direction, Engine, EngineConfig, Error, IoBackend, SubdevSpec,
};
use std::path::Path;
use std::sync::Arc;

const RATE: usize = 48000;

/// Interleaved stereo s16le sine, identical on both channels.
fn sine_pcm(frames: usize, freq: f64, amplitude: f64) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        let s = (2.0 * std::f64::consts::PI * freq * i as f64 / RATE as f64).sin() * amplitude;
        let v = (s as i16).to_le_bytes();
        out.extend_from_slice(&v);
        out.extend_from_slice(&v);
    }
    out
}

fn stereo_spec(backend: Arc<dyn IoBackend>, clocked: bool, max_delay: usize) -> SubdevSpec {
    SubdevSpec {
        backend,
        open_channels: 2,
        channels: vec![
            ChannelBinding::direct(0).with_delay(0, max_delay),
            ChannelBinding::direct(1).with_delay(0, max_delay),
        ],
        format: SampleFormat::s16_le(),
        uses_clock: clocked,
    }
}

fn file_engine(
    in_path: &Path,
    out_path: &Path,
    partition: usize,
    max_delay: usize,
) -> (Engine, caudal_io::Control) {
    Engine::init(
        EngineConfig::default(),
        partition,
        RATE,
        vec![stereo_spec(
            Arc::new(FileBackend::reader(in_path)),
            true,
            max_delay,
        )],
        vec![stereo_spec(
            Arc::new(FileBackend::writer(out_path)),
            true,
            max_delay,
        )],
    )
    .unwrap()
}

/// Sample (both bytes) of channel `ch` at frame `f` in an interleaved
/// stereo s16 byte stream.
fn sample(bytes: &[u8], f: usize, ch: usize) -> &[u8] {
    &bytes[f * 4 + ch * 2..f * 4 + ch * 2 + 2]
}

// ---------------------------------------------------------------------------
// S1: pass-through is bit-exact after the priming partitions
// ---------------------------------------------------------------------------

#[test]
fn passthrough_is_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    let parts = 1000;
    let payload = sine_pcm(parts * partition, 1000.0, 16000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, _control) = file_engine(&in_path, &out_path, partition, 0);
    assert!(!engine.input_poll_mode());
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let prefix = 2 * partition * 4;
    assert_eq!(out.len(), prefix + payload.len());
    assert!(
        out[..prefix].iter().all(|&b| b == 0),
        "priming partitions must be silence"
    );
    assert_eq!(&out[prefix..], &payload[..], "payload must be bit-exact");
}

// ---------------------------------------------------------------------------
// S2: muting an output channel zeroes it from the next partition on
// ---------------------------------------------------------------------------

#[test]
fn output_mute_is_selective() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    let parts = 200;
    let toggle_at = 100usize;
    let payload = sine_pcm(parts * partition, 1000.0, 16000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, control) = file_engine(&in_path, &out_path, partition, 0);
    let ctl = control.clone();
    engine
        .run(move |io| {
            if io.partition_index == toggle_at {
                ctl.toggle_mute(Direction::Output, 0).unwrap();
            }
            io.output.copy_from_slice(io.input);
        })
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let body = &out[2 * partition * 4..];
    for p in 0..parts {
        for i in 0..partition {
            let f = p * partition + i;
            // Channel 1 is never touched.
            assert_eq!(sample(body, f, 1), sample(&payload, f, 1));
            if p + 2 <= toggle_at {
                // Drained strictly before the toggle could be observed.
                assert_eq!(sample(body, f, 0), sample(&payload, f, 0));
            } else if p >= toggle_at {
                assert_eq!(sample(body, f, 0), &[0, 0], "frame {f} must be muted");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// S3: a runtime delay change shifts one channel by exactly d samples
// ---------------------------------------------------------------------------

#[test]
fn output_delay_ramp_shifts_channel() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    let parts = 200;
    let change_at = 100usize;
    let delay = 32usize;
    let payload = sine_pcm(parts * partition, 997.0, 12000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, control) = file_engine(&in_path, &out_path, partition, 64);
    let ctl = control.clone();
    engine
        .run(move |io| {
            if io.partition_index == change_at {
                ctl.change_delay(Direction::Output, 0, delay).unwrap();
            }
            io.output.copy_from_slice(io.input);
        })
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let body = &out[2 * partition * 4..];
    for p in 0..parts {
        for i in 0..partition {
            let f = p * partition + i;
            assert_eq!(sample(body, f, 1), sample(&payload, f, 1));
            if p + 2 <= change_at {
                assert_eq!(sample(body, f, 0), sample(&payload, f, 0));
            } else if p > change_at {
                let expected: &[u8] = if f >= delay {
                    sample(&payload, f - delay, 0)
                } else {
                    &[0, 0]
                };
                assert_eq!(
                    sample(body, f, 0),
                    expected,
                    "frame {f} must lag by {delay} samples"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// S4: blocking input feeding a callback output, mixed block sizes
// ---------------------------------------------------------------------------

#[test]
fn mixed_backends_track_with_fixed_latency() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 256;
    let block = 128;
    let parts = 50;
    let payload = sine_pcm(parts * partition, 440.0, 14000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, _control) = Engine::init(
        EngineConfig::default(),
        partition,
        RATE,
        vec![stereo_spec(
            Arc::new(FileBackend::reader(&in_path)),
            true,
            0,
        )],
        vec![stereo_spec(
            Arc::new(CallbackFile::writer(&out_path).with_block_size(block)),
            true,
            0,
        )],
    )
    .unwrap();
    assert_eq!(engine.min_block_size(), Some(block));
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();

    // iodelay_fill = 2 * partition / block - 2 silence blocks precede the
    // payload; the stream then tracks the input bit-exactly.
    let out = std::fs::read(&out_path).unwrap();
    let silence_frames = (2 * partition / block - 2) * block;
    let prefix = silence_frames * 4;
    assert_eq!(out.len(), prefix + payload.len());
    assert!(out[..prefix].iter().all(|&b| b == 0));
    assert_eq!(&out[prefix..], &payload[..]);
}

// ---------------------------------------------------------------------------
// Callback input feeding a blocking output, short-read termination
// ---------------------------------------------------------------------------

#[test]
fn callback_input_short_read_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 128;
    let parts = 40;
    let tail_frames = 24usize;
    let payload = sine_pcm(parts * partition + tail_frames, 660.0, 9000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, _control) = Engine::init(
        EngineConfig::default(),
        partition,
        RATE,
        vec![stereo_spec(Arc::new(CallbackFile::reader(&in_path)), true, 0)],
        vec![stereo_spec(
            Arc::new(FileBackend::writer(&out_path)),
            true,
            0,
        )],
    )
    .unwrap();
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let prefix = 2 * partition * 4;
    assert_eq!(out.len(), prefix + payload.len());
    assert_eq!(&out[prefix..], &payload[..]);
}

// ---------------------------------------------------------------------------
// S5: a short last read emits exactly the residual payload, then success
// ---------------------------------------------------------------------------

#[test]
fn short_read_emits_exact_residual() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    let parts = 1000;
    let tail_frames = 40usize;
    let payload = sine_pcm(parts * partition + tail_frames, 1000.0, 16000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, _control) = file_engine(&in_path, &out_path, partition, 0);
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let prefix = 2 * partition * 4;
    assert_eq!(
        out.len(),
        prefix + payload.len(),
        "the final partition must carry exactly {tail_frames} frames"
    );
    assert_eq!(&out[prefix..], &payload[..]);
}

// ---------------------------------------------------------------------------
// S6: poll mode switches on when every clocked input is badly aligned
// ---------------------------------------------------------------------------

#[test]
fn poll_mode_activates_for_bad_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let in_a = dir.path().join("a.raw");
    let in_b = dir.path().join("b.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 128;
    let parts = 4;
    std::fs::write(&in_a, sine_pcm(parts * partition, 500.0, 8000.0)).unwrap();
    std::fs::write(&in_b, sine_pcm(parts * partition, 700.0, 8000.0)).unwrap();

    // Backends are single-open, so each init attempt gets fresh specs.
    let make_inputs = || {
        vec![
            SubdevSpec {
                backend: Arc::new(FileBackend::reader(&in_a).with_block_size(96)),
                open_channels: 2,
                channels: vec![ChannelBinding::direct(0), ChannelBinding::direct(1)],
                format: SampleFormat::s16_le(),
                uses_clock: true,
            },
            SubdevSpec {
                backend: Arc::new(FileBackend::reader(&in_b).with_block_size(96)),
                open_channels: 2,
                channels: vec![
                    ChannelBinding::direct(2).with_selection(0),
                    ChannelBinding::direct(3).with_selection(1),
                ],
                format: SampleFormat::s16_le(),
                uses_clock: true,
            },
        ]
    };
    let make_output = || {
        vec![SubdevSpec {
            backend: Arc::new(FileBackend::writer(&out_path)),
            open_channels: 2,
            channels: vec![ChannelBinding::direct(0), ChannelBinding::direct(1)],
            format: SampleFormat::s16_le(),
            uses_clock: true,
        }]
    };

    let (engine, _control) = Engine::init(
        EngineConfig::default(),
        partition,
        RATE,
        make_inputs(),
        make_output(),
    )
    .unwrap();
    assert!(engine.input_poll_mode());
    engine
        .run(|io| {
            let (head, _) = io.output.split_at_mut(io.input.len().min(io.output.len()));
            head.copy_from_slice(&io.input[..head.len()]);
        })
        .unwrap();

    // The same configuration must be refused when poll mode is forbidden.
    let forbid = EngineConfig {
        allow_poll_mode: false,
        ..EngineConfig::default()
    };
    let err = Engine::init(forbid, partition, RATE, make_inputs(), make_output()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

// ---------------------------------------------------------------------------
// Rate monitor: file clocks run wildly fast and must be flagged
// ---------------------------------------------------------------------------

#[test]
fn rate_monitor_flags_impossible_clock() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    // Two seconds of audio delivered as fast as the kernel can: far more
    // than +2 % over nominal.
    let payload = sine_pcm(2 * RATE, 1000.0, 16000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let cfg = EngineConfig {
        monitor_rate: true,
        ..EngineConfig::default()
    };
    let (engine, _control) = Engine::init(
        cfg,
        partition,
        RATE,
        vec![stereo_spec(
            Arc::new(FileBackend::reader(&in_path)),
            true,
            0,
        )],
        vec![stereo_spec(
            Arc::new(FileBackend::writer(&out_path)),
            true,
            0,
        )],
    )
    .unwrap();
    let err = engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap_err();
    assert!(matches!(err, Error::RateDrift { nominal: 48000, .. }));
}

// ---------------------------------------------------------------------------
// Control channel: backend commands are serviced mid-stream
// ---------------------------------------------------------------------------

#[test]
fn subdev_command_roundtrip_during_run() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64;
    let payload = sine_pcm(500 * partition, 1000.0, 16000.0);
    std::fs::write(&in_path, &payload).unwrap();

    let (engine, control) = file_engine(&in_path, &out_path, partition, 0);
    let expected = out_path.display().to_string();
    let commander = std::thread::spawn(move || {
        let reply = control
            .subdev_command(Direction::Output, 0, "path")
            .unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(reply.message, expected);
        let reply = control
            .subdev_command(Direction::Output, 0, "bogus")
            .unwrap();
        assert_eq!(reply.status, -1);
    });
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();
    commander.join().unwrap();
}

// ---------------------------------------------------------------------------
// Init-time validation
// ---------------------------------------------------------------------------

#[test]
fn callback_block_must_divide_partition() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    std::fs::write(&in_path, sine_pcm(256, 500.0, 1000.0)).unwrap();

    let err = Engine::init(
        EngineConfig::default(),
        64,
        RATE,
        vec![stereo_spec(
            Arc::new(FileBackend::reader(&in_path)),
            true,
            0,
        )],
        vec![stereo_spec(
            Arc::new(CallbackFile::writer(&out_path).with_block_size(48)),
            true,
            0,
        )],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn outputs_are_required() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    std::fs::write(&in_path, sine_pcm(64, 500.0, 1000.0)).unwrap();
    let err = Engine::init(
        EngineConfig::default(),
        64,
        RATE,
        vec![stereo_spec(
            Arc::new(FileBackend::reader(&in_path)),
            true,
            0,
        )],
        vec![],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
