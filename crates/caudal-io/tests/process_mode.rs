//! Fork-based engine smoke test.
//!
//! Runs the same pass-through pipeline as the thread-mode scenarios, but
//! with process workers: pipe semaphores, an anonymous shared communication
//! area and a System V buffer segment. Kept alone in its own test binary so
//! the fork happens without unrelated sibling test threads in flight.

use caudal_core::SampleFormat;
use caudal_io::backends::file::FileBackend;
use caudal_io::{ChannelBinding, ConcurrencyMode, Engine, EngineConfig, SubdevSpec};
use std::sync::Arc;

#[test]
fn process_mode_passthrough() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.raw");
    let out_path = dir.path().join("out.raw");
    let partition = 64usize;
    let parts = 20usize;

    let payload: Vec<u8> = (0..parts * partition * 4).map(|i| (i % 251) as u8).collect();
    std::fs::write(&in_path, &payload).unwrap();

    let spec = |backend: Arc<dyn caudal_io::IoBackend>| SubdevSpec {
        backend,
        open_channels: 2,
        channels: vec![ChannelBinding::direct(0), ChannelBinding::direct(1)],
        format: SampleFormat::s16_le(),
        uses_clock: true,
    };

    let cfg = EngineConfig {
        concurrency: ConcurrencyMode::Processes,
        ..EngineConfig::default()
    };
    let (engine, _control) = Engine::init(
        cfg,
        partition,
        48000,
        vec![spec(Arc::new(FileBackend::reader(&in_path)))],
        vec![spec(Arc::new(FileBackend::writer(&out_path)))],
    )
    .unwrap();
    engine
        .run(|io| io.output.copy_from_slice(io.input))
        .unwrap();

    let out = std::fs::read(&out_path).unwrap();
    let prefix = 2 * partition * 4;
    assert_eq!(out.len(), prefix + payload.len());
    assert!(out[..prefix].iter().all(|&b| b == 0));
    assert_eq!(&out[prefix..], &payload[..]);
}
