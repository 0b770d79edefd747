//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use livecast::backend::Backend;
use livecast::codec::{Codec, DataFormat, Family};
use livecast::config::AppConfig;
use livecast::encoder::EncoderParams;
use livecast::recorder::{RecordSource, RecorderParams};

pub use livecast::testing::{CountingFactory, FRAME};

pub fn config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.pools.encoders = 1;
    config.pools.recorders = 1;
    config.pools.streamers = 1;
    config.encoder.poll_interval_ms = 2;
    config.recorder.poll_interval_ms = 2;
    config.recorder.default_folder = dir.path().to_path_buf();
    config
}

pub fn mp3() -> EncoderParams {
    EncoderParams {
        format: DataFormat::new(Family::Mpeg, Codec::Mp3),
        ..Default::default()
    }
}

pub fn record_encoder(filename: &str) -> RecorderParams {
    RecorderParams {
        source: RecordSource::Encoder(0),
        folder: None,
        filename: filename.into(),
    }
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

/// Feed silence until the recording reaches `ms`
pub fn feed_until(backend: &Backend, ms: u64) {
    let recorder = backend.recorders.shared(0).unwrap().clone();
    wait_until("recording length", || {
        backend.feed.process(&[0.0; FRAME], &[0.0; FRAME]);
        recorder.length_ms() >= ms
    });
}
