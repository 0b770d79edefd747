//! Process-wide pools
//!
//! Everything here is allocated once at startup: the audio feed with one PCM
//! sink per encoder slot and per recorder, the encoder, recorder and
//! streamer pools, and the codec lock shared by every backend.

use std::sync::Arc;

use crate::audio::AudioFeed;
use crate::codec::{BackendFactory, CodecLock, DefaultBackends};
use crate::config::AppConfig;
use crate::encoder::{EncoderPool, EncoderRuntime};
use crate::error::Result;
use crate::recorder::RecorderPool;
use crate::streamer::StreamerPool;

pub struct Backend {
    pub feed: Arc<AudioFeed>,
    pub encoders: EncoderPool,
    pub recorders: RecorderPool,
    pub streamers: StreamerPool,
}

impl Backend {
    /// Build the pools with the codecs compiled into this binary
    pub fn new(config: &AppConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(DefaultBackends))
    }

    pub fn with_factory(config: &AppConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let mut feed = AudioFeed::new(config.audio.sample_rate);
        let encoder_sinks = (0..config.pools.encoders)
            .map(|_| feed.add_sink(config.encoder.input_ring_samples))
            .collect();
        let recorder_sinks = (0..config.pools.recorders)
            .map(|_| feed.add_sink(config.recorder.input_ring_samples))
            .collect();
        let feed = Arc::new(feed);
        let wait_timeout = config.control.state_wait_timeout();

        let runtime = EncoderRuntime {
            feed: feed.clone(),
            factory,
            lock: Arc::new(CodecLock::new()),
            poll_interval: config.encoder.poll_interval(),
            fade_seconds: config.encoder.fade_seconds,
        };
        let encoders = EncoderPool::new(&config.encoder, encoder_sinks, runtime, wait_timeout)?;
        let recorders =
            RecorderPool::new(&config.recorder, recorder_sinks, feed.clone(), wait_timeout)?;
        let streamers = StreamerPool::new(
            config.pools.streamers,
            config.encoder.poll_interval(),
            wait_timeout,
        )?;

        tracing::info!(
            "Backend ready: {} encoders, {} recorders, {} streamers at {} Hz",
            encoders.len(),
            recorders.len(),
            streamers.len(),
            feed.sample_rate()
        );
        Ok(Self {
            feed,
            encoders,
            recorders,
            streamers,
        })
    }
}
