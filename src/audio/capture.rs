//! Audio capture from an input device
//!
//! Builds a cpal input stream on a dedicated thread and drives the
//! [`AudioFeed`] from its callback. Interleaved device blocks are split into
//! preallocated planar scratch buffers so the callback never allocates.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::find_input_device;
use crate::audio::feed::AudioFeed;
use crate::error::AudioError;

/// Largest block split in one pass; longer device blocks are chunked
const SCRATCH_FRAMES: usize = 8192;

pub struct AudioCapture {
    device_name: Option<String>,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl AudioCapture {
    /// Prepare capture from `device_name` (host default for `None`)
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self, AudioError> {
        let device = find_input_device(device_name)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels().min(2),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device_name: device_name.map(str::to_string),
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start capturing into `feed`
    pub fn start(&mut self, feed: Arc<AudioFeed>) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_input_device(self.device_name.as_deref())?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let config = self.config.clone();
        let channels = config.channels as usize;
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let mut left = vec![0.0f32; SCRATCH_FRAMES];
                let mut right = vec![0.0f32; SCRATCH_FRAMES];
                let callback_feed = feed.clone();

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for block in data.chunks(SCRATCH_FRAMES * channels) {
                            let frames = block.len() / channels;
                            for (i, frame) in block.chunks_exact(channels).enumerate() {
                                left[i] = frame[0];
                                right[i] = frame[channels - 1];
                            }
                            callback_feed.process(&left[..frames], &right[..frames]);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!("Failed to build stream: {}", e);
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    tracing::error!("Failed to start stream: {}", e);
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                tracing::info!(
                    "Audio capture started: {} Hz, {} channel(s)",
                    self.config.sample_rate.0,
                    self.config.channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("capture thread did not report".into()))
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll for stream errors reported by the backend
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
