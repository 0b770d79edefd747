//! # Livecast
//!
//! Real-time audio encode, fan-out and recording core for live broadcasting.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          REAL-TIME AUDIO CALLBACK                            │
//! │        cpal input stream (audio::capture) → AudioFeed (audio::feed)          │
//! │        heartbeat → Watchdog (audio::watchdog)                                │
//! └──────────┬──────────────────────────────┬───────────────────────────────────┘
//!            │ per-channel SPSC rings       │ per-channel SPSC rings
//!            ▼                              ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  Encoder Slot 0..N (encoder) │   │  Raw Recorder (recorder)     │
//! │  ┌────────────────────────┐  │   │  interleave → WAV writer     │
//! │  │ resample → fade → gain │  │   └──────────────────────────────┘
//! │  └───────────┬────────────┘  │
//! │              ▼               │
//! │  ┌────────────────────────┐  │
//! │  │ CodecBackend (codec::*)│  │   Vorbis / Opus in Ogg, MP3
//! │  └───────────┬────────────┘  │
//! │              ▼               │
//! │  Packet {serial, flags, ..}  │
//! │              │ fan-out       │
//! │  ┌───────────┴────────────┐  │
//! │  │ ClientQueue ClientQueue│  │   (encoder::client)
//! │  └─────┬─────────────┬────┘  │
//! └────────┼─────────────┼───────┘
//!          ▼             ▼
//! ┌────────────────┐ ┌─────────────────────────────────────────┐
//! │ Streamer       │ │ Encoded Recorder                        │
//! │ (streamer)     │ │ file + checkpoints → ID3/Xing/cue sheet │
//! └────────────────┘ └─────────────────────────────────────────┘
//!
//!   control thread: stdin `key=value` lines → command::Dispatcher → Backend
//! ```

pub mod audio;
pub mod backend;
pub mod codec;
pub mod command;
pub mod config;
pub mod encoder;
pub mod error;
pub mod packet;
pub mod recorder;
pub mod state;
pub mod streamer;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate of the audio feed
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// The feed is always stereo
    pub const FEED_CHANNELS: usize = 2;

    /// Default encoder pool size
    pub const DEFAULT_ENCODERS: usize = 6;

    /// Default recorder pool size
    pub const DEFAULT_RECORDERS: usize = 2;

    /// Default streamer pool size
    pub const DEFAULT_STREAMERS: usize = 6;

    /// Encoder PCM ring capacity per channel (samples)
    pub const ENCODER_RING_SAMPLES: usize = 53000;

    /// Raw recorder PCM ring capacity per channel (samples)
    pub const RECORDER_RING_SAMPLES: usize = 10000;

    /// Packet queue capacity per client
    pub const CLIENT_QUEUE_PACKETS: usize = 256;

    /// Worker polling interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 10;

    /// Control thread wait bound for synchronous transitions
    pub const STATE_WAIT_TIMEOUT_SECS: u64 = 10;

    /// Seconds without audio callbacks before forced shutdown
    pub const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = 10;

    /// Fade-out ramp length
    pub const FADE_SECONDS: f32 = 6.0;

    /// Ogg pages are flushed at least this often (fraction of a second)
    pub const OGG_PAGE_INTERVAL_DIVISOR: u32 = 10;

    /// Padding appended to the ID3 tag
    pub const ID3_PADDING: usize = 512;
}
