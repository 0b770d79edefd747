//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod fade;
pub mod feed;
pub mod resample;
pub mod watchdog;

pub use buffer::{RingBuffer, SharedRingBuffer, StereoRing};
pub use capture::AudioCapture;
pub use fade::FadeRamp;
pub use feed::{AudioFeed, PcmSink, SharedPcmSink};
pub use resample::{ResampleQuality, StreamResampler};
pub use watchdog::{ShutdownReason, Watchdog};
