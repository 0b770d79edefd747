//! Typed encoder parameters

use crate::audio::resample::ResampleQuality;
use crate::codec::{Codec, DataFormat, Family};
use crate::constants::DEFAULT_SAMPLE_RATE;

/// Highest Opus complexity setting
pub const MAX_COMPLEXITY: u32 = 10;

/// Where the encoder takes its PCM from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeSource {
    /// The real-time audio feed
    #[default]
    Live,
    /// Streaming straight from a file; recognised but not supported
    File,
}

impl EncodeSource {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "jack" | "live" => Some(EncodeSource::Live),
            "file" => Some(EncodeSource::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    #[default]
    Stereo,
    JointStereo,
    Mono,
}

impl ChannelMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "stereo" => Some(ChannelMode::Stereo),
            "jointstereo" => Some(ChannelMode::JointStereo),
            "mono" => Some(ChannelMode::Mono),
            _ => None,
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }
}

/// Bitrate management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variability {
    #[default]
    Constant,
    /// Constrained VBR
    Constrained,
    /// Free VBR with an allowed swing in percent of the nominal rate
    Variable(u32),
}

impl Variability {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "constant" | "cbr" => Some(Variability::Constant),
            "cvbr" => Some(Variability::Constrained),
            "vbr" => Some(Variability::Variable(0)),
            other => other.parse().ok().map(Variability::Variable),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub format: DataFormat,
    pub source: EncodeSource,
    /// Target sample rate of the encoded stream
    pub sample_rate: u32,
    pub resample_quality: ResampleQuality,
    /// Nominal bitrate in kbps
    pub bitrate: u32,
    pub variability: Variability,
    /// Codec quality knob (LAME 0 best .. 9 worst)
    pub quality: u32,
    /// Opus encoder complexity, 0 fastest .. 10 best
    pub complexity: u32,
    /// Opus frame duration in ms
    pub frame_ms: u32,
    pub mode: ChannelMode,
    pub use_metadata: bool,
    pub pregain: f32,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            format: DataFormat::new(Family::Ogg, Codec::Vorbis),
            source: EncodeSource::Live,
            sample_rate: DEFAULT_SAMPLE_RATE,
            resample_quality: ResampleQuality::default(),
            bitrate: 128,
            variability: Variability::Constant,
            quality: 2,
            complexity: MAX_COMPLEXITY,
            frame_ms: 20,
            mode: ChannelMode::Stereo,
            use_metadata: true,
            pregain: 1.0,
        }
    }
}

impl EncoderParams {
    pub fn channels(&self) -> usize {
        self.mode.channels()
    }

    /// Sample rate the codec actually runs at
    pub fn target_rate(&self) -> u32 {
        self.format.forced_sample_rate().unwrap_or(self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variability_forms() {
        assert_eq!(Variability::parse("constant"), Some(Variability::Constant));
        assert_eq!(Variability::parse("cvbr"), Some(Variability::Constrained));
        assert_eq!(Variability::parse("15"), Some(Variability::Variable(15)));
        assert_eq!(Variability::parse("wobbly"), None);
    }

    #[test]
    fn test_opus_target_rate_forced() {
        let params = EncoderParams {
            format: DataFormat::new(Family::Ogg, Codec::Opus),
            sample_rate: 44100,
            ..Default::default()
        };
        assert_eq!(params.target_rate(), 48000);
    }
}
