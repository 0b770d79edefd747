//! Codec backends
//!
//! Every codec family implements [`CodecBackend`]; the encoder engine is
//! written once against it. Backends are opened and closed while holding the
//! process-wide [`CodecLock`], which is passed in explicitly.

#[cfg(feature = "mp3")]
pub mod mp3;
pub mod ogg;
#[cfg(feature = "opus")]
pub mod opus;
#[cfg(feature = "vorbis")]
pub mod vorbis;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;

use crate::encoder::EncoderParams;
use crate::error::CodecError;
use crate::packet::{PacketFlags, StreamInfo, TrackMetadata};

/// Container family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Mpeg,
    Ogg,
    Webm,
}

impl Family {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mpeg" => Some(Family::Mpeg),
            "ogg" => Some(Family::Ogg),
            "webm" => Some(Family::Webm),
            _ => None,
        }
    }
}

/// Codec within a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Mp3,
    Mp2,
    Aac,
    AacPlusV2,
    Vorbis,
    Flac,
    Speex,
    Opus,
}

impl Codec {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mp3" => Some(Codec::Mp3),
            "mp2" => Some(Codec::Mp2),
            "aac" => Some(Codec::Aac),
            "aacpv2" => Some(Codec::AacPlusV2),
            "vorbis" => Some(Codec::Vorbis),
            "flac" => Some(Codec::Flac),
            "speex" => Some(Codec::Speex),
            "opus" => Some(Codec::Opus),
            _ => None,
        }
    }
}

/// Negotiated container family plus codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataFormat {
    pub family: Family,
    pub codec: Codec,
}

impl DataFormat {
    pub fn new(family: Family, codec: Codec) -> Self {
        Self { family, codec }
    }

    /// Parse `family` and `codec` names, rejecting combinations that do not exist
    pub fn parse(family: &str, codec: &str) -> Result<Self, CodecError> {
        let family = Family::parse(family)
            .ok_or_else(|| CodecError::UnsupportedFormat(format!("family {family}")))?;
        let codec = Codec::parse(codec)
            .ok_or_else(|| CodecError::UnsupportedFormat(format!("codec {codec}")))?;
        let format = Self { family, codec };
        if format.is_valid() {
            Ok(format)
        } else {
            Err(CodecError::UnsupportedFormat(format.to_string()))
        }
    }

    fn is_valid(&self) -> bool {
        use Codec::*;
        match self.family {
            Family::Mpeg => matches!(self.codec, Mp3 | Mp2 | Aac | AacPlusV2),
            Family::Ogg => matches!(self.codec, Vorbis | Flac | Speex | Opus),
            Family::Webm => matches!(self.codec, Vorbis | Opus),
        }
    }

    /// Container flag carried by every audio packet of this format
    pub fn packet_flag(&self) -> PacketFlags {
        match (self.family, self.codec) {
            (Family::Ogg, _) => PacketFlags::OGG,
            (Family::Webm, _) => PacketFlags::WEBM,
            (Family::Mpeg, Codec::Mp2) => PacketFlags::MP2,
            (Family::Mpeg, Codec::Aac) => PacketFlags::AAC,
            (Family::Mpeg, Codec::AacPlusV2) => PacketFlags::AACP2,
            (Family::Mpeg, _) => PacketFlags::MP3,
        }
    }

    /// Recording file extension
    pub fn extension(&self) -> &'static str {
        match (self.family, self.codec) {
            (Family::Ogg, _) => ".oga",
            (Family::Webm, _) => ".webm",
            (Family::Mpeg, Codec::Mp2) => ".mp2",
            (Family::Mpeg, Codec::Aac | Codec::AacPlusV2) => ".aac",
            (Family::Mpeg, _) => ".mp3",
        }
    }

    /// Recordings in this format get an ID3 tag and MP3-style cue sheet
    pub fn supports_id3(&self) -> bool {
        self.family == Family::Mpeg
    }

    /// Recordings in this format get a Xing/Info frame
    pub fn supports_xing(&self) -> bool {
        self.family == Family::Mpeg && self.codec == Codec::Mp3
    }

    /// Opus only runs at 48 kHz
    pub fn forced_sample_rate(&self) -> Option<u32> {
        (self.codec == Codec::Opus).then_some(48000)
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.family, self.codec)
    }
}

/// Process-wide guard around codec library context creation and teardown
#[derive(Default)]
pub struct CodecLock {
    inner: Mutex<()>,
}

impl CodecLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }
}

/// Planar PCM staged for a backend. Mono streams use channel 0 only.
#[derive(Debug, Default)]
pub struct PcmQueue {
    channels: usize,
    data: [Vec<f32>; 2],
}

impl PcmQueue {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, 2),
            data: [Vec::new(), Vec::new()],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.data[0].len()
    }

    pub fn push(&mut self, left: &[f32], right: &[f32]) {
        self.data[0].extend_from_slice(left);
        if self.channels == 2 {
            self.data[1].extend_from_slice(right);
        }
    }

    /// First `n` frames of each channel; mono returns channel 0 twice
    pub fn front(&self, n: usize) -> (&[f32], &[f32]) {
        let n = n.min(self.frames());
        let left = &self.data[0][..n];
        let right = if self.channels == 2 {
            &self.data[1][..n]
        } else {
            left
        };
        (left, right)
    }

    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.frames());
        for ch in self.data.iter_mut() {
            if ch.len() >= n {
                ch.drain(..n);
            }
        }
    }

    pub fn clear(&mut self) {
        for ch in self.data.iter_mut() {
            ch.clear();
        }
    }

    /// Mutable access used by the engine to stage processed input
    pub fn staging(&mut self) -> &mut [Vec<f32>; 2] {
        &mut self.data
    }
}

/// One compressed unit emitted by a backend
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    /// Extra flags such as HEADER; INITIAL and FINAL are added by the engine
    pub flags: PacketFlags,
    /// Seconds since the start of the serial
    pub timestamp: f64,
}

impl EncodedUnit {
    pub fn audio(data: impl Into<Bytes>, timestamp: f64) -> Self {
        Self {
            data: data.into(),
            flags: PacketFlags::NONE,
            timestamp,
        }
    }

    pub fn header(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: PacketFlags::HEADER,
            timestamp: 0.0,
        }
    }
}

/// Result of one encode step
#[derive(Debug)]
pub enum EncodeStep {
    Produced(Vec<EncodedUnit>),
    NeedMoreInput,
}

/// Capability interface every codec family implements
pub trait CodecBackend {
    /// Header values stamped onto every packet
    fn stream_info(&self) -> StreamInfo;

    /// Preferred number of input frames per step
    fn frame_size(&self) -> usize;

    /// Whether new metadata requires a new serial (tags live in the headers)
    fn restarts_on_metadata(&self) -> bool;

    /// Open a new serial and return its header units
    fn begin_serial(
        &mut self,
        serial: u32,
        meta: &TrackMetadata,
        lock: &CodecLock,
    ) -> Result<Vec<EncodedUnit>, CodecError>;

    /// Encode whatever input is ready
    fn encode_step(&mut self, input: &mut PcmQueue) -> Result<EncodeStep, CodecError>;

    /// Drain delayed frames and close the serial
    fn end_serial(&mut self, input: &mut PcmQueue) -> Result<Vec<EncodedUnit>, CodecError>;

    /// Release codec resources
    fn teardown(self: Box<Self>, lock: &CodecLock);
}

/// Opens backends for the formats it knows
pub trait BackendFactory: Send + Sync {
    fn supports(&self, format: DataFormat) -> bool;

    fn open(
        &self,
        params: &EncoderParams,
        lock: &CodecLock,
    ) -> Result<Box<dyn CodecBackend>, CodecError>;
}

/// Backends compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

impl BackendFactory for DefaultBackends {
    fn supports(&self, format: DataFormat) -> bool {
        match (format.family, format.codec) {
            #[cfg(feature = "mp3")]
            (Family::Mpeg, Codec::Mp3) => true,
            #[cfg(feature = "vorbis")]
            (Family::Ogg, Codec::Vorbis) => true,
            #[cfg(feature = "opus")]
            (Family::Ogg, Codec::Opus) => true,
            _ => false,
        }
    }

    fn open(
        &self,
        params: &EncoderParams,
        lock: &CodecLock,
    ) -> Result<Box<dyn CodecBackend>, CodecError> {
        let _guard = lock.hold();
        match (params.format.family, params.format.codec) {
            #[cfg(feature = "mp3")]
            (Family::Mpeg, Codec::Mp3) => Ok(Box::new(mp3::Mp3Backend::new(params)?)),
            #[cfg(feature = "vorbis")]
            (Family::Ogg, Codec::Vorbis) => Ok(Box::new(vorbis::VorbisBackend::new(params)?)),
            #[cfg(feature = "opus")]
            (Family::Ogg, Codec::Opus) => Ok(Box::new(opus::OpusBackend::new(params)?)),
            _ => Err(CodecError::UnsupportedFormat(params.format.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_formats() {
        let f = DataFormat::parse("ogg", "vorbis").unwrap();
        assert_eq!(f.packet_flag(), PacketFlags::OGG);
        assert_eq!(f.extension(), ".oga");

        let f = DataFormat::parse("mpeg", "mp3").unwrap();
        assert!(f.supports_xing());
        assert_eq!(f.extension(), ".mp3");
    }

    #[test]
    fn test_reject_mismatched_family() {
        assert!(DataFormat::parse("mpeg", "vorbis").is_err());
        assert!(DataFormat::parse("flac", "flac").is_err());
    }

    #[test]
    fn test_unbuilt_codecs_unsupported() {
        let mp2 = DataFormat::new(Family::Mpeg, Codec::Mp2);
        assert!(!DefaultBackends.supports(mp2));
        assert!(!DefaultBackends.supports(DataFormat::new(Family::Webm, Codec::Opus)));
    }

    #[test]
    fn test_mono_queue_mirrors_left() {
        let mut q = PcmQueue::new(1);
        q.push(&[1.0, 2.0, 3.0], &[9.0, 9.0, 9.0]);
        let (l, r) = q.front(2);
        assert_eq!(l, r);
        q.advance(2);
        assert_eq!(q.frames(), 1);
    }
}
