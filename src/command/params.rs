//! Accumulated `key=value` parameters and their typed views

use std::collections::HashMap;
use std::path::PathBuf;

use crate::audio::ResampleQuality;
use crate::codec::DataFormat;
use crate::encoder::{ChannelMode, EncodeSource, EncoderParams, Variability, MAX_COMPLEXITY};
use crate::error::{CommandError, EncoderError, Error, Result};
use crate::packet::TrackMetadata;
use crate::recorder::{RecordSource, RecorderParams};
use crate::streamer::StreamerParams;

/// Every key the control channel may set
pub const KNOWN_KEYS: &[&str] = &[
    "tab_id",
    "dev_type",
    // encoder
    "encode_source",
    "samplerate",
    "resample_quality",
    "family",
    "codec",
    "bitrate",
    "variability",
    "quality",
    "complexity",
    "framesize",
    "mode",
    "metadata_mode",
    "pregain",
    "custom_meta",
    "artist",
    "title",
    "album",
    // streamer
    "stream_source",
    "host",
    "port",
    // recorder
    "record_source",
    "record_folder",
    "record_filename",
    // feed
    "sample_rate",
];

/// Instance selector of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One(usize),
    /// `tab_id=-1`
    All,
}

/// Parameters accumulated since the last command
#[derive(Debug, Default, Clone)]
pub struct ParamSet {
    values: HashMap<&'static str, String>,
}

fn invalid(key: &'static str, value: &str) -> Error {
    EncoderError::InvalidParameter {
        key,
        value: value.to_string(),
    }
    .into()
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), CommandError> {
        let key = KNOWN_KEYS
            .iter()
            .copied()
            .find(|k| *k == key)
            .ok_or_else(|| CommandError::UnknownKey(key.to_string()))?;
        self.values.insert(key, value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn text(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    fn require(&self, key: &'static str) -> std::result::Result<&str, CommandError> {
        self.get(key).ok_or(CommandError::MissingParameter(key))
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>> {
        match self.get(key) {
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, text)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn target(&self) -> std::result::Result<Target, CommandError> {
        let text = self.require("tab_id")?;
        match text.trim().parse::<i64>() {
            Ok(-1) => Ok(Target::All),
            Ok(n) if n >= 0 => Ok(Target::One(n as usize)),
            _ => Err(CommandError::InvalidIndex(text.to_string())),
        }
    }

    /// `tab_id` of a command addressing exactly one instance
    pub fn index(&self) -> std::result::Result<usize, CommandError> {
        match self.target()? {
            Target::One(n) => Ok(n),
            Target::All => Err(CommandError::InvalidIndex("-1".into())),
        }
    }

    pub fn song_metadata(&self) -> TrackMetadata {
        TrackMetadata {
            custom: self.text("custom_meta"),
            artist: self.text("artist"),
            title: self.text("title"),
            album: self.text("album"),
        }
    }

    /// Encoder parameters; unset keys keep their defaults
    pub fn encoder_params(&self) -> Result<EncoderParams> {
        let mut params = EncoderParams::default();

        if self.get("family").is_some() || self.get("codec").is_some() {
            params.format = DataFormat::parse(
                self.get("family").unwrap_or("ogg"),
                self.get("codec").unwrap_or("vorbis"),
            )?;
        }
        if let Some(text) = self.get("encode_source") {
            params.source =
                EncodeSource::parse(text).ok_or_else(|| invalid("encode_source", text))?;
        }
        if let Some(rate) = self.number::<u32>("samplerate")? {
            params.sample_rate = rate;
        }
        if let Some(text) = self.get("resample_quality") {
            params.resample_quality =
                ResampleQuality::parse(text).ok_or_else(|| invalid("resample_quality", text))?;
        }
        if let Some(bitrate) = self.number::<u32>("bitrate")? {
            params.bitrate = bitrate;
        }
        if let Some(text) = self.get("variability") {
            params.variability =
                Variability::parse(text).ok_or_else(|| invalid("variability", text))?;
        }
        if let Some(quality) = self.number::<u32>("quality")? {
            params.quality = quality;
        }
        if let Some(frame_ms) = self.number::<u32>("framesize")? {
            params.frame_ms = frame_ms;
        }
        if let Some(text) = self.get("mode") {
            params.mode = ChannelMode::parse(text).ok_or_else(|| invalid("mode", text))?;
        }
        if let Some(text) = self.get("metadata_mode") {
            params.use_metadata = text != "suppressed";
        }
        if let Some(pregain) = self.number::<f32>("pregain")? {
            if !pregain.is_finite() || pregain < 0.0 {
                return Err(invalid("pregain", &pregain.to_string()));
            }
            params.pregain = pregain;
        }
        if let Some(complexity) = self.number::<u32>("complexity")? {
            if complexity > MAX_COMPLEXITY {
                return Err(invalid("complexity", &complexity.to_string()));
            }
            params.complexity = complexity;
        }
        if params.sample_rate == 0 || params.bitrate == 0 {
            return Err(invalid("samplerate/bitrate", "0"));
        }
        Ok(params)
    }

    pub fn recorder_params(&self) -> std::result::Result<RecorderParams, CommandError> {
        let text = self.require("record_source")?;
        let source = RecordSource::parse(text)
            .ok_or_else(|| CommandError::InvalidIndex(text.to_string()))?;
        let folder = self
            .get("record_folder")
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);
        Ok(RecorderParams {
            source,
            folder,
            filename: self.text("record_filename"),
        })
    }

    pub fn streamer_params(&self) -> std::result::Result<StreamerParams, CommandError> {
        let text = self.require("stream_source")?;
        let source = text
            .trim()
            .parse()
            .map_err(|_| CommandError::InvalidIndex(text.to_string()))?;
        let host = self.require("host")?.to_string();
        let port_text = self.require("port")?;
        let port = port_text
            .trim()
            .parse()
            .map_err(|_| CommandError::MalformedLine(format!("port={}", port_text)))?;
        Ok(StreamerParams { source, host, port })
    }

    pub fn sample_rate(&self) -> Result<u32> {
        self.number::<u32>("sample_rate")?
            .filter(|rate| *rate > 0)
            .ok_or_else(|| CommandError::MissingParameter("sample_rate").into())
    }
}
