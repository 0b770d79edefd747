//! Ogg/Vorbis backend
//!
//! libvorbis contexts cannot be reopened with new comments, so every serial
//! gets a fresh encoder. Tags are written as Vorbis comments, which is why
//! this backend restarts on metadata.
//!
//! libogg is asked for a page as soon as four packets are queued, whatever
//! their size. With 2048-sample long blocks that is a page per 4096 samples,
//! inside the 100 ms page interval at 44.1 and 48 kHz even when silence makes
//! packets tiny.

use std::num::{NonZeroU32, NonZeroU8};

use vorbis_rs::{VorbisBitrateManagementStrategy, VorbisEncoder, VorbisEncoderBuilder};

use crate::codec::ogg::{comment_tags, PageSplitter, SharedSink};
use crate::codec::{CodecBackend, CodecLock, EncodeStep, EncodedUnit, PcmQueue};
use crate::encoder::{EncoderParams, Variability};
use crate::error::CodecError;
use crate::packet::{PacketFlags, StreamInfo, TrackMetadata};

/// Frames handed to libvorbis per step
const BLOCK_FRAMES: usize = 1024;

pub struct VorbisBackend {
    encoder: Option<VorbisEncoder<SharedSink>>,
    sink: SharedSink,
    splitter: PageSplitter,
    sample_rate: u32,
    channels: usize,
    bitrate: u32,
    variability: Variability,
}

impl VorbisBackend {
    pub fn new(params: &EncoderParams) -> Result<Self, CodecError> {
        if params.bitrate == 0 {
            return Err(CodecError::EncoderInit("bitrate must be non-zero".into()));
        }
        Ok(Self {
            encoder: None,
            sink: SharedSink::default(),
            splitter: PageSplitter::default(),
            sample_rate: params.target_rate(),
            channels: params.channels(),
            bitrate: params.bitrate,
            variability: params.variability,
        })
    }

    fn strategy(&self) -> Result<VorbisBitrateManagementStrategy, CodecError> {
        let bps = NonZeroU32::new(self.bitrate * 1000)
            .ok_or_else(|| CodecError::EncoderInit("bitrate must be non-zero".into()))?;
        Ok(match self.variability {
            Variability::Constant | Variability::Constrained => {
                VorbisBitrateManagementStrategy::ConstrainedAbr {
                    maximum_bitrate: bps,
                }
            }
            Variability::Variable(_) => VorbisBitrateManagementStrategy::Vbr {
                target_bitrate: bps,
            },
        })
    }

    fn collect(&mut self) -> Vec<EncodedUnit> {
        self.splitter.push(&self.sink.take());
        match self.splitter.take_pages() {
            Some((pages, granule)) => {
                let timestamp = granule.map_or(0.0, |g| g as f64 / self.sample_rate as f64);
                vec![EncodedUnit::audio(pages, timestamp)]
            }
            None => Vec::new(),
        }
    }
}

impl CodecBackend for VorbisBackend {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            bit_rate: self.bitrate,
            sample_rate: self.sample_rate,
            channel_count: self.channels as u16,
            family: PacketFlags::OGG,
        }
    }

    fn frame_size(&self) -> usize {
        BLOCK_FRAMES
    }

    fn restarts_on_metadata(&self) -> bool {
        true
    }

    fn begin_serial(
        &mut self,
        serial: u32,
        meta: &TrackMetadata,
        lock: &CodecLock,
    ) -> Result<Vec<EncodedUnit>, CodecError> {
        let rate = NonZeroU32::new(self.sample_rate)
            .ok_or_else(|| CodecError::EncoderInit("sample rate must be non-zero".into()))?;
        let channels = NonZeroU8::new(self.channels as u8)
            .ok_or_else(|| CodecError::EncoderInit("channel count must be non-zero".into()))?;
        let strategy = self.strategy()?;

        let _guard = lock.hold();
        let mut builder = VorbisEncoderBuilder::new(rate, channels, self.sink.clone())
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        builder.stream_serial(serial as i32);
        builder.bitrate_management_strategy(strategy);
        builder.minimum_page_data_size(Some(0));
        for (key, value) in comment_tags(meta) {
            let _ = builder.comment_tag(key, value);
        }
        let encoder = builder
            .build()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        self.encoder = Some(encoder);

        self.splitter.clear();
        Ok(self
            .collect()
            .into_iter()
            .map(|unit| EncodedUnit::header(unit.data))
            .collect())
    }

    fn encode_step(&mut self, input: &mut PcmQueue) -> Result<EncodeStep, CodecError> {
        let frames = input.frames().min(BLOCK_FRAMES);
        if frames == 0 {
            return Ok(EncodeStep::NeedMoreInput);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::EncodingFailed("no open serial".into()))?;
        {
            let (left, right) = input.front(frames);
            let result = if self.channels == 2 {
                encoder.encode_audio_block([left, right])
            } else {
                encoder.encode_audio_block([left])
            };
            result.map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        }
        input.advance(frames);

        let units = self.collect();
        if units.is_empty() {
            Ok(EncodeStep::NeedMoreInput)
        } else {
            Ok(EncodeStep::Produced(units))
        }
    }

    fn end_serial(&mut self, input: &mut PcmQueue) -> Result<Vec<EncodedUnit>, CodecError> {
        let mut units = Vec::new();
        while input.frames() > 0 {
            if let EncodeStep::Produced(more) = self.encode_step(input)? {
                units.extend(more);
            }
        }
        if let Some(encoder) = self.encoder.take() {
            encoder
                .finish()
                .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        }
        units.extend(self.collect());
        Ok(units)
    }

    fn teardown(mut self: Box<Self>, lock: &CodecLock) {
        let _guard = lock.hold();
        if let Some(encoder) = self.encoder.take() {
            let _ = encoder.finish();
        }
        tracing::debug!("Vorbis backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ogg::parse_page;
    use crate::constants::OGG_PAGE_INTERVAL_DIVISOR;

    #[test]
    fn test_serial_headers_then_final_granule() {
        let lock = CodecLock::new();
        let params = EncoderParams::default();
        let mut backend = VorbisBackend::new(&params).unwrap();
        let headers = backend
            .begin_serial(1234, &TrackMetadata::default(), &lock)
            .unwrap();
        let mut input = PcmQueue::new(2);
        input.push(&vec![0.0; 44100], &vec![0.0; 44100]);
        let mut units = headers;
        while input.frames() > 0 {
            if let EncodeStep::Produced(more) = backend.encode_step(&mut input).unwrap() {
                units.extend(more);
            }
        }
        units.extend(backend.end_serial(&mut input).unwrap());
        let last = units.last().unwrap();
        assert!((last.timestamp - 1.0).abs() < 0.05);
        Box::new(backend).teardown(&lock);
    }

    #[test]
    fn test_low_bitrate_pages_stay_within_interval() {
        let lock = CodecLock::new();
        let params = EncoderParams {
            bitrate: 96,
            ..Default::default()
        };
        let mut backend = VorbisBackend::new(&params).unwrap();
        backend
            .begin_serial(77, &TrackMetadata::default(), &lock)
            .unwrap();

        let mut input = PcmQueue::new(2);
        input.push(&vec![0.0; 88200], &vec![0.0; 88200]);
        let mut units = Vec::new();
        while input.frames() > 0 {
            if let EncodeStep::Produced(more) = backend.encode_step(&mut input).unwrap() {
                units.extend(more);
            }
        }
        units.extend(backend.end_serial(&mut input).unwrap());

        let mut pages = Vec::new();
        for unit in &units {
            let mut rest = &unit.data[..];
            while let Some(page) = parse_page(rest) {
                pages.push(page);
                rest = &rest[page.len..];
            }
            assert!(rest.is_empty());
        }
        assert!(pages.last().unwrap().eos);
        assert!(pages.len() > 15, "only {} pages for two seconds", pages.len());

        let limit = (44100 / OGG_PAGE_INTERVAL_DIVISOR) as i64;
        let mut previous = 0;
        for page in pages.iter().filter(|p| !p.eos && p.granule >= 0) {
            assert!(
                page.granule - previous <= limit,
                "page at granule {} follows {}",
                page.granule,
                previous
            );
            previous = page.granule;
        }
        Box::new(backend).teardown(&lock);
    }
}
