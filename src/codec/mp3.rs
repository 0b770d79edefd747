//! MPEG-1/2 Layer III backend on LAME
//!
//! One LAME instance lives for the whole encoder run. A serial boundary is a
//! `FlushNoGap`, so the decoded stream stays sample-continuous across it and
//! metadata travels out of band instead of forcing a restart.
//!
//! `variability=vbr` runs LAME's MTRH VBR mode at the `quality` level. Every
//! other setting, `cvbr` included, is CBR at the nearest legal bitrate.

use mp3lame_encoder::{
    max_required_buffer_size, Bitrate, Builder, Encoder, FlushNoGap, InterleavedPcm, MonoPcm,
    Quality, VbrMode,
};

use crate::codec::{CodecBackend, CodecLock, EncodeStep, EncodedUnit, PcmQueue};
use crate::encoder::{EncoderParams, Variability};
use crate::error::CodecError;
use crate::packet::{PacketFlags, StreamInfo, TrackMetadata};

/// Upper bound on frames handed to LAME per step
const MAX_STEP_FRAMES: usize = 8192;

/// Room LAME needs for the final frames of a flush
const FLUSH_RESERVE: usize = 7200;

const BITRATES: [(u32, Bitrate); 16] = [
    (8, Bitrate::Kbps8),
    (16, Bitrate::Kbps16),
    (24, Bitrate::Kbps24),
    (32, Bitrate::Kbps32),
    (40, Bitrate::Kbps40),
    (48, Bitrate::Kbps48),
    (64, Bitrate::Kbps64),
    (80, Bitrate::Kbps80),
    (96, Bitrate::Kbps96),
    (112, Bitrate::Kbps112),
    (128, Bitrate::Kbps128),
    (160, Bitrate::Kbps160),
    (192, Bitrate::Kbps192),
    (224, Bitrate::Kbps224),
    (256, Bitrate::Kbps256),
    (320, Bitrate::Kbps320),
];

/// Closest bitrate LAME accepts, in kbps
pub fn nearest_bitrate(kbps: u32) -> (u32, Bitrate) {
    BITRATES
        .iter()
        .copied()
        .min_by_key(|(rate, _)| rate.abs_diff(kbps))
        .unwrap_or((128, Bitrate::Kbps128))
}

fn quality(level: u32) -> Quality {
    match level {
        0 => Quality::Best,
        1 => Quality::SecondBest,
        2 => Quality::NearBest,
        3 => Quality::VeryNice,
        4 => Quality::Nice,
        5 => Quality::Good,
        6 => Quality::Decent,
        7 => Quality::Ok,
        8 => Quality::SecondWorst,
        _ => Quality::Worst,
    }
}

pub struct Mp3Backend {
    lame: Encoder,
    sample_rate: u32,
    channels: usize,
    bitrate: u32,
    vbr: bool,
    /// Samples consumed since the serial began
    serial_samples: u64,
    interleaved: Vec<f32>,
    output: Vec<u8>,
}

impl Mp3Backend {
    pub fn new(params: &EncoderParams) -> Result<Self, CodecError> {
        let sample_rate = params.target_rate();
        let channels = params.channels();
        let (bitrate, brate) = nearest_bitrate(params.bitrate);
        if bitrate != params.bitrate {
            tracing::warn!(
                "MP3 bitrate {} kbps not available, using {} kbps",
                params.bitrate,
                bitrate
            );
        }

        let mut builder = Builder::new()
            .ok_or_else(|| CodecError::EncoderInit("Failed to create LAME builder".into()))?;
        builder
            .set_num_channels(channels as u8)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set channels: {:?}", e)))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set sample rate: {:?}", e)))?;
        builder
            .set_brate(brate)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {:?}", e)))?;
        builder
            .set_quality(quality(params.quality))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set quality: {:?}", e)))?;
        // the recorder writes its own Xing frame
        builder
            .set_to_write_vbr_tag(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to disable VBR tag: {:?}", e)))?;
        let vbr = matches!(params.variability, Variability::Variable(_));
        if vbr {
            builder
                .set_vbr_mode(VbrMode::Mtrh)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {:?}", e)))?;
            builder
                .set_vbr_quality(quality(params.quality))
                .map_err(|e| {
                    CodecError::EncoderInit(format!("Failed to set VBR quality: {:?}", e))
                })?;
        }
        tracing::debug!(
            "LAME {} at {} kbps nominal, quality {}",
            if vbr { "VBR" } else { "CBR" },
            bitrate,
            params.quality
        );
        let lame = builder
            .build()
            .map_err(|e| CodecError::EncoderInit(format!("{:?}", e)))?;

        Ok(Self {
            lame,
            sample_rate,
            channels,
            bitrate,
            vbr,
            serial_samples: 0,
            interleaved: Vec::with_capacity(MAX_STEP_FRAMES * 2),
            output: Vec::new(),
        })
    }

    pub fn is_vbr(&self) -> bool {
        self.vbr
    }

    fn timestamp(&self) -> f64 {
        self.serial_samples as f64 / self.sample_rate as f64
    }

    /// Encode up to `MAX_STEP_FRAMES` from the queue into `self.output`
    fn encode_chunk(&mut self, input: &mut PcmQueue) -> Result<usize, CodecError> {
        let frames = input.frames().min(MAX_STEP_FRAMES);
        if frames == 0 {
            return Ok(0);
        }
        let (left, right) = input.front(frames);
        self.output.reserve(max_required_buffer_size(frames));
        let written = if self.channels == 2 {
            self.interleaved.clear();
            for (l, r) in left.iter().zip(right) {
                self.interleaved.push(*l);
                self.interleaved.push(*r);
            }
            self.lame
                .encode_to_vec(InterleavedPcm(&self.interleaved), &mut self.output)
        } else {
            self.lame.encode_to_vec(MonoPcm(left), &mut self.output)
        }
        .map_err(|e| CodecError::EncodingFailed(format!("{:?}", e)))?;

        input.advance(frames);
        self.serial_samples += frames as u64;
        Ok(written)
    }
}

impl CodecBackend for Mp3Backend {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            bit_rate: self.bitrate,
            sample_rate: self.sample_rate,
            channel_count: self.channels as u16,
            family: PacketFlags::MP3,
        }
    }

    fn frame_size(&self) -> usize {
        1152
    }

    fn restarts_on_metadata(&self) -> bool {
        false
    }

    fn begin_serial(
        &mut self,
        _serial: u32,
        _meta: &TrackMetadata,
        _lock: &CodecLock,
    ) -> Result<Vec<EncodedUnit>, CodecError> {
        self.serial_samples = 0;
        self.output.clear();
        Ok(Vec::new())
    }

    fn encode_step(&mut self, input: &mut PcmQueue) -> Result<EncodeStep, CodecError> {
        if input.frames() == 0 {
            return Ok(EncodeStep::NeedMoreInput);
        }
        self.encode_chunk(input)?;
        if self.output.is_empty() {
            return Ok(EncodeStep::NeedMoreInput);
        }
        let data = std::mem::take(&mut self.output);
        Ok(EncodeStep::Produced(vec![EncodedUnit::audio(
            data,
            self.timestamp(),
        )]))
    }

    fn end_serial(&mut self, input: &mut PcmQueue) -> Result<Vec<EncodedUnit>, CodecError> {
        while input.frames() > 0 {
            self.encode_chunk(input)?;
        }
        self.output.reserve(FLUSH_RESERVE);
        self.lame
            .flush_to_vec::<FlushNoGap>(&mut self.output)
            .map_err(|e| CodecError::EncodingFailed(format!("{:?}", e)))?;

        if self.output.is_empty() {
            return Ok(Vec::new());
        }
        let data = std::mem::take(&mut self.output);
        Ok(vec![EncodedUnit::audio(data, self.timestamp())])
    }

    fn teardown(self: Box<Self>, lock: &CodecLock) {
        let _guard = lock.hold();
        drop(self);
        tracing::debug!("LAME encoder released");
    }
}
