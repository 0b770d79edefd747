//! Deterministic codec for exercising the encoder, recorder and streamer
//! plumbing without a real codec library

use bytes::Bytes;

use crate::codec::{
    BackendFactory, CodecBackend, CodecLock, DataFormat, EncodeStep, EncodedUnit, Family,
    PcmQueue,
};
use crate::encoder::EncoderParams;
use crate::error::CodecError;
use crate::packet::{PacketFlags, StreamInfo, TrackMetadata};

/// Frames consumed per audio packet
pub const FRAME: usize = 441;

/// Emits `HEAD` per serial, then one packet per [`FRAME`] frames carrying the
/// running frame count as a big-endian u64
pub struct CountingBackend {
    frames: u64,
    serial_start: u64,
    restarts: bool,
}

impl CodecBackend for CountingBackend {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            bit_rate: 128,
            sample_rate: 44100,
            channel_count: 2,
            family: PacketFlags::MP3,
        }
    }

    fn frame_size(&self) -> usize {
        FRAME
    }

    fn restarts_on_metadata(&self) -> bool {
        self.restarts
    }

    fn begin_serial(
        &mut self,
        _serial: u32,
        _meta: &TrackMetadata,
        _lock: &CodecLock,
    ) -> Result<Vec<EncodedUnit>, CodecError> {
        self.serial_start = self.frames;
        Ok(vec![EncodedUnit::header(Bytes::from_static(b"HEAD"))])
    }

    fn encode_step(&mut self, input: &mut PcmQueue) -> Result<EncodeStep, CodecError> {
        if input.frames() < FRAME {
            return Ok(EncodeStep::NeedMoreInput);
        }
        input.advance(FRAME);
        self.frames += FRAME as u64;
        let ts = (self.frames - self.serial_start) as f64 / 44100.0;
        Ok(EncodeStep::Produced(vec![EncodedUnit::audio(
            Bytes::copy_from_slice(&self.frames.to_be_bytes()),
            ts,
        )]))
    }

    fn end_serial(&mut self, _input: &mut PcmQueue) -> Result<Vec<EncodedUnit>, CodecError> {
        Ok(Vec::new())
    }

    fn teardown(self: Box<Self>, _lock: &CodecLock) {}
}

/// Opens a [`CountingBackend`] for any MPEG format
#[derive(Debug, Default)]
pub struct CountingFactory {
    /// Restart the serial on every metadata change, the way Ogg codecs do
    pub restarts: bool,
}

impl BackendFactory for CountingFactory {
    fn supports(&self, format: DataFormat) -> bool {
        format.family == Family::Mpeg
    }

    fn open(
        &self,
        _params: &EncoderParams,
        _lock: &CodecLock,
    ) -> Result<Box<dyn CodecBackend>, CodecError> {
        Ok(Box::new(CountingBackend {
            frames: 0,
            serial_start: 0,
            restarts: self.restarts,
        }))
    }
}
