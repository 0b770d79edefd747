//! Ogg/Opus backend
//!
//! Opus always runs at 48 kHz. Each serial is a new logical Ogg stream with
//! its own `OpusHead`/`OpusTags` header pages; pages are closed at least
//! every 100 ms of audio so late joiners and recorders see steady output.

use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Channels, Encoder};

use crate::codec::ogg::{comment_tags, PageSplitter};
use crate::codec::{CodecBackend, CodecLock, EncodeStep, EncodedUnit, PcmQueue};
use crate::constants::OGG_PAGE_INTERVAL_DIVISOR;
use crate::encoder::{EncoderParams, Variability};
use crate::error::CodecError;
use crate::packet::{PacketFlags, StreamInfo, TrackMetadata};

pub const OPUS_RATE: u32 = 48000;

/// Encoder delay signalled to decoders in `OpusHead`
const PRESKIP: u16 = 312;

const VENDOR: &str = "livecast";

pub struct OpusBackend {
    encoder: Option<Encoder>,
    writer: PacketWriter<'static, Vec<u8>>,
    splitter: PageSplitter,
    channels: usize,
    bitrate: u32,
    variability: Variability,
    complexity: u32,
    /// Samples per channel per Opus frame
    frame_size: usize,
    serial: u32,
    granule: u64,
    samples_since_page: u64,
    encode_buffer: Vec<u8>,
    interleaved: Vec<f32>,
}

impl OpusBackend {
    pub fn new(params: &EncoderParams) -> Result<Self, CodecError> {
        let frame_size = match params.frame_ms {
            10 | 20 | 40 | 60 => params.frame_ms as usize * 48,
            other => return Err(CodecError::InvalidFrameSize(other as usize)),
        };
        let channels = params.channels();

        Ok(Self {
            encoder: None,
            writer: PacketWriter::new(Vec::new()),
            splitter: PageSplitter::default(),
            channels,
            bitrate: params.bitrate,
            variability: params.variability,
            complexity: params.complexity,
            frame_size,
            serial: 0,
            granule: 0,
            samples_since_page: 0,
            encode_buffer: vec![0u8; 4000],
            interleaved: Vec::with_capacity(frame_size * channels),
        })
    }

    /// Create a libopus encoder with all settings
    fn open_encoder(&self) -> Result<Encoder, CodecError> {
        let channels = match self.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };
        let mut encoder = Encoder::new(OPUS_RATE, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(self.bitrate as i32 * 1000))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        let (vbr, constrained) = match self.variability {
            Variability::Constant => (false, false),
            Variability::Constrained => (true, true),
            Variability::Variable(_) => (true, false),
        };
        encoder
            .set_vbr(vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        if vbr {
            encoder
                .set_vbr_constraint(constrained)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder
            .set_complexity(self.complexity as i32)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;
        Ok(encoder)
    }

    fn head_packet(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(self.channels as u8);
        head.extend_from_slice(&PRESKIP.to_le_bytes());
        head.extend_from_slice(&OPUS_RATE.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);
        head
    }

    fn tags_packet(meta: &TrackMetadata) -> Vec<u8> {
        let tags = comment_tags(meta);
        let mut packet = Vec::new();
        packet.extend_from_slice(b"OpusTags");
        packet.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
        packet.extend_from_slice(VENDOR.as_bytes());
        packet.extend_from_slice(&(tags.len() as u32).to_le_bytes());
        for (key, value) in tags {
            let comment = format!("{}={}", key, value);
            packet.extend_from_slice(&(comment.len() as u32).to_le_bytes());
            packet.extend_from_slice(comment.as_bytes());
        }
        packet
    }

    /// Encode one frame of `frames` real samples, zero padded to a full frame
    fn encode_frame(
        &mut self,
        left: &[f32],
        right: &[f32],
        end: PacketWriteEndInfo,
    ) -> Result<(), CodecError> {
        let real = left.len();
        self.interleaved.clear();
        for i in 0..self.frame_size {
            let (l, r) = if i < real { (left[i], right[i]) } else { (0.0, 0.0) };
            self.interleaved.push(l);
            if self.channels == 2 {
                self.interleaved.push(r);
            }
        }

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::EncodingFailed("no open serial".into()))?;
        let size = encoder
            .encode_float(&self.interleaved, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.granule += real as u64;
        self.samples_since_page += real as u64;

        let end = match end {
            PacketWriteEndInfo::NormalPacket
                if self.samples_since_page >= (OPUS_RATE / OGG_PAGE_INTERVAL_DIVISOR) as u64 =>
            {
                PacketWriteEndInfo::EndPage
            }
            other => other,
        };
        if !matches!(end, PacketWriteEndInfo::NormalPacket) {
            self.samples_since_page = 0;
        }

        self.writer
            .write_packet(
                self.encode_buffer[..size].to_vec(),
                self.serial,
                end,
                PRESKIP as u64 + self.granule,
            )
            .map_err(|e| CodecError::Container(e.to_string()))
    }

    fn collect(&mut self) -> Vec<EncodedUnit> {
        let bytes = std::mem::take(self.writer.inner_mut());
        self.splitter.push(&bytes);
        match self.splitter.take_pages() {
            Some((pages, granule)) => {
                let samples = granule.map_or(0, |g| (g - PRESKIP as i64).max(0));
                vec![EncodedUnit::audio(pages, samples as f64 / OPUS_RATE as f64)]
            }
            None => Vec::new(),
        }
    }
}

impl CodecBackend for OpusBackend {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            bit_rate: self.bitrate,
            sample_rate: OPUS_RATE,
            channel_count: self.channels as u16,
            family: PacketFlags::OGG,
        }
    }

    fn frame_size(&self) -> usize {
        self.frame_size
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
        {
            let _guard = lock.hold();
            self.encoder = Some(self.open_encoder()?);
        }
        self.serial = serial;
        self.granule = 0;
        self.samples_since_page = 0;
        self.splitter.clear();
        self.writer.inner_mut().clear();

        self.writer
            .write_packet(self.head_packet(), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| CodecError::Container(e.to_string()))?;
        self.writer
            .write_packet(Self::tags_packet(meta), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| CodecError::Container(e.to_string()))?;

        Ok(self
            .collect()
            .into_iter()
            .map(|unit| EncodedUnit::header(unit.data))
            .collect())
    }

    fn encode_step(&mut self, input: &mut PcmQueue) -> Result<EncodeStep, CodecError> {
        if input.frames() < self.frame_size {
            return Ok(EncodeStep::NeedMoreInput);
        }
        while input.frames() >= self.frame_size {
            let (left, right) = input.front(self.frame_size);
            let (left, right) = (left.to_vec(), right.to_vec());
            self.encode_frame(&left, &right, PacketWriteEndInfo::NormalPacket)?;
            input.advance(self.frame_size);
        }
        let units = self.collect();
        if units.is_empty() {
            Ok(EncodeStep::NeedMoreInput)
        } else {
            Ok(EncodeStep::Produced(units))
        }
    }

    fn end_serial(&mut self, input: &mut PcmQueue) -> Result<Vec<EncodedUnit>, CodecError> {
        let mut units = match self.encode_step(input)? {
            EncodeStep::Produced(units) => units,
            EncodeStep::NeedMoreInput => Vec::new(),
        };
        let (left, right) = input.front(input.frames());
        let (left, right) = (left.to_vec(), right.to_vec());
        input.clear();
        self.encode_frame(&left, &right, PacketWriteEndInfo::EndStream)?;
        units.extend(self.collect());
        Ok(units)
    }

    fn teardown(mut self: Box<Self>, lock: &CodecLock) {
        let _guard = lock.hold();
        self.encoder.take();
        tracing::debug!(
            "Opus backend released at serial {} granule {}",
            self.serial,
            self.granule
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ogg::parse_page;
    use crate::codec::{Codec, DataFormat, Family};

    fn params() -> EncoderParams {
        EncoderParams {
            format: DataFormat::new(Family::Ogg, Codec::Opus),
            sample_rate: 48000,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_odd_frame_size() {
        let mut p = params();
        p.frame_ms = 7;
        assert!(matches!(
            OpusBackend::new(&p),
            Err(CodecError::InvalidFrameSize(7))
        ));
    }

    #[test]
    fn test_header_pages() {
        let lock = CodecLock::new();
        let mut backend = OpusBackend::new(&params()).unwrap();
        let units = backend
            .begin_serial(99, &TrackMetadata::default(), &lock)
            .unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].flags.contains(PacketFlags::HEADER));

        let first = parse_page(&units[0].data).unwrap();
        assert!(first.bos);
        assert_eq!(first.serial, 99);
        assert_eq!(&units[0].data[28..36], b"OpusHead");
    }

    #[test]
    fn test_pages_flushed_every_100ms() {
        let lock = CodecLock::new();
        let mut backend = OpusBackend::new(&params()).unwrap();
        backend
            .begin_serial(5, &TrackMetadata::default(), &lock)
            .unwrap();

        let mut input = PcmQueue::new(2);
        input.push(&vec![0.0; 4800], &vec![0.0; 4800]);
        match backend.encode_step(&mut input).unwrap() {
            EncodeStep::Produced(units) => {
                assert!((units[0].timestamp - 0.1).abs() < 1e-9);
            }
            EncodeStep::NeedMoreInput => panic!("expected a page after 100 ms"),
        }

        input.push(&vec![0.0; 100], &vec![0.0; 100]);
        let tail = backend.end_serial(&mut input).unwrap();
        let page = parse_page(&tail[0].data).unwrap();
        assert!(page.eos);
        assert_eq!(page.granule, PRESKIP as i64 + 4900);
        assert_eq!(backend.granule, 4900);
    }

    #[test]
    fn test_complexity_reaches_libopus() {
        for complexity in [0, 3, 10] {
            let backend = OpusBackend::new(&EncoderParams {
                complexity,
                ..params()
            })
            .unwrap();
            let mut encoder = backend.open_encoder().unwrap();
            assert_eq!(encoder.get_complexity().unwrap(), complexity as i32);
        }
    }
}
