//! Xing/Info frame synthesis for finished MP3 recordings
//!
//! The frame copies the first audio frame's header, skips the side info
//! area, and carries the frame count, byte count and (for VBR) a 100-entry
//! seek table. It is padded with zeros to the length of a real frame.

use crate::error::RecorderError;
use crate::recorder::checkpoint::Segment;

const XING_MAGIC: &[u8; 8] = b"Xing\x00\x00\x00\x07";
const INFO_MAGIC: &[u8; 8] = b"Info\x00\x00\x00\x03";

/// Bits of a 4-byte MPEG audio frame header this module needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegHeader {
    pub bytes: [u8; 4],
    pub mpeg1: bool,
    pub mono: bool,
    pub padding: bool,
}

impl MpegHeader {
    pub fn parse(bytes: [u8; 4]) -> Option<Self> {
        if bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }
        Some(Self {
            bytes,
            mpeg1: bytes[1] & 0x18 == 0x18,
            mono: bytes[3] & 0xC0 == 0xC0,
            padding: bytes[2] & 0x02 != 0,
        })
    }

    pub fn samples_per_frame(&self) -> u64 {
        if self.mpeg1 {
            1152
        } else {
            576
        }
    }

    /// Size of the side information that precedes the Xing magic
    pub fn side_info_len(&self) -> usize {
        match (self.mpeg1, self.mono) {
            (true, false) => 32,
            (true, true) => 17,
            (false, false) => 17,
            (false, true) => 9,
        }
    }
}

/// 100-entry table mapping playback percentage to file position in 1/256ths
pub fn seek_table(
    segments: &[Segment],
    length_ms: u64,
    bytes_written: u64,
) -> Result<[u8; 100], RecorderError> {
    let mut table = [0u8; 100];
    if bytes_written == 0 {
        return Ok(table);
    }
    let mut iter = segments.iter();
    let mut segment = iter
        .next()
        .ok_or_else(|| RecorderError::Tagging("no bitrate segments".into()))?;

    for (i, entry) in table.iter_mut().enumerate() {
        let look_ms = i as f64 / 100.0 * length_ms as f64;
        while look_ms > segment.finish_ms as f64 {
            segment = iter.next().ok_or_else(|| {
                RecorderError::Tagging("bitrate segments do not cover the recording".into())
            })?;
        }
        let span = segment.finish_ms.saturating_sub(segment.start_ms) as f64;
        let proportion = if span > 0.0 {
            (look_ms - segment.start_ms as f64) / span
        } else {
            0.0
        };
        let position = proportion * segment.size_bytes as f64 + segment.byte_offset as f64;
        *entry = (position / bytes_written as f64 * 255.0) as u8;
    }
    Ok(table)
}

/// Build the complete Xing (VBR) or Info (CBR) frame
pub fn build_frame(
    header: MpegHeader,
    segments: &[Segment],
    length_ms: u64,
    bytes_written: u64,
    vbr: bool,
) -> Result<Vec<u8>, RecorderError> {
    let first = segments
        .first()
        .ok_or_else(|| RecorderError::Tagging("no bitrate segments".into()))?;
    if first.sample_rate == 0 {
        return Err(RecorderError::Tagging("segment without sample rate".into()));
    }

    let spf = header.samples_per_frame();
    let frame_len = (spf / 8 * first.bit_rate as u64 * 1000 / first.sample_rate as u64
        + header.padding as u64) as usize;
    let total_frames =
        (first.sample_rate as f64 * length_ms as f64 / (spf as f64 * 1000.0) + 0.5) as u32;

    let mut frame = Vec::with_capacity(frame_len.max(160));
    frame.extend_from_slice(&header.bytes);
    frame.resize(4 + header.side_info_len(), 0);
    frame.extend_from_slice(if vbr { XING_MAGIC } else { INFO_MAGIC });
    frame.extend_from_slice(&total_frames.to_be_bytes());
    frame.extend_from_slice(&(bytes_written.min(u32::MAX as u64) as u32).to_be_bytes());

    if vbr {
        let table = seek_table(segments, length_ms, bytes_written)?;
        frame.extend_from_slice(&table);
        if table[99] == 0xFF {
            frame.push(0);
        }
    }
    if frame.len() < frame_len {
        frame.resize(frame_len, 0);
    }
    Ok(frame)
}

/// Contents of a Xing/Info frame read back from a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XingHeader {
    pub vbr: bool,
    pub frames: Option<u32>,
    pub bytes: Option<u32>,
    pub toc: Option<[u8; 100]>,
}

impl XingHeader {
    /// Parse the frame starting at `data[0]`
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = MpegHeader::parse(data.get(..4)?.try_into().ok()?)?;
        let mut pos = 4 + header.side_info_len();
        let magic = data.get(pos..pos + 4)?;
        let vbr = match magic {
            b"Xing" => true,
            b"Info" => false,
            _ => return None,
        };
        let flags = u32::from_be_bytes(data.get(pos + 4..pos + 8)?.try_into().ok()?);
        pos += 8;

        let mut read_u32 = |present: bool| -> Option<Option<u32>> {
            if !present {
                return Some(None);
            }
            let value = u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            Some(Some(value))
        };
        let frames = read_u32(flags & 0x1 != 0)?;
        let bytes = read_u32(flags & 0x2 != 0)?;

        let toc = if flags & 0x4 != 0 {
            let mut table = [0u8; 100];
            table.copy_from_slice(data.get(pos..pos + 100)?);
            Some(table)
        } else {
            None
        };
        Some(Self {
            vbr,
            frames,
            bytes,
            toc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MPEG1 layer III, 128 kbps, 44.1 kHz, joint stereo
    const HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x44];

    fn segment(start: u64, finish: u64, offset: u64, size: u64, bit_rate: u32) -> Segment {
        Segment {
            start_ms: start,
            finish_ms: finish,
            byte_offset: offset,
            size_bytes: size,
            bit_rate,
            sample_rate: 44100,
        }
    }

    #[test]
    fn test_header_bits() {
        let header = MpegHeader::parse(HEADER).unwrap();
        assert!(header.mpeg1);
        assert!(!header.mono);
        assert_eq!(header.side_info_len(), 32);
        assert!(MpegHeader::parse([0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_info_frame_is_frame_sized() {
        let header = MpegHeader::parse(HEADER).unwrap();
        let segments = [segment(0, 10_000, 0, 160_000, 128)];
        let frame = build_frame(header, &segments, 10_000, 160_000, false).unwrap();
        assert_eq!(frame.len(), 417);
        assert_eq!(&frame[36..40], b"Info");

        let parsed = XingHeader::parse(&frame).unwrap();
        assert!(!parsed.vbr);
        assert_eq!(parsed.frames, Some(383));
        assert_eq!(parsed.bytes, Some(160_000));
        assert_eq!(parsed.toc, None);
    }

    #[test]
    fn test_vbr_frame_roundtrip() {
        let header = MpegHeader::parse(HEADER).unwrap();
        let segments = [
            segment(0, 5_000, 0, 80_000, 128),
            segment(5_000, 10_000, 80_000, 200_000, 320),
        ];
        let frame = build_frame(header, &segments, 10_000, 280_000, true).unwrap();
        let parsed = XingHeader::parse(&frame).unwrap();
        assert!(parsed.vbr);
        let toc = parsed.toc.unwrap();
        assert_eq!(toc[0], 0);
        assert!(toc.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(toc[50], (80_000.0 / 280_000.0 * 255.0) as u8);
    }

    #[test]
    fn test_seek_table_fails_on_gap() {
        let segments = [segment(0, 4_000, 0, 64_000, 128)];
        assert!(matches!(
            seek_table(&segments, 10_000, 64_000),
            Err(RecorderError::Tagging(_))
        ));
    }
}
