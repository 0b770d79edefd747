//! Metadata checkpoints and bitrate segments
//!
//! Both lists are append-only arenas that live for one recording. Each new
//! entry closes the end offsets of the one before it; the final close
//! happens when the recording stops.

use crate::packet::{Packet, PacketFlags, TrackMetadata};

/// One track change inside a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub start_byte: u64,
    pub end_byte: u64,
}

#[derive(Debug, Default)]
pub struct CheckpointList {
    entries: Vec<Checkpoint>,
}

impl CheckpointList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a checkpoint at the given position. An entry identical to the
    /// last one is discarded and `false` returned.
    pub fn append(&mut self, meta: &TrackMetadata, time_ms: u64, byte: u64) -> bool {
        if let Some(last) = self.entries.last_mut() {
            if last.artist == meta.artist && last.title == meta.title && last.album == meta.album {
                tracing::debug!("Duplicate checkpoint skipped: {}", meta.title);
                return false;
            }
            last.end_ms = time_ms;
            last.end_byte = byte;
        }
        self.entries.push(Checkpoint {
            artist: meta.artist.clone(),
            title: meta.title.clone(),
            album: meta.album.clone(),
            start_ms: time_ms,
            end_ms: time_ms,
            start_byte: byte,
            end_byte: byte,
        });
        true
    }

    /// Close the last entry at the end of the recording
    pub fn close(&mut self, time_ms: u64, byte: u64) {
        if let Some(last) = self.entries.last_mut() {
            last.end_ms = time_ms;
            last.end_byte = byte;
        }
    }

    pub fn entries(&self) -> &[Checkpoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stretch of the recording encoded with one bit rate and sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start_ms: u64,
    pub finish_ms: u64,
    pub byte_offset: u64,
    pub size_bytes: u64,
    pub bit_rate: u32,
    pub sample_rate: u32,
}

/// One segment per serial start, plus variable bitrate detection
#[derive(Debug, Default)]
pub struct SegmentList {
    entries: Vec<Segment>,
    previous: Option<(u32, u32)>,
    vbr: bool,
}

impl SegmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a segment for the INITIAL packet of a serial
    pub fn begin(&mut self, packet: &Packet, time_ms: u64, byte: u64) {
        let (start_ms, byte_offset) = match self.entries.last_mut() {
            Some(last) => {
                last.finish_ms = time_ms;
                last.size_bytes = byte.saturating_sub(last.byte_offset);
                (time_ms, byte)
            }
            None => (0, 0),
        };
        self.entries.push(Segment {
            start_ms,
            finish_ms: start_ms,
            byte_offset,
            size_bytes: 0,
            bit_rate: packet.bit_rate,
            sample_rate: packet.sample_rate,
        });

        let mpeg = PacketFlags::MP3 | PacketFlags::MP2 | PacketFlags::AAC | PacketFlags::AACP2;
        if packet.flags.intersects(mpeg) {
            let current = (packet.bit_rate, packet.sample_rate);
            match self.previous {
                Some(previous) if previous != current => {
                    if !self.vbr {
                        tracing::info!(
                            "Frame length changed ({} kbps @ {} Hz -> {} kbps @ {} Hz), tagging as VBR",
                            previous.0,
                            previous.1,
                            current.0,
                            current.1
                        );
                    }
                    self.vbr = true;
                }
                _ => {}
            }
            if current.0 != 0 && current.1 != 0 {
                self.previous = Some(current);
            }
        }
    }

    pub fn close(&mut self, time_ms: u64, byte: u64) {
        if let Some(last) = self.entries.last_mut() {
            last.finish_ms = time_ms;
            last.size_bytes = byte.saturating_sub(last.byte_offset);
        }
    }

    pub fn entries(&self) -> &[Segment] {
        &self.entries
    }

    pub fn first(&self) -> Option<&Segment> {
        self.entries.first()
    }

    pub fn is_vbr(&self) -> bool {
        self.vbr
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.previous = None;
        self.vbr = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn meta(artist: &str, title: &str) -> TrackMetadata {
        TrackMetadata {
            artist: artist.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    fn initial(bit_rate: u32, sample_rate: u32) -> Packet {
        Packet {
            bit_rate,
            sample_rate,
            channel_count: 2,
            flags: PacketFlags::INITIAL | PacketFlags::MP3,
            serial: 1,
            timestamp: 0.0,
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut list = CheckpointList::new();
        assert!(list.append(&meta("A", "One"), 0, 0));
        assert!(!list.append(&meta("A", "One"), 5000, 80000));
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].end_ms, 0);
    }

    #[test]
    fn test_distinct_closes_previous() {
        let mut list = CheckpointList::new();
        list.append(&meta("A", "One"), 0, 0);
        list.append(&meta("B", "Two"), 5000, 80000);
        list.close(9000, 144000);

        let entries = list.entries();
        assert_eq!(entries[0].end_ms, entries[1].start_ms);
        assert_eq!(entries[0].end_byte, entries[1].start_byte);
        assert_eq!(entries[1].end_ms, 9000);
    }

    #[test]
    fn test_vbr_detected_on_second_divergence_only() {
        let mut segments = SegmentList::new();
        segments.begin(&initial(128, 44100), 0, 0);
        assert!(!segments.is_vbr());
        segments.begin(&initial(128, 44100), 1000, 16000);
        assert!(!segments.is_vbr());
        segments.begin(&initial(192, 44100), 2000, 32000);
        assert!(segments.is_vbr());

        segments.close(3000, 56000);
        let last = segments.entries().last().unwrap();
        assert_eq!(last.size_bytes, 24000);
        assert_eq!(segments.entries()[0].finish_ms, 1000);
    }

    #[test]
    fn test_ogg_packets_never_vbr() {
        let mut segments = SegmentList::new();
        let mut packet = initial(128, 44100);
        packet.flags = PacketFlags::INITIAL | PacketFlags::OGG;
        segments.begin(&packet, 0, 0);
        packet.bit_rate = 96;
        segments.begin(&packet, 10, 100);
        assert!(!segments.is_vbr());
    }

    proptest! {
        #[test]
        fn prop_checkpoints_chain(titles in proptest::collection::vec(0u8..4, 1..40)) {
            let mut list = CheckpointList::new();
            let mut t = 0u64;
            for title in &titles {
                t += 100;
                let before = list.len();
                let last = list.entries().last().cloned();
                let added = list.append(&meta("A", &title.to_string()), t, t * 16);
                if let Some(last) = last {
                    prop_assert_eq!(added, last.title != title.to_string());
                }
                prop_assert_eq!(list.len(), before + added as usize);
            }
            for pair in list.entries().windows(2) {
                prop_assert_eq!(pair[0].end_ms, pair[1].start_ms);
                prop_assert_eq!(pair[0].end_byte, pair[1].start_byte);
                prop_assert!(pair[0].title != pair[1].title);
            }
        }
    }
}
