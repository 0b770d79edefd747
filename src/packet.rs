//! Packet model
//!
//! A [`Packet`] is the fan-out unit: one compressed unit (or container
//! header, or metadata text) plus the header describing it. Payloads are
//! `Bytes` so every client queue shares one allocation.

use bytes::Bytes;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Packet flag bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    pub const NONE: Self = Self(0);
    /// First packet of a serial
    pub const INITIAL: Self = Self(0x0001);
    /// Last packet of a serial
    pub const FINAL: Self = Self(0x0002);
    pub const OGG: Self = Self(0x0004);
    pub const MP3: Self = Self(0x0008);
    /// Payload is metadata text rather than audio
    pub const METADATA: Self = Self(0x0010);
    /// Payload is container header bytes only
    pub const HEADER: Self = Self(0x0020);
    pub const MP2: Self = Self(0x0040);
    pub const AAC: Self = Self(0x0080);
    pub const AACP2: Self = Self(0x0100);
    pub const WEBM: Self = Self(0x0200);

    const CODEC_MASK: u16 = 0x0004 | 0x0008 | 0x0040 | 0x0080 | 0x0100 | 0x0200;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Carries a compressed-audio container flag
    pub const fn is_audio(self) -> bool {
        self.0 & Self::CODEC_MASK != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PacketFlags, &str); 10] = [
            (PacketFlags::INITIAL, "INITIAL"),
            (PacketFlags::FINAL, "FINAL"),
            (PacketFlags::OGG, "OGG"),
            (PacketFlags::MP3, "MP3"),
            (PacketFlags::METADATA, "METADATA"),
            (PacketFlags::HEADER, "HEADER"),
            (PacketFlags::MP2, "MP2"),
            (PacketFlags::AAC, "AAC"),
            (PacketFlags::AACP2, "AACP2"),
            (PacketFlags::WEBM, "WEBM"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Compressed audio unit plus header
#[derive(Debug, Clone)]
pub struct Packet {
    /// Nominal or frame-derived bit rate in kbps
    pub bit_rate: u32,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub flags: PacketFlags,
    pub serial: u32,
    /// Seconds since the start of this serial
    pub timestamp: f64,
    pub data: Bytes,
}

impl Packet {
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_initial(&self) -> bool {
        self.flags.contains(PacketFlags::INITIAL)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(PacketFlags::FINAL)
    }

    pub fn is_metadata(&self) -> bool {
        self.flags.contains(PacketFlags::METADATA)
    }

    pub fn is_audio(&self) -> bool {
        self.flags.is_audio()
    }
}

/// Shared per-stream header values stamped onto every packet
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub bit_rate: u32,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Codec family flag for audio packets
    pub family: PacketFlags,
}

impl StreamInfo {
    pub fn packet(&self, serial: u32, flags: PacketFlags, timestamp: f64, data: Bytes) -> Packet {
        Packet {
            bit_rate: self.bit_rate,
            sample_rate: self.sample_rate,
            channel_count: self.channel_count,
            flags: flags | self.family,
            serial,
            timestamp,
            data,
        }
    }
}

/// Artist/title/album plus free-form custom text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub custom: String,
    pub artist: String,
    pub title: String,
    pub album: String,
}

impl TrackMetadata {
    /// Payload of a METADATA packet: `custom\nartist\ntitle\nalbum`
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(format!(
            "{}\n{}\n{}\n{}",
            self.custom, self.artist, self.title, self.album
        ))
    }

    pub fn from_payload(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut parts = text.splitn(4, '\n');
        let mut next = || parts.next().unwrap_or_default().to_string();
        Self {
            custom: next(),
            artist: next(),
            title: next(),
            album: next(),
        }
    }

    /// Title shown to listeners: the custom string wins when set
    pub fn display_title(&self) -> String {
        if !self.custom.is_empty() {
            self.custom.clone()
        } else if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.custom.is_empty() && self.artist.is_empty() && self.title.is_empty() && self.album.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_compose() {
        let flags = PacketFlags::INITIAL | PacketFlags::OGG | PacketFlags::HEADER;
        assert!(flags.contains(PacketFlags::INITIAL));
        assert!(flags.is_audio());
        assert!(!flags.contains(PacketFlags::FINAL));
        assert_eq!(flags.to_string(), "INITIAL|OGG|HEADER");
    }

    #[test]
    fn test_metadata_only_is_not_audio() {
        assert!(!PacketFlags::METADATA.is_audio());
        assert_eq!(PacketFlags::NONE.to_string(), "-");
    }

    #[test]
    fn test_metadata_payload() {
        let meta = TrackMetadata {
            custom: String::new(),
            artist: "Artist".into(),
            title: "Song".into(),
            album: "Album".into(),
        };
        let payload = meta.to_payload();
        assert_eq!(&payload[..], b"\nArtist\nSong\nAlbum");
        assert_eq!(TrackMetadata::from_payload(&payload), meta);
        assert_eq!(meta.display_title(), "Artist - Song");
    }
}
