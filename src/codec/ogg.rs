//! Ogg page helpers
//!
//! Backends that hand encoding to a library writing whole pages use
//! [`PageSplitter`] to cut the byte stream back into complete pages and read
//! their granule positions for packet timestamps.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

use crate::packet::TrackMetadata;

const CAPTURE: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;

/// Header fields of one complete page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub granule: i64,
    pub serial: u32,
    pub bos: bool,
    pub eos: bool,
    pub len: usize,
}

/// Parse the page starting at `data[0]`. `None` if incomplete or not a page.
pub fn parse_page(data: &[u8]) -> Option<PageInfo> {
    if data.len() < HEADER_LEN || &data[..4] != CAPTURE {
        return None;
    }
    let header_type = data[5];
    let granule = i64::from_le_bytes(data[6..14].try_into().ok()?);
    let serial = u32::from_le_bytes(data[14..18].try_into().ok()?);
    let segments = data[26] as usize;
    let table_end = HEADER_LEN + segments;
    if data.len() < table_end {
        return None;
    }
    let body: usize = data[HEADER_LEN..table_end].iter().map(|&s| s as usize).sum();
    let len = table_end + body;
    if data.len() < len {
        return None;
    }
    Some(PageInfo {
        granule,
        serial,
        bos: header_type & 0x02 != 0,
        eos: header_type & 0x04 != 0,
        len,
    })
}

/// Comment tags for a serial. Custom text takes the TITLE slot and the track
/// fields move to TRK-* names.
pub fn comment_tags(meta: &TrackMetadata) -> Vec<(&'static str, String)> {
    let mut tags = Vec::new();
    let (artist_key, title_key, album_key) = if meta.custom.is_empty() {
        ("ARTIST", "TITLE", "ALBUM")
    } else {
        tags.push(("TITLE", meta.custom.clone()));
        ("TRK-ARTIST", "TRK-TITLE", "TRK-ALBUM")
    };
    for (key, value) in [
        (artist_key, &meta.artist),
        (title_key, &meta.title),
        (album_key, &meta.album),
    ] {
        if !value.is_empty() {
            tags.push((key, value.clone()));
        }
    }
    tags
}

/// Accumulates library output and releases it in whole pages
#[derive(Debug, Default)]
pub struct PageSplitter {
    pending: Vec<u8>,
}

impl PageSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take every complete page buffered so far, with the last known granule
    pub fn take_pages(&mut self) -> Option<(Vec<u8>, Option<i64>)> {
        let mut offset = 0;
        let mut granule = None;
        while let Some(page) = parse_page(&self.pending[offset..]) {
            if page.granule >= 0 {
                granule = Some(page.granule);
            }
            offset += page.len;
        }
        if offset == 0 {
            return None;
        }
        let rest = self.pending.split_off(offset);
        let pages = std::mem::replace(&mut self.pending, rest);
        Some((pages, granule))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// `Write` sink shared between a library encoder and its backend
#[derive(Debug, Clone, Default)]
pub struct SharedSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal page with one segment of `body` bytes
    pub(crate) fn fake_page(granule: i64, serial: u32, body: &[u8], header_type: u8) -> Vec<u8> {
        assert!(body.len() < 255);
        let mut page = Vec::new();
        page.extend_from_slice(CAPTURE);
        page.push(0);
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&serial.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes());
        page.push(1);
        page.push(body.len() as u8);
        page.extend_from_slice(body);
        page
    }

    #[test]
    fn test_comment_tags_plain() {
        let meta = TrackMetadata {
            artist: "A".into(),
            title: "T".into(),
            ..Default::default()
        };
        assert_eq!(
            comment_tags(&meta),
            vec![("ARTIST", "A".to_string()), ("TITLE", "T".to_string())]
        );
    }

    #[test]
    fn test_comment_tags_custom_moves_track_fields() {
        let meta = TrackMetadata {
            custom: "Live from the studio".into(),
            artist: "A".into(),
            title: "T".into(),
            album: "L".into(),
        };
        let tags = comment_tags(&meta);
        assert_eq!(tags[0], ("TITLE", "Live from the studio".to_string()));
        assert!(tags.contains(&("TRK-ALBUM", "L".to_string())));
    }

    #[test]
    fn test_parse_page_fields() {
        let page = fake_page(4410, 77, b"abc", 0x04);
        let info = parse_page(&page).unwrap();
        assert_eq!(info.granule, 4410);
        assert_eq!(info.serial, 77);
        assert!(info.eos);
        assert_eq!(info.len, page.len());
    }

    #[test]
    fn test_splitter_holds_partial_page() {
        let mut splitter = PageSplitter::default();
        let first = fake_page(-1, 1, b"head", 0x02);
        let second = fake_page(1024, 1, b"audio", 0);
        splitter.push(&first);
        splitter.push(&second[..10]);

        let (pages, granule) = splitter.take_pages().unwrap();
        assert_eq!(pages, first);
        assert_eq!(granule, None);

        splitter.push(&second[10..]);
        let (pages, granule) = splitter.take_pages().unwrap();
        assert_eq!(pages, second);
        assert_eq!(granule, Some(1024));
        assert!(splitter.take_pages().is_none());
    }
}
