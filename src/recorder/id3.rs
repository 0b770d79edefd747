//! ID3v2.4 chapter tag
//!
//! Layout: `TLEN` with the recording length in ms, then one `CHAP` frame per
//! checkpoint. Each chapter embeds `TIT2`, plus `TALB`/`TPE1` when set.

use crate::constants::ID3_PADDING;
use crate::recorder::checkpoint::Checkpoint;

const HEADER_LEN: usize = 10;

/// Encode a 28-bit value as four 7-bit bytes
pub fn syncsafe(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}

pub fn from_syncsafe(bytes: [u8; 4]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| (acc << 7) | (b & 0x7F) as u32)
}

#[derive(Debug, Clone)]
enum Frame {
    Text {
        id: [u8; 4],
        encoding: u8,
        text: String,
    },
    Chapter {
        element_id: String,
        start_ms: u32,
        end_ms: u32,
        start_byte: u32,
        end_byte: u32,
        children: Vec<Frame>,
    },
}

impl Frame {
    fn utf8(id: &[u8; 4], text: &str) -> Self {
        Frame::Text {
            id: *id,
            encoding: 3,
            text: text.to_string(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let (id, body) = match self {
            Frame::Text { id, encoding, text } => {
                let mut body = Vec::with_capacity(text.len() + 2);
                body.push(*encoding);
                body.extend_from_slice(text.as_bytes());
                if *encoding == 3 {
                    body.push(0);
                }
                (*id, body)
            }
            Frame::Chapter {
                element_id,
                start_ms,
                end_ms,
                start_byte,
                end_byte,
                children,
            } => {
                let mut body = Vec::new();
                body.extend_from_slice(element_id.as_bytes());
                body.push(0);
                for value in [start_ms, end_ms, start_byte, end_byte] {
                    body.extend_from_slice(&value.to_be_bytes());
                }
                for child in children {
                    child.write(&mut body);
                }
                (*b"CHAP", body)
            }
        };
        out.extend_from_slice(&id);
        out.extend_from_slice(&syncsafe(body.len() as u32));
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&body);
    }
}

/// Build the tag. `byte_shift` is added to chapter byte offsets to account
/// for anything spliced in between the tag and the recorded audio.
pub fn chapter_tag(length_ms: u64, checkpoints: &[Checkpoint], byte_shift: u64) -> Vec<u8> {
    let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
    let mut frames = vec![Frame::Text {
        id: *b"TLEN",
        encoding: 0,
        text: length_ms.to_string(),
    }];

    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let mut children = vec![Frame::utf8(b"TIT2", &checkpoint.title)];
        if !checkpoint.album.is_empty() {
            children.push(Frame::utf8(b"TALB", &checkpoint.album));
        }
        if !checkpoint.artist.is_empty() {
            children.push(Frame::utf8(b"TPE1", &checkpoint.artist));
        }
        frames.push(Frame::Chapter {
            element_id: format!("chp{}", i),
            start_ms: clamp(checkpoint.start_ms),
            end_ms: clamp(checkpoint.end_ms),
            start_byte: clamp(checkpoint.start_byte + byte_shift),
            end_byte: clamp(checkpoint.end_byte + byte_shift),
            children,
        });
    }

    let mut body = Vec::new();
    for frame in &frames {
        frame.write(&mut body);
    }
    body.resize(body.len() + ID3_PADDING, 0);

    let mut tag = Vec::with_capacity(HEADER_LEN + body.len());
    tag.extend_from_slice(b"ID3\x04\x00\x00");
    tag.extend_from_slice(&syncsafe(body.len() as u32));
    tag.extend_from_slice(&body);
    tag
}

/// Total length of an ID3v2 tag at the start of `data`, or 0 when absent
pub fn tag_len(data: &[u8]) -> usize {
    if data.len() < HEADER_LEN || &data[..3] != b"ID3" {
        return 0;
    }
    let size = from_syncsafe([data[6], data[7], data[8], data[9]]) as usize;
    HEADER_LEN + size
}
