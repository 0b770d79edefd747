//! Cue sheets
//!
//! Encoded recordings get their sheet written in one go when the recording
//! stops. Raw recordings append a track on each metadata update while the
//! recording runs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::recorder::checkpoint::Checkpoint;

/// `FILE` type column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueFileType {
    Mp3,
    Wave,
}

impl CueFileType {
    fn as_str(&self) -> &'static str {
        match self {
            CueFileType::Mp3 => "MP3",
            CueFileType::Wave => "WAVE",
        }
    }
}

/// `MM:SS:FF` with 75 frames per second
pub fn index_time(ms: u64) -> String {
    let minutes = ms / 60_000;
    let seconds = ms / 1000 % 60;
    let frames = ms % 1000 * 75 / 1000;
    format!("{:02}:{:02}:{:02}", minutes, seconds, frames)
}

fn write_header(
    out: &mut impl Write,
    timestamp: &str,
    file_name: &str,
    kind: CueFileType,
) -> std::io::Result<()> {
    write!(out, "TITLE \"{}\"\r\n", timestamp)?;
    write!(out, "PERFORMER \"Recorded live\"\r\n")?;
    write!(out, "FILE \"{}\" {}\r\n", file_name, kind.as_str())
}

struct Track<'a> {
    title: &'a str,
    artist: &'a str,
    album: &'a str,
}

fn write_track(
    out: &mut impl Write,
    number: usize,
    track: &Track<'_>,
    start_ms: u64,
    all_fields: bool,
) -> std::io::Result<()> {
    let index = if number == 1 {
        index_time(0)
    } else {
        index_time(start_ms)
    };
    write!(out, "  TRACK {:02} AUDIO\r\n", number)?;
    if all_fields || !track.title.is_empty() {
        write!(out, "    TITLE \"{}\"\r\n", track.title)?;
    }
    if all_fields || !track.artist.is_empty() {
        write!(out, "    PERFORMER \"{}\"\r\n", track.artist)?;
    }
    if all_fields || !track.album.is_empty() {
        write!(out, "    REM ALBUM \"{}\"\r\n", track.album)?;
    }
    write!(out, "    INDEX 01 {}\r\n", index)
}

/// Write a complete sheet for a finished recording
pub fn write_cue_sheet(
    path: &Path,
    timestamp: &str,
    file_name: &str,
    kind: CueFileType,
    checkpoints: &[Checkpoint],
) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header(&mut out, timestamp, file_name, kind)?;
    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let track = Track {
            title: &checkpoint.title,
            artist: &checkpoint.artist,
            album: &checkpoint.album,
        };
        write_track(&mut out, i + 1, &track, checkpoint.start_ms, false)?;
    }
    out.flush()
}

/// Sheet written track by track alongside a raw recording
pub struct LiveCue {
    out: BufWriter<File>,
    tracks: usize,
}

impl LiveCue {
    pub fn create(path: &Path, timestamp: &str, file_name: &str) -> std::io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        write_header(&mut out, timestamp, file_name, CueFileType::Wave)?;
        out.flush()?;
        Ok(Self { out, tracks: 0 })
    }

    pub fn add_track(
        &mut self,
        artist: &str,
        title: &str,
        album: &str,
        start_ms: u64,
    ) -> std::io::Result<()> {
        self.tracks += 1;
        let track = Track {
            title,
            artist,
            album,
        };
        write_track(&mut self.out, self.tracks, &track, start_ms, true)?;
        self.out.flush()
    }

    pub fn tracks(&self) -> usize {
        self.tracks
    }
}
