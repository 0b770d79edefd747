//! Recorders
//!
//! A fixed pool of recorders, each with one long-lived worker thread.
//! A recorder either consumes the packet stream of an encoder slot and
//! writes the compressed payloads to a file, or takes PCM straight from the
//! audio feed and writes a WAV file.
//!
//! ```text
//! STOPPED ──start──▶ RECORDING ⇄ PAUSED
//!    ▲                   │          │
//!    └── STOPPED ◀── STOPPING ◀─stop┘
//! ```
//!
//! Pause, unpause and stop block the control thread until the worker has
//! reached the requested state. Encoded recordings pause on serial
//! boundaries: the worker asks the encoder for a flush and keeps writing
//! until the FINAL packet of the serial being closed.
//!
//! MPEG recordings are post-processed when they stop: an ID3 chapter tag
//! and a Xing/Info frame are written in front of the audio through a
//! temporary file that is renamed over the original.

pub mod checkpoint;
pub mod cue;
pub mod id3;
pub mod xing;

use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{AudioFeed, SharedPcmSink};
use crate::codec::DataFormat;
use crate::config::RecorderConfig;
use crate::encoder::{Client, EncoderPool};
use crate::error::{RecorderError, Result};
use crate::packet::{Packet, TrackMetadata};
use crate::state::StateCell;

use checkpoint::{CheckpointList, SegmentList};
use cue::{CueFileType, LiveCue};
use xing::MpegHeader;

const IDLE_WAIT: Duration = Duration::from_millis(100);

const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d][%H:%M:%S]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Stopped,
    Recording,
    Paused,
    Stopping,
}

impl RecorderState {
    /// Numeric state used in report lines
    pub fn code(&self) -> u8 {
        match self {
            RecorderState::Stopped => 0,
            RecorderState::Recording => 1,
            RecorderState::Paused => 2,
            RecorderState::Stopping => 3,
        }
    }
}

/// What a recorder records from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Packet stream of an encoder slot
    Encoder(usize),
    /// PCM straight from the audio feed
    Raw,
}

impl RecordSource {
    /// Protocol form: encoder index, or `-1` for raw PCM
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().parse::<i64>().ok()? {
            -1 => Some(RecordSource::Raw),
            n if n >= 0 => Some(RecordSource::Encoder(n as usize)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderParams {
    pub source: RecordSource,
    /// Output folder, `None` selects the configured default
    pub folder: Option<PathBuf>,
    /// Base file name; empty uses the start timestamp
    pub filename: String,
}

#[derive(Debug, Default)]
struct MetadataSlot {
    current: TrackMetadata,
    changed: bool,
}

/// State of one recorder shared between its worker and the control thread
pub struct RecorderShared {
    pub id: usize,
    state: StateCell<RecorderState>,
    session: Mutex<Option<Session>>,
    metadata: Mutex<MetadataSlot>,
    pause_request: AtomicBool,
    unpause_request: AtomicBool,
    stop_request: AtomicBool,
    /// Pause requested while stopped: the next recording starts paused
    start_paused: AtomicBool,
    shutdown: AtomicBool,
    length_ms: AtomicU64,
    bytes_written: AtomicU64,
    output: Mutex<Option<PathBuf>>,
    last_error: Mutex<Option<String>>,
}

impl RecorderShared {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: StateCell::new(RecorderState::Stopped),
            session: Mutex::new(None),
            metadata: Mutex::new(MetadataSlot::default()),
            pause_request: AtomicBool::new(false),
            unpause_request: AtomicBool::new(false),
            stop_request: AtomicBool::new(false),
            start_paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            length_ms: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            output: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state.get()
    }

    /// Recorded duration of the current (or last) recording
    pub fn length_ms(&self) -> u64 {
        self.length_ms.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Audio file of the current (or last) recording
    pub fn output_path(&self) -> Option<PathBuf> {
        self.output.lock().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_error(&self, error: &RecorderError) {
        tracing::error!("Recorder {} failed: {}", self.id, error);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn set_progress(&self, length_ms: u64, bytes: u64) {
        self.length_ms.store(length_ms, Ordering::Relaxed);
        self.bytes_written.store(bytes, Ordering::Relaxed);
    }

    fn take_metadata(&self) -> Option<TrackMetadata> {
        let mut slot = self.metadata.lock();
        if slot.changed {
            slot.changed = false;
            Some(slot.current.clone())
        } else {
            None
        }
    }
}

/// Output file names of one recording
#[derive(Debug, Clone)]
struct OutputNames {
    timestamp: String,
    audio: PathBuf,
    cue: PathBuf,
}

impl OutputNames {
    fn derive(folder: &Path, filename: &str, extension: &str) -> Self {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let base = if filename.is_empty() {
            timestamp.clone()
        } else {
            filename.to_string()
        };
        Self {
            audio: folder.join(format!("{}{}", base, extension)),
            cue: folder.join(format!("{}.cue", base)),
            timestamp,
        }
    }

    fn file_name(&self) -> String {
        self.audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Rewrite an MPEG recording with ID3 chapters and a Xing/Info frame in front
fn tag_recording(
    path: &Path,
    checkpoints: &CheckpointList,
    segments: &SegmentList,
    first_header: Option<MpegHeader>,
    length_ms: u64,
    bytes_written: u64,
) -> std::result::Result<(), RecorderError> {
    let xing = match first_header {
        Some(header) => xing::build_frame(
            header,
            segments.entries(),
            length_ms,
            bytes_written,
            segments.is_vbr(),
        )?,
        None => Vec::new(),
    };
    let tag = id3::chapter_tag(length_ms, checkpoints.entries(), xing.len() as u64);

    let tmp = temp_path(path);
    let write = || -> io::Result<()> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(&tag)?;
        out.write_all(&xing)?;
        io::copy(&mut File::open(path)?, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        RecorderError::Tagging(e.to_string())
    })?;
    tracing::info!(
        "Tagged {} with {} chapters{}",
        path.display(),
        checkpoints.len(),
        match (xing.is_empty(), segments.is_vbr()) {
            (true, _) => "",
            (false, true) => " and a VBR seek table",
            (false, false) => " and an Info frame",
        }
    );
    Ok(())
}

/// Recording from an encoder's packet stream
struct EncodedSession {
    client: Client,
    format: DataFormat,
    names: OutputNames,
    file: Option<BufWriter<File>>,
    checkpoints: CheckpointList,
    segments: SegmentList,
    first_header: Option<MpegHeader>,
    /// Packets from older serials are ignored
    start_serial: u32,
    /// Resume serial handed out for a pending pause
    pause_target: Option<u32>,
    stop_pending: bool,
    stop_ready: bool,
    /// Duration of the serials already closed
    accumulated: f64,
    length_ms: u64,
    bytes: u64,
}

impl EncodedSession {
    fn tagging(&self) -> bool {
        self.format.supports_id3()
    }

    fn enter_paused(&mut self, shared: &RecorderShared) {
        self.pause_target = None;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                tracing::warn!("Recorder {} flush failed: {}", shared.id, e);
            }
        }
        if self.stop_pending {
            self.stop_ready = true;
        } else {
            shared.state.set(RecorderState::Paused);
            tracing::info!(
                "Recorder {} paused at {:.1}s",
                shared.id,
                self.length_ms as f64 / 1000.0
            );
        }
    }

    /// Close the current serial, or go straight to paused when no encoder
    /// is producing one
    fn request_boundary(
        &mut self,
        shared: &RecorderShared,
    ) -> std::result::Result<(), RecorderError> {
        if self.pause_target.is_some() {
            return Ok(());
        }
        if self.client.encoder_running() {
            self.pause_target = Some(self.client.set_flush());
        } else {
            // whatever the encoder queued before stopping still belongs here
            self.drain(shared)?;
            self.enter_paused(shared);
        }
        Ok(())
    }

    fn drain(&mut self, shared: &RecorderShared) -> std::result::Result<(), RecorderError> {
        while let Some(packet) = self.client.get_packet() {
            self.handle_packet(shared, &packet)?;
        }
        Ok(())
    }

    fn handle_requests(
        &mut self,
        shared: &RecorderShared,
    ) -> std::result::Result<(), RecorderError> {
        let state = shared.state();
        if shared.stop_request.swap(false, Ordering::AcqRel) {
            self.stop_pending = true;
            if state == RecorderState::Paused {
                self.stop_ready = true;
            } else {
                self.request_boundary(shared)?;
            }
        }
        if shared.pause_request.swap(false, Ordering::AcqRel) && state == RecorderState::Recording
        {
            self.request_boundary(shared)?;
        }
        if shared.unpause_request.swap(false, Ordering::AcqRel) && state == RecorderState::Paused
        {
            self.start_serial = self.client.set_flush();
            shared.state.set(RecorderState::Recording);
            tracing::info!(
                "Recorder {} resuming from serial {}",
                shared.id,
                self.start_serial
            );
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<(), RecorderError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RecorderError::Writer("file already closed".into()))?;
        file.write_all(data)
            .map_err(|e| RecorderError::Writer(e.to_string()))?;
        if self.bytes == 0 && self.format.supports_xing() && data.len() >= 4 {
            self.first_header = MpegHeader::parse([data[0], data[1], data[2], data[3]]);
        }
        self.bytes += data.len() as u64;
        Ok(())
    }

    fn handle_packet(
        &mut self,
        shared: &RecorderShared,
        packet: &Packet,
    ) -> std::result::Result<(), RecorderError> {
        if shared.state() != RecorderState::Recording || packet.serial < self.start_serial {
            return Ok(());
        }
        if packet.is_metadata() {
            let meta = TrackMetadata::from_payload(&packet.data);
            if self.tagging() && self.checkpoints.append(&meta, self.length_ms, self.bytes) {
                tracing::debug!(
                    "Recorder {} checkpoint at {} ms: {}",
                    shared.id,
                    self.length_ms,
                    meta.display_title()
                );
            }
            return Ok(());
        }
        if let Some(resume) = self.pause_target {
            // the closing FINAL was lost to an overflow
            if packet.serial >= resume {
                self.enter_paused(shared);
                return Ok(());
            }
        }

        if packet.is_initial() && self.tagging() {
            self.segments.begin(packet, self.length_ms, self.bytes);
        }
        if packet.is_audio() && !packet.data.is_empty() {
            self.write(&packet.data)?;
        }
        self.length_ms = ((self.accumulated + packet.timestamp) * 1000.0) as u64;
        shared.set_progress(self.length_ms, self.bytes);

        if packet.is_final() {
            self.accumulated += packet.timestamp;
            if let Some(resume) = self.pause_target {
                if packet.serial + 1 >= resume {
                    self.enter_paused(shared);
                }
            }
        }
        Ok(())
    }

    fn run(
        &mut self,
        shared: &RecorderShared,
        poll: Duration,
    ) -> std::result::Result<(), RecorderError> {
        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.handle_requests(shared)?;
            while !self.stop_ready {
                let Some(packet) = self.client.get_packet() else {
                    break;
                };
                self.handle_packet(shared, &packet)?;
            }
            if self.stop_ready {
                return Ok(());
            }
            if self.client.take_overflow() {
                tracing::warn!(
                    "Recorder {} fell behind encoder {}, {} packets dropped so far",
                    shared.id,
                    self.client.encoder_id(),
                    self.client.dropped()
                );
            }
            thread::sleep(poll);
        }
    }

    fn finish(mut self, shared: &RecorderShared) -> std::result::Result<(), RecorderError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .map_err(|e| RecorderError::Writer(e.to_string()))?;
        }
        let tagging = self.tagging();
        drop(self.client);

        if !tagging {
            return Ok(());
        }
        self.checkpoints.close(self.length_ms, self.bytes);
        self.segments.close(self.length_ms, self.bytes);

        let tagged = tag_recording(
            &self.names.audio,
            &self.checkpoints,
            &self.segments,
            self.first_header,
            self.length_ms,
            self.bytes,
        );
        if let Err(e) = &tagged {
            tracing::warn!(
                "Recorder {} keeping untagged file {}: {}",
                shared.id,
                self.names.audio.display(),
                e
            );
        }
        cue::write_cue_sheet(
            &self.names.cue,
            &self.names.timestamp,
            &self.names.file_name(),
            CueFileType::Mp3,
            self.checkpoints.entries(),
        )
        .map_err(|e| RecorderError::Writer(e.to_string()))?;
        tagged
    }
}

/// Recording straight from the audio feed
struct RawSession {
    sink: SharedPcmSink,
    names: OutputNames,
    writer: Option<WavWriter<BufWriter<File>>>,
    cue: LiveCue,
    checkpoints: CheckpointList,
    sample_rate: u32,
    frames: u64,
    buffers: [Vec<f32>; 2],
}

impl RawSession {
    fn length_ms(&self) -> u64 {
        self.frames * 1000 / self.sample_rate.max(1) as u64
    }

    fn bytes(&self) -> u64 {
        self.frames * 8
    }

    fn add_track(&mut self, shared: &RecorderShared, meta: &TrackMetadata) {
        let (length_ms, bytes) = (self.length_ms(), self.bytes());
        if !self.checkpoints.append(meta, length_ms, bytes) {
            return;
        }
        if let Err(e) = self
            .cue
            .add_track(&meta.artist, &meta.title, &meta.album, length_ms)
        {
            tracing::warn!("Recorder {} cue sheet write failed: {}", shared.id, e);
        }
    }

    fn pull(&mut self, shared: &RecorderShared) -> std::result::Result<(), RecorderError> {
        let ring = self.sink.ring();
        let frames = ring.available_frames();
        if frames == 0 {
            return Ok(());
        }
        let [left, right] = &mut self.buffers;
        left.clear();
        right.clear();
        ring.left.read_into_vec(left, frames);
        ring.right.read_into_vec(right, frames);

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RecorderError::Writer("writer already closed".into()))?;
        for (l, r) in left.iter().zip(right.iter()) {
            writer.write_sample(*l)?;
            writer.write_sample(*r)?;
        }
        self.frames += left.len().min(right.len()) as u64;
        shared.set_progress(self.length_ms(), self.bytes());
        Ok(())
    }

    fn run(
        &mut self,
        shared: &RecorderShared,
        poll: Duration,
    ) -> std::result::Result<(), RecorderError> {
        loop {
            if shared.shutdown.load(Ordering::Relaxed)
                || shared.stop_request.swap(false, Ordering::AcqRel)
            {
                return Ok(());
            }
            let state = shared.state();
            if shared.pause_request.swap(false, Ordering::AcqRel)
                && state == RecorderState::Recording
            {
                self.pull(shared)?;
                self.sink.disable();
                if let Some(writer) = self.writer.as_mut() {
                    writer.flush()?;
                }
                shared.state.set(RecorderState::Paused);
                tracing::info!("Recorder {} paused", shared.id);
            }
            if shared.unpause_request.swap(false, Ordering::AcqRel)
                && state == RecorderState::Paused
            {
                self.sink.enable();
                shared.state.set(RecorderState::Recording);
                tracing::info!("Recorder {} resumed", shared.id);
            }
            if let Some(meta) = shared.take_metadata() {
                self.add_track(shared, &meta);
            }
            if shared.state() == RecorderState::Recording {
                self.pull(shared)?;
            }
            thread::sleep(poll);
        }
    }

    fn finish(mut self, shared: &RecorderShared) -> std::result::Result<(), RecorderError> {
        if self.sink.is_enabled() {
            self.pull(shared)?;
        }
        self.sink.disable();
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

enum Session {
    Encoded(Box<EncodedSession>),
    Raw(Box<RawSession>),
}

impl Session {
    fn run(
        &mut self,
        shared: &RecorderShared,
        poll: Duration,
    ) -> std::result::Result<(), RecorderError> {
        match self {
            Session::Encoded(session) => session.run(shared, poll),
            Session::Raw(session) => session.run(shared, poll),
        }
    }

    fn finish(self, shared: &RecorderShared) -> std::result::Result<(), RecorderError> {
        match self {
            Session::Encoded(session) => session.finish(shared),
            Session::Raw(session) => session.finish(shared),
        }
    }
}

fn run_session(shared: &RecorderShared, mut session: Session, poll: Duration) {
    let outcome = session.run(shared, poll);
    shared.state.set(RecorderState::Stopping);
    if let Err(e) = &outcome {
        shared.record_error(e);
    }
    if let Err(e) = session.finish(shared) {
        shared.record_error(&e);
    }
    shared.stop_request.store(false, Ordering::Release);
    shared.pause_request.store(false, Ordering::Release);
    shared.unpause_request.store(false, Ordering::Release);
    shared.state.set(RecorderState::Stopped);
    tracing::info!(
        "Recorder {} stopped after {:.1}s",
        shared.id,
        shared.length_ms() as f64 / 1000.0
    );
}

fn worker_main(shared: Arc<RecorderShared>, poll: Duration) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        let woke = shared
            .state
            .wait_until(IDLE_WAIT, |s| s != RecorderState::Stopped);
        if woke.is_none() {
            continue;
        }
        let session = shared.session.lock().take();
        if let Some(session) = session {
            run_session(&shared, session, poll);
        }
    }
    tracing::debug!("Recorder {} worker exiting", shared.id);
}

struct RecorderSlot {
    shared: Arc<RecorderShared>,
    sink: SharedPcmSink,
    worker: Option<JoinHandle<()>>,
}

/// Fixed pool of recorders
pub struct RecorderPool {
    slots: Vec<RecorderSlot>,
    feed: Arc<AudioFeed>,
    default_folder: PathBuf,
    wait_timeout: Duration,
}

impl RecorderPool {
    /// Spawn one worker per sink
    pub fn new(
        config: &RecorderConfig,
        sinks: Vec<SharedPcmSink>,
        feed: Arc<AudioFeed>,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(sinks.len());
        for (id, sink) in sinks.into_iter().enumerate() {
            let shared = Arc::new(RecorderShared::new(id));
            let worker = {
                let shared = shared.clone();
                let poll = config.poll_interval();
                thread::Builder::new()
                    .name(format!("recorder-{}", id))
                    .spawn(move || worker_main(shared, poll))
                    .map_err(|e| RecorderError::Spawn(e.to_string()))?
            };
            slots.push(RecorderSlot {
                shared,
                sink,
                worker: Some(worker),
            });
        }
        tracing::info!("Recorder pool ready with {} slots", slots.len());

        Ok(Self {
            slots,
            feed,
            default_folder: config.default_folder.clone(),
            wait_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: usize) -> std::result::Result<&RecorderSlot, RecorderError> {
        self.slots.get(id).ok_or(RecorderError::NotFound(id))
    }

    pub fn shared(&self, id: usize) -> std::result::Result<&Arc<RecorderShared>, RecorderError> {
        Ok(&self.slot(id)?.shared)
    }

    pub fn state(&self, id: usize) -> Result<RecorderState> {
        Ok(self.shared(id)?.state())
    }

    fn open_encoded(
        &self,
        id: usize,
        encoder: usize,
        folder: &Path,
        filename: &str,
        encoders: &EncoderPool,
    ) -> Result<Session> {
        let client = encoders.register(encoder)?;
        let encoder_shared = encoders.shared(encoder)?;
        let format = encoder_shared
            .format()
            .ok_or_else(|| RecorderError::InvalidSource(format!("encoder {}", encoder)))?;

        let names = OutputNames::derive(folder, filename, format.extension());
        let file = BufWriter::new(File::create(&names.audio)?);
        let start_serial = client.set_flush();

        let mut checkpoints = CheckpointList::new();
        let current = encoder_shared.metadata();
        if format.supports_id3() && !current.is_empty() {
            checkpoints.append(&current, 0, 0);
        }
        tracing::info!(
            "Recorder {} recording encoder {} ({}) to {} from serial {}",
            id,
            encoder,
            format,
            names.audio.display(),
            start_serial
        );

        Ok(Session::Encoded(Box::new(EncodedSession {
            client,
            format,
            names,
            file: Some(file),
            checkpoints,
            segments: SegmentList::new(),
            first_header: None,
            start_serial,
            pause_target: None,
            stop_pending: false,
            stop_ready: false,
            accumulated: 0.0,
            length_ms: 0,
            bytes: 0,
        })))
    }

    fn open_raw(
        &self,
        slot: &RecorderSlot,
        folder: &Path,
        filename: &str,
        paused: bool,
    ) -> Result<Session> {
        let names = OutputNames::derive(folder, filename, ".wav");
        let sample_rate = self.feed.sample_rate();
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(&names.audio, spec).map_err(RecorderError::from)?;
        let cue = LiveCue::create(&names.cue, &names.timestamp, &names.file_name())?;

        let mut session = RawSession {
            sink: slot.sink.clone(),
            names,
            writer: Some(writer),
            cue,
            checkpoints: CheckpointList::new(),
            sample_rate,
            frames: 0,
            buffers: [Vec::new(), Vec::new()],
        };
        let current = {
            let mut meta = slot.shared.metadata.lock();
            meta.changed = false;
            meta.current.clone()
        };
        session.add_track(&slot.shared, &current);

        if !paused {
            session.sink.enable();
        }
        tracing::info!(
            "Recorder {} recording raw PCM at {} Hz to {}",
            slot.shared.id,
            sample_rate,
            session.names.audio.display()
        );
        Ok(Session::Raw(Box::new(session)))
    }

    /// Begin a recording. Returns once the output files are open.
    pub fn start(&self, id: usize, params: RecorderParams, encoders: &EncoderPool) -> Result<()> {
        let slot = self.slot(id)?;
        let shared = &slot.shared;
        if shared.state() != RecorderState::Stopped {
            return Err(RecorderError::AlreadyRunning(id).into());
        }
        let folder = params
            .folder
            .clone()
            .unwrap_or_else(|| self.default_folder.clone());
        let paused = shared.start_paused.swap(false, Ordering::AcqRel);

        let session = match params.source {
            RecordSource::Encoder(encoder) => {
                self.open_encoded(id, encoder, &folder, &params.filename, encoders)?
            }
            RecordSource::Raw => self.open_raw(slot, &folder, &params.filename, paused)?,
        };
        let output = match &session {
            Session::Encoded(s) => s.names.audio.clone(),
            Session::Raw(s) => s.names.audio.clone(),
        };

        *shared.output.lock() = Some(output);
        *shared.last_error.lock() = None;
        shared.set_progress(0, 0);
        shared.stop_request.store(false, Ordering::Release);
        shared.pause_request.store(false, Ordering::Release);
        shared.unpause_request.store(false, Ordering::Release);
        *shared.session.lock() = Some(session);

        let initial = if paused {
            RecorderState::Paused
        } else {
            RecorderState::Recording
        };
        if !shared.state.transition(RecorderState::Stopped, initial) {
            shared.session.lock().take();
            return Err(RecorderError::AlreadyRunning(id).into());
        }
        Ok(())
    }

    fn wait_for(
        &self,
        shared: &RecorderShared,
        pred: impl FnMut(RecorderState) -> bool,
    ) -> std::result::Result<RecorderState, RecorderError> {
        shared
            .state
            .wait_until(self.wait_timeout, pred)
            .ok_or(RecorderError::Timeout(shared.id))
    }

    /// Stop and finalize the recording; returns once the recorder is stopped
    pub fn stop(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() == RecorderState::Stopped {
            shared.start_paused.store(false, Ordering::Release);
            return Err(RecorderError::AlreadyStopped(id).into());
        }
        shared.stop_request.store(true, Ordering::Release);
        self.wait_for(shared, |s| s == RecorderState::Stopped)?;
        Ok(())
    }

    /// Pause the recording; returns once the recorder is paused. A stopped
    /// recorder remembers the request and starts paused.
    pub fn pause(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        match shared.state() {
            RecorderState::Stopped => {
                shared.start_paused.store(true, Ordering::Release);
                return Ok(());
            }
            RecorderState::Paused => return Err(RecorderError::AlreadyPaused(id).into()),
            RecorderState::Stopping => return Err(RecorderError::NotRecording(id).into()),
            RecorderState::Recording => {}
        }
        shared.pause_request.store(true, Ordering::Release);
        match self.wait_for(shared, |s| s != RecorderState::Recording)? {
            RecorderState::Paused => Ok(()),
            _ => Err(RecorderError::NotRecording(id).into()),
        }
    }

    /// Resume a paused recording; returns once it is recording again
    pub fn unpause(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != RecorderState::Paused {
            return Err(RecorderError::NotPaused(id).into());
        }
        shared.unpause_request.store(true, Ordering::Release);
        match self.wait_for(shared, |s| s != RecorderState::Paused)? {
            RecorderState::Recording => Ok(()),
            _ => Err(RecorderError::NotRecording(id).into()),
        }
    }

    /// Track change for raw recordings; encoded recordings take their
    /// metadata from the packet stream
    pub fn new_metadata(&self, id: usize, artist: &str, title: &str, album: &str) -> Result<()> {
        let shared = self.shared(id)?;
        let mut slot = shared.metadata.lock();
        slot.current.artist = artist.to_string();
        slot.current.title = title.to_string();
        slot.current.album = album.to_string();
        slot.changed = true;
        Ok(())
    }

    /// `recorder<N>report=<state>:<seconds>`
    pub fn report(&self, id: usize) -> Result<String> {
        let shared = self.shared(id)?;
        Ok(format!(
            "recorder{}report={}:{}",
            id,
            shared.state().code(),
            shared.length_ms() / 1000
        ))
    }
}

impl Drop for RecorderPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.shared.shutdown.store(true, Ordering::Release);
        }
        for slot in &mut self.slots {
            if let Some(worker) = slot.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFeed;
    use crate::codec::{Codec, CodecLock, DataFormat, Family};
    use crate::config::EncoderConfig;
    use crate::encoder::{EncoderParams, EncoderRuntime};
    use crate::testing::CountingFactory;

    struct Rig {
        feed: Arc<AudioFeed>,
        encoders: EncoderPool,
        recorders: RecorderPool,
        dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let mut feed = AudioFeed::new(44100);
        let encoder_sinks = vec![feed.add_sink(44100)];
        let recorder_sinks = vec![feed.add_sink(44100)];
        let feed = Arc::new(feed);
        let runtime = EncoderRuntime {
            feed: feed.clone(),
            factory: Arc::new(CountingFactory { restarts: false }),
            lock: Arc::new(CodecLock::new()),
            poll_interval: Duration::from_millis(2),
            fade_seconds: 1.0,
        };
        let encoders = EncoderPool::new(
            &EncoderConfig::default(),
            encoder_sinks,
            runtime,
            Duration::from_secs(5),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            default_folder: dir.path().to_path_buf(),
            poll_interval_ms: 2,
            ..Default::default()
        };
        let recorders =
            RecorderPool::new(&config, recorder_sinks, feed.clone(), Duration::from_secs(5))
                .unwrap();
        Rig {
            feed,
            encoders,
            recorders,
            dir,
        }
    }

    fn mp3_params() -> EncoderParams {
        EncoderParams {
            format: DataFormat::new(Family::Mpeg, Codec::Mp3),
            ..Default::default()
        }
    }

    fn record(source: RecordSource, filename: &str) -> RecorderParams {
        RecorderParams {
            source,
            folder: None,
            filename: filename.into(),
        }
    }

    /// Keep the feed running until the recording is `ms` long
    fn feed_until(rig: &Rig, ms: u64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rig.recorders.shared(0).unwrap().length_ms() < ms {
            assert!(std::time::Instant::now() < deadline, "recording stalled");
            rig.feed.process(&[0.0; 441], &[0.0; 441]);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_for_length(recorders: &RecorderPool, ms: u64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorders.shared(0).unwrap().length_ms() < ms {
            assert!(std::time::Instant::now() < deadline, "recording stalled");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_record_source_forms() {
        assert_eq!(RecordSource::parse("-1"), Some(RecordSource::Raw));
        assert_eq!(RecordSource::parse("3"), Some(RecordSource::Encoder(3)));
        assert_eq!(RecordSource::parse("-2"), None);
        assert_eq!(RecordSource::parse("x"), None);
    }

    #[test]
    fn test_command_preconditions() {
        let rig = rig();
        assert!(rig.recorders.stop(0).is_err());
        assert!(rig.recorders.unpause(0).is_err());
        assert!(rig.recorders.pause(5).is_err());
        assert_eq!(rig.recorders.report(0).unwrap(), "recorder0report=0:0");

        // encoder 0 is not running
        assert!(rig
            .recorders
            .start(0, record(RecordSource::Encoder(0), "x"), &rig.encoders)
            .is_err());
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Stopped);
    }

    #[test]
    fn test_encoded_recording_is_tagged_with_cue() {
        let rig = rig();
        rig.encoders.start(0, mp3_params()).unwrap();
        rig.encoders
            .set_song_metadata(0, "Artist", "Opening", "")
            .unwrap();
        rig.recorders
            .start(0, record(RecordSource::Encoder(0), "show"), &rig.encoders)
            .unwrap();
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Recording);

        feed_until(&rig, 100);
        rig.recorders.stop(0).unwrap();
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Stopped);

        let audio = rig.dir.path().join("show.mp3");
        let data = fs::read(&audio).unwrap();
        let tag = id3::tag_len(&data);
        assert!(tag > 0);
        assert_eq!(&data[tag..tag + 4], b"HEAD");
        assert!(data[..tag].windows(4).any(|w| w == b"CHAP"));
        assert!(!temp_path(&audio).exists());

        let cue = fs::read_to_string(rig.dir.path().join("show.cue")).unwrap();
        assert!(cue.contains("FILE \"show.mp3\" MP3\r\n"));
        assert!(cue.contains("TITLE \"Opening\"\r\n"));
        assert!(cue.contains("INDEX 01 00:00:00\r\n"));
        rig.encoders.stop(0).unwrap();
    }

    #[test]
    fn test_pause_blocks_until_paused() {
        let rig = rig();
        rig.encoders.start(0, mp3_params()).unwrap();
        rig.recorders
            .start(0, record(RecordSource::Encoder(0), "paused"), &rig.encoders)
            .unwrap();
        feed_until(&rig, 20);

        rig.recorders.pause(0).unwrap();
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Paused);
        assert!(rig.recorders.pause(0).is_err());
        assert!(rig.recorders.report(0).unwrap().starts_with("recorder0report=2:"));

        rig.recorders.unpause(0).unwrap();
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Recording);
        rig.recorders.stop(0).unwrap();
        rig.encoders.stop(0).unwrap();
    }

    #[test]
    fn test_metadata_while_paused_adds_no_track() {
        let rig = rig();
        rig.encoders.start(0, mp3_params()).unwrap();
        rig.encoders
            .set_song_metadata(0, "Artist", "Opening", "")
            .unwrap();
        rig.recorders
            .start(0, record(RecordSource::Encoder(0), "gaps"), &rig.encoders)
            .unwrap();
        feed_until(&rig, 50);
        rig.recorders.pause(0).unwrap();
        let paused_at = rig.recorders.shared(0).unwrap().length_ms();

        for _ in 0..5 {
            rig.feed.process(&[0.0; 441], &[0.0; 441]);
            thread::sleep(Duration::from_millis(2));
        }
        rig.encoders
            .set_song_metadata(0, "Artist", "Skipped", "")
            .unwrap();
        rig.encoders.set_custom_metadata(0, "").unwrap();
        for _ in 0..20 {
            rig.feed.process(&[0.0; 441], &[0.0; 441]);
            thread::sleep(Duration::from_millis(2));
        }

        rig.recorders.unpause(0).unwrap();
        feed_until(&rig, paused_at + 30);
        rig.encoders
            .set_song_metadata(0, "Artist", "Closing", "")
            .unwrap();
        rig.encoders.set_custom_metadata(0, "").unwrap();
        feed_until(&rig, paused_at + 80);
        rig.recorders.stop(0).unwrap();
        rig.encoders.stop(0).unwrap();

        let cue = fs::read_to_string(rig.dir.path().join("gaps.cue")).unwrap();
        assert!(cue.contains("TITLE \"Opening\""));
        assert!(cue.contains("TITLE \"Closing\""));
        assert!(!cue.contains("Skipped"));
    }

    #[test]
    fn test_stop_after_encoder_stopped_keeps_queued_audio() {
        let rig = rig();
        rig.encoders.start(0, mp3_params()).unwrap();
        let mut session = rig
            .recorders
            .open_encoded(0, 0, rig.dir.path(), "late", &rig.encoders)
            .unwrap();
        let queued = |session: &Session| match session {
            Session::Encoded(inner) => inner.client.queued(),
            Session::Raw(_) => 0,
        };

        // header plus about 50 audio packets, none read yet
        for _ in 0..5 {
            rig.feed.process(&[0.0; 4410], &[0.0; 4410]);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queued(&session) < 51 {
            assert!(std::time::Instant::now() < deadline, "encoder stalled");
            thread::sleep(Duration::from_millis(2));
        }
        rig.encoders.stop(0).unwrap();

        let shared = RecorderShared::new(9);
        shared.state.set(RecorderState::Recording);
        shared.stop_request.store(true, Ordering::Release);
        session.run(&shared, Duration::from_millis(1)).unwrap();
        assert_eq!(queued(&session), 0);
        session.finish(&shared).unwrap();

        let data = fs::read(rig.dir.path().join("late.mp3")).unwrap();
        let audio = &data[id3::tag_len(&data)..];
        assert_eq!(&audio[..4], b"HEAD");
        let counts: Vec<u64> = audio[4..]
            .chunks(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert!(counts.len() >= 49, "only {} packets written", counts.len());
        assert_eq!(counts[0], 441);
        assert!(counts.windows(2).all(|w| w[1] - w[0] == 441));
        assert!(shared.length_ms().abs_diff(counts.len() as u64 * 10) <= 1);
    }

    #[test]
    fn test_pause_before_start_starts_paused() {
        let rig = rig();
        rig.recorders.pause(0).unwrap();
        rig.recorders
            .start(0, record(RecordSource::Raw, "raw"), &rig.encoders)
            .unwrap();
        assert_eq!(rig.recorders.state(0).unwrap(), RecorderState::Paused);
        rig.recorders.stop(0).unwrap();
    }

    #[test]
    fn test_raw_recording_writes_wav_and_live_cue() {
        let rig = rig();
        rig.recorders.new_metadata(0, "A", "First", "").unwrap();
        rig.recorders
            .start(0, record(RecordSource::Raw, "raw"), &rig.encoders)
            .unwrap();

        rig.feed.process(&[0.25; 4410], &[-0.25; 4410]);
        wait_for_length(&rig.recorders, 100);
        rig.recorders.new_metadata(0, "B", "Second", "LP").unwrap();
        rig.feed.process(&[0.25; 4410], &[-0.25; 4410]);
        wait_for_length(&rig.recorders, 200);
        rig.recorders.stop(0).unwrap();

        let reader = hound::WavReader::open(rig.dir.path().join("raw.wav")).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_format, SampleFormat::Float);
        let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 2 * 8820);
        assert_eq!(&samples[..2], &[0.25, -0.25]);

        let cue = fs::read_to_string(rig.dir.path().join("raw.cue")).unwrap();
        assert!(cue.contains("FILE \"raw.wav\" WAVE\r\n"));
        assert!(cue.contains("TRACK 01 AUDIO\r\n    TITLE \"First\""));
        assert!(cue.contains("TRACK 02 AUDIO\r\n    TITLE \"Second\""));
    }
}
