//! Encoder slots
//!
//! A fixed pool of slots, each driven by one long-lived worker thread. The
//! worker sleeps while its slot is STOPPED and runs the engine loop while it
//! is STARTING/RUNNING/STOPPING:
//!
//! ```text
//! STOPPED ──start──▶ STARTING ──backend open, first serial──▶ RUNNING
//!    ▲                  ▲                                        │
//!    │                  └──────────── update (new params) ───────┤
//!    └──────────── backend teardown ◀── STOPPING ◀──── stop ─────┘
//! ```
//!
//! Each iteration pulls PCM from the slot's feed sink, applies fade and
//! pregain, resamples when the feed rate differs from the codec rate, runs
//! the codec backend and publishes packets through the slot's [`Fanout`].

pub mod client;
mod params;

pub use client::{Client, ClientQueue, Fanout};
pub use params::*;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{AudioFeed, FadeRamp, SharedPcmSink, StreamResampler};
use crate::codec::{
    BackendFactory, CodecBackend, CodecLock, DataFormat, EncodeStep, EncodedUnit, PcmQueue,
};
use crate::config::EncoderConfig;
use crate::error::{CodecError, EncoderError, Error, Result};
use crate::packet::{Packet, PacketFlags, StreamInfo, TrackMetadata};
use crate::state::StateCell;

/// How long an idle worker sleeps between shutdown checks
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EncoderState {
    pub fn code(&self) -> u8 {
        match self {
            EncoderState::Stopped => 0,
            EncoderState::Starting => 1,
            EncoderState::Running => 2,
            EncoderState::Stopping => 3,
        }
    }
}

#[derive(Debug, Default)]
struct MetadataSlot {
    current: TrackMetadata,
    changed: bool,
}

/// State of one slot shared between its worker, the control thread and clients
pub struct EncoderShared {
    pub id: usize,
    state: StateCell<EncoderState>,
    pub(crate) fanout: Fanout,
    params: Mutex<Option<EncoderParams>>,
    metadata: Mutex<MetadataSlot>,
    fade_request: AtomicBool,
    stop_request: AtomicBool,
    restart_request: AtomicBool,
    shutdown: AtomicBool,
    last_error: Mutex<Option<String>>,
    packets_published: AtomicU64,
}

impl EncoderShared {
    pub fn new(id: usize, queue_capacity: usize) -> Self {
        let initial_serial = rand::thread_rng().gen_range(100..u16::MAX as u32);
        Self {
            id,
            state: StateCell::new(EncoderState::Stopped),
            fanout: Fanout::new(queue_capacity, initial_serial),
            params: Mutex::new(None),
            metadata: Mutex::new(MetadataSlot::default()),
            fade_request: AtomicBool::new(false),
            stop_request: AtomicBool::new(false),
            restart_request: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            last_error: Mutex::new(None),
            packets_published: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state.get()
    }

    pub fn serial(&self) -> u32 {
        self.fanout.serial()
    }

    pub fn client_count(&self) -> usize {
        self.fanout.client_count()
    }

    pub fn packets_published(&self) -> u64 {
        self.packets_published.load(Ordering::Relaxed)
    }

    /// Most recent failure of the worker, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn metadata(&self) -> TrackMetadata {
        self.metadata.lock().current.clone()
    }

    /// Format of the current (or last) run
    pub fn format(&self) -> Option<DataFormat> {
        self.params.lock().as_ref().map(|p| p.format)
    }

    fn record_error(&self, error: &Error) {
        tracing::error!("Encoder {} failed: {}", self.id, error);
        *self.last_error.lock() = Some(error.to_string());
    }
}

/// Everything a worker needs besides its own slot
#[derive(Clone)]
pub struct EncoderRuntime {
    pub feed: Arc<AudioFeed>,
    pub factory: Arc<dyn BackendFactory>,
    pub lock: Arc<CodecLock>,
    pub poll_interval: Duration,
    pub fade_seconds: f32,
}

enum Exit {
    Stop,
    Restart,
}

/// One backend lifetime: from open to teardown
struct Engine {
    shared: Arc<EncoderShared>,
    sink: SharedPcmSink,
    runtime: EncoderRuntime,
    backend: Box<dyn CodecBackend>,
    info: StreamInfo,
    params: EncoderParams,
    input: PcmQueue,
    resampler: Option<StreamResampler>,
    fade: FadeRamp,
    feed_rate: u32,
    raw: [Vec<f32>; 2],
    serial: u32,
    first_in_serial: bool,
    last_timestamp: f64,
}

impl Engine {
    fn open(
        shared: Arc<EncoderShared>,
        sink: SharedPcmSink,
        runtime: EncoderRuntime,
        params: EncoderParams,
    ) -> Result<Self> {
        let backend = runtime.factory.open(&params, &runtime.lock)?;
        let info = backend.stream_info();
        let feed_rate = runtime.feed.sample_rate();
        let target_rate = params.target_rate();

        let resampler = if feed_rate != target_rate {
            tracing::info!(
                "Encoder {} resampling {} Hz -> {} Hz",
                shared.id,
                feed_rate,
                target_rate
            );
            Some(StreamResampler::new(
                feed_rate,
                target_rate,
                backend.frame_size(),
                params.channels(),
                params.resample_quality,
            )?)
        } else {
            None
        };

        Ok(Self {
            input: PcmQueue::new(params.channels()),
            shared,
            sink,
            runtime,
            backend,
            info,
            params,
            resampler,
            fade: FadeRamp::default(),
            feed_rate,
            raw: [Vec::new(), Vec::new()],
            serial: 0,
            first_in_serial: true,
            last_timestamp: 0.0,
        })
    }

    fn emit(&mut self, unit: EncodedUnit, extra: PacketFlags) {
        let mut flags = unit.flags | extra;
        if self.first_in_serial {
            flags |= PacketFlags::INITIAL;
            self.first_in_serial = false;
        }
        let timestamp = unit.timestamp.max(self.last_timestamp);
        self.last_timestamp = timestamp;

        let packet = self.info.packet(self.serial, flags, timestamp, unit.data);
        tracing::trace!(
            "Encoder {} serial {} {} {} bytes at {:.3}s",
            self.shared.id,
            packet.serial,
            packet.flags,
            packet.data_size(),
            packet.timestamp
        );
        self.shared.fanout.publish(&packet);
        self.shared.packets_published.fetch_add(1, Ordering::Relaxed);
    }

    fn header_metadata(&self) -> TrackMetadata {
        if self.params.use_metadata {
            self.shared.metadata()
        } else {
            TrackMetadata::default()
        }
    }

    fn begin_serial(&mut self, serial: u32) -> Result<()> {
        self.serial = serial;
        self.first_in_serial = true;
        self.last_timestamp = 0.0;
        let meta = self.header_metadata();
        let units = self
            .backend
            .begin_serial(serial, &meta, &self.runtime.lock)?;
        for unit in units {
            self.emit(unit, PacketFlags::NONE);
        }
        tracing::debug!("Encoder {} began serial {}", self.shared.id, serial);
        Ok(())
    }

    fn end_serial(&mut self) -> Result<()> {
        let units = self.backend.end_serial(&mut self.input)?;
        let count = units.len();
        if count == 0 {
            let ts = self.last_timestamp;
            self.emit(EncodedUnit::audio(Bytes::new(), ts), PacketFlags::FINAL);
        }
        for (i, unit) in units.into_iter().enumerate() {
            let extra = if i + 1 == count {
                PacketFlags::FINAL
            } else {
                PacketFlags::NONE
            };
            self.emit(unit, extra);
        }
        Ok(())
    }

    fn restart_serial(&mut self) -> Result<()> {
        self.end_serial()?;
        let serial = self.shared.fanout.advance_serial();
        self.begin_serial(serial)
    }

    fn check_metadata(&mut self) -> Result<()> {
        let update = {
            let mut slot = self.shared.metadata.lock();
            if slot.changed {
                slot.changed = false;
                Some(slot.current.clone())
            } else {
                None
            }
        };
        let Some(meta) = update else {
            return Ok(());
        };
        if !self.params.use_metadata {
            return Ok(());
        }

        if self.backend.restarts_on_metadata() {
            tracing::info!(
                "Encoder {} new metadata, restarting serial: {}",
                self.shared.id,
                meta.display_title()
            );
            self.restart_serial()
        } else if self.first_in_serial {
            // no audio in this serial yet
            self.shared.metadata.lock().changed = true;
            Ok(())
        } else {
            let packet = Packet {
                bit_rate: self.info.bit_rate,
                sample_rate: self.info.sample_rate,
                channel_count: self.info.channel_count,
                flags: PacketFlags::METADATA,
                serial: self.serial,
                timestamp: self.last_timestamp,
                data: meta.to_payload(),
            };
            self.shared.fanout.publish(&packet);
            Ok(())
        }
    }

    /// Move whatever the callback buffered into the codec input queue
    fn pull_input(&mut self) -> Result<()> {
        let ring = self.sink.ring();
        let frames = ring.available_frames();
        if frames == 0 {
            return Ok(());
        }
        let [left, right] = &mut self.raw;
        left.clear();
        right.clear();
        ring.left.read_into_vec(left, frames);
        ring.right.read_into_vec(right, frames);

        self.fade.apply(left, right, self.params.pregain);
        if self.input.channels() == 1 {
            for (l, r) in left.iter_mut().zip(right.iter()) {
                *l = (*l + *r) * 0.5;
            }
        }

        match &mut self.resampler {
            Some(resampler) => {
                resampler.push(left, right);
                resampler.process(self.input.staging())?;
            }
            None => self.input.push(left, right),
        }
        Ok(())
    }

    fn encode_available(&mut self) -> Result<()> {
        loop {
            match self.backend.encode_step(&mut self.input)? {
                EncodeStep::Produced(units) => {
                    for unit in units {
                        self.emit(unit, PacketFlags::NONE);
                    }
                }
                EncodeStep::NeedMoreInput => return Ok(()),
            }
        }
    }

    /// Flush the resampler and close the current serial
    fn finish(&mut self) -> Result<()> {
        self.pull_input()?;
        if let Some(resampler) = &mut self.resampler {
            resampler.drain(self.input.staging())?;
        }
        self.encode_available()?;
        self.end_serial()
    }

    fn run(&mut self) -> Result<Exit> {
        let serial = self.shared.fanout.begin_run();
        self.begin_serial(serial)?;
        self.sink.enable();
        self.shared.state.set(EncoderState::Running);
        tracing::info!(
            "Encoder {} running: {} at {} Hz, {} kbps, serial {}",
            self.shared.id,
            self.params.format,
            self.info.sample_rate,
            self.info.bit_rate,
            serial
        );

        loop {
            if self.shared.shutdown.load(Ordering::Relaxed)
                || self.shared.stop_request.swap(false, Ordering::AcqRel)
            {
                self.shared.state.set(EncoderState::Stopping);
                self.finish()?;
                return Ok(Exit::Stop);
            }
            if self.shared.restart_request.swap(false, Ordering::AcqRel) {
                self.shared.state.set(EncoderState::Stopping);
                self.finish()?;
                return Ok(Exit::Restart);
            }

            if self.shared.fanout.flush_pending() {
                self.restart_serial()?;
            }
            self.check_metadata()?;
            if self.shared.fade_request.swap(false, Ordering::AcqRel) {
                tracing::info!("Encoder {} fading out", self.shared.id);
                self.fade.start(self.feed_rate, self.runtime.fade_seconds);
            }

            self.pull_input()?;
            self.encode_available()?;
            thread::sleep(self.runtime.poll_interval);
        }
    }

    /// Emit a bare FINAL so consumers waiting on this serial are released
    fn abort_serial(&mut self) {
        if self.serial != 0 {
            let ts = self.last_timestamp;
            self.emit(EncodedUnit::audio(Bytes::new(), ts), PacketFlags::FINAL);
        }
    }

    fn close(self) {
        let Engine {
            backend, runtime, ..
        } = self;
        backend.teardown(&runtime.lock);
    }
}

/// Worker body for one backend run plus any restarts requested by `update`
fn run_slot(shared: &Arc<EncoderShared>, sink: &SharedPcmSink, runtime: &EncoderRuntime) {
    loop {
        let params = match shared.params.lock().clone() {
            Some(params) => params,
            None => break,
        };

        let mut engine = match Engine::open(shared.clone(), sink.clone(), runtime.clone(), params)
        {
            Ok(engine) => engine,
            Err(e) => {
                shared.record_error(&e);
                break;
            }
        };

        let outcome = engine.run();
        if outcome.is_err() {
            shared.state.set(EncoderState::Stopping);
            engine.abort_serial();
        }
        engine.close();

        match outcome {
            Ok(Exit::Restart) => {
                tracing::info!("Encoder {} restarting with new parameters", shared.id);
                shared.state.set(EncoderState::Starting);
            }
            Ok(Exit::Stop) => break,
            Err(e) => {
                shared.record_error(&e);
                break;
            }
        }
    }

    sink.disable();
    shared.state.set(EncoderState::Stopped);
    tracing::info!("Encoder {} stopped", shared.id);
}

fn worker_main(shared: Arc<EncoderShared>, sink: SharedPcmSink, runtime: EncoderRuntime) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        let woke = shared
            .state
            .wait_until(IDLE_WAIT, |s| s == EncoderState::Starting);
        if woke == Some(EncoderState::Starting) && !shared.shutdown.load(Ordering::Relaxed) {
            run_slot(&shared, &sink, &runtime);
        }
    }
    tracing::debug!("Encoder {} worker exiting", shared.id);
}

struct EncoderSlot {
    shared: Arc<EncoderShared>,
    worker: Option<JoinHandle<()>>,
}

/// Fixed pool of encoder slots
pub struct EncoderPool {
    slots: Vec<EncoderSlot>,
    factory: Arc<dyn BackendFactory>,
    wait_timeout: Duration,
}

impl EncoderPool {
    /// Spawn one worker per sink
    pub fn new(
        config: &EncoderConfig,
        sinks: Vec<SharedPcmSink>,
        runtime: EncoderRuntime,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(sinks.len());
        for (id, sink) in sinks.into_iter().enumerate() {
            let shared = Arc::new(EncoderShared::new(id, config.client_queue_packets));
            let worker = {
                let shared = shared.clone();
                let runtime = runtime.clone();
                thread::Builder::new()
                    .name(format!("encoder-{}", id))
                    .spawn(move || worker_main(shared, sink, runtime))
                    .map_err(|e| EncoderError::Spawn(e.to_string()))?
            };
            slots.push(EncoderSlot {
                shared,
                worker: Some(worker),
            });
        }
        tracing::info!("Encoder pool ready with {} slots", slots.len());

        Ok(Self {
            slots,
            factory: runtime.factory,
            wait_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn shared(&self, id: usize) -> std::result::Result<&Arc<EncoderShared>, EncoderError> {
        self.slots
            .get(id)
            .map(|slot| &slot.shared)
            .ok_or(EncoderError::NotFound(id))
    }

    pub fn state(&self, id: usize) -> Result<EncoderState> {
        Ok(self.shared(id)?.state())
    }

    fn validate(&self, params: &EncoderParams) -> Result<()> {
        if params.source == EncodeSource::File {
            return Err(EncoderError::InvalidParameter {
                key: "encode_source",
                value: "file".into(),
            }
            .into());
        }
        if !self.factory.supports(params.format) {
            return Err(CodecError::UnsupportedFormat(params.format.to_string()).into());
        }
        Ok(())
    }

    /// Start a stopped slot and wait until it is running
    pub fn start(&self, id: usize, params: EncoderParams) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != EncoderState::Stopped {
            return Err(EncoderError::NotStopped(id).into());
        }
        self.validate(&params)?;

        *shared.params.lock() = Some(params);
        *shared.last_error.lock() = None;
        shared.stop_request.store(false, Ordering::Release);
        shared.restart_request.store(false, Ordering::Release);
        if !shared
            .state
            .transition(EncoderState::Stopped, EncoderState::Starting)
        {
            return Err(EncoderError::NotStopped(id).into());
        }

        match shared.state.wait_until(self.wait_timeout, |s| {
            matches!(s, EncoderState::Running | EncoderState::Stopped)
        }) {
            Some(EncoderState::Running) => Ok(()),
            Some(_) => Err(EncoderError::StartFailed(id).into()),
            None => Err(EncoderError::Timeout(id).into()),
        }
    }

    /// Stop a running slot; returns once the final serial has been published
    pub fn stop(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() == EncoderState::Stopped {
            return Err(EncoderError::AlreadyStopped(id).into());
        }
        shared.stop_request.store(true, Ordering::Release);
        shared
            .state
            .wait_until(self.wait_timeout, |s| s == EncoderState::Stopped)
            .map(|_| ())
            .ok_or_else(|| EncoderError::Timeout(id).into())
    }

    /// Reconfigure a running slot. The current serial ends and a new run
    /// begins with `params`; clients stay attached.
    pub fn update(&self, id: usize, params: EncoderParams) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != EncoderState::Running {
            return Err(EncoderError::NotRunning(id).into());
        }
        self.validate(&params)?;
        *shared.params.lock() = Some(params);
        shared.restart_request.store(true, Ordering::Release);
        Ok(())
    }

    /// Store track fields without announcing them
    pub fn set_song_metadata(&self, id: usize, artist: &str, title: &str, album: &str) -> Result<()> {
        let shared = self.shared(id)?;
        let mut slot = shared.metadata.lock();
        slot.current.artist = artist.to_string();
        slot.current.title = title.to_string();
        slot.current.album = album.to_string();
        Ok(())
    }

    /// Store the custom text and announce the metadata
    pub fn set_custom_metadata(&self, id: usize, custom: &str) -> Result<()> {
        let shared = self.shared(id)?;
        let mut slot = shared.metadata.lock();
        slot.current.custom = custom.to_string();
        slot.changed = true;
        Ok(())
    }

    pub fn initiate_fade(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != EncoderState::Running {
            return Err(EncoderError::NotRunning(id).into());
        }
        shared.fade_request.store(true, Ordering::Release);
        Ok(())
    }

    /// Attach a consumer to a running slot
    pub fn register(&self, id: usize) -> Result<Client> {
        Ok(Client::register(self.shared(id)?.clone())?)
    }
}

impl Drop for EncoderPool {
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
    use crate::codec::{Codec, DataFormat, Family};
    use crate::testing::CountingFactory;

    fn pool(restarts: bool) -> (Arc<AudioFeed>, EncoderPool) {
        let mut feed = AudioFeed::new(44100);
        let sinks = vec![feed.add_sink(44100)];
        let feed = Arc::new(feed);
        let runtime = EncoderRuntime {
            feed: feed.clone(),
            factory: Arc::new(CountingFactory { restarts }),
            lock: Arc::new(CodecLock::new()),
            poll_interval: Duration::from_millis(2),
            fade_seconds: 1.0,
        };
        let pool = EncoderPool::new(
            &EncoderConfig::default(),
            sinks,
            runtime,
            Duration::from_secs(5),
        )
        .unwrap();
        (feed, pool)
    }

    fn mp3_params() -> EncoderParams {
        EncoderParams {
            format: DataFormat::new(Family::Mpeg, Codec::Mp3),
            ..Default::default()
        }
    }

    fn drain(client: &Client, until: impl Fn(&Packet) -> bool) -> Vec<Packet> {
        let mut packets = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match client.get_packet() {
                Some(p) => {
                    let done = until(&p);
                    packets.push(p);
                    if done {
                        break;
                    }
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        packets
    }

    #[test]
    fn test_start_rejects_unsupported_and_busy() {
        let (_feed, pool) = pool(false);
        assert!(pool.start(0, EncoderParams::default()).is_err());
        assert_eq!(pool.state(0).unwrap(), EncoderState::Stopped);

        pool.start(0, mp3_params()).unwrap();
        assert!(matches!(
            pool.start(0, mp3_params()),
            Err(Error::Encoder(EncoderError::NotStopped(0)))
        ));
        pool.stop(0).unwrap();
        assert!(pool.stop(0).is_err());
        assert!(pool.start(7, mp3_params()).is_err());
    }

    #[test]
    fn test_flush_closes_serial_and_reopens() {
        let (feed, pool) = pool(false);
        pool.start(0, mp3_params()).unwrap();
        let client = pool.register(0).unwrap();
        let resume = client.set_flush();

        feed.process(&[0.0; 882], &[0.0; 882]);
        let packets = drain(&client, |p| p.serial == resume);
        let first_new = packets.iter().position(|p| p.serial == resume).unwrap();
        assert!(packets[first_new].is_initial());
        assert!(packets[..first_new].iter().any(|p| p.is_final()));
        pool.stop(0).unwrap();
    }

    #[test]
    fn test_metadata_packet_for_non_restarting_backend() {
        let (feed, pool) = pool(false);
        pool.start(0, mp3_params()).unwrap();
        let client = pool.register(0).unwrap();

        feed.process(&[0.0; 441], &[0.0; 441]);
        drain(&client, |p| p.is_audio() && !p.flags.contains(PacketFlags::HEADER));
        pool.set_song_metadata(0, "Artist", "Title", "Album").unwrap();
        pool.set_custom_metadata(0, "").unwrap();

        let packets = drain(&client, Packet::is_metadata);
        let meta = packets.last().unwrap();
        assert!(meta.is_metadata());
        assert!(!meta.is_audio());
        let parsed = TrackMetadata::from_payload(&meta.data);
        assert_eq!(parsed.title, "Title");
        pool.stop(0).unwrap();
    }

    #[test]
    fn test_stop_publishes_final() {
        let (_feed, pool) = pool(true);
        pool.start(0, mp3_params()).unwrap();
        let client = pool.register(0).unwrap();
        let serial = client.set_flush();
        drain(&client, |p| p.serial == serial);
        pool.stop(0).unwrap();

        let packets = drain(&client, Packet::is_final);
        assert!(packets.last().unwrap().is_final());
        assert!(!client.encoder_running());
        assert!(pool.register(0).is_err());
    }
}
