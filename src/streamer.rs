//! Streamers
//!
//! A streamer is the network consumer of one encoder's packet stream. It
//! joins the stream on a serial boundary (so the far end always receives
//! container headers first), forwards every audio payload to a
//! [`PacketSink`], and leaves on a serial boundary too.
//!
//! Protocol framing (HTTP, ICY) is not done here; the provided sink is a
//! plain TCP connection.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::encoder::{Client, EncoderPool};
use crate::error::{Result, StreamerError};
use crate::packet::Packet;
use crate::state::StateCell;

const IDLE_WAIT: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_BUFFER_BYTES: usize = 256 * 1024;

/// Destination of a streamer's bytes
pub trait PacketSink: Send {
    fn send(&mut self, data: &[u8]) -> std::result::Result<(), StreamerError>;

    fn close(&mut self) {}
}

/// Plain TCP connection
pub struct TcpSink {
    stream: TcpStream,
}

impl TcpSink {
    pub fn connect(host: &str, port: u16) -> std::result::Result<Self, StreamerError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| StreamerError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| {
                StreamerError::ConnectionFailed(format!("{}:{} did not resolve", host, port))
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| StreamerError::ConnectionFailed(e.to_string()))?;
        socket
            .connect_timeout(&SockAddr::from(addr), CONNECT_TIMEOUT)
            .map_err(|e| StreamerError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!("Failed to disable Nagle on {}: {}", addr, e);
        }
        if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
            tracing::warn!("Failed to size send buffer on {}: {}", addr, e);
        }
        socket
            .set_write_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|e| StreamerError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connected to {}", addr);
        Ok(Self {
            stream: socket.into(),
        })
    }
}

impl PacketSink for TcpSink {
    fn send(&mut self, data: &[u8]) -> std::result::Result<(), StreamerError> {
        self.stream
            .write_all(data)
            .map_err(|e| StreamerError::SendFailed(e.to_string()))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Disconnected,
    /// Waiting for the first packet of the join serial
    Connecting,
    Connected,
    /// Sending out the rest of the current serial
    Disconnecting,
}

impl StreamerState {
    pub fn code(&self) -> u8 {
        match self {
            StreamerState::Disconnected => 0,
            StreamerState::Connecting => 1,
            StreamerState::Connected => 2,
            StreamerState::Disconnecting => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamerParams {
    /// Encoder slot to stream from
    pub source: usize,
    pub host: String,
    pub port: u16,
}

struct Session {
    client: Client,
    sink: Box<dyn PacketSink>,
    join_serial: u32,
    leave_serial: Option<u32>,
}

pub struct StreamerShared {
    pub id: usize,
    state: StateCell<StreamerState>,
    session: Mutex<Option<Session>>,
    disconnect_request: AtomicBool,
    shutdown: AtomicBool,
    bytes_sent: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl StreamerShared {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: StateCell::new(StreamerState::Disconnected),
            session: Mutex::new(None),
            disconnect_request: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamerState {
        self.state.get()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Session {
    /// Send one packet; returns true once the leave serial is complete
    fn forward(
        &mut self,
        shared: &StreamerShared,
        packet: &Packet,
    ) -> std::result::Result<bool, StreamerError> {
        if packet.serial < self.join_serial {
            return Ok(false);
        }
        if let Some(leave) = self.leave_serial {
            if packet.serial >= leave {
                return Ok(true);
            }
        }
        if shared.state() == StreamerState::Connecting {
            if !packet.is_initial() {
                return Ok(false);
            }
            shared.state.set(StreamerState::Connected);
            tracing::info!("Streamer {} joined at serial {}", shared.id, packet.serial);
        }
        if packet.is_audio() && !packet.data.is_empty() {
            self.sink.send(&packet.data)?;
            shared
                .bytes_sent
                .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
        }
        let leaving = self
            .leave_serial
            .is_some_and(|leave| packet.serial + 1 >= leave);
        Ok(packet.is_final() && leaving)
    }

    fn run(
        &mut self,
        shared: &StreamerShared,
        poll: Duration,
    ) -> std::result::Result<(), StreamerError> {
        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            if shared.disconnect_request.swap(false, Ordering::AcqRel)
                && self.leave_serial.is_none()
            {
                if shared.state() != StreamerState::Connected || !self.client.encoder_running() {
                    return Ok(());
                }
                self.leave_serial = Some(self.client.set_flush());
                shared.state.set(StreamerState::Disconnecting);
            }
            while let Some(packet) = self.client.get_packet() {
                if self.forward(shared, &packet)? {
                    return Ok(());
                }
            }
            if self.client.take_overflow() {
                tracing::warn!(
                    "Streamer {} fell behind encoder {}, {} packets dropped so far",
                    shared.id,
                    self.client.encoder_id(),
                    self.client.dropped()
                );
            }
            thread::sleep(poll);
        }
    }
}

fn worker_main(shared: Arc<StreamerShared>, poll: Duration) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        let woke = shared
            .state
            .wait_until(IDLE_WAIT, |s| s != StreamerState::Disconnected);
        if woke.is_none() {
            continue;
        }
        let Some(mut session) = shared.session.lock().take() else {
            continue;
        };
        if let Err(e) = session.run(&shared, poll) {
            tracing::error!("Streamer {} failed: {}", shared.id, e);
            *shared.last_error.lock() = Some(e.to_string());
        }
        session.sink.close();
        drop(session);
        shared.disconnect_request.store(false, Ordering::Release);
        shared.state.set(StreamerState::Disconnected);
        tracing::info!(
            "Streamer {} disconnected after {} bytes",
            shared.id,
            shared.bytes_sent()
        );
    }
}

struct StreamerSlot {
    shared: Arc<StreamerShared>,
    worker: Option<JoinHandle<()>>,
}

/// Fixed pool of streamers
pub struct StreamerPool {
    slots: Vec<StreamerSlot>,
    wait_timeout: Duration,
}

impl StreamerPool {
    pub fn new(count: usize, poll: Duration, wait_timeout: Duration) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for id in 0..count {
            let shared = Arc::new(StreamerShared::new(id));
            let worker = {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("streamer-{}", id))
                    .spawn(move || worker_main(shared, poll))
                    .map_err(|e| StreamerError::Spawn(e.to_string()))?
            };
            slots.push(StreamerSlot {
                shared,
                worker: Some(worker),
            });
        }
        Ok(Self {
            slots,
            wait_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn shared(&self, id: usize) -> std::result::Result<&Arc<StreamerShared>, StreamerError> {
        self.slots
            .get(id)
            .map(|slot| &slot.shared)
            .ok_or(StreamerError::NotFound(id))
    }

    /// Open a TCP connection and start streaming
    pub fn connect(
        &self,
        id: usize,
        params: &StreamerParams,
        encoders: &EncoderPool,
    ) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != StreamerState::Disconnected {
            return Err(StreamerError::AlreadyConnected(id).into());
        }
        encoders.state(params.source)?;
        let sink = TcpSink::connect(&params.host, params.port)?;
        self.connect_sink(id, params.source, Box::new(sink), encoders)
    }

    /// Start streaming encoder `source` into `sink`
    pub fn connect_sink(
        &self,
        id: usize,
        source: usize,
        sink: Box<dyn PacketSink>,
        encoders: &EncoderPool,
    ) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() != StreamerState::Disconnected {
            return Err(StreamerError::AlreadyConnected(id).into());
        }
        let client = encoders.register(source)?;
        let join_serial = client.set_flush();

        shared.bytes_sent.store(0, Ordering::Relaxed);
        *shared.last_error.lock() = None;
        shared.disconnect_request.store(false, Ordering::Release);
        *shared.session.lock() = Some(Session {
            client,
            sink,
            join_serial,
            leave_serial: None,
        });
        if !shared
            .state
            .transition(StreamerState::Disconnected, StreamerState::Connecting)
        {
            shared.session.lock().take();
            return Err(StreamerError::AlreadyConnected(id).into());
        }
        tracing::info!(
            "Streamer {} streaming encoder {} from serial {}",
            id,
            source,
            join_serial
        );
        Ok(())
    }

    /// Finish the current serial and disconnect; returns once disconnected
    pub fn disconnect(&self, id: usize) -> Result<()> {
        let shared = self.shared(id)?;
        if shared.state() == StreamerState::Disconnected {
            return Err(StreamerError::NotConnected(id).into());
        }
        shared.disconnect_request.store(true, Ordering::Release);
        shared
            .state
            .wait_until(self.wait_timeout, |s| s == StreamerState::Disconnected)
            .map(|_| ())
            .ok_or_else(|| {
                StreamerError::SendFailed(format!("streamer {} did not disconnect", id)).into()
            })
    }

    /// `streamer<N>report=<state>:<bytes>`
    pub fn report(&self, id: usize) -> Result<String> {
        let shared = self.shared(id)?;
        Ok(format!(
            "streamer{}report={}:{}",
            id,
            shared.state().code(),
            shared.bytes_sent()
        ))
    }
}

impl Drop for StreamerPool {
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
    use std::net::TcpListener;

    /// Sink that keeps everything in memory
    #[derive(Clone, Default)]
    struct MemorySink {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl PacketSink for MemorySink {
        fn send(&mut self, data: &[u8]) -> std::result::Result<(), StreamerError> {
            self.data.lock().extend_from_slice(data);
            Ok(())
        }
    }

    fn encoders() -> (Arc<AudioFeed>, EncoderPool) {
        let mut feed = AudioFeed::new(44100);
        let sinks = vec![feed.add_sink(44100)];
        let feed = Arc::new(feed);
        let runtime = EncoderRuntime {
            feed: feed.clone(),
            factory: Arc::new(CountingFactory { restarts: false }),
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
        pool.start(
            0,
            EncoderParams {
                format: DataFormat::new(Family::Mpeg, Codec::Mp3),
                ..Default::default()
            },
        )
        .unwrap();
        (feed, pool)
    }

    #[test]
    fn test_stream_starts_with_serial_header() {
        let (feed, encoders) = encoders();
        let streamers =
            StreamerPool::new(1, Duration::from_millis(2), Duration::from_secs(5)).unwrap();
        let sink = MemorySink::default();
        streamers
            .connect_sink(0, 0, Box::new(sink.clone()), &encoders)
            .unwrap();
        assert!(streamers
            .connect_sink(0, 0, Box::new(sink.clone()), &encoders)
            .is_err());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.data.lock().len() < 4 + 8 * 5 {
            assert!(std::time::Instant::now() < deadline);
            feed.process(&[0.0; 441], &[0.0; 441]);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(&sink.data.lock()[..4], b"HEAD");
        assert!(streamers.report(0).unwrap().starts_with("streamer0report=2:"));

        streamers.disconnect(0).unwrap();
        assert_eq!(
            streamers.shared(0).unwrap().state(),
            StreamerState::Disconnected
        );
        assert!(streamers.disconnect(0).is_err());
        encoders.stop(0).unwrap();
    }

    #[test]
    fn test_connect_requires_running_encoder() {
        let (_feed, encoders) = encoders();
        encoders.stop(0).unwrap();
        let streamers =
            StreamerPool::new(1, Duration::from_millis(2), Duration::from_secs(5)).unwrap();
        assert!(streamers
            .connect_sink(0, 0, Box::new(MemorySink::default()), &encoders)
            .is_err());
        assert_eq!(streamers.report(0).unwrap(), "streamer0report=0:0");
    }

    #[test]
    fn test_tcp_sink_delivers_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sink = TcpSink::connect("127.0.0.1", port).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        sink.send(b"OggS").unwrap();
        sink.close();

        let mut received = Vec::new();
        std::io::Read::read_to_end(&mut peer, &mut received).unwrap();
        assert_eq!(received, b"OggS");
    }
}
