//! Client registry and packet fan-out
//!
//! Every consumer attached to an encoder owns a bounded [`ClientQueue`]. The
//! encoder thread pushes a reference-counted copy of each packet into every
//! queue; a full queue drops that packet for that client only.
//!
//! The flush protocol hands out serial boundaries. [`Fanout::set_flush`]
//! raises the flush target and returns it; the encoder thread restarts its
//! container until its serial reaches the target. A client registered after
//! a flush never sees packets from an older serial.

use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{EncoderShared, EncoderState};
use crate::error::EncoderError;
use crate::packet::Packet;

/// One consumer's packet queue
pub struct ClientQueue {
    queue: ArrayQueue<Packet>,
    overflow: AtomicBool,
    dropped: AtomicU64,
    /// Packets below this serial are never delivered
    floor: u32,
}

impl ClientQueue {
    fn new(capacity: usize, floor: u32) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            floor,
        }
    }

    /// Encoder-side push; never blocks
    fn push(&self, packet: Packet) {
        if packet.serial < self.floor {
            return;
        }
        if self.queue.push(packet).is_err() {
            self.overflow.store(true, Ordering::Relaxed);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct FlushState {
    /// Serial the encoder is currently producing
    serial: u32,
    /// Highest serial requested through `set_flush`
    target: u32,
}

/// Fan-out list plus flush bookkeeping of one encoder slot
pub struct Fanout {
    clients: RwLock<Vec<Arc<ClientQueue>>>,
    flush: Mutex<FlushState>,
    queue_capacity: usize,
}

impl Fanout {
    pub fn new(queue_capacity: usize, initial_serial: u32) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            flush: Mutex::new(FlushState {
                serial: initial_serial,
                target: initial_serial,
            }),
            queue_capacity,
        }
    }

    fn register(&self) -> Arc<ClientQueue> {
        let floor = {
            let flush = self.flush.lock();
            flush.target
        };
        let queue = Arc::new(ClientQueue::new(self.queue_capacity, floor));
        self.clients.write().push(queue.clone());
        queue
    }

    fn unregister(&self, queue: &Arc<ClientQueue>) {
        self.clients.write().retain(|c| !Arc::ptr_eq(c, queue));
    }

    /// Request a fresh serial; returns the serial to resume from
    pub fn set_flush(&self) -> u32 {
        let mut flush = self.flush.lock();
        flush.target = flush.serial.max(flush.target) + 1;
        flush.target
    }

    /// Push one packet into every registered queue
    pub fn publish(&self, packet: &Packet) {
        for client in self.clients.read().iter() {
            client.push(packet.clone());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Serial currently produced by the encoder thread
    pub fn serial(&self) -> u32 {
        self.flush.lock().serial
    }

    /// Whether a flush is waiting for the encoder thread
    pub fn flush_pending(&self) -> bool {
        let flush = self.flush.lock();
        flush.serial < flush.target
    }

    /// Encoder thread moves to the next serial and returns it
    pub(crate) fn advance_serial(&self) -> u32 {
        let mut flush = self.flush.lock();
        flush.serial += 1;
        flush.serial
    }

    /// Start a fresh run after every serial handed out so far
    pub(crate) fn begin_run(&self) -> u32 {
        let mut flush = self.flush.lock();
        flush.serial = flush.serial.max(flush.target) + 1;
        flush.target = flush.serial;
        flush.serial
    }
}

/// A registered consumer. Dropping it unregisters.
pub struct Client {
    queue: Arc<ClientQueue>,
    encoder: Arc<EncoderShared>,
}

impl Client {
    /// Attach to a running encoder
    pub fn register(encoder: Arc<EncoderShared>) -> Result<Self, EncoderError> {
        if encoder.state() != EncoderState::Running {
            return Err(EncoderError::NotRunning(encoder.id));
        }
        let queue = encoder.fanout.register();
        tracing::debug!(
            "Client registered with encoder {} ({} clients)",
            encoder.id,
            encoder.fanout.client_count()
        );
        Ok(Self { queue, encoder })
    }

    /// Request a new serial boundary; packets from the returned serial on
    /// form a complete decodable stream
    pub fn set_flush(&self) -> u32 {
        self.encoder.fanout.set_flush()
    }

    /// Non-blocking pop
    pub fn get_packet(&self) -> Option<Packet> {
        self.queue.queue.pop()
    }

    /// Overflow flag, cleared on read
    pub fn take_overflow(&self) -> bool {
        self.queue.overflow.swap(false, Ordering::Relaxed)
    }

    pub fn overflowed(&self) -> bool {
        self.queue.overflow.load(Ordering::Relaxed)
    }

    /// Packets dropped for this client so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn encoder_id(&self) -> usize {
        self.encoder.id
    }

    pub fn encoder_running(&self) -> bool {
        matches!(
            self.encoder.state(),
            EncoderState::Running | EncoderState::Starting
        )
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.encoder.fanout.unregister(&self.queue);
        tracing::debug!("Client unregistered from encoder {}", self.encoder.id);
    }
}
