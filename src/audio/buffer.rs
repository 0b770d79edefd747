//! Lock-free ring buffer for audio samples
//!
//! Single-producer single-consumer sample ring used between the real-time
//! callback and the encoder or raw recorder threads. Writes and reads never
//! block and never allocate.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-capacity ring of `Copy` samples
pub struct RingBuffer<T = f32> {
    queue: ArrayQueue<T>,
    dropped_count: AtomicU64,
    underrun_count: AtomicU64,
}

impl<T: Copy> RingBuffer<T> {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
        }
    }

    /// Write as many samples as fit. Returns the number written; the rest
    /// are counted as dropped.
    pub fn write(&self, samples: &[T]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.queue.push(sample).is_err() {
                break;
            }
            written += 1;
        }
        let dropped = samples.len() - written;
        if dropped > 0 {
            self.dropped_count.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        written
    }

    /// Read up to `out.len()` samples. Returns 0 when empty.
    pub fn read(&self, out: &mut [T]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    read += 1;
                }
                None => break,
            }
        }
        if read < out.len() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        read
    }

    /// Append up to `max` samples onto `out`
    pub fn read_into_vec(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut read = 0;
        while read < max {
            match self.queue.pop() {
                Some(sample) => {
                    out.push(sample);
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    /// Samples ready to read
    pub fn available_read(&self) -> usize {
        self.queue.len()
    }

    /// Free space in samples
    pub fn available_write(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Discard everything buffered
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Samples rejected because the ring was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Reads that came back short
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.dropped_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.available_read() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer<f32>>;

/// Create a new shared sample ring
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// A left/right pair of rings fed by the callback in lock-step
pub struct StereoRing {
    pub left: SharedRingBuffer,
    pub right: SharedRingBuffer,
}

impl StereoRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            left: create_shared_buffer(capacity),
            right: create_shared_buffer(capacity),
        }
    }

    /// Push one planar block, keeping both channels the same length.
    /// Returns the number of frames written.
    pub fn write(&self, left: &[f32], right: &[f32]) -> usize {
        let frames = left
            .len()
            .min(right.len())
            .min(self.left.available_write())
            .min(self.right.available_write());
        self.left.write(&left[..frames]);
        self.right.write(&right[..frames]);
        let dropped = left.len().min(right.len()) - frames;
        if dropped > 0 {
            self.left
                .dropped_count
                .fetch_add(dropped as u64, Ordering::Relaxed);
            self.right
                .dropped_count
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        frames
    }

    /// Frames readable from both channels
    pub fn available_frames(&self) -> usize {
        self.left.available_read().min(self.right.available_read())
    }

    pub fn clear(&self) {
        self.left.clear();
        self.right.clear();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.left.dropped_count()
    }
}
