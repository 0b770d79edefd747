//! Audio callback watchdog
//!
//! Losing the audio server leaves every worker half torn down, so a stalled
//! callback is fatal: after `timeout` without a heartbeat the watchdog sends
//! a shutdown request and exits.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::AudioError;

/// Why the watchdog asked for shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    CallbackStalled { silent_for: Duration },
}

pub struct Watchdog {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start watching `heartbeat`, polling every `check_interval`
    pub fn spawn(
        heartbeat: Arc<AtomicU64>,
        timeout: Duration,
        check_interval: Duration,
        shutdown_tx: Sender<ShutdownReason>,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("audio-watchdog".into())
            .spawn(move || {
                let mut last_beat = heartbeat.load(Ordering::Relaxed);
                let mut last_change = Instant::now();

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(check_interval);
                    let beat = heartbeat.load(Ordering::Relaxed);
                    if beat != last_beat {
                        last_beat = beat;
                        last_change = Instant::now();
                        continue;
                    }
                    let silent_for = last_change.elapsed();
                    if silent_for >= timeout {
                        tracing::error!(
                            "Audio callback silent for {:.1}s, requesting shutdown",
                            silent_for.as_secs_f32()
                        );
                        let _ = shutdown_tx.send(ShutdownReason::CallbackStalled { silent_for });
                        break;
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_stalled_callback_triggers_shutdown() {
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (tx, rx) = bounded(1);
        let _dog = Watchdog::spawn(
            heartbeat,
            Duration::from_millis(50),
            Duration::from_millis(10),
            tx,
        )
        .unwrap();

        let reason = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(reason, ShutdownReason::CallbackStalled { .. }));
    }

    #[test]
    fn test_live_callback_keeps_quiet() {
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (tx, rx) = bounded(1);
        let mut dog = Watchdog::spawn(
            heartbeat.clone(),
            Duration::from_millis(200),
            Duration::from_millis(10),
            tx,
        )
        .unwrap();

        for _ in 0..30 {
            heartbeat.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(rx.try_recv().is_err());
        dog.stop();
    }
}
