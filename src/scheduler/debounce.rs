use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Minimum spacing between the starts of two dump batches
pub const DUMP_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Why a dump request was or was not taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpRequest {
    Queued,
    AlreadyDumping,
    NotConnected,
    ShuttingDown,
}

/// Debounce state for on-demand dumps.
///
/// Two independent guards: a request is refused while a dump is in
/// flight, and an accepted dump is dropped when the previous batch
/// started less than `min_interval` ago.
#[derive(Debug)]
pub struct DumpGate {
    in_flight: bool,
    accepting: bool,
    connected: bool,
    last_batch: Option<Instant>,
    min_interval: Duration,
}

impl DumpGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            in_flight: false,
            accepting: true,
            connected: false,
            last_batch: None,
            min_interval,
        }
    }

    /// Claim the in-flight slot
    pub fn claim(&mut self) -> DumpRequest {
        if !self.accepting {
            return DumpRequest::ShuttingDown;
        }
        if !self.connected {
            return DumpRequest::NotConnected;
        }
        if self.in_flight {
            return DumpRequest::AlreadyDumping;
        }
        self.in_flight = true;
        DumpRequest::Queued
    }

    /// Called by the worker before sending; false means throttled,
    /// in which case the slot is released
    pub fn begin_batch(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_batch {
            if now.duration_since(last) < self.min_interval {
                self.in_flight = false;
                return false;
            }
        }
        self.last_batch = Some(now);
        true
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

struct DumpShared {
    device: String,
    gate: Mutex<DumpGate>,
    tx: mpsc::UnboundedSender<String>,
}

/// Cheap, cloneable entry point for requesting a dump on one device.
///
/// `request` never blocks: it only checks the gate and enqueues, so it is
/// safe to call from another device's reader path.
#[derive(Clone)]
pub struct DumpHandle {
    shared: Arc<DumpShared>,
}

impl std::fmt::Debug for DumpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpHandle").field("device", &self.shared.device).finish()
    }
}

impl DumpHandle {
    /// Handle plus the receiving end consumed by the device's dump worker
    pub fn new(device: &str, min_interval: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = DumpShared {
            device: device.to_string(),
            gate: Mutex::new(DumpGate::new(min_interval)),
            tx,
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    pub fn device(&self) -> &str {
        &self.shared.device
    }

    pub(crate) fn gate(&self) -> MutexGuard<'_, DumpGate> {
        self.shared.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for a dump; logged and skipped when it cannot run
    pub fn request(&self, reason: &str) -> DumpRequest {
        let device = self.device();
        log::info!("{}: dump_request {}", device, reason);

        let outcome = self.claim(reason);
        if outcome == DumpRequest::Queued && self.shared.tx.send(reason.to_string()).is_err() {
            self.gate().finish();
            log::debug!("{}: dump worker gone, request dropped", device);
            return DumpRequest::ShuttingDown;
        }
        outcome
    }

    /// Claim the gate without queueing, for callers that run the dump inline
    pub fn claim(&self, reason: &str) -> DumpRequest {
        let device = self.device();
        let outcome = self.gate().claim();
        match outcome {
            DumpRequest::Queued => {}
            DumpRequest::AlreadyDumping => log::warn!("{}: already dumping, skipped {}", device, reason),
            DumpRequest::NotConnected => log::error!("{}: no serial connection, skipped {}", device, reason),
            DumpRequest::ShuttingDown => log::debug!("{}: shutting down, skipped {}", device, reason),
        }
        outcome
    }

    pub fn set_connected(&self, connected: bool) {
        self.gate().connected = connected;
    }

    /// Refuse every later request
    pub fn close(&self) {
        self.gate().accepting = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.gate().is_in_flight()
    }
}
