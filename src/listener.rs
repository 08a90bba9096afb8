//! Passive listener for newline-delimited JSON over TCP.
//!
//! Reads a sniffer's stream in small chunks and keeps every decodable
//! line while recording is armed.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::clock::RunClock;
use crate::serial::LineBuffer;

const READ_CHUNK: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// A decoded line with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub t: f64,
    pub o: Value,
}

/// Serialized form of one listener at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSnapshot {
    pub address: String,
    pub num_lines: usize,
    pub recv_objs: Vec<ListenerRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    recording: AtomicBool,
    records: Mutex<Vec<ListenerRecord>>,
}

impl Shared {
    fn records(&self) -> std::sync::MutexGuard<'_, Vec<ListenerRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct PassiveListener {
    address: String,
    shared: Arc<Shared>,
    stop_tx: mpsc::Sender<()>,
    task_handle: JoinHandle<()>,
}

impl std::fmt::Debug for PassiveListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveListener")
            .field("address", &self.address)
            .field("recording", &self.is_recording())
            .finish()
    }
}

impl PassiveListener {
    /// Connect to `address:port` and start reading. Recording starts off.
    pub async fn connect(address: &str, port: u16, clock: RunClock) -> std::io::Result<Self> {
        let stream = TcpStream::connect((address, port)).await?;
        log::info!("Listener connected to {}:{}", address, port);
        Ok(Self::spawn(stream, address, clock))
    }

    /// Read from any byte stream until EOF, error or `stop()`
    pub fn spawn<R>(mut reader: R, address: &str, clock: RunClock) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task_shared = shared.clone();
        let name = address.to_string();

        let task_handle = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut buf = [0u8; READ_CHUNK];

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    read_res = reader.read(&mut buf) => {
                        match read_res {
                            Ok(0) => {
                                log::info!("{}: listener stream closed", name);
                                break;
                            }
                            Ok(n) => {
                                for line in lines.push(&buf[..n]) {
                                    task_shared.ingest(&line, &clock);
                                }
                            }
                            Err(e) => {
                                log::error!("{}: listener read error: {}", name, e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { address: address.to_string(), shared, stop_tx, task_handle }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_recording(&self, on: bool) {
        self.shared.recording.store(on, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.shared.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop recording and reading
    pub async fn stop(self) -> ListenerSnapshot {
        self.set_recording(false);
        let _ = self.stop_tx.send(()).await;
        if timeout(STOP_TIMEOUT, self.task_handle).await.is_err() {
            log::warn!("{}: listener task did not stop within {:?}", self.address, STOP_TIMEOUT);
        }
        let recv_objs = std::mem::take(&mut *self.shared.records());
        ListenerSnapshot { address: self.address, num_lines: recv_objs.len(), recv_objs }
    }

    pub fn serialize(&self) -> ListenerSnapshot {
        let recv_objs = self.shared.records().clone();
        ListenerSnapshot { address: self.address.clone(), num_lines: recv_objs.len(), recv_objs }
    }
}

impl Shared {
    fn ingest(&self, line: &str, clock: &RunClock) {
        if !self.recording.load(Ordering::SeqCst) {
            return;
        }
        let text = line.trim().replace('\0', "");
        if let Ok(o) = serde_json::from_str::<Value>(&text) {
            self.records().push(ListenerRecord { t: clock.now(), o });
        }
    }
}
