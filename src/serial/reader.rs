//! Per-device reader task: bytes in, decoded lines out.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{DecodedLine, LineProtocolDecoder};

const READ_CHUNK: usize = 512;
const MAX_PARTIAL: usize = 8192;
const KEEP_PARTIAL: usize = 4096;

/// Accumulates raw bytes and hands back complete newline-terminated lines.
/// The trailing fragment is kept until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    trims: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line from the buffer
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        // A device spewing without newlines must not grow this forever
        if self.partial.len() > MAX_PARTIAL {
            let cut = self.partial.len() - KEEP_PARTIAL;
            self.partial.drain(..cut);
            self.trims += 1;
            log::warn!("Partial line buffer overflow, dropped {} bytes", cut);
        }

        lines
    }

    /// Bytes still waiting for a newline
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }

    pub fn trims(&self) -> u64 {
        self.trims
    }
}

/// Receiver of decoded lines. Called synchronously from the reader task,
/// so implementations must not block.
pub trait LineSink: Send + Sync {
    fn ingest(&self, decoded: DecodedLine);

    /// The stream hit EOF or an IO error
    fn connection_lost(&self, reason: &str);
}

/// Handle to a running reader task
pub struct ReaderHandle {
    stop_tx: mpsc::Sender<()>,
    task_handle: JoinHandle<()>,
}

impl ReaderHandle {
    /// Signal the task to stop and wait for it (bounded)
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if timeout(Duration::from_secs(2), self.task_handle).await.is_err() {
            log::warn!("Reader task did not stop within 2s");
        }
    }

    /// Cancel the task without waiting for it
    pub fn abort(self) {
        self.task_handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }
}

/// Spawn a task that reads `reader` until EOF, error or `stop()`,
/// decoding every complete line and handing it to `sink`.
pub fn spawn_reader<R>(name: &str, mut reader: R, sink: Arc<dyn LineSink>) -> ReaderHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let name = name.to_string();

    let task_handle = tokio::spawn(async move {
        let decoder = LineProtocolDecoder;
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    log::debug!("{}: reader stopping", name);
                    break;
                }
                read_res = reader.read(&mut buf) => {
                    match read_res {
                        Ok(0) => {
                            log::info!("{}: serial stream closed", name);
                            sink.connection_lost("eof");
                            break;
                        }
                        Ok(n) => {
                            for line in lines.push(&buf[..n]) {
                                sink.ingest(decoder.decode(&line));
                            }
                        }
                        Err(e) => {
                            log::error!("{}: read error: {}", name, e);
                            sink.connection_lost(&e.to_string());
                            break;
                        }
                    }
                }
            }
        }
    });

    ReaderHandle { stop_tx, task_handle }
}
