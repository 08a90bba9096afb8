use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{Result, SerialError};

/// Line terminator expected by the firmware shell
pub const LINE_TERMINATOR: &str = "\r\n";
/// Pacing delay after each command in a batch
pub const COMMAND_PACING: Duration = Duration::from_millis(50);

/// One outbound line and the pause that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub delay_after: Duration,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), delay_after: COMMAND_PACING }
    }

    pub fn with_delay(text: impl Into<String>, delay_after: Duration) -> Self {
        Self { text: text.into(), delay_after }
    }

    /// Paced batch from plain strings
    pub fn batch<S: AsRef<str>>(lines: &[S]) -> Vec<Command> {
        lines.iter().map(|l| Command::new(l.as_ref())).collect()
    }
}

/// Serialized write side of a device connection.
///
/// A batch holds the lock for its whole duration, so batches from the
/// startup, periodic and shutdown paths never interleave.
pub struct CommandWriter {
    name: String,
    port: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl CommandWriter {
    pub fn new(name: &str, port: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { name: name.to_string(), port: Mutex::new(Some(port)) }
    }

    /// Writer with no connection behind it
    pub fn disconnected(name: &str) -> Self {
        Self { name: name.to_string(), port: Mutex::new(None) }
    }

    pub async fn is_connected(&self) -> bool {
        self.port.lock().await.is_some()
    }

    /// Write every command in order, pausing after each.
    /// Individual write failures are logged and the batch continues.
    pub async fn send_batch(&self, commands: &[Command]) -> Result<usize> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(SerialError::NotConnected)?;

        let mut written = 0;
        for cmd in commands {
            match write_line(port, &cmd.text).await {
                Ok(()) => written += 1,
                Err(e) => log::error!("{}: error writing cmd {:?}: {}", self.name, cmd.text, e),
            }
            tokio::time::sleep(cmd.delay_after).await;
        }
        Ok(written)
    }

    /// Drop the connection; later batches fail with `NotConnected`
    pub async fn close(&self) {
        let mut guard = self.port.lock().await;
        if let Some(mut port) = guard.take() {
            let _ = port.shutdown().await;
            log::info!("{}: connection released", self.name);
        }
    }

    /// Drop the connection without flushing or shutting it down. A batch
    /// still holding the port gets `wait` to let go; returns whether the
    /// port was released.
    pub async fn abandon(&self, wait: Duration) -> bool {
        match timeout(wait, self.port.lock()).await {
            Ok(mut guard) => {
                if guard.take().is_some() {
                    log::warn!("{}: connection dropped", self.name);
                }
                true
            }
            Err(_) => {
                log::error!("{}: port still busy after {:?}, left open", self.name, wait);
                false
            }
        }
    }
}

async fn write_line(port: &mut Box<dyn AsyncWrite + Send + Unpin>, text: &str) -> std::io::Result<()> {
    port.write_all(text.as_bytes()).await?;
    port.write_all(LINE_TERMINATOR.as_bytes()).await?;
    port.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_send_batch_in_order() {
        let (client, mut device) = tokio::io::duplex(1024);
        let writer = CommandWriter::new("dev", Box::new(client));

        let sent = writer.send_batch(&Command::batch(&["", "stat mac", "stat stat"])).await.unwrap();
        assert_eq!(sent, 3);

        let mut buf = vec![0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\r\nstat mac\r\nstat stat\r\n");
    }

    #[tokio::test]
    async fn test_closed_writer_rejects() {
        let (client, _device) = tokio::io::duplex(64);
        let writer = CommandWriter::new("dev", Box::new(client));
        writer.close().await;
        assert!(!writer.is_connected().await);
        assert!(matches!(writer.send_batch(&Command::batch(&["x"])).await, Err(SerialError::NotConnected)));
        assert!(!CommandWriter::disconnected("other").is_connected().await);
    }
}
