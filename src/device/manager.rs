use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;

use super::models::DeviceSnapshot;
use super::monitor::DeviceMonitor;
use super::variant::{variant_for, BoardVariant};
use super::{DeviceError, Result};
use crate::clock::RunClock;
use crate::config::{BoardConfig, LinkConfig};
use crate::events::EventRouter;
use crate::scheduler::{DumpHandle, PollScheduler, DUMP_MIN_INTERVAL};
use crate::serial::{spawn_reader, CommandWriter, ReaderHandle, SerialInterface, SerialLink};

/// Upper bound on one board's whole shutdown sequence
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long an abandoned board waits for a stuck batch to drop the port
const RELEASE_WAIT: Duration = Duration::from_secs(1);

/// A connected board: its monitor, reader task, writer and scheduler
pub struct Board {
    monitor: Arc<DeviceMonitor>,
    scheduler: PollScheduler,
    writer: Arc<CommandWriter>,
    reader: Option<ReaderHandle>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("monitor", &self.monitor)
            .field("reading", &self.reader.is_some())
            .finish()
    }
}

impl Board {
    /// Open the board's console port by USB serial number
    pub fn connect(cfg: BoardConfig, clock: RunClock) -> Result<Self> {
        let variant = variant_for(&cfg.board_class)
            .ok_or_else(|| DeviceError::UnknownBoardClass(cfg.board_class.clone()))?;
        let link = SerialInterface::connect(&cfg.com_serial, cfg.baudrate)?;
        log::info!("{}: connected on {}", cfg.name, link.port_name);
        Ok(Self::attach(cfg, variant, link, clock))
    }

    /// Wire a board onto an already open link and start reading from it
    pub fn attach(cfg: BoardConfig, variant: Box<dyn BoardVariant>, link: SerialLink, clock: RunClock) -> Self {
        let name = cfg.name.clone();
        let (dump, dump_rx) = DumpHandle::new(&name, DUMP_MIN_INTERVAL);
        dump.set_connected(true);

        let monitor = Arc::new(DeviceMonitor::new(cfg, variant, clock, dump));
        let writer = Arc::new(CommandWriter::new(&name, link.writer));
        let reader = spawn_reader(&name, link.reader, monitor.clone());
        let scheduler = PollScheduler::new(monitor.clone(), writer.clone(), dump_rx);

        Self { monitor, scheduler, writer, reader: Some(reader) }
    }

    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    pub fn monitor(&self) -> &Arc<DeviceMonitor> {
        &self.monitor
    }

    /// Start ingesting and kick off the startup sequence
    pub fn start(&self) {
        self.monitor.set_running(true);
        self.scheduler.start();
    }

    /// Full shutdown sequence, then stop the reader and release the port
    pub async fn shutdown(&mut self, grace: Duration) {
        self.scheduler.shutdown(grace).await;
        if let Some(reader) = self.reader.take() {
            reader.stop().await;
        }
        self.writer.close().await;
    }

    /// Tear down what an interrupted shutdown left behind. Nothing more is
    /// sent and nothing waits on the device.
    pub async fn abandon(&mut self) {
        self.scheduler.abort().await;
        self.monitor.stop();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.abandon(RELEASE_WAIT).await;
    }
}

/// Owns every configured board for the length of a run
#[derive(Debug)]
pub struct DeviceManager {
    clock: RunClock,
    boards: Vec<Board>,
}

impl DeviceManager {
    pub fn new(clock: RunClock) -> Self {
        Self { clock, boards: Vec::new() }
    }

    /// Connect every board in order. Boards with an unknown class are
    /// logged and skipped; failing to open a port is fatal.
    pub fn connect_all(&mut self, configs: &[BoardConfig]) -> Result<()> {
        for cfg in configs {
            match Board::connect(cfg.clone(), self.clock) {
                Ok(board) => self.boards.push(board),
                Err(DeviceError::UnknownBoardClass(class)) => {
                    log::error!("{}: unknown board class {}, skipping", cfg.name, class);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn add(&mut self, board: Board) {
        self.boards.push(board);
    }

    pub fn boards(&self) -> &[Board] {
        &self.boards
    }

    pub fn get(&self, name: &str) -> Result<&Board> {
        self.boards
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Build the event graph over the connected boards and hand it to
    /// every monitor
    pub fn link_events(&self, links: &[LinkConfig]) -> Arc<EventRouter> {
        let handles: HashMap<String, DumpHandle> = self
            .boards
            .iter()
            .map(|b| (b.name().to_string(), b.monitor.dump_handle().clone()))
            .collect();

        let router = Arc::new(EventRouter::build(links, &handles));
        for board in &self.boards {
            board.monitor.attach_router(router.clone());
        }
        router
    }

    pub fn start_all(&self) {
        for board in &self.boards {
            board.start();
        }
    }

    /// Shut every board down concurrently, each bounded by `SHUTDOWN_TIMEOUT`.
    /// A board that runs over is abandoned: stopped and its port dropped.
    pub async fn shutdown_all(&mut self, grace: Duration) {
        let shutdowns = self.boards.iter_mut().map(|board| async move {
            if timeout(SHUTDOWN_TIMEOUT, board.shutdown(grace)).await.is_err() {
                log::warn!("{}: shutdown did not finish within {:?}", board.name(), SHUTDOWN_TIMEOUT);
                board.abandon().await;
            }
        });
        join_all(shutdowns).await;
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.boards.iter().map(|b| b.monitor.serialize_state()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NtwrVariant;
    use crate::scheduler::SHUTDOWN_GRACE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn board(name: &str) -> (Board, tokio::io::DuplexStream) {
        let (client, device) = tokio::io::duplex(64 * 1024);
        let mut cfg = BoardConfig::new(name, "NtwrBoard");
        cfg.stats_timer_interval = 3600.0;
        let link = SerialLink::from_stream(name, client);
        (Board::attach(cfg, Box::new(NtwrVariant::new()), link, RunClock::start()), device)
    }

    #[test]
    fn test_connect_all_skips_unknown_class() {
        let mut manager = DeviceManager::new(RunClock::start());
        let cfg = BoardConfig::new("odd", "HwtBoard");
        manager.connect_all(&[cfg]).unwrap();
        assert!(manager.boards().is_empty());
        assert!(matches!(manager.get("odd"), Err(DeviceError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_and_shutdown() {
        let mut manager = DeviceManager::new(RunClock::start());
        let (a, mut dev_a) = board("a");
        let (b, _dev_b) = board("b");
        manager.add(a);
        manager.add(b);

        let router = manager.link_events(&[LinkConfig {
            src: "a".into(),
            src_type: "error_tag_1".into(),
            dst: vec!["b".into(), "zz".into()],
            dst_type: "stat_dump".into(),
        }]);
        assert_eq!(router.targets("a", "error_tag_1"), vec!["b"]);

        manager.start_all();
        dev_a.write_all(b"1 stat mac\r\n2 rx: 1\r\n3 tx: 2\r\n\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        manager.shutdown_all(SHUTDOWN_GRACE).await;
        let snaps = manager.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].dev_stat[0].name, "mac");
        assert!(!manager.get("b").unwrap().monitor().is_running());

        // The port is released once shutdown finishes
        let mut rest = Vec::new();
        dev_a.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_port_is_abandoned_after_timeout() {
        // A device that never reads: the startup batch fills the pipe and blocks
        let (client, mut device) = tokio::io::duplex(16);
        let mut cfg = BoardConfig::new("stuck", "NtwrBoard");
        cfg.stats_timer_interval = 3600.0;
        let link = SerialLink::from_stream("stuck", client);
        let mut manager = DeviceManager::new(RunClock::start());
        manager.add(Board::attach(cfg, Box::new(NtwrVariant::new()), link, RunClock::start()));

        manager.start_all();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        manager.shutdown_all(SHUTDOWN_GRACE).await;
        assert!(started.elapsed() >= SHUTDOWN_TIMEOUT);

        let board = manager.get("stuck").unwrap();
        assert!(!board.monitor().is_running());
        assert!(board.reader.is_none());
        assert!(!board.writer.is_connected().await);
        assert_eq!(board.monitor().request_dump("late"), crate::scheduler::DumpRequest::ShuttingDown);

        // Both halves are gone, so the device end reaches EOF
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), device.read_to_end(&mut rest))
            .await
            .expect("port was not released")
            .unwrap();
        assert!(rest.starts_with(b"\r\n\nimgr list"));
    }
}
