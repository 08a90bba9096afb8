//! Per-device command scheduling: startup sequence, periodic stat dumps,
//! debounced on-demand dumps and the shutdown sequence.
pub mod debounce;

pub use debounce::{DumpGate, DumpHandle, DumpRequest, DUMP_MIN_INTERVAL};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::BoardConfig;
use crate::device::DeviceMonitor;
use crate::serial::protocol::stat_dump_commands;
use crate::serial::{Command, CommandWriter, SerialError};

/// Grace period between the shutdown dump and closing the port
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const CONNECT_POLL: Duration = Duration::from_millis(50);
const RESET_WAKE_DELAY: Duration = Duration::from_millis(10);
const RESET_SETTLE: Duration = Duration::from_secs(2);

pub const REASON_STARTUP: &str = "Startup";
pub const REASON_TIMER: &str = "timer";
pub const REASON_SHUTDOWN: &str = "Shutdown";

/// Scheduling knobs taken from a board's configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub initial_reset: bool,
    pub start_end_stats: Vec<String>,
}

impl PollSettings {
    pub fn from_config(cfg: &BoardConfig) -> Self {
        Self {
            interval: Duration::from_secs_f64(cfg.stats_timer_interval),
            initial_reset: cfg.initial_reset,
            start_end_stats: cfg.start_end_stats.clone(),
        }
    }
}

/// State shared by the scheduler's tasks
struct DumpRunner {
    monitor: Arc<DeviceMonitor>,
    writer: Arc<CommandWriter>,
    rearm: Notify,
    dump_cmds: Vec<Command>,
    start_end_cmds: Vec<Command>,
}

impl DumpRunner {
    fn name(&self) -> &str {
        self.monitor.name()
    }

    /// Send one full dump batch. The caller must hold the in-flight slot.
    async fn execute_dump(&self, reason: &str) {
        let handle = self.monitor.dump_handle();
        let started = handle.gate().begin_batch(Instant::now());
        if !started {
            log::debug!("{}: dump {} dropped, previous batch too recent", self.name(), reason);
            return;
        }

        self.monitor.set_dump_reason(reason);
        log::info!("{}: stat dump ({})", self.name(), reason);
        self.rearm.notify_one();
        self.send(&self.dump_cmds).await;
        self.rearm.notify_one();
        handle.gate().finish();
    }

    async fn send(&self, cmds: &[Command]) {
        match self.writer.send_batch(cmds).await {
            Ok(_) => {}
            Err(SerialError::NotConnected) => log::error!("{}: No serial connection", self.name()),
            Err(e) => log::error!("{}: batch failed: {}", self.name(), e),
        }
    }

    async fn send_start_end(&self, reason: &str) {
        if self.start_end_cmds.is_empty() {
            return;
        }
        self.monitor.set_dump_reason(reason);
        self.send(&self.start_end_cmds).await;
    }

    async fn startup(&self, settings: &PollSettings) {
        while !self.monitor.is_running() || !self.writer.is_connected().await {
            sleep(CONNECT_POLL).await;
        }
        log::info!("{}: start timer", self.name());

        if settings.initial_reset {
            log::info!("{}: Issuing reset", self.name());
            self.send(&[
                Command::with_delay("", RESET_WAKE_DELAY),
                Command::with_delay("reset", RESET_SETTLE),
            ])
            .await;
        }
        self.send(&Command::batch(&["", "\nimgr list", "\nconfig dump"])).await;

        if self.monitor.dump_handle().claim(REASON_STARTUP) == DumpRequest::Queued {
            self.execute_dump(REASON_STARTUP).await;
        }
        self.send_start_end(REASON_STARTUP).await;
        self.monitor.mark_init_complete();

        let extra = self.monitor.variant().startup_commands();
        if !extra.is_empty() {
            self.send(&Command::batch(extra)).await;
        }
    }

    /// Self re-arming timer; any dump start or end restarts the countdown
    async fn periodic(&self, interval: Duration) {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    self.monitor.request_dump(REASON_TIMER);
                }
                _ = self.rearm.notified() => {}
            }
        }
    }

    async fn worker(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(reason) = rx.recv().await {
            self.execute_dump(&reason).await;
        }
        log::debug!("{}: dump worker exiting", self.name());
    }
}

/// Drives every command a single device receives
pub struct PollScheduler {
    runner: Arc<DumpRunner>,
    settings: PollSettings,
    dump_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("device", &self.runner.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl PollScheduler {
    /// `dump_rx` is the receiving end of the monitor's dump handle
    pub fn new(
        monitor: Arc<DeviceMonitor>,
        writer: Arc<CommandWriter>,
        dump_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let settings = PollSettings::from_config(monitor.config());
        let dump_cmds = Command::batch(&stat_dump_commands(monitor.variant().stat_categories()));
        let start_end_cmds = if settings.start_end_stats.is_empty() {
            Vec::new()
        } else {
            Command::batch(&stat_dump_commands(&settings.start_end_stats))
        };

        Self {
            runner: Arc::new(DumpRunner {
                monitor,
                writer,
                rearm: Notify::new(),
                dump_cmds,
                start_end_cmds,
            }),
            settings,
            dump_rx: Mutex::new(Some(dump_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Spawn the dump worker and the startup task, which continues as the
    /// periodic timer once startup is done. A second call is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.dump_rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            log::warn!("{}: scheduler already started", self.runner.name());
            return;
        };

        let worker = {
            let runner = self.runner.clone();
            tokio::spawn(async move { runner.worker(rx).await })
        };
        let timer = {
            let runner = self.runner.clone();
            let settings = self.settings.clone();
            tokio::spawn(async move {
                runner.startup(&settings).await;
                runner.periodic(settings.interval).await;
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(worker);
        tasks.push(timer);
    }

    /// Run the shutdown sequence: no further dumps, final dump batches,
    /// grace period, then stop ingesting. The owner stops the reader and
    /// releases the port afterwards.
    pub async fn shutdown(&self, grace: Duration) {
        let runner = &self.runner;
        log::info!("{}: end timer", runner.name());
        runner.monitor.dump_handle().close();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        runner.monitor.set_dump_reason(REASON_SHUTDOWN);
        runner.send(&runner.dump_cmds).await;
        runner.send_start_end(REASON_SHUTDOWN).await;
        sleep(grace).await;

        runner.monitor.stop();
        log::info!("{}: end timer done", runner.name());
    }

    /// Refuse further dumps and cancel every task without sending anything
    pub async fn abort(&self) {
        self.runner.monitor.dump_handle().close();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}
