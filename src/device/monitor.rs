use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde_json::{Map, Value};

use super::models::{
    CheckOutcome, DeviceRecord, DeviceSnapshot, DeviceState, Measurement, RawLine, TimedRecord,
};
use super::variant::{classify, BoardVariant, RaisedEvent};
use crate::clock::RunClock;
use crate::config::BoardConfig;
use crate::events::EventRouter;
use crate::scheduler::{DumpHandle, DumpRequest};
use crate::serial::protocol::{strip_noise, DecodedLine, ERROR_MARKER, STAT_HEADER, VERSION_MARKER};
use crate::serial::LineSink;
use crate::stats::accumulator::REASON_SHUTDOWN;
use crate::stats::parser::parse_version_banner;
use crate::stats::{StatLine, StatSnapshotAccumulator};

/// Mutable per-device state; only ever touched under the monitor's lock
#[derive(Debug)]
struct MonitorState {
    running: bool,
    init_complete: bool,
    device: DeviceState,
    stats: StatSnapshotAccumulator,
    /// Last measurement per tag, the reference point for the next `dt`
    last_sample: std::collections::HashMap<String, Measurement>,
}

/// One monitored board: decodes what its reader hands over, classifies
/// measurements and keeps the run's history.
pub struct DeviceMonitor {
    config: BoardConfig,
    variant: Box<dyn BoardVariant>,
    clock: RunClock,
    dump: DumpHandle,
    router: OnceLock<Arc<EventRouter>>,
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("name", &self.config.name)
            .field("variant", &self.variant.name())
            .finish()
    }
}

impl DeviceMonitor {
    pub fn new(config: BoardConfig, variant: Box<dyn BoardVariant>, clock: RunClock, dump: DumpHandle) -> Self {
        let device = DeviceState::with_counters(&variant.counter_names());
        Self {
            config,
            variant,
            clock,
            dump,
            router: OnceLock::new(),
            state: Mutex::new(MonitorState {
                running: false,
                init_complete: false,
                device,
                stats: StatSnapshotAccumulator::new(),
                last_sample: std::collections::HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn variant(&self) -> &dyn BoardVariant {
        self.variant.as_ref()
    }

    pub fn dump_handle(&self) -> &DumpHandle {
        &self.dump
    }

    /// Install the event graph; only the first call takes effect
    pub fn attach_router(&self, router: Arc<EventRouter>) {
        if self.router.set(router).is_err() {
            log::warn!("{}: event router already attached", self.name());
        }
    }

    pub fn set_running(&self, running: bool) {
        self.state().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Startup finished; measurements are classified from now on
    pub fn mark_init_complete(&self) {
        self.state().init_complete = true;
        log::info!("{}: startup complete", self.name());
    }

    pub fn is_init_complete(&self) -> bool {
        self.state().init_complete
    }

    pub fn set_dump_reason(&self, reason: &str) {
        self.state().stats.set_dump_reason(reason);
    }

    /// Ask this device's scheduler for an on-demand stat dump
    pub fn request_dump(&self, reason: &str) -> DumpRequest {
        self.dump.request(reason)
    }

    /// Stop accepting input and close any half-collected stat block
    pub fn stop(&self) {
        let mut state = self.state();
        state.running = false;
        if let Some(snap) = state.stats.flush(REASON_SHUTDOWN) {
            log::debug!("{}: save_reason:{:?} {:?}", self.config.name, REASON_SHUTDOWN, snap);
        }
    }

    /// Free-text line from the device
    pub fn ingest_line(&self, line: &str) {
        let mut state = self.state();
        if !state.running {
            return;
        }
        let t = self.clock.now();
        let trimmed = line.trim();
        log::trace!("{}: 0{:?}", self.config.name, trimmed);
        state.device.recv_lines.push(RawLine { t, line: trimmed.to_string() });

        let (ticks, text) = strip_noise(trimmed);

        if text.contains(STAT_HEADER) {
            state.stats.push_line(&text, ticks, t);
        } else if trimmed.contains(VERSION_MARKER) {
            if state.device.image_version.is_none() {
                let version = parse_version_banner(&text);
                log::info!("{}: image version {}", self.config.name, version);
                state.device.image_version = Some(version);
            }
        } else if trimmed.contains(ERROR_MARKER) {
            log::warn!("{}: EE {}", self.config.name, text);
            state.device.error_lines.push(RawLine { t, line: text });
        } else {
            match state.stats.push_line(&text, ticks, t) {
                StatLine::Ignored if !state.stats.is_collecting() && text.len() > 1 => {
                    log::debug!("{}: {:?}", self.config.name, text);
                }
                _ => {}
            }
        }
    }

    /// Structured record from the device. `line` is the raw text it came in.
    pub fn ingest_record(&self, fields: Map<String, Value>, line: &str) {
        let events = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            let t = self.clock.now();
            state.device.recv_lines.push(RawLine { t, line: line.trim().to_string() });

            // Boot noise is never classified
            if !state.init_complete {
                return;
            }
            let events = self.apply_record(&mut state, &fields, t);
            state.device.recv_objs.push(TimedRecord { t, o: fields });
            events
        };

        // Fire with the lock released: targets may be this very device
        if let Some(router) = self.router.get() {
            for ev in events {
                let queued = router.fire(self.name(), &ev.event, &ev.reason);
                log::debug!("{}: event {} -> {} target(s)", self.name(), ev.event, queued);
            }
        }
    }

    fn apply_record(&self, state: &mut MonitorState, fields: &Map<String, Value>, t: f64) -> Vec<RaisedEvent> {
        let measurement = match self.variant.probe(fields) {
            DeviceRecord::Identity => {
                state.device.identity.extend(fields.clone());
                return Vec::new();
            }
            DeviceRecord::Unrecognized => return Vec::new(),
            DeviceRecord::Measurement(m) => m,
        };

        state.device.bump("total_tag_msgs");
        let Some(tag_id) = measurement.tag_id.clone() else {
            return Vec::new();
        };

        let previous = state.last_sample.get(&tag_id);
        if previous.is_none() {
            log::info!("{}: new tag_id:{}", self.config.name, tag_id);
        }
        let outcome = classify(self.variant.as_ref(), self.name(), &tag_id, &measurement, previous);
        for counter in &outcome.counters {
            state.device.bump(counter);
        }

        state
            .device
            .tag_log
            .entry(tag_id.clone())
            .or_default()
            .push(TimedRecord { t, o: fields.clone() });
        state.last_sample.insert(tag_id, measurement);

        outcome.events
    }

    /// Copy of the counters
    pub fn counters(&self) -> std::collections::BTreeMap<String, u64> {
        self.state().device.counters.clone()
    }

    /// Copy of the accumulated device state
    pub fn device_state(&self) -> DeviceState {
        self.state().device.clone()
    }

    /// Full snapshot for the results file. Pure read.
    pub fn serialize_state(&self) -> DeviceSnapshot {
        let state = self.state();
        DeviceSnapshot {
            cfg: self.config.clone(),
            id: state.device.identity.clone(),
            image_version: state.device.image_version.clone(),
            stat: state.device.counters.clone(),
            dev_stat: state.stats.history().to_vec(),
            recv_objs: state.device.recv_objs.clone(),
            recv_lines: state.device.recv_lines.clone(),
            error_lines: state.device.error_lines.clone(),
            tag_obj_log: state.device.tag_log.clone(),
        }
    }

    pub fn run_checks(&self) -> CheckOutcome {
        let state = self.state();
        self.variant.run_checks(&state.device, &self.config)
    }
}

impl LineSink for DeviceMonitor {
    fn ingest(&self, decoded: DecodedLine) {
        match decoded {
            DecodedLine::Record { fields, line } => self.ingest_record(fields, &line),
            DecodedLine::Raw { line } => self.ingest_line(&line),
        }
    }

    fn connection_lost(&self, reason: &str) {
        log::warn!("{}: connection lost ({})", self.name(), reason);
        self.dump.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::variant::NtwrVariant;
    use crate::scheduler::DUMP_MIN_INTERVAL;
    use crate::serial::decode_line;

    fn monitor() -> (DeviceMonitor, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (dump, rx) = DumpHandle::new("anchor0", DUMP_MIN_INTERVAL);
        let cfg = BoardConfig::new("anchor0", "NtwrBoard");
        let m = DeviceMonitor::new(cfg, Box::new(NtwrVariant::new()), RunClock::start(), dump);
        (m, rx)
    }

    fn feed(m: &DeviceMonitor, lines: &[&str]) {
        for l in lines {
            m.ingest(decode_line(l));
        }
    }

    #[tokio::test]
    async fn test_lines_ignored_until_running() {
        let (m, _rx) = monitor();
        feed(&m, &["hello"]);
        assert!(m.device_state().recv_lines.is_empty());

        m.set_running(true);
        feed(&m, &["hello"]);
        assert_eq!(m.device_state().recv_lines.len(), 1);
    }

    #[tokio::test]
    async fn test_markers_and_stat_blocks() {
        let (m, _rx) = monitor();
        m.set_running(true);
        feed(
            &m,
            &[
                "img abc 1.4.2 0xfeed 2024-02-02 build",
                "img abc 9.9.9 0xbeef 2024-02-03 build",
                "311 compat> stat mac",
                "312 rx_ok: 40",
                "313 tx_ok: 41",
                "",
                "[ts=1] level=3 radio fault",
            ],
        );
        let snap = m.serialize_state();
        assert_eq!(snap.image_version.as_deref(), Some("abc 1.4.2 0xfeed 2024-02-02"));
        assert_eq!(snap.dev_stat.len(), 1);
        assert_eq!(snap.dev_stat[0].name, "mac");
        assert_eq!(snap.dev_stat[0].stat["tx_ok"], 41);
        assert_eq!(snap.error_lines.len(), 1);
        assert_eq!(snap.recv_lines.len(), 7);
    }

    #[tokio::test]
    async fn test_records_before_startup_only_reach_raw_history() {
        let (m, _rx) = monitor();
        m.set_running(true);
        feed(&m, &["{\"euid\": \"0x1\"}", "{\"mid\": 1, \"id\": 3, \"ts\": 1.0}", "{\"mid\": 1, \"id\": 3, \"ts\": 9.0}"]);

        let snap = m.serialize_state();
        assert_eq!(snap.recv_lines.len(), 3);
        assert!(snap.recv_objs.is_empty());
        assert!(snap.id.is_empty());
        assert!(snap.tag_obj_log.is_empty());
        assert_eq!(snap.stat["total_tag_msgs"], 0);
        assert_eq!(snap.stat["num_1s_miss"], 0);
    }

    #[tokio::test]
    async fn test_classification_after_startup() {
        let (m, _rx) = monitor();
        m.set_running(true);
        m.mark_init_complete();
        feed(
            &m,
            &[
                "{\"euid\": \"0x1\", \"part\": 52}",
                "{\"mid\": 1, \"id\": 3, \"ts\": 1.0, \"meas\": {\"a\": [1, 2]}}",
                "{\"mid\": 2, \"id\": 3, \"ts\": 2.2, \"meas\": {\"a\": [1]}}",
                "{\"mid\": 3, \"id\": 3, \"ts\": 2.18}",
                "{\"mid\": 4, \"id\": 4, \"ts\": 0.5, \"meas\": {\"a\": [1, 2]}}",
                "{\"mid\": 5}",
            ],
        );

        let snap = m.serialize_state();
        assert_eq!(snap.id["euid"], "0x1");
        assert_eq!(snap.stat["total_tag_msgs"], 5);
        assert_eq!(snap.stat["num_1s_miss"], 1);
        assert_eq!(snap.stat["num_negative_dt"], 1);
        assert_eq!(snap.stat["single_anchor"], 1);
        assert_eq!(snap.stat["missing_meas"], 1);
        assert_eq!(snap.stat["total_meas"], 1);
        assert_eq!(snap.tag_obj_log["tag_3"].len(), 3);
        assert_eq!(snap.tag_obj_log["tag_4"].len(), 1);
        assert_eq!(snap.recv_objs.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_and_tag_log_share_timestamp() {
        let (m, _rx) = monitor();
        m.set_running(true);
        m.mark_init_complete();
        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        feed(&m, &["{\"mid\": 1, \"id\": 3, \"ts\": 1.0}"]);
        tokio::time::advance(std::time::Duration::from_millis(700)).await;
        feed(&m, &["{\"mid\": 2, \"id\": 3, \"ts\": 1.1}"]);

        let snap = m.serialize_state();
        let logged: Vec<f64> = snap.tag_obj_log["tag_3"].iter().map(|r| r.t).collect();
        let recorded: Vec<f64> = snap.recv_objs.iter().map(|r| r.t).collect();
        assert_eq!(logged, recorded);
        assert_eq!(snap.recv_lines[1].t, recorded[1]);
    }

    #[tokio::test]
    async fn test_events_fire_through_router() {
        let (m, _rx) = monitor();
        let (target, mut target_rx) = DumpHandle::new("tag0", DUMP_MIN_INTERVAL);
        target.set_connected(true);
        let mut router = EventRouter::new();
        router.subscribe("anchor0", "error_tag_3", target);
        m.attach_router(Arc::new(router));

        m.set_running(true);
        m.mark_init_complete();
        feed(&m, &["{\"mid\": 1, \"id\": 3, \"ts\": 1.0}", "{\"mid\": 2, \"id\": 3, \"ts\": 1.5}"]);

        let reason = target_rx.recv().await.unwrap();
        assert!(reason.starts_with("anchor0:tag_3 num_200ms_miss"), "{}", reason);
    }

    #[tokio::test]
    async fn test_stop_flushes_open_block() {
        let (m, _rx) = monitor();
        m.set_running(true);
        feed(&m, &["stat pan", "joins: 2"]);
        m.stop();
        feed(&m, &["stat mac"]);

        let snap = m.serialize_state();
        assert_eq!(snap.dev_stat.len(), 1);
        assert_eq!(snap.dev_stat[0].completion, REASON_SHUTDOWN);
        assert!(!m.is_running());
    }
}
