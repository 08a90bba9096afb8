//! Persisted run output and the end-of-run console summary.
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::device::{CheckOutcome, DeviceSnapshot};
use crate::listener::ListenerSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to write results to {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("Failed to read results from {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("Results are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything one run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cmdline: String,
    pub boards: Vec<DeviceSnapshot>,
    pub threads: Vec<ListenerSnapshot>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, cmdline: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            cmdline,
            boards: Vec::new(),
            threads: Vec::new(),
        }
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ReportError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReportError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Every timestamped entry of a run with `t` in `[start, end]`, sorted by
/// `t`: board stat snapshots and records tagged with a `board` key, then
/// listener records as they are.
pub fn entries_between(report: &RunReport, start: f64, end: f64) -> Vec<Value> {
    let in_range = |t: f64| t >= start && t <= end;
    let mut entries: Vec<(f64, Value)> = Vec::new();

    for board in &report.boards {
        let stats = board
            .dev_stat
            .iter()
            .filter(|s| in_range(s.t))
            .map(|s| (s.t, serde_json::to_value(s)));
        let records = board
            .recv_objs
            .iter()
            .filter(|r| in_range(r.t))
            .map(|r| (r.t, serde_json::to_value(r)));

        for (t, value) in stats.chain(records) {
            let Ok(Value::Object(fields)) = value else {
                continue;
            };
            let mut entry = Map::new();
            entry.insert("board".to_string(), Value::String(board.cfg.name.clone()));
            entry.extend(fields);
            entries.push((t, Value::Object(entry)));
        }
    }

    for thread in &report.threads {
        for rec in thread.recv_objs.iter().filter(|r| in_range(r.t)) {
            if let Ok(value) = serde_json::to_value(rec) {
                entries.push((rec.t, value));
            }
        }
    }

    entries.sort_by(|a, b| a.0.total_cmp(&b.0));
    entries.into_iter().map(|(_, v)| v).collect()
}

/// Console summary for one board.
///
/// Always the header, counters and error count; from verbosity 1 also the
/// error lines, the stat snapshots in category order and the check result.
pub fn board_summary(
    snap: &DeviceSnapshot,
    categories: &[&str],
    checks: &CheckOutcome,
    verbose: u8,
) -> String {
    let mut out = String::new();
    let board_id = snap
        .id
        .get("euid")
        .or_else(|| snap.id.get("part_id"))
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .unwrap_or_else(|| "None".to_string());
    let version = snap.image_version.as_deref().unwrap_or("None");

    let _ = writeln!(out, "{} {} ({}):", snap.cfg.name, board_id, version);
    let _ = writeln!(out, "  {:?}", snap.stat);
    let _ = writeln!(out, "  Num err lines: {}", snap.error_lines.len());
    if verbose < 1 {
        return out;
    }

    let _ = writeln!(out, "############################");
    for line in &snap.error_lines {
        let _ = writeln!(out, "  EE: {:.4} {}", line.t, line.line);
    }
    let _ = writeln!(out, "# Stats");
    let names = categories
        .iter()
        .copied()
        .chain(["stat"])
        .chain(snap.cfg.start_end_stats.iter().map(String::as_str));
    for name in names {
        for s in snap.dev_stat.iter().filter(|s| s.name == name) {
            let _ = writeln!(out, "  {}", serde_json::to_string(s).unwrap_or_default());
        }
    }
    let status = if checks.ok { "OK" } else { "FAIL" };
    let _ = writeln!(out, "# Checks: {} {}", status, checks.message);
    let _ = writeln!(out, "############################");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::device::RawLine;
    use crate::stats::{StatSnapshot, TickCount};

    fn snapshot() -> DeviceSnapshot {
        let mut cfg = BoardConfig::new("anchor0", "NtwrBoard");
        cfg.extra.insert("location".into(), serde_json::json!("lab"));
        DeviceSnapshot {
            cfg,
            id: serde_json::Map::new(),
            image_version: Some("abc 1.0".into()),
            stat: [("total_tag_msgs".to_string(), 3)].into_iter().collect(),
            dev_stat: vec![StatSnapshot {
                name: "mac".into(),
                t: 1.5,
                ticks: TickCount::UNKNOWN,
                reason: Some("timer".into()),
                completion: "blank line".into(),
                stat: [("rx".to_string(), 4)].into_iter().collect(),
            }],
            recv_objs: vec![],
            recv_lines: vec![],
            error_lines: vec![RawLine { t: 0.5, line: "level=3 boom".into() }],
            tag_obj_log: Default::default(),
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        let mut report = RunReport::new(Utc::now(), "serial-check cfg.json -d 5".into());
        report.boards.push(snapshot());
        report.write_to(&path).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["run_id", "started_at", "cmdline", "boards", "threads"] {
            assert!(raw.get(key).is_some(), "missing {}", key);
        }
        let board = &raw["boards"][0];
        assert_eq!(board["cfg"]["location"], "lab");
        assert_eq!(board["dev_stat"][0]["ticks"], "unknown");

        let back = RunReport::read_from(&path).unwrap();
        assert_eq!(back.run_id, report.run_id);
        assert_eq!(back.boards[0].cfg.name, "anchor0");
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(RunReport::read_from(dir.path().join("nope.json")), Err(ReportError::Read { .. })));
    }

    #[test]
    fn test_entries_between_filters_and_sorts() {
        use crate::device::TimedRecord;
        use crate::listener::{ListenerRecord, ListenerSnapshot};

        let mut board = snapshot();
        board.recv_objs = vec![
            TimedRecord { t: 0.2, o: serde_json::json!({"mid": 1}).as_object().cloned().unwrap() },
            TimedRecord { t: 12.0, o: serde_json::json!({"mid": 2}).as_object().cloned().unwrap() },
        ];
        let mut report = RunReport::new(Utc::now(), String::new());
        report.boards.push(board);
        report.threads.push(ListenerSnapshot {
            address: "sniffer".into(),
            num_lines: 1,
            recv_objs: vec![ListenerRecord { t: 1.0, o: serde_json::json!({"s": 1}) }],
        });

        let entries = entries_between(&report, 0.0, 10.0);
        let times: Vec<f64> = entries.iter().map(|e| e["t"].as_f64().unwrap()).collect();
        assert_eq!(times, vec![0.2, 1.0, 1.5]);
        assert_eq!(entries[0]["board"], "anchor0");
        assert_eq!(entries[0]["o"]["mid"], 1);
        assert!(entries[1].get("board").is_none());
        assert_eq!(entries[2]["name"], "mac");
    }

    #[test]
    fn test_summary_verbosity() {
        let snap = snapshot();
        let checks = CheckOutcome { ok: true, message: "No run_checks implemented".into() };

        let short = board_summary(&snap, &["mac"], &checks, 0);
        assert!(short.starts_with("anchor0 None (abc 1.0):"));
        assert!(short.contains("Num err lines: 1"));
        assert!(!short.contains("EE:"));

        let long = board_summary(&snap, &["mac"], &checks, 1);
        assert!(long.contains("EE: 0.5000 level=3 boom"));
        assert!(long.contains("\"name\":\"mac\""));
        assert!(long.contains("# Checks: OK"));
    }
}
