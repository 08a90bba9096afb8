use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::BoardConfig;
use crate::stats::StatSnapshot;

/// Identity fields merged from identity records; never cleared
pub type DeviceIdentity = Map<String, Value>;

/// A line as received, trimmed, with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLine {
    pub t: f64,
    pub line: String,
}

/// A decoded JSON object with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedRecord {
    pub t: f64,
    pub o: Map<String, Value>,
}

/// Measurement sub-structure found in a measurement record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasStructure {
    /// The expected structure is absent or malformed
    Missing,
    /// Number of contributing anchors
    Contributors(usize),
}

/// A record carrying a per-tag timing sample
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// `tag_<id>`, when the record names its tag
    pub tag_id: Option<String>,
    /// Sample time in seconds
    pub timestamp: Option<f64>,
    pub structure: MeasStructure,
}

/// Shape of a decoded record, probed by field presence
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRecord {
    Identity,
    Measurement(Measurement),
    Unrecognized,
}

/// Everything a monitor has accumulated about its device
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub identity: DeviceIdentity,
    pub image_version: Option<String>,
    pub counters: BTreeMap<String, u64>,
    pub recv_lines: Vec<RawLine>,
    pub error_lines: Vec<RawLine>,
    pub recv_objs: Vec<TimedRecord>,
    pub tag_log: BTreeMap<String, Vec<TimedRecord>>,
}

impl DeviceState {
    pub fn with_counters(names: &[&str]) -> Self {
        Self {
            counters: names.iter().map(|n| (n.to_string(), 0)).collect(),
            ..Self::default()
        }
    }

    pub fn bump(&mut self, counter: &str) {
        *self.counters.entry(counter.to_string()).or_insert(0) += 1;
    }
}

/// Serialized form of one device at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub cfg: BoardConfig,
    pub id: DeviceIdentity,
    pub image_version: Option<String>,
    pub stat: BTreeMap<String, u64>,
    pub dev_stat: Vec<StatSnapshot>,
    pub recv_objs: Vec<TimedRecord>,
    pub recv_lines: Vec<RawLine>,
    pub error_lines: Vec<RawLine>,
    pub tag_obj_log: BTreeMap<String, Vec<TimedRecord>>,
}

/// Result of a variant's post-run checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub ok: bool,
    pub message: String,
}
