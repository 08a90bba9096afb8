//! Per-variant record shapes and timing classification.
//!
//! Every board shares one monitor; what differs between firmware variants
//! (field names, units, threshold ladders, stat categories, startup
//! commands) lives behind [`BoardVariant`].
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde_json::{Map, Value};

use super::models::{CheckOutcome, DeviceRecord, DeviceState, MeasStructure, Measurement};
use crate::config::BoardConfig;

/// Event raised for structural measurement problems
pub const WARNING_EVENT: &str = "warning";

/// One rung of a timing ladder: `dt > above` lands in `counter`
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub counter: &'static str,
    pub above: f64,
    /// Crossing a hard tier also raises `error_<tag>`
    pub hard: bool,
}

/// Bucket for samples that went backwards: `dt < below`
#[derive(Debug, Clone, PartialEq)]
pub struct NegativeTier {
    pub counter: &'static str,
    pub below: f64,
    pub hard: bool,
}

/// Ordered threshold ladder, most severe tier first
#[derive(Debug, Clone, PartialEq)]
pub struct TimingLadder {
    pub tiers: Vec<Tier>,
    pub negative: Option<NegativeTier>,
    /// Gaps above this are worth a log line
    pub log_above: f64,
}

/// Where a single `dt` landed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingOutcome {
    pub counter: &'static str,
    pub hard: bool,
}

impl TimingLadder {
    /// First matching tier wins; at most one bucket per sample
    pub fn evaluate(&self, dt: f64) -> Option<TimingOutcome> {
        if let Some(tier) = self.tiers.iter().find(|t| dt > t.above) {
            return Some(TimingOutcome { counter: tier.counter, hard: tier.hard });
        }
        match &self.negative {
            Some(neg) if dt < neg.below => Some(TimingOutcome { counter: neg.counter, hard: neg.hard }),
            _ => None,
        }
    }

    /// Names of every bucket in this ladder
    pub fn counters(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tiers.iter().map(|t| t.counter).collect();
        names.extend(self.negative.iter().map(|n| n.counter));
        names
    }
}

/// Event to fire through the router after the state lock is released
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedEvent {
    pub event: String,
    pub reason: String,
}

/// Counter bumps and events produced by one measurement record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub counters: Vec<&'static str>,
    pub events: Vec<RaisedEvent>,
}

pub trait BoardVariant: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Counters every device of this variant starts with
    fn counter_names(&self) -> Vec<&'static str>;

    /// Stat categories requested by every dump
    fn stat_categories(&self) -> &'static [&'static str];

    /// Configuration commands sent once after startup
    fn startup_commands(&self) -> &'static [&'static str] {
        &[]
    }

    fn ladder(&self) -> &TimingLadder;

    /// Decide what kind of record this is
    fn probe(&self, fields: &Map<String, Value>) -> DeviceRecord;

    /// Whether the measurement sub-structure is checked
    fn checks_structure(&self) -> bool {
        false
    }

    fn run_checks(&self, _state: &DeviceState, _cfg: &BoardConfig) -> CheckOutcome {
        CheckOutcome { ok: true, message: "No run_checks implemented".to_string() }
    }
}

/// Classify a measurement against the previous sample of the same tag.
/// `previous` is `None` for a first-seen tag, which is never classified.
pub fn classify(
    variant: &dyn BoardVariant,
    device: &str,
    tag_id: &str,
    current: &Measurement,
    previous: Option<&Measurement>,
) -> Classification {
    let mut out = Classification::default();
    let Some(previous) = previous else {
        return out;
    };

    let dt = match (current.timestamp, previous.timestamp) {
        (Some(now), Some(before)) => now - before,
        _ => 0.0,
    };

    let ladder = variant.ladder();
    let outcome = ladder.evaluate(dt);
    if let Some(hit) = outcome {
        out.counters.push(hit.counter);
        if hit.hard {
            out.events.push(RaisedEvent {
                event: format!("error_{}", tag_id),
                reason: format!("{}:{} {} ({:.4})", device, tag_id, hit.counter, dt),
            });
        }
    }
    if dt > ladder.log_above {
        let level = if outcome.map(|o| o.hard).unwrap_or(false) { "EE" } else { "WW" };
        log::info!(
            "[{}] {}:{} t:{:.4} dt:{:.4} (>{})",
            level,
            device,
            tag_id,
            current.timestamp.unwrap_or_default(),
            dt,
            ladder.log_above
        );
    }

    if variant.checks_structure() {
        match current.structure {
            MeasStructure::Missing => {
                out.counters.push("missing_meas");
                out.events.push(RaisedEvent {
                    event: WARNING_EVENT.to_string(),
                    reason: format!("{}:{} missing_meas", device, tag_id),
                });
            }
            MeasStructure::Contributors(n) => {
                if n == 1 {
                    out.counters.push("single_anchor");
                    out.events.push(RaisedEvent {
                        event: WARNING_EVENT.to_string(),
                        reason: format!("{}:{} single_anchor", device, tag_id),
                    });
                }
                out.counters.push("total_meas");
            }
        }
    }

    out
}

/// Render a JSON scalar the way it reads on the console
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integer view of a JSON number or numeric string; whole floats such as
/// `4660.0` truncate like an integer cast
fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Network TWR firmware: `euid` identity, `mid` measurements in seconds
#[derive(Debug)]
pub struct NtwrVariant {
    ladder: TimingLadder,
}

impl NtwrVariant {
    pub fn new() -> Self {
        Self {
            ladder: TimingLadder {
                tiers: vec![
                    Tier { counter: "num_1s_miss", above: 1.0, hard: true },
                    Tier { counter: "num_500ms_miss", above: 0.5, hard: true },
                    Tier { counter: "num_200ms_miss", above: 0.2, hard: true },
                    Tier { counter: "num_60ms_miss", above: 0.06, hard: false },
                ],
                negative: Some(NegativeTier { counter: "num_negative_dt", below: -0.01, hard: true }),
                log_above: 0.06,
            },
        }
    }
}

impl Default for NtwrVariant {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardVariant for NtwrVariant {
    fn name(&self) -> &'static str {
        "NtwrBoard"
    }

    fn counter_names(&self) -> Vec<&'static str> {
        let mut names = self.ladder.counters();
        names.extend(["missing_meas", "single_anchor", "total_tag_msgs", "total_meas"]);
        names
    }

    fn stat_categories(&self) -> &'static [&'static str] {
        &["ccp", "pan", "tdma", "mac"]
    }

    fn ladder(&self) -> &TimingLadder {
        &self.ladder
    }

    fn probe(&self, fields: &Map<String, Value>) -> DeviceRecord {
        if fields.contains_key("euid") {
            return DeviceRecord::Identity;
        }
        if !fields.contains_key("mid") {
            return DeviceRecord::Unrecognized;
        }

        let structure = match fields.get("meas").and_then(|m| m.get("a")) {
            Some(Value::Array(a)) => MeasStructure::Contributors(a.len()),
            Some(Value::Object(o)) => MeasStructure::Contributors(o.len()),
            _ => MeasStructure::Missing,
        };

        DeviceRecord::Measurement(Measurement {
            tag_id: fields.get("id").map(|id| format!("tag_{}", plain(id))),
            timestamp: fields.get("ts").and_then(Value::as_f64),
            structure,
        })
    }

    fn checks_structure(&self) -> bool {
        true
    }
}

/// ALOHA TWR firmware: `part_id` identity, `uid` measurements in microseconds
#[derive(Debug)]
pub struct TwrAlohaVariant {
    ladder: TimingLadder,
}

impl TwrAlohaVariant {
    pub const MIN_RANGES_PER_SEC: f64 = 5.0;

    pub fn new() -> Self {
        Self {
            ladder: TimingLadder {
                tiers: vec![
                    Tier { counter: "num_500ms_miss", above: 0.5, hard: true },
                    Tier { counter: "num_80ms_miss", above: 0.08, hard: false },
                ],
                negative: None,
                log_above: 0.08,
            },
        }
    }
}

impl Default for TwrAlohaVariant {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardVariant for TwrAlohaVariant {
    fn name(&self) -> &'static str {
        "TwrAlohaBoard"
    }

    fn counter_names(&self) -> Vec<&'static str> {
        let mut names = self.ladder.counters();
        names.push("total_tag_msgs");
        names
    }

    fn stat_categories(&self) -> &'static [&'static str] {
        &["mac"]
    }

    fn startup_commands(&self) -> &'static [&'static str] {
        &["config uwb/frame_filter 0xf", "config commit"]
    }

    fn ladder(&self) -> &TimingLadder {
        &self.ladder
    }

    fn probe(&self, fields: &Map<String, Value>) -> DeviceRecord {
        if fields.contains_key("part_id") {
            return DeviceRecord::Identity;
        }
        if !fields.contains_key("uid") {
            return DeviceRecord::Unrecognized;
        }

        DeviceRecord::Measurement(Measurement {
            tag_id: fields.get("ouid").and_then(as_u64).map(|id| format!("tag_{:04x}", id)),
            timestamp: fields.get("utime").and_then(Value::as_f64).map(|us| us / 1_000_000.0),
            structure: MeasStructure::Missing,
        })
    }

    /// Every ranging code must reach the minimum rate over the run and
    /// every configured code must appear at all
    fn run_checks(&self, state: &DeviceState, cfg: &BoardConfig) -> CheckOutcome {
        let mut ok = true;
        let mut message = "All checks passed".to_string();

        let mut t_min = f64::MAX;
        let mut t_max = f64::MIN;
        let mut codes: BTreeMap<String, usize> = BTreeMap::new();
        for rec in &state.recv_objs {
            t_min = t_min.min(rec.t);
            t_max = t_max.max(rec.t);
            if let Some(code) = rec.o.get("c").and_then(as_u64) {
                *codes.entry(format!("code_{:x}", code)).or_insert(0) += 1;
            }
        }

        let span = t_max - t_min;
        for (code, count) in &codes {
            let rate = if span > 0.0 { *count as f64 / span } else { 0.0 };
            if rate < Self::MIN_RANGES_PER_SEC {
                ok = false;
                message = format!("{}: {:.2} rng/s < {:.1}", code, rate, Self::MIN_RANGES_PER_SEC);
            } else {
                log::debug!("{}: {}: {:.2} rng/s", cfg.name, code, rate);
            }
        }

        for check in &cfg.check_codes {
            if !codes.contains_key(&check.id) {
                ok = false;
                message = format!("{}({}) missing from data", check.id, check.name);
            }
        }

        CheckOutcome { ok, message }
    }
}

/// Variant implementation for a configured `board_class`
pub fn variant_for(board_class: &str) -> Option<Box<dyn BoardVariant>> {
    match board_class {
        "NtwrBoard" => Some(Box::new(NtwrVariant::new())),
        "TwrAlohaBoard" => Some(Box::new(TwrAlohaVariant::new())),
        _ => None,
    }
}
