use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Device tick counter attached to a snapshot, `"unknown"` when the
/// header and body lines carried none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TickCount {
    Known(u64),
    Unknown(UnknownTicks),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTicks {
    Unknown,
}

impl TickCount {
    pub const UNKNOWN: TickCount = TickCount::Unknown(UnknownTicks::Unknown);
}

impl From<Option<u64>> for TickCount {
    fn from(ticks: Option<u64>) -> Self {
        ticks.map(TickCount::Known).unwrap_or(TickCount::UNKNOWN)
    }
}

/// One finished stat block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    /// Category from the `stat <name>` header
    pub name: String,
    /// Run time (s) at which the header was seen
    pub t: f64,
    pub ticks: TickCount,
    /// Dump reason in effect when the block was requested
    pub reason: Option<String>,
    /// What closed the block: `new stat`, `blank line` or `shutdown`
    pub completion: String,
    pub stat: BTreeMap<String, i64>,
}

/// Where a line landed in the accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum StatLine {
    /// A header opened a new block
    Header { name: String, ticks: Option<u64> },
    /// A `<key>: <integer>` field was stored
    Field { key: String, value: i64 },
    /// A blank line closed the open block
    Closed,
    /// Nothing happened
    Ignored,
}
