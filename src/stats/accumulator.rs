use std::collections::BTreeMap;

use super::parser::{parse_stat_field, parse_stat_header};
use super::types::{StatLine, StatSnapshot, TickCount};

/// Fields needed before a blank line may close a block. The dump reason
/// shares the buffer, so two fields make it "more than two entries".
pub const BLANK_CLOSE_MIN_FIELDS: usize = 2;

pub const REASON_NEW_STAT: &str = "new stat";
pub const REASON_BLANK_LINE: &str = "blank line";
pub const REASON_SHUTDOWN: &str = "shutdown";

/// The block currently being collected
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSnapshot {
    pub name: String,
    pub started_at: f64,
    pub ticks: Option<u64>,
    pub fields: BTreeMap<String, i64>,
}

/// Folds `stat <name>` headers and `<key>: <value>` lines into snapshots.
/// At most one block is open at a time.
#[derive(Debug, Default)]
pub struct StatSnapshotAccumulator {
    open: Option<OpenSnapshot>,
    dump_reason: Option<String>,
    finished: Vec<StatSnapshot>,
}

impl StatSnapshotAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record why the next blocks were requested (timer, startup, an event)
    pub fn set_dump_reason(&mut self, reason: &str) {
        self.dump_reason = Some(reason.to_string());
    }

    pub fn is_collecting(&self) -> bool {
        self.open.is_some()
    }

    pub fn open(&self) -> Option<&OpenSnapshot> {
        self.open.as_ref()
    }

    /// Finished snapshots, oldest first
    pub fn history(&self) -> &[StatSnapshot] {
        &self.finished
    }

    /// Feed one cleaned line. `ticks` is the line's leading tick counter.
    pub fn push_line(&mut self, text: &str, ticks: Option<u64>, now: f64) -> StatLine {
        if let Some(name) = parse_stat_header(text) {
            // A new header always wins over a partial block
            self.flush(REASON_NEW_STAT);
            self.open = Some(OpenSnapshot {
                name: name.clone(),
                started_at: now,
                ticks,
                fields: BTreeMap::new(),
            });
            return StatLine::Header { name, ticks };
        }

        let Some(open) = self.open.as_mut() else {
            return StatLine::Ignored;
        };

        if text.is_empty() {
            if open.fields.len() >= BLANK_CLOSE_MIN_FIELDS {
                self.flush(REASON_BLANK_LINE);
                return StatLine::Closed;
            }
            return StatLine::Ignored;
        }

        match parse_stat_field(text) {
            Some((key, value)) => {
                open.fields.insert(key.clone(), value);
                if open.ticks.is_none() {
                    open.ticks = ticks;
                }
                StatLine::Field { key, value }
            }
            None => StatLine::Ignored,
        }
    }

    /// Close the open block, if any, into history
    pub fn flush(&mut self, completion: &str) -> Option<&StatSnapshot> {
        let open = self.open.take()?;
        let snapshot = StatSnapshot {
            name: open.name,
            t: open.started_at,
            ticks: TickCount::from(open.ticks),
            reason: self.dump_reason.clone(),
            completion: completion.to_string(),
            stat: open.fields,
        };
        log::trace!("stat block closed ({}): {:?}", completion, snapshot);
        self.finished.push(snapshot);
        self.finished.last()
    }
}
