use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::serial::interface::DEFAULT_BAUD_RATE;

const DEFAULT_STATS_TIMER_INTERVAL: f64 = 10.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("Not a valid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top level harness file: boards to monitor, optional sniffers and the
/// event links between boards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub sniffers: Vec<SnifferConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    /// USB serial number of the board's console port
    pub com_serial: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Variant name, e.g. `NtwrBoard` or `TwrAlohaBoard`
    pub board_class: String,
    /// Seconds between periodic stat dumps
    #[serde(default = "default_stats_timer_interval")]
    pub stats_timer_interval: f64,
    #[serde(default)]
    pub initial_reset: bool,
    /// Extra stat categories dumped only at startup and shutdown
    #[serde(default)]
    pub start_end_stats: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debugger_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bl_target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check_codes: Vec<CheckCode>,
    /// Keys this harness does not interpret, echoed back in the report
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A ranging code that must show up in the run's data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckCode {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnifferConfig {
    pub address: String,
    pub port: u16,
}

/// `src` raising `src_type` triggers a dump on every board in `dst`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub src: String,
    pub src_type: String,
    pub dst: Vec<String>,
    #[serde(default = "default_dst_type")]
    pub dst_type: String,
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_stats_timer_interval() -> f64 {
    DEFAULT_STATS_TIMER_INTERVAL
}

fn default_dst_type() -> String {
    "stat_dump".to_string()
}

impl BoardConfig {
    /// Minimal config for a named board, mostly useful in tests
    pub fn new(name: &str, board_class: &str) -> Self {
        Self {
            name: name.to_string(),
            com_serial: String::new(),
            baudrate: DEFAULT_BAUD_RATE,
            board_class: board_class.to_string(),
            stats_timer_interval: DEFAULT_STATS_TIMER_INTERVAL,
            initial_reset: false,
            start_end_stats: Vec::new(),
            debugger_serial: None,
            target: None,
            bl_target: None,
            check_codes: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl HarnessConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, board) in self.boards.iter().enumerate() {
            if board.name.is_empty() {
                return Err(ConfigError::Invalid(format!("board #{} has no name", i)));
            }
            if !(board.stats_timer_interval > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: stats_timer_interval must be positive",
                    board.name
                )));
            }
            if self.boards[..i].iter().any(|b| b.name == board.name) {
                return Err(ConfigError::Invalid(format!("duplicate board name {}", board.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "boards": [
            {"name": "anchor0", "com_serial": "000683", "baudrate": 1000000,
             "board_class": "NtwrBoard", "initial_reset": true,
             "start_end_stats": ["uwb_stat"], "location": "desk"},
            {"name": "tag0", "com_serial": "000684", "board_class": "TwrAlohaBoard",
             "stats_timer_interval": 5,
             "check_codes": [{"id": "code_1", "name": "twr"}]}
        ],
        "sniffers": [{"address": "127.0.0.1", "port": 2002}],
        "links": [{"src": "anchor0", "src_type": "error_tag_1", "dst": ["tag0"], "dst_type": "stat_dump"}]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = HarnessConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.boards.len(), 2);

        let anchor = &config.boards[0];
        assert_eq!(anchor.baudrate, 1000000);
        assert!(anchor.initial_reset);
        assert_eq!(anchor.stats_timer_interval, 10.0);
        assert_eq!(anchor.extra["location"], "desk");

        let tag = &config.boards[1];
        assert_eq!(tag.baudrate, DEFAULT_BAUD_RATE);
        assert_eq!(tag.stats_timer_interval, 5.0);
        assert_eq!(tag.check_codes[0].id, "code_1");

        assert_eq!(config.sniffers[0].port, 2002);
        assert_eq!(config.links[0].dst, vec!["tag0"]);
    }

    #[test]
    fn test_extra_keys_round_trip_into_report() {
        let config = HarnessConfig::from_json(SAMPLE).unwrap();
        let value = serde_json::to_value(&config.boards[0]).unwrap();
        assert_eq!(value["location"], "desk");
        assert!(value.get("target").is_none());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(HarnessConfig::from_json("{}"), Err(ConfigError::Parse(_))));

        let dup = r#"{"boards": [
            {"name": "a", "com_serial": "1", "board_class": "NtwrBoard"},
            {"name": "a", "com_serial": "2", "board_class": "NtwrBoard"}]}"#;
        assert!(matches!(HarnessConfig::from_json(dup), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(HarnessConfig::load(&path).unwrap().boards.len(), 2);

        let missing = HarnessConfig::load(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
