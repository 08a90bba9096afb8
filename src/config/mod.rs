pub mod harness;

pub use harness::{
    BoardConfig, CheckCode, ConfigError, HarnessConfig, LinkConfig, SnifferConfig,
};
