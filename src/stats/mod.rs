pub mod accumulator;
pub mod parser;
pub mod types;

pub use accumulator::{OpenSnapshot, StatSnapshotAccumulator};
pub use types::{StatLine, StatSnapshot, TickCount};
