pub mod manager;
pub mod models;
pub mod monitor;
pub mod variant;

pub use manager::{Board, DeviceManager};
pub use models::*;
pub use monitor::DeviceMonitor;
pub use variant::{variant_for, BoardVariant, NtwrVariant, TimingLadder, TwrAlohaVariant};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Unknown board class: {0}")]
    UnknownBoardClass(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
