//! Multi-board serial test harness for UWB ranging firmware.
//!
//! Each configured board gets a reader task feeding a [`device::DeviceMonitor`],
//! and a [`scheduler::PollScheduler`] that drives startup, periodic stat dumps
//! and shutdown. Boards are linked through an [`events::EventRouter`] so a
//! timing fault on one board can trigger a stat dump on others.

pub mod clock;
pub mod config;
pub mod device;
pub mod events;
pub mod flash;
pub mod listener;
pub mod report;
pub mod scheduler;
pub mod serial;
pub mod stats;

