//! Producers that post events to the control loop
//!
//! Watchers never touch registers; they only send [`crate::events::ControlEvent`]s.

pub mod load;
pub mod resume;

pub use load::{LoadMonitor, ProcStatSampler};
pub use resume::ResumeWatcher;
