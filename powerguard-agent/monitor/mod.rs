//! Read-only observation of throttling, power draw and voltages

pub mod energy;
pub mod throttle;
pub mod view;

pub use energy::{EnergyMonitor, EnergyPlane};
pub use throttle::{ThrottleCause, ThrottleMonitor, ThrottleSnapshot};
pub use view::{MonitorView, MIN_INTERVAL};
