// Macros (must be first for visibility)
#[macro_use]
pub mod macros;

pub mod common;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod power;
pub mod state;
pub mod watchers;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigFile, Profile, ProfileSet, ProfileSource};
pub use error::{PowerguardError, Result};
pub use events::{ControlEvent, HwpHint};
pub use orchestrator::{Capabilities, ControlLoop, TickReport};
pub use power::{PowerSource, PowerSourceProvider, SysfsPowerSource};
pub use state::DaemonState;
