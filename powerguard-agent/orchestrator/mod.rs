pub mod capabilities;
pub mod controller;

pub use capabilities::Capabilities;
pub use controller::{ControlLoop, TickReport};
