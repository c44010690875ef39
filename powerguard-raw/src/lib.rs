//! # powerguard-raw
//!
//! Register definitions and codecs for Intel client power, thermal and voltage
//! control.
//!
//! This crate translates domain units (watts, seconds, millivolts, amps and
//! degrees Celsius) to and from the bit layouts of the RAPL, FIVR overclocking
//! mailbox, thermal, HWP and platform registers. It performs no I/O: reading
//! and writing the registers is left to the caller.
//!
//! ## Features
//!
//! Select the register layout via feature flags:
//! - `client` (default) - Intel client parts, Skylake and newer mobile
//!
//! ## Usage
//!
//! ```ignore
//! use powerguard_raw::current_arch::{mailbox, rapl};
//!
//! let units = rapl::RaplPowerUnit::reference();
//! let word = units.encode_power_limit(&rapl::PowerLimits {
//!     pl1_watts: 44.0,
//!     pl1_seconds: 28.0,
//!     pl2_watts: 44.0,
//!     pl2_seconds: 0.002,
//! });
//!
//! let undervolt = mailbox::encode_undervolt(mailbox::Plane::Core, -100.0)?;
//! ```

pub mod arch;
pub mod error;
pub mod register;

pub use error::{CodecError, Result};
pub use register::{FieldSpec, Register, RegisterKind, RegisterLayout, Unit};

// Export current architecture based on feature flag
#[cfg(feature = "client")]
pub use arch::client as current_arch;
