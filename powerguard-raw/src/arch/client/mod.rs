//! Intel client (Skylake and newer) register definitions
//!
//! ## Register groups
//!
//! - **RAPL** - package power limits PL1/PL2 and energy counters
//! - **Mailbox** - FIVR overclocking mailbox: voltage offsets and IccMax
//! - **Thermal** - temperature target, thermal status, BD PROCHOT
//! - **HWP** - hardware P-state energy/performance preference
//! - **Platform** - platform info and configurable TDP
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 4
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B,
//!   Section 14.9: Platform Specific Power Management Support

pub mod hwp;
pub mod mailbox;
pub mod platform;
pub mod rapl;
pub mod thermal;
