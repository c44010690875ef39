//! Architecture-specific register definitions
//!
//! MSR addresses are shared across Intel client generations, but field
//! encodings (most notably the RAPL time window and the MCHBAR base) have
//! drifted between generations. Each layout lives in its own module.
//!
//! ## Supported Architectures
//!
//! - **Intel client** (`client` feature) - Skylake through Lunar Lake mobile

#[cfg(feature = "client")]
pub mod client;
