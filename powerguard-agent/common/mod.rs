pub mod access;
pub mod arch;
pub mod cpuid;
pub mod lock;
pub mod mmio;
pub mod msr;
pub mod pci;

pub use access::{Platform, RegisterAccess};
pub use arch::CpuModel;
pub use lock::InstanceLock;
pub use msr::{Msr, MsrHandle};
