//! Hardware P-state (HWP) request register

use crate::register::{FieldSpec, Register, Unit};

pub const IA32_HWP_REQUEST: u64 = 0x774;

pub const HWP_REQUEST: Register = Register::msr("IA32_HWP_REQUEST", IA32_HWP_REQUEST);

/// Energy/performance preference, 0 = performance, 255 = energy saving
pub const EPP: FieldSpec = FieldSpec {
    name: "energy_performance_preference",
    offset: 24,
    width: 8,
    scale: 1.0,
    unit: Unit::Raw,
    signed: false,
    preserve_other_bits: true,
};

/// EPP requested while the machine is busy on AC
pub const EPP_PERFORMANCE: u8 = 0x20;

/// Balanced EPP most distributions program at boot
pub const EPP_DEFAULT: u8 = 0x80;

/// Replace the EPP field of the current request, keeping min/max/desired
/// performance and the activity window
pub fn encode_epp(current: u64, epp: u8) -> u64 {
    EPP.insert(current, epp as u64)
}

pub fn decode_epp(value: u64) -> u8 {
    EPP.extract(value) as u8
}
