//! Platform information and configurable TDP

use crate::register::{FieldSpec, Register, RegisterLayout};

pub const MSR_PLATFORM_INFO: u64 = 0xCE;

pub const MSR_CONFIG_TDP_CONTROL: u64 = 0x64B;

pub const CONFIG_TDP_CONTROL: Register =
    Register::msr("MSR_CONFIG_TDP_CONTROL", MSR_CONFIG_TDP_CONTROL);

/// PCI config space offset of the MCHBAR base in the host bridge (0:0.0)
pub const PCI_MCHBAR_OFFSET: u32 = 0x48;

/// Size of the MCHBAR window that must be mapped to reach the power limit mirror
pub const MCHBAR_WINDOW_SIZE: usize = 0x8000;

/// Selected TDP level, bits 0-1
pub const TDP_LEVEL: FieldSpec = FieldSpec {
    preserve_other_bits: true,
    ..FieldSpec::bits("tdp_level", 0, 2)
};

/// Field layout of `MSR_PLATFORM_INFO`
pub mod fields {
    use crate::register::FieldSpec;

    pub const MAX_NON_TURBO_RATIO: FieldSpec = FieldSpec::bits("maximum_non_turbo_ratio", 8, 8);
    pub const PPIN_CAP: FieldSpec = FieldSpec::bits("feature_ppin_cap", 23, 1);
    pub const PROGRAMMABLE_TURBO_RATIO: FieldSpec =
        FieldSpec::bits("feature_programmable_turbo_ratio", 28, 1);
    pub const PROGRAMMABLE_TDP_LIMIT: FieldSpec =
        FieldSpec::bits("feature_programmable_tdp_limit", 29, 1);
    pub const PROGRAMMABLE_TEMPERATURE_TARGET: FieldSpec =
        FieldSpec::bits("feature_programmable_temperature_target", 30, 1);
    pub const LOW_POWER_MODE: FieldSpec = FieldSpec::bits("feature_low_power_mode", 32, 1);
    pub const ADDITIONAL_TDP_PROFILES: FieldSpec =
        FieldSpec::bits("number_of_additional_tdp_profiles", 33, 2);
    pub const MAX_EFFICIENCY_RATIO: FieldSpec = FieldSpec::bits("maximum_efficiency_ratio", 40, 8);
    pub const MIN_OPERATING_RATIO: FieldSpec = FieldSpec::bits("minimum_operating_ratio", 48, 8);

    pub const ALL: [FieldSpec; 9] = [
        MAX_NON_TURBO_RATIO,
        MAX_EFFICIENCY_RATIO,
        MIN_OPERATING_RATIO,
        PPIN_CAP,
        PROGRAMMABLE_TURBO_RATIO,
        PROGRAMMABLE_TDP_LIMIT,
        ADDITIONAL_TDP_PROFILES,
        PROGRAMMABLE_TEMPERATURE_TARGET,
        LOW_POWER_MODE,
    ];
}

/// Decoded `MSR_PLATFORM_INFO`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub max_non_turbo_ratio: u8,
    pub max_efficiency_ratio: u8,
    pub min_operating_ratio: u8,
    pub programmable_tdp_limit: bool,
    pub programmable_temperature_target: bool,
    pub additional_tdp_profiles: u8,
    raw: u64,
}

impl RegisterLayout for PlatformInfo {
    fn to_msr_value(&self) -> u64 {
        self.raw
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            max_non_turbo_ratio: fields::MAX_NON_TURBO_RATIO.extract(value) as u8,
            max_efficiency_ratio: fields::MAX_EFFICIENCY_RATIO.extract(value) as u8,
            min_operating_ratio: fields::MIN_OPERATING_RATIO.extract(value) as u8,
            programmable_tdp_limit: fields::PROGRAMMABLE_TDP_LIMIT.is_set(value),
            programmable_temperature_target: fields::PROGRAMMABLE_TEMPERATURE_TARGET.is_set(value),
            additional_tdp_profiles: fields::ADDITIONAL_TDP_PROFILES.extract(value) as u8,
            raw: value,
        }
    }
}

impl PlatformInfo {
    /// Every documented field with its raw value, for debug listings
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        fields::ALL
            .iter()
            .map(|field| (field.name, field.extract(self.raw)))
            .collect()
    }

    /// Base clock in MHz, assuming the 100 MHz bus clock
    pub fn base_frequency_mhz(&self) -> u32 {
        self.max_non_turbo_ratio as u32 * 100
    }
}

/// Select a configurable TDP level, keeping the lock bit and reserved bits
pub fn encode_ctdp(current: u64, level: u8) -> u64 {
    TDP_LEVEL.insert(current, level as u64)
}

pub fn decode_ctdp(value: u64) -> u8 {
    TDP_LEVEL.extract(value) as u8
}
