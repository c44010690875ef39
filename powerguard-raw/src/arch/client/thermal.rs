//! Thermal register definitions
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Section 14.8: Thermal Monitoring and Protection

use crate::register::{FieldSpec, Register, RegisterLayout, Unit};

/// MSR addresses for thermal control and status
pub mod msr {
    /// Current performance state; bits 32-47 carry the core voltage
    pub const IA32_PERF_STATUS: u64 = 0x198;

    /// Per-core thermal status with sticky log bits
    pub const IA32_THERM_STATUS: u64 = 0x19C;

    /// TjMax and the thermal control circuit activation offset
    pub const MSR_TEMPERATURE_TARGET: u64 = 0x1A2;

    /// Power control; bit 0 enables bi-directional PROCHOT
    pub const MSR_POWER_CTL: u64 = 0x1FC;
}

pub const TEMPERATURE_TARGET: Register =
    Register::msr("MSR_TEMPERATURE_TARGET", msr::MSR_TEMPERATURE_TARGET);

pub const THERM_STATUS: Register = Register::msr("IA32_THERM_STATUS", msr::IA32_THERM_STATUS);

pub const POWER_CTL: Register = Register::msr("MSR_POWER_CTL", msr::MSR_POWER_CTL);

/// Junction temperature at which PROCHOT asserts (TjMax)
pub const TJ_MAX: FieldSpec = FieldSpec {
    name: "tj_max",
    offset: 16,
    width: 8,
    scale: 1.0,
    unit: Unit::Celsius,
    signed: false,
    preserve_other_bits: true,
};

/// Degrees below TjMax at which throttling starts
pub const TARGET_OFFSET: FieldSpec = FieldSpec {
    name: "target_offset",
    offset: 24,
    width: 6,
    scale: 1.0,
    unit: Unit::Celsius,
    signed: false,
    preserve_other_bits: true,
};

pub const BD_PROCHOT: FieldSpec = FieldSpec {
    name: "bd_prochot",
    offset: 0,
    width: 1,
    scale: 1.0,
    unit: Unit::Raw,
    signed: false,
    preserve_other_bits: true,
};

const VCORE: FieldSpec = FieldSpec {
    name: "vcore",
    offset: 32,
    width: 16,
    scale: 1000.0 / 8192.0,
    unit: Unit::Millivolts,
    signed: false,
    preserve_other_bits: false,
};

/// Encode a throttling trip point into `MSR_TEMPERATURE_TARGET`
///
/// The offset below `reference_trip_c` (TjMax) is clamped to the 6-bit field
/// and written into bits 24-29 of `current`; every other bit is kept.
pub fn encode_temperature_target(current: u64, trip_temp_c: f64, reference_trip_c: f64) -> u64 {
    let offset = if trip_temp_c.is_finite() && reference_trip_c.is_finite() {
        (reference_trip_c - trip_temp_c)
            .round()
            .clamp(0.0, TARGET_OFFSET.max_raw() as f64) as u64
    } else {
        0
    };
    TARGET_OFFSET.insert(current, offset)
}

/// Offset below TjMax currently programmed
pub fn decode_temperature_target(value: u64) -> u64 {
    TARGET_OFFSET.extract(value)
}

/// TjMax in °C reported by `MSR_TEMPERATURE_TARGET`
pub fn decode_tj_max(value: u64) -> f64 {
    TJ_MAX.to_units(value)
}

/// Clear BD PROCHOT, leaving the other power control bits untouched
pub fn disable_bd_prochot(current: u64) -> u64 {
    BD_PROCHOT.insert(current, 0)
}

/// Core voltage in mV from `IA32_PERF_STATUS`
pub fn decode_vcore_mv(value: u64) -> f64 {
    VCORE.to_units(value)
}

/// Bit layout of `IA32_THERM_STATUS`, one entry per decoded field
///
/// Even bits 0-14 are the instantaneous status, odd bits 1-15 the sticky log
/// of the same event since the log was last cleared.
pub const THERMAL_STATUS_FIELDS: [FieldSpec; 19] = [
    FieldSpec::bits("thermal_limit_status", 0, 1),
    FieldSpec::bits("thermal_limit_log", 1, 1),
    FieldSpec::bits("prochot_or_forcepr_status", 2, 1),
    FieldSpec::bits("prochot_or_forcepr_log", 3, 1),
    FieldSpec::bits("crit_temp_status", 4, 1),
    FieldSpec::bits("crit_temp_log", 5, 1),
    FieldSpec::bits("thermal_threshold1_status", 6, 1),
    FieldSpec::bits("thermal_threshold1_log", 7, 1),
    FieldSpec::bits("thermal_threshold2_status", 8, 1),
    FieldSpec::bits("thermal_threshold2_log", 9, 1),
    FieldSpec::bits("power_limit_status", 10, 1),
    FieldSpec::bits("power_limit_log", 11, 1),
    FieldSpec::bits("current_limit_status", 12, 1),
    FieldSpec::bits("current_limit_log", 13, 1),
    FieldSpec::bits("cross_domain_limit_status", 14, 1),
    FieldSpec::bits("cross_domain_limit_log", 15, 1),
    FieldSpec {
        name: "digital_readout",
        offset: 16,
        width: 7,
        scale: 1.0,
        unit: Unit::Celsius,
        signed: false,
        preserve_other_bits: false,
    },
    FieldSpec::bits("resolution", 27, 4),
    FieldSpec::bits("reading_valid", 31, 1),
];

/// Writing zero to the log bits clears them; status bits are read-only
pub const THERMAL_LOG_CLEAR: u64 = 0;

/// One set of throttle flags, either all instantaneous or all sticky
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleFlags {
    pub thermal: bool,
    pub prochot: bool,
    pub critical_temp: bool,
    pub threshold1: bool,
    pub threshold2: bool,
    pub power_limit: bool,
    pub current_limit: bool,
    pub cross_domain: bool,
}

impl ThrottleFlags {
    /// Decode the flags starting at `base` (0 for status, 1 for log)
    fn decode(value: u64, base: usize) -> Self {
        let bit = |index: usize| THERMAL_STATUS_FIELDS[index * 2 + base].is_set(value);
        Self {
            thermal: bit(0),
            prochot: bit(1),
            critical_temp: bit(2),
            threshold1: bit(3),
            threshold2: bit(4),
            power_limit: bit(5),
            current_limit: bit(6),
            cross_domain: bit(7),
        }
    }

    pub fn any(&self) -> bool {
        self.thermal
            || self.prochot
            || self.critical_temp
            || self.threshold1
            || self.threshold2
            || self.power_limit
            || self.current_limit
            || self.cross_domain
    }
}

/// Decoded `IA32_THERM_STATUS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThermalStatus {
    /// Instantaneous status bits
    pub current: ThrottleFlags,
    /// Sticky log bits, set on an event since the log was last cleared
    pub sticky: ThrottleFlags,
    /// Degrees below TjMax
    pub digital_readout: u8,
    /// Readout resolution in °C
    pub resolution: u8,
    pub reading_valid: bool,
}

impl RegisterLayout for ThermalStatus {
    fn to_msr_value(&self) -> u64 {
        let flags = |f: &ThrottleFlags, base: u32| {
            [
                f.thermal,
                f.prochot,
                f.critical_temp,
                f.threshold1,
                f.threshold2,
                f.power_limit,
                f.current_limit,
                f.cross_domain,
            ]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &set)| {
                acc | ((set as u64) << (i as u32 * 2 + base))
            })
        };

        flags(&self.current, 0)
            | flags(&self.sticky, 1)
            | ((self.digital_readout as u64 & 0x7F) << 16)
            | ((self.resolution as u64 & 0x0F) << 27)
            | (if self.reading_valid { 1 << 31 } else { 0 })
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            current: ThrottleFlags::decode(value, 0),
            sticky: ThrottleFlags::decode(value, 1),
            digital_readout: THERMAL_STATUS_FIELDS[16].extract(value) as u8,
            resolution: THERMAL_STATUS_FIELDS[17].extract(value) as u8,
            reading_valid: THERMAL_STATUS_FIELDS[18].is_set(value),
        }
    }
}

impl ThermalStatus {
    /// Temperature in °C given TjMax, if the readout is valid
    pub fn temperature_c(&self, tj_max: f64) -> Option<f64> {
        self.reading_valid
            .then(|| tj_max - self.digital_readout as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_target_preserves_unrelated_bits() {
        // TjMax 100 °C, fan temperature target and reserved bits populated
        let current = 0xC000_0000_0064_0A00u64 | (5 << 24);
        let written = encode_temperature_target(current, 95.0, 100.0);

        assert_eq!(decode_temperature_target(written), 5);
        let written = encode_temperature_target(current, 85.0, 100.0);
        assert_eq!(decode_temperature_target(written), 15);
        assert_eq!(written & !TARGET_OFFSET.mask(), current & !TARGET_OFFSET.mask());
        assert_eq!(decode_tj_max(written), 100.0);
    }

    #[test]
    fn test_temperature_target_clamps_offset() {
        assert_eq!(decode_temperature_target(encode_temperature_target(0, 105.0, 100.0)), 0);
        assert_eq!(decode_temperature_target(encode_temperature_target(0, 0.0, 100.0)), 63);
    }

    #[test]
    fn test_thermal_status_separates_status_and_log() {
        // power limit status (bit 10) and log (bit 11), valid reading 30 °C below TjMax
        let value = (1 << 10) | (1 << 11) | (30 << 16) | (1 << 31);
        let status = ThermalStatus::from_msr_value(value);

        assert!(status.current.power_limit);
        assert!(status.sticky.power_limit);
        assert!(!status.current.thermal && !status.sticky.thermal);
        assert_eq!(status.temperature_c(100.0), Some(70.0));
        assert_eq!(status.to_msr_value(), value);

        let only_log = ThermalStatus::from_msr_value(1 << 13);
        assert!(!only_log.current.any());
        assert!(only_log.sticky.current_limit);
        assert_eq!(only_log.temperature_c(100.0), None);
    }

    #[test]
    fn test_bd_prochot_and_vcore() {
        assert_eq!(disable_bd_prochot(0x0024_005F), 0x0024_005E);
        let perf_status = 0x1B33u64 << 32;
        assert!((decode_vcore_mv(perf_status) - 850.0).abs() < 0.5);
    }
}
