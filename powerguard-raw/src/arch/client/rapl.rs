//! RAPL (Running Average Power Limit) register definitions
//!
//! RAPL caps the package power draw with two limits: PL1, the sustained
//! limit averaged over a long window, and PL2, the short-term limit averaged
//! over a window of a few milliseconds.
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Section 14.9: Platform Specific Power Management Support

use crate::register::{FieldSpec, Register, RegisterLayout, Unit};

/// MSR addresses for RAPL
pub mod msr {
    /// RAPL Power Unit MSR - Defines energy, power, and time units
    pub const MSR_RAPL_POWER_UNIT: u64 = 0x606;

    /// Package Power Limit - Configure package power limits
    pub const MSR_PKG_POWER_LIMIT: u64 = 0x610;

    /// Package Energy Status - Total package energy consumption
    pub const MSR_PKG_ENERGY_STATUS: u64 = 0x611;

    /// DRAM Energy Status - Memory controller energy consumption
    pub const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;

    /// PP1 Energy Status - Integrated graphics energy consumption
    pub const MSR_PP1_ENERGY_STATUS: u64 = 0x641;
}

/// Offset of the package power limit mirror inside the MCHBAR window
pub const MCHBAR_PKG_POWER_LIMIT_OFFSET: u64 = 0x59A0;

pub const PKG_POWER_LIMIT: Register = Register::msr("MSR_PKG_POWER_LIMIT", msr::MSR_PKG_POWER_LIMIT);

pub const MCHBAR_PKG_POWER_LIMIT: Register =
    Register::mmio("MCHBAR_PKG_POWER_LIMIT", MCHBAR_PKG_POWER_LIMIT_OFFSET);

/// Bits 0-55 carry both limits; the lock bit and the reserved top byte are
/// never compared during read-back.
pub const POWER_LIMIT_COMPARE_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

pub const PL1_POWER: FieldSpec = FieldSpec {
    name: "pl1_power",
    offset: 0,
    width: 15,
    scale: 0.125,
    unit: Unit::Watts,
    signed: false,
    preserve_other_bits: false,
};

pub const PL2_POWER: FieldSpec = FieldSpec {
    name: "pl2_power",
    offset: 32,
    width: 15,
    scale: 0.125,
    unit: Unit::Watts,
    signed: false,
    preserve_other_bits: false,
};

/// RAPL Power Unit Register layout
///
/// Defines the units for energy, power, and time measurements.
///
/// ## Register Format
///
/// | Bits   | Field        | Description                           |
/// |--------|--------------|---------------------------------------|
/// | 0-3    | power_units  | Power units (1/2^PU watts)           |
/// | 4-7    | reserved     |                                       |
/// | 8-12   | energy_units | Energy units (1/2^ESU joules)        |
/// | 13-15  | reserved     |                                       |
/// | 16-19  | time_units   | Time units (1/2^TU seconds)          |
/// | 20-63  | reserved     |                                       |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaplPowerUnit {
    /// Power units: watts = value * (1.0 / 2^power_units)
    pub power_units: u8,

    /// Energy units: joules = value * (1.0 / 2^energy_units)
    pub energy_units: u8,

    /// Time units: seconds = value * (1.0 / 2^time_units)
    pub time_units: u8,
}

impl RegisterLayout for RaplPowerUnit {
    fn to_msr_value(&self) -> u64 {
        (self.power_units as u64 & 0x0F)
            | ((self.energy_units as u64 & 0x1F) << 8)
            | ((self.time_units as u64 & 0x0F) << 16)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            power_units: (value & 0x0F) as u8,
            energy_units: ((value >> 8) & 0x1F) as u8,
            time_units: ((value >> 16) & 0x0F) as u8,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.power_units > 15 {
            return Err("Power units must be <= 15 (4 bits)");
        }
        if self.energy_units > 31 {
            return Err("Energy units must be <= 31 (5 bits)");
        }
        if self.time_units > 15 {
            return Err("Time units must be <= 15 (4 bits)");
        }
        Ok(())
    }
}

impl RaplPowerUnit {
    /// Units found on every client part this crate targets:
    /// 1/8 W, 61 µJ and 1/1024 s (~0.98 ms).
    pub const fn reference() -> Self {
        Self {
            power_units: 3,
            energy_units: 14,
            time_units: 10,
        }
    }

    /// Get power unit multiplier (watts per LSB)
    pub fn power_unit_multiplier(&self) -> f64 {
        1.0 / (1u64 << self.power_units) as f64
    }

    /// Get energy unit multiplier (joules per LSB)
    pub fn energy_unit_multiplier(&self) -> f64 {
        1.0 / (1u64 << self.energy_units) as f64
    }

    /// Get time unit multiplier (seconds per LSB)
    pub fn time_unit_multiplier(&self) -> f64 {
        1.0 / (1u64 << self.time_units) as f64
    }

    /// Quantize watts into the 15-bit power field, clamping to its range
    pub fn encode_watts(&self, watts: f64) -> u16 {
        if !watts.is_finite() || watts <= 0.0 {
            return 0;
        }
        let raw = (watts / self.power_unit_multiplier()).round();
        raw.min(PL1_POWER.max_raw() as f64) as u16
    }

    pub fn decode_watts(&self, raw: u16) -> f64 {
        raw as f64 * self.power_unit_multiplier()
    }

    pub fn encode_seconds(&self, seconds: f64) -> TimeWindow {
        TimeWindow::nearest(seconds, self.time_unit_multiplier())
    }

    pub fn decode_seconds(&self, window: TimeWindow) -> f64 {
        window.seconds(self.time_unit_multiplier())
    }

    /// Encode both package limits into a `MSR_PKG_POWER_LIMIT` word
    ///
    /// Both limits are enabled, PL1 may clamp below the OS-requested
    /// frequency and the lock bit is left clear.
    pub fn encode_power_limit(&self, limits: &PowerLimits) -> u64 {
        RaplPowerLimit {
            power_limit_1: self.encode_watts(limits.pl1_watts),
            enable_1: true,
            clamp_1: true,
            time_window_1: self.encode_seconds(limits.pl1_seconds),
            power_limit_2: self.encode_watts(limits.pl2_watts),
            enable_2: true,
            clamp_2: false,
            time_window_2: self.encode_seconds(limits.pl2_seconds),
            lock: false,
        }
        .to_msr_value()
    }

    pub fn decode_power_limit(&self, value: u64) -> PowerLimits {
        let layout = RaplPowerLimit::from_msr_value(value);
        PowerLimits {
            pl1_watts: self.decode_watts(layout.power_limit_1),
            pl1_seconds: self.decode_seconds(layout.time_window_1),
            pl2_watts: self.decode_watts(layout.power_limit_2),
            pl2_seconds: self.decode_seconds(layout.time_window_2),
        }
    }
}

/// Package power limits in domain units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLimits {
    pub pl1_watts: f64,
    pub pl1_seconds: f64,
    pub pl2_watts: f64,
    pub pl2_seconds: f64,
}

/// Encode limits with the reference units (1/8 W, 1/1024 s)
pub fn encode_power_limit(pl1_watts: f64, pl1_seconds: f64, pl2_watts: f64, pl2_seconds: f64) -> u64 {
    RaplPowerUnit::reference().encode_power_limit(&PowerLimits {
        pl1_watts,
        pl1_seconds,
        pl2_watts,
        pl2_seconds,
    })
}

/// Decode a `MSR_PKG_POWER_LIMIT` word with the reference units
pub fn decode_power_limit(value: u64) -> PowerLimits {
    RaplPowerUnit::reference().decode_power_limit(value)
}

/// RAPL time window: `2^exponent * (1 + mantissa / 4) * time_unit`
///
/// The 7-bit field stores the exponent in bits 0-4 and the mantissa in
/// bits 5-6. Resolution is coarse for short windows: at the reference time
/// unit the two smallest steps are ~0.98 ms and ~1.95 ms apart, so a PL2
/// window of 2 ms lands on 1.95 ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub exponent: u8,
    pub mantissa: u8,
}

impl TimeWindow {
    pub fn from_raw(raw: u8) -> Self {
        Self {
            exponent: raw & 0x1F,
            mantissa: (raw >> 5) & 0x03,
        }
    }

    pub fn raw(&self) -> u8 {
        (self.exponent & 0x1F) | ((self.mantissa & 0x03) << 5)
    }

    pub fn seconds(&self, time_unit: f64) -> f64 {
        (1u64 << self.exponent) as f64 * (1.0 + self.mantissa as f64 / 4.0) * time_unit
    }

    /// Representable window closest to `seconds`; ties go to the shorter one
    pub fn nearest(seconds: f64, time_unit: f64) -> Self {
        let mut best = Self::default();
        if !seconds.is_finite() || seconds <= 0.0 {
            return best;
        }

        let mut best_error = f64::INFINITY;
        for exponent in 0..32u8 {
            for mantissa in 0..4u8 {
                let candidate = Self { exponent, mantissa };
                let error = (candidate.seconds(time_unit) - seconds).abs();
                if error < best_error {
                    best = candidate;
                    best_error = error;
                }
            }
        }
        best
    }
}

/// RAPL Power Limit Register layout
///
/// Configures power limits and time windows for a power domain.
///
/// ## Register Format
///
/// | Bits   | Field          | Description                        |
/// |--------|----------------|------------------------------------|
/// | 0-14   | power_limit_1  | Power limit 1 (power units)        |
/// | 15     | enable_1       | Enable power limit 1              |
/// | 16     | clamp_1        | Clamp to power limit 1            |
/// | 17-23  | time_window_1  | Time window 1                     |
/// | 24-31  | reserved       |                                    |
/// | 32-46  | power_limit_2  | Power limit 2 (power units)        |
/// | 47     | enable_2       | Enable power limit 2              |
/// | 48     | clamp_2        | Clamp to power limit 2            |
/// | 49-55  | time_window_2  | Time window 2                     |
/// | 56-62  | reserved       |                                    |
/// | 63     | lock           | Lock register                     |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaplPowerLimit {
    pub power_limit_1: u16,
    pub enable_1: bool,
    pub clamp_1: bool,
    pub time_window_1: TimeWindow,
    pub power_limit_2: u16,
    pub enable_2: bool,
    pub clamp_2: bool,
    pub time_window_2: TimeWindow,

    /// Lock register (prevents further writes until reset)
    pub lock: bool,
}

impl RegisterLayout for RaplPowerLimit {
    fn to_msr_value(&self) -> u64 {
        (self.power_limit_1 as u64 & 0x7FFF)
            | (if self.enable_1 { 1 << 15 } else { 0 })
            | (if self.clamp_1 { 1 << 16 } else { 0 })
            | ((self.time_window_1.raw() as u64 & 0x7F) << 17)
            | ((self.power_limit_2 as u64 & 0x7FFF) << 32)
            | (if self.enable_2 { 1 << 47 } else { 0 })
            | (if self.clamp_2 { 1 << 48 } else { 0 })
            | ((self.time_window_2.raw() as u64 & 0x7F) << 49)
            | (if self.lock { 1 << 63 } else { 0 })
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            power_limit_1: (value & 0x7FFF) as u16,
            enable_1: (value & (1 << 15)) != 0,
            clamp_1: (value & (1 << 16)) != 0,
            time_window_1: TimeWindow::from_raw(((value >> 17) & 0x7F) as u8),
            power_limit_2: ((value >> 32) & 0x7FFF) as u16,
            enable_2: (value & (1 << 47)) != 0,
            clamp_2: (value & (1 << 48)) != 0,
            time_window_2: TimeWindow::from_raw(((value >> 49) & 0x7F) as u8),
            lock: (value & (1 << 63)) != 0,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.power_limit_1 > 0x7FFF {
            return Err("Power limit 1 must be <= 0x7FFF (15 bits)");
        }
        if self.power_limit_2 > 0x7FFF {
            return Err("Power limit 2 must be <= 0x7FFF (15 bits)");
        }
        Ok(())
    }
}
