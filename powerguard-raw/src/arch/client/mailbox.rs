//! FIVR overclocking mailbox (MSR 0x150)
//!
//! Voltage offsets and current limits of the integrated voltage regulator are
//! not plain registers: a command word is written to the mailbox MSR and, for
//! read commands, the answer is read back from the same MSR.
//!
//! ## Command word
//!
//! | Bits   | Field     | Description                                  |
//! |--------|-----------|----------------------------------------------|
//! | 0-31   | data      | Command payload / response                   |
//! | 32-39  | command   | 0x10 read offset, 0x11 write offset,         |
//! |        |           | 0x16 read IccMax, 0x17 write IccMax          |
//! | 40-42  | plane     | Voltage/current plane selector               |
//! | 63     | busy      | Run bit, must be set on every command        |
//!
//! Voltage offsets live in bits 21-31 of the payload as an 11-bit two's
//! complement value in 1/1024 V steps. IccMax lives in bits 0-9 in 1/4 A steps.

use crate::error::{CodecError, Result};
use crate::register::{FieldSpec, Register, Unit};

pub const MSR_OC_MAILBOX: u64 = 0x150;

pub const OC_MAILBOX: Register = Register::msr("MSR_OC_MAILBOX", MSR_OC_MAILBOX);

const MAILBOX_RUN: u64 = 1 << 63;

const CMD_READ_VOLTAGE_OFFSET: u64 = 0x10;
const CMD_WRITE_VOLTAGE_OFFSET: u64 = 0x11;
const CMD_READ_ICCMAX: u64 = 0x16;
const CMD_WRITE_ICCMAX: u64 = 0x17;

/// Mask of the payload compared during undervolt read-back
pub const VOLTAGE_OFFSET_MASK: u64 = 0xFFE0_0000;

/// Mask of the payload compared during IccMax read-back
pub const ICCMAX_MASK: u64 = 0x3FF;

/// One millivolt expressed in offset steps (1/1024 V)
const STEPS_PER_MV: f64 = 1.024;

const ICCMAX_STEPS_PER_AMP: f64 = 4.0;

/// Most negative offset the 11-bit field holds (-1024 steps)
pub const UNDERVOLT_LIMIT_MV: f64 = -1000.0;

/// Largest IccMax the 10-bit field holds (1023 quarter amps)
pub const ICCMAX_LIMIT_AMPS: f64 = 255.75;

pub const VOLTAGE_OFFSET: FieldSpec = FieldSpec {
    name: "voltage_offset",
    offset: 21,
    width: 11,
    scale: 1.0 / STEPS_PER_MV,
    unit: Unit::Millivolts,
    signed: true,
    preserve_other_bits: false,
};

pub const ICCMAX: FieldSpec = FieldSpec {
    name: "iccmax",
    offset: 0,
    width: 10,
    scale: 1.0 / ICCMAX_STEPS_PER_AMP,
    unit: Unit::Amps,
    signed: false,
    preserve_other_bits: false,
};

const COMMAND: FieldSpec = FieldSpec::bits("command", 32, 8);
const PLANE: FieldSpec = FieldSpec::bits("plane", 40, 3);

/// Voltage planes addressable through the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Plane {
    Core,
    Gpu,
    Cache,
    Uncore,
    AnalogIo,
}

/// Selector and capabilities, indexed by `Plane as usize`
static PLANE_LAYOUTS: [PlaneLayout; 5] = [
    PlaneLayout {
        name: "CORE",
        selector: 0,
        current_control: true,
    },
    PlaneLayout {
        name: "GPU",
        selector: 1,
        current_control: true,
    },
    PlaneLayout {
        name: "CACHE",
        selector: 2,
        current_control: true,
    },
    PlaneLayout {
        name: "UNCORE",
        selector: 3,
        current_control: false,
    },
    PlaneLayout {
        name: "ANALOGIO",
        selector: 4,
        current_control: false,
    },
];

/// Per-plane layout parameters
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    pub name: &'static str,
    pub selector: u64,
    pub current_control: bool,
}

impl Plane {
    pub const ALL: [Plane; 5] = [
        Plane::Core,
        Plane::Gpu,
        Plane::Cache,
        Plane::Uncore,
        Plane::AnalogIo,
    ];

    /// Planes whose IccMax can be programmed
    pub const CURRENT: [Plane; 3] = [Plane::Core, Plane::Gpu, Plane::Cache];

    pub fn layout(&self) -> &'static PlaneLayout {
        &PLANE_LAYOUTS[*self as usize]
    }

    pub fn name(&self) -> &'static str {
        self.layout().name
    }

    pub fn selector(&self) -> u64 {
        self.layout().selector
    }

    pub fn from_selector(selector: u64) -> Option<Plane> {
        Self::ALL.into_iter().find(|p| p.selector() == selector)
    }
}

impl std::fmt::Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn command(cmd: u64, plane: Plane) -> u64 {
    MAILBOX_RUN | PLANE.insert(COMMAND.insert(0, cmd), plane.selector())
}

/// Command word decoded from a raw mailbox value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCommand {
    pub command: u8,
    pub plane: Option<Plane>,
    pub data: u32,
}

impl MailboxCommand {
    pub const READ_VOLTAGE_OFFSET: u8 = CMD_READ_VOLTAGE_OFFSET as u8;
    pub const WRITE_VOLTAGE_OFFSET: u8 = CMD_WRITE_VOLTAGE_OFFSET as u8;
    pub const READ_ICCMAX: u8 = CMD_READ_ICCMAX as u8;
    pub const WRITE_ICCMAX: u8 = CMD_WRITE_ICCMAX as u8;

    pub fn decode(value: u64) -> Self {
        Self {
            command: COMMAND.extract(value) as u8,
            plane: Plane::from_selector(PLANE.extract(value)),
            data: (value & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Build the mailbox word that writes a voltage offset to `plane`
///
/// `offset_mv` must lie within -1000..=0 mV. The offset is quantized to
/// 1/1.024 mV steps.
pub fn encode_undervolt(plane: Plane, offset_mv: f64) -> Result<u64> {
    if !offset_mv.is_finite() {
        return Err(CodecError::NotFinite {
            field: "undervolt",
        });
    }
    if offset_mv > 0.0 {
        return Err(CodecError::PositiveUndervolt(offset_mv));
    }
    if offset_mv * STEPS_PER_MV < -1024.0 {
        return Err(CodecError::UndervoltOutOfRange(offset_mv));
    }

    let steps = (offset_mv * STEPS_PER_MV).round() as i64;
    let payload = VOLTAGE_OFFSET_MASK & ((steps as u64) << 21);
    Ok(command(CMD_WRITE_VOLTAGE_OFFSET, plane) | payload)
}

/// Voltage offset in mV carried by a mailbox payload
pub fn decode_undervolt(value: u64) -> f64 {
    VOLTAGE_OFFSET.to_units(value)
}

/// Build the mailbox word that requests the current offset of `plane`
pub fn undervolt_read_request(plane: Plane) -> u64 {
    command(CMD_READ_VOLTAGE_OFFSET, plane)
}

/// Build the mailbox word that sets the absolute current limit of `plane`
pub fn encode_iccmax(plane: Plane, amps: f64) -> Result<u64> {
    if !plane.layout().current_control {
        return Err(CodecError::NoCurrentControl(plane.name()));
    }
    if !amps.is_finite() {
        return Err(CodecError::NotFinite { field: "iccmax" });
    }
    if amps <= 0.0 || amps > ICCMAX_LIMIT_AMPS {
        return Err(CodecError::IccMaxOutOfRange(amps));
    }

    let steps = (amps * ICCMAX_STEPS_PER_AMP).round() as u64;
    Ok(command(CMD_WRITE_ICCMAX, plane) | steps)
}

pub fn decode_iccmax(value: u64) -> f64 {
    ICCMAX.to_units(value)
}

pub fn iccmax_read_request(plane: Plane) -> Result<u64> {
    if !plane.layout().current_control {
        return Err(CodecError::NoCurrentControl(plane.name()));
    }
    Ok(command(CMD_READ_ICCMAX, plane))
}
