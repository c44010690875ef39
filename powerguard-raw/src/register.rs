//! Generic register abstractions for type-safe MSR and MCHBAR programming

/// How a register is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Model-specific register, addressed by index through `/dev/cpu/*/msr`
    Msr,
    /// Memory-mapped chipset register, addressed by offset from MCHBAR
    Mmio,
}

/// A hardware register identity
///
/// Identity is the `(kind, address)` pair; `name` is only used for logging.
/// All registers handled here are 64 bits wide. MMIO registers are accessed
/// as two consecutive 32-bit halves.
#[derive(Debug, Clone, Copy)]
pub struct Register {
    pub name: &'static str,
    pub kind: RegisterKind,
    pub address: u64,
}

impl Register {
    pub const fn msr(name: &'static str, address: u64) -> Self {
        Self {
            name,
            kind: RegisterKind::Msr,
            address,
        }
    }

    pub const fn mmio(name: &'static str, offset: u64) -> Self {
        Self {
            name,
            kind: RegisterKind::Mmio,
            address: offset,
        }
    }
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.address == other.address
    }
}

impl Eq for Register {}

impl std::hash::Hash for Register {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.address.hash(state);
    }
}

/// Physical unit carried by a register field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Raw,
    Watts,
    Seconds,
    Millivolts,
    Amps,
    Celsius,
}

/// Layout of a single bit-field inside a 64-bit register
///
/// `preserve_other_bits` marks fields that share their register with unrelated
/// hardware state: writing them must go through [`FieldSpec::insert`] on the
/// current register content, never through a blind write.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: u32,
    pub width: u32,
    pub scale: f64,
    pub unit: Unit,
    pub signed: bool,
    pub preserve_other_bits: bool,
}

impl FieldSpec {
    /// A raw, unsigned flag or counter field
    pub const fn bits(name: &'static str, offset: u32, width: u32) -> Self {
        Self {
            name,
            offset,
            width,
            scale: 1.0,
            unit: Unit::Raw,
            signed: false,
            preserve_other_bits: false,
        }
    }

    /// Mask of the field, already shifted into position
    pub const fn mask(&self) -> u64 {
        let low = if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        };
        low << self.offset
    }

    /// Largest raw value the field can hold
    pub const fn max_raw(&self) -> u64 {
        self.mask() >> self.offset
    }

    pub fn extract(&self, value: u64) -> u64 {
        (value & self.mask()) >> self.offset
    }

    pub fn extract_signed(&self, value: u64) -> i64 {
        let raw = self.extract(value);
        if self.width == 0 || self.width >= 64 {
            return raw as i64;
        }
        let sign = 1u64 << (self.width - 1);
        if raw & sign != 0 {
            raw as i64 - (1i64 << self.width)
        } else {
            raw as i64
        }
    }

    pub fn is_set(&self, value: u64) -> bool {
        self.extract(value) != 0
    }

    /// Replace the field inside `register` with `field`, keeping every other bit
    pub fn insert(&self, register: u64, field: u64) -> u64 {
        (register & !self.mask()) | ((field << self.offset) & self.mask())
    }

    /// Decode the field into its physical unit
    pub fn to_units(&self, value: u64) -> f64 {
        if self.signed {
            self.extract_signed(value) as f64 * self.scale
        } else {
            self.extract(value) as f64 * self.scale
        }
    }
}

/// Trait for register layouts that can be converted to/from raw MSR values
///
/// This trait provides type-safe conversion between structured register
/// layouts and the raw 64-bit values that are written to/read from MSRs.
pub trait RegisterLayout: Sized {
    /// Convert this register layout to a raw MSR value
    fn to_msr_value(&self) -> u64;

    /// Parse a raw MSR value into this register layout
    fn from_msr_value(value: u64) -> Self;

    /// Validate that the register values are within acceptable ranges
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_insert_preserves_other_bits() {
        let field = FieldSpec::bits("offset", 24, 6);
        let register = 0xC000_0000_0064_1234u64;
        let written = field.insert(register, 0x3F);

        assert_eq!(field.extract(written), 0x3F);
        assert_eq!(written & !field.mask(), register & !field.mask());
    }

    #[test]
    fn test_field_signed_extract() {
        let field = FieldSpec::bits("offset", 21, 11);
        let value = 0x7FFu64 << 21;
        assert_eq!(field.extract_signed(value), -1);
        assert_eq!(field.extract_signed(0x3FF << 21), 0x3FF);
    }

    #[test]
    fn test_register_identity_ignores_name() {
        let a = Register::msr("A", 0x610);
        let b = Register::msr("B", 0x610);
        let c = Register::mmio("A", 0x610);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
