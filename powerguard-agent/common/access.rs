use powerguard_raw::current_arch::platform::MCHBAR_WINDOW_SIZE;

use crate::common::arch::CpuModel;
use crate::common::cpuid::CpuSignature;
use crate::common::mmio::MmioMapping;
use crate::common::msr::{self, Msr};
use crate::common::pci;
use crate::error::{PowerguardError, Result};

const CPU_ONLINE: &str = "/sys/devices/system/cpu/online";

/// Privileged register I/O used by the control loop
///
/// MSR operations address one logical CPU; MCHBAR operations address an
/// offset inside the mapped chipset window and move 64 bits as two 32-bit
/// halves. Nothing here retries: the caller owns retry policy.
pub trait RegisterAccess: Send + Sync {
    fn cpus(&self) -> &[u32];

    fn read_msr(&self, cpu: u32, address: u64) -> Result<u64>;

    fn write_msr(&self, cpu: u32, address: u64, value: u64) -> Result<()>;

    /// Write the same value on every online CPU
    fn write_msr_all(&self, address: u64, value: u64) -> Result<()> {
        for &cpu in self.cpus() {
            self.write_msr(cpu, address, value)?;
        }
        Ok(())
    }

    fn has_mchbar(&self) -> bool;

    fn read_mchbar(&self, offset: u64) -> Result<u64>;

    fn write_mchbar(&self, offset: u64, value: u64) -> Result<()>;
}

/// The real register file: `/dev/cpu/*/msr` plus a `/dev/mem` MCHBAR window
pub struct Platform {
    msr: Msr,
    mchbar: Option<MmioMapping>,
}

impl Platform {
    /// Acquire every privileged handle
    ///
    /// MSR failures are returned as errors. A missing MCHBAR mapping only
    /// degrades power limit enforcement to the MSR copy.
    pub fn open(signature: Option<CpuSignature>) -> Result<Self> {
        msr::allow_writes();

        let cpus = online_cpus();
        let msr = Msr::open(&cpus)?;

        let mchbar = match map_mchbar(signature) {
            Ok(mapping) => Some(mapping),
            Err(e @ PowerguardError::Privilege { .. }) | Err(e @ PowerguardError::Mmio(_)) => {
                tracing::warn!("Unable to map MCHBAR: {}. TDP override might not work correctly", e);
                tracing::warn!("Try to disable Secure Boot and/or enable CONFIG_DEVMEM in the kernel");
                None
            }
            Err(e) => {
                tracing::warn!("Unable to map MCHBAR: {}", e);
                None
            }
        };

        Ok(Self { msr, mchbar })
    }

    fn mapping(&self) -> Result<&MmioMapping> {
        self.mchbar
            .as_ref()
            .ok_or_else(|| PowerguardError::Mmio("MCHBAR is not mapped".to_string()))
    }
}

impl RegisterAccess for Platform {
    fn cpus(&self) -> &[u32] {
        self.msr.cpus()
    }

    fn read_msr(&self, cpu: u32, address: u64) -> Result<u64> {
        self.msr.read(cpu, address)
    }

    fn write_msr(&self, cpu: u32, address: u64, value: u64) -> Result<()> {
        self.msr.write(cpu, address, value)
    }

    fn has_mchbar(&self) -> bool {
        self.mchbar.is_some()
    }

    fn read_mchbar(&self, offset: u64) -> Result<u64> {
        let mapping = self.mapping()?;
        let offset = offset as usize;
        let low = mapping.read32(offset)? as u64;
        let high = mapping.read32(offset + 4)? as u64;
        Ok(low | (high << 32))
    }

    fn write_mchbar(&self, offset: u64, value: u64) -> Result<()> {
        let mapping = self.mapping()?;
        let offset = offset as usize;
        mapping.write32(offset, (value & 0xFFFF_FFFF) as u32)?;
        mapping.write32(offset + 4, (value >> 32) as u32)
    }
}

fn map_mchbar(signature: Option<CpuSignature>) -> Result<MmioMapping> {
    let base = match pci::read_mchbar_base() {
        Ok(base) => base,
        Err(e) => {
            let guess = CpuModel::guess_mchbar_base(signature);
            tracing::warn!("{}", e);
            tracing::warn!(
                "Guessing the MCHBAR address from CPUID: 0x{:X}. This might not work",
                guess
            );
            guess
        }
    };
    tracing::info!("MCHBAR base 0x{:X}", base);
    MmioMapping::map(base, MCHBAR_WINDOW_SIZE)
}

/// Online logical CPUs from sysfs, CPU 0 alone if unreadable
pub fn online_cpus() -> Vec<u32> {
    std::fs::read_to_string(CPU_ONLINE)
        .ok()
        .and_then(|s| parse_cpu_list(&s))
        .unwrap_or_else(|| {
            tracing::warn!("Failed to detect online CPUs, using CPU 0 only");
            vec![0]
        })
}

/// Parse a CPU list like "0-3,8-11"
fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.parse().ok()?;
            let end: u32 = end.parse().ok()?;
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse().ok()?);
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8-9\n"), Some(vec![0, 1, 2, 3, 8, 9]));
        assert_eq!(parse_cpu_list("0"), Some(vec![0]));
        assert_eq!(parse_cpu_list("0-x"), None);
    }
}
