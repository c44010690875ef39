//! In-memory register file for unit tests

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use powerguard_raw::current_arch::mailbox::{
    MailboxCommand, Plane, ICCMAX_MASK, MSR_OC_MAILBOX, VOLTAGE_OFFSET_MASK,
};
use powerguard_raw::current_arch::{hwp, platform, rapl, thermal};

use crate::common::RegisterAccess;
use crate::error::{PowerguardError, Result};

/// Sticky log bits of `IA32_THERM_STATUS`
const THERM_LOG_BITS: u64 = 0xAAAA;

/// Package-scoped fake: every CPU sees the same register values
///
/// Writes are recorded per CPU. The OC mailbox answers read commands with the
/// last value written for the plane, and "stuck" registers silently drop
/// writes so read-back verification fails.
pub struct FakeRegisters {
    cpus: Vec<u32>,
    msrs: Mutex<HashMap<u64, u64>>,
    mchbar: Option<Mutex<HashMap<u64, u64>>>,
    stuck: Mutex<HashSet<u64>>,
    stuck_mchbar: Mutex<HashSet<u64>>,
    writes: Mutex<Vec<(u32, u64, u64)>>,
    planes: Mutex<HashMap<(u8, Plane), u32>>,
}

impl FakeRegisters {
    pub fn new(cpus: Vec<u32>, with_mchbar: bool) -> Self {
        Self {
            cpus,
            msrs: Mutex::new(HashMap::new()),
            mchbar: with_mchbar.then(|| Mutex::new(HashMap::new())),
            stuck: Mutex::new(HashSet::new()),
            stuck_mchbar: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            planes: Mutex::new(HashMap::new()),
        }
    }

    /// Four CPUs of a Kaby Lake R class laptop
    pub fn client() -> Self {
        let regs = Self::new(vec![0, 1, 2, 3], true);
        regs.set(rapl::msr::MSR_RAPL_POWER_UNIT, 0x000A_0E03);
        // PL1 25 W / 28 s, PL2 44 W / 2.44 ms
        regs.set(rapl::msr::MSR_PKG_POWER_LIMIT, 0x0042_8160_00DC_80C8);
        regs.set(rapl::msr::MSR_PKG_ENERGY_STATUS, 0);
        regs.set(rapl::msr::MSR_PP1_ENERGY_STATUS, 0);
        regs.set(rapl::msr::MSR_DRAM_ENERGY_STATUS, 0);
        regs.set(thermal::msr::MSR_TEMPERATURE_TARGET, 0x0064_0000);
        regs.set(thermal::msr::IA32_THERM_STATUS, 0x8832_0000);
        regs.set(thermal::msr::IA32_PERF_STATUS, 0x1B33u64 << 32);
        regs.set(thermal::msr::MSR_POWER_CTL, 0x0024_005F);
        regs.set(
            platform::MSR_PLATFORM_INFO,
            (18 << 8) | (1 << 29) | (1 << 30) | (2 << 33),
        );
        regs.set(platform::MSR_CONFIG_TDP_CONTROL, 0);
        regs.set(hwp::IA32_HWP_REQUEST, 0x8000_FF01);
        regs.set(MSR_OC_MAILBOX, 0);
        regs
    }

    pub fn set(&self, address: u64, value: u64) {
        self.msrs.lock().insert(address, value);
    }

    pub fn get(&self, address: u64) -> Option<u64> {
        self.msrs.lock().get(&address).copied()
    }

    /// Make the register unreadable and unwritable
    pub fn remove(&self, address: u64) {
        self.msrs.lock().remove(&address);
    }

    /// Drop every future write to `address`
    pub fn stick(&self, address: u64) {
        self.stuck.lock().insert(address);
    }

    /// Drop every future write to the MCHBAR `offset`
    pub fn stick_mchbar(&self, offset: u64) {
        self.stuck_mchbar.lock().insert(offset);
    }

    pub fn mchbar_value(&self, offset: u64) -> Option<u64> {
        self.mchbar
            .as_ref()
            .and_then(|m| m.lock().get(&offset).copied())
    }

    /// Values written to `address`, one entry per CPU and write
    pub fn writes_to(&self, address: u64) -> Vec<u64> {
        self.writes
            .lock()
            .iter()
            .filter(|(_, a, _)| *a == address)
            .map(|(_, _, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    fn mailbox(&self, value: u64) -> u64 {
        let cmd = MailboxCommand::decode(value);
        let Some(plane) = cmd.plane else {
            return 0;
        };
        let mut planes = self.planes.lock();
        let stuck = self.stuck.lock().contains(&MSR_OC_MAILBOX);

        let response = match cmd.command {
            MailboxCommand::WRITE_VOLTAGE_OFFSET | MailboxCommand::WRITE_ICCMAX => {
                let (key, mask) = if cmd.command == MailboxCommand::WRITE_VOLTAGE_OFFSET {
                    (MailboxCommand::READ_VOLTAGE_OFFSET, VOLTAGE_OFFSET_MASK)
                } else {
                    (MailboxCommand::READ_ICCMAX, ICCMAX_MASK)
                };
                if !stuck {
                    planes.insert((key, plane), cmd.data & mask as u32);
                }
                0
            }
            MailboxCommand::READ_VOLTAGE_OFFSET | MailboxCommand::READ_ICCMAX => {
                planes.get(&(cmd.command, plane)).copied().unwrap_or(0)
            }
            _ => 0,
        };
        response as u64
    }
}

impl RegisterAccess for FakeRegisters {
    fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    fn read_msr(&self, cpu: u32, address: u64) -> Result<u64> {
        if !self.cpus.contains(&cpu) {
            return Err(PowerguardError::Msr(format!("No MSR handle for CPU {cpu}")));
        }
        self.get(address).ok_or_else(|| {
            PowerguardError::Msr(format!("Failed to read MSR 0x{address:X} on CPU {cpu}"))
        })
    }

    fn write_msr(&self, cpu: u32, address: u64, value: u64) -> Result<()> {
        let current = self.read_msr(cpu, address).map_err(|_| {
            PowerguardError::Msr(format!("Failed to write MSR 0x{address:X} on CPU {cpu}"))
        })?;
        self.writes.lock().push((cpu, address, value));

        if address == MSR_OC_MAILBOX {
            let response = self.mailbox(value);
            self.set(address, response);
            return Ok(());
        }
        if self.stuck.lock().contains(&address) {
            return Ok(());
        }

        let stored = if address == thermal::msr::IA32_THERM_STATUS {
            (current & !THERM_LOG_BITS) | (current & value & THERM_LOG_BITS)
        } else {
            value
        };
        self.set(address, stored);
        Ok(())
    }

    fn has_mchbar(&self) -> bool {
        self.mchbar.is_some()
    }

    fn read_mchbar(&self, offset: u64) -> Result<u64> {
        let mchbar = self
            .mchbar
            .as_ref()
            .ok_or_else(|| PowerguardError::Mmio("MCHBAR is not mapped".to_string()))?;
        Ok(mchbar.lock().get(&offset).copied().unwrap_or(0))
    }

    fn write_mchbar(&self, offset: u64, value: u64) -> Result<()> {
        let mchbar = self
            .mchbar
            .as_ref()
            .ok_or_else(|| PowerguardError::Mmio("MCHBAR is not mapped".to_string()))?;
        if !self.stuck_mchbar.lock().contains(&offset) {
            mchbar.lock().insert(offset, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerguard_raw::current_arch::mailbox;

    #[test]
    fn test_mailbox_emulation() {
        let regs = FakeRegisters::client();
        let word = mailbox::encode_undervolt(Plane::Cache, -80.0).unwrap();
        regs.write_msr(0, MSR_OC_MAILBOX, word).unwrap();
        regs.write_msr(0, MSR_OC_MAILBOX, mailbox::undervolt_read_request(Plane::Cache))
            .unwrap();

        let read = regs.read_msr(0, MSR_OC_MAILBOX).unwrap();
        assert_eq!(read & VOLTAGE_OFFSET_MASK, word & VOLTAGE_OFFSET_MASK);
        assert!((mailbox::decode_undervolt(read) + 80.0).abs() <= 1.0);
    }

    #[test]
    fn test_stuck_register_keeps_value() {
        let regs = FakeRegisters::client();
        regs.stick(rapl::msr::MSR_PKG_POWER_LIMIT);
        regs.write_msr_all(rapl::msr::MSR_PKG_POWER_LIMIT, 0).unwrap();

        assert_eq!(regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).len(), 4);
        assert_eq!(
            regs.get(rapl::msr::MSR_PKG_POWER_LIMIT),
            Some(0x0042_8160_00DC_80C8)
        );
    }
}
