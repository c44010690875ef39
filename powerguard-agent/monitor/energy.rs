use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use powerguard_raw::current_arch::rapl::{msr, RaplPowerUnit};
use powerguard_raw::RegisterLayout;

use crate::common::RegisterAccess;
use crate::error::Result;
use crate::named_enum;

named_enum! {
    pub enum EnergyPlane {
        Package => "Package",
        Graphics => "Graphics",
        Dram => "DRAM",
    }
}

impl EnergyPlane {
    pub fn msr(&self) -> u64 {
        match self {
            EnergyPlane::Package => msr::MSR_PKG_ENERGY_STATUS,
            EnergyPlane::Graphics => msr::MSR_PP1_ENERGY_STATUS,
            EnergyPlane::Dram => msr::MSR_DRAM_ENERGY_STATUS,
        }
    }
}

/// Energy counters are 32 bits wide and wrap
const COUNTER_MASK: u64 = 0xFFFF_FFFF;

/// Average power between calls, from the RAPL energy status counters
pub struct EnergyMonitor {
    regs: Arc<dyn RegisterAccess>,
    cpu: u32,
    energy_unit: f64,
    last_readings: HashMap<EnergyPlane, u64>,
    last_time: Instant,
}

impl EnergyMonitor {
    pub fn new(regs: Arc<dyn RegisterAccess>) -> Result<Self> {
        let cpu = regs.cpus().first().copied().unwrap_or(0);
        let rapl_unit = RaplPowerUnit::from_msr_value(regs.read_msr(cpu, msr::MSR_RAPL_POWER_UNIT)?);
        let energy_unit = rapl_unit.energy_unit_multiplier();

        let mut monitor = Self {
            regs,
            cpu,
            energy_unit,
            last_readings: HashMap::new(),
            last_time: Instant::now(),
        };
        monitor.last_readings = monitor.read_counters();
        Ok(monitor)
    }

    /// Raw counters; planes the CPU does not implement are left out
    fn read_counters(&self) -> HashMap<EnergyPlane, u64> {
        EnergyPlane::all()
            .into_iter()
            .filter_map(|plane| {
                self.regs
                    .read_msr(self.cpu, plane.msr())
                    .ok()
                    .map(|raw| (plane, raw & COUNTER_MASK))
            })
            .collect()
    }

    fn watts(&self, plane: EnergyPlane, current: u64, seconds: f64) -> Option<f64> {
        let last = *self.last_readings.get(&plane)?;
        let delta = current.wrapping_sub(last) & COUNTER_MASK;
        (seconds > 0.0).then(|| delta as f64 * self.energy_unit / seconds)
    }

    /// Watts per plane since the previous call
    pub fn power(&mut self) -> Vec<(EnergyPlane, f64)> {
        self.power_at(Instant::now())
    }

    fn power_at(&mut self, now: Instant) -> Vec<(EnergyPlane, f64)> {
        let seconds = now.duration_since(self.last_time).as_secs_f64();
        let current = self.read_counters();

        let power = EnergyPlane::all()
            .into_iter()
            .filter_map(|plane| {
                let raw = *current.get(&plane)?;
                self.watts(plane, raw, seconds).map(|w| (plane, w))
            })
            .collect();

        self.last_readings = current;
        self.last_time = now;
        power
    }
}
