// Probe which register features the running CPU actually accepts

use powerguard_raw::current_arch::platform::{PlatformInfo, MSR_PLATFORM_INFO};
use powerguard_raw::current_arch::{hwp, mailbox, thermal};
use powerguard_raw::RegisterLayout;

use crate::common::RegisterAccess;
use crate::config::{CtdpLevel, ProfileSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub undervolt: bool,
    pub hwp: bool,
    pub temperature_target: bool,
    /// Additional cTDP profiles, `None` when the TDP is not programmable
    pub ctdp_profiles: Option<u8>,
    /// TjMax in °C
    pub tj_max: Option<f64>,
}

impl Capabilities {
    pub fn probe(regs: &dyn RegisterAccess, debug: bool) -> Self {
        let cpu = regs.cpus().first().copied().unwrap_or(0);

        let platform = match regs.read_msr(cpu, MSR_PLATFORM_INFO) {
            Ok(value) => PlatformInfo::from_msr_value(value),
            Err(e) => {
                tracing::warn!("Unable to read MSR_PLATFORM_INFO: {}", e);
                PlatformInfo::default()
            }
        };
        if debug {
            for (name, value) in platform.entries() {
                tracing::debug!("cpu platform info: {} = {}", name.replace('_', " "), value);
            }
        }

        tracing::info!("Testing if undervolt is supported...");
        let undervolt = probe_undervolt(regs, cpu);
        if !undervolt {
            tracing::warn!("Undervolt seems not to be supported by your system, disabling");
        }

        tracing::info!("Testing if HWP is supported...");
        let hwp = probe_hwp(regs, cpu);
        if !hwp {
            tracing::warn!("HWP seems not to be supported by your system, disabling");
        }

        let tj_max = regs
            .read_msr(cpu, thermal::msr::MSR_TEMPERATURE_TARGET)
            .ok()
            .map(thermal::decode_tj_max)
            .filter(|t| *t > 0.0);

        let temperature_target = platform.programmable_temperature_target && tj_max.is_some();
        if !temperature_target {
            tracing::warn!("Setting temperature target is not supported by this CPU");
        }

        let ctdp_profiles = platform
            .programmable_tdp_limit
            .then_some(platform.additional_tdp_profiles);

        Self {
            undervolt,
            hwp,
            temperature_target,
            ctdp_profiles,
            tj_max,
        }
    }

    /// Whether `level` can be selected on this CPU
    pub fn supports_ctdp(&self, level: CtdpLevel) -> bool {
        match self.ctdp_profiles {
            Some(profiles) => level.level() <= profiles,
            None => false,
        }
    }

    /// Warn once about configured features the CPU cannot honour
    pub fn report_unsupported(&self, profiles: &ProfileSet) {
        for profile in [&profiles.ac, &profiles.battery] {
            if let Some(level) = profile.ctdp_level {
                if self.ctdp_profiles.is_none() {
                    tracing::warn!("cTDP setting not supported by this CPU");
                } else if !self.supports_ctdp(level) {
                    tracing::warn!("The configured cTDP profile {} is not supported by this CPU", level);
                }
            }
        }
        if profiles.uses_voltage_planes() && !self.undervolt {
            tracing::warn!("Undervolt/IccMax values are configured but will be ignored");
        }
    }

    #[cfg(test)]
    pub fn all() -> Self {
        Self {
            undervolt: true,
            hwp: true,
            temperature_target: true,
            ctdp_profiles: Some(2),
            tj_max: Some(100.0),
        }
    }
}

/// A CORE offset read through the mailbox succeeds
fn probe_undervolt(regs: &dyn RegisterAccess, cpu: u32) -> bool {
    let request = mailbox::undervolt_read_request(mailbox::Plane::Core);
    regs.write_msr(cpu, mailbox::MSR_OC_MAILBOX, request)
        .and_then(|_| regs.read_msr(cpu, mailbox::MSR_OC_MAILBOX))
        .is_ok()
}

/// The HWP request register can be read and written back unchanged
fn probe_hwp(regs: &dyn RegisterAccess, cpu: u32) -> bool {
    regs.read_msr(cpu, hwp::IA32_HWP_REQUEST)
        .and_then(|value| regs.write_msr(cpu, hwp::IA32_HWP_REQUEST, value))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRegisters;

    #[test]
    fn test_probe_reads_platform_features() {
        let regs = FakeRegisters::client();
        let caps = Capabilities::probe(&regs, true);

        assert!(caps.undervolt);
        assert!(caps.hwp);
        assert!(caps.temperature_target);
        assert_eq!(caps.tj_max, Some(100.0));
        assert_eq!(caps.ctdp_profiles, Some(2));
        assert!(caps.supports_ctdp(CtdpLevel::Up));
    }

    #[test]
    fn test_probe_degrades_missing_features() {
        let regs = FakeRegisters::client();
        regs.remove(hwp::IA32_HWP_REQUEST);
        regs.remove(mailbox::MSR_OC_MAILBOX);
        regs.set(MSR_PLATFORM_INFO, 0);

        let caps = Capabilities::probe(&regs, false);
        assert!(!caps.undervolt);
        assert!(!caps.hwp);
        assert!(!caps.temperature_target);
        assert_eq!(caps.ctdp_profiles, None);
        assert!(!caps.supports_ctdp(CtdpLevel::Nominal));
    }
}
