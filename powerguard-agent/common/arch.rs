// CPU model detection and per-model platform details

use once_cell::sync::Lazy;

use crate::common::cpuid::{self, CpuSignature};
use crate::error::{PowerguardError, Result};

const INTEL_VENDOR: &str = "GenuineIntel";

/// MCHBAR base used by Tiger Lake and Alder Lake
const MCHBAR_BASE_TGL_ADL: u64 = 0xFEDC_0000;
/// MCHBAR base used by earlier client parts
const MCHBAR_BASE_DEFAULT: u64 = 0xFED1_0000;

/// Supported Intel client models (family 6), keyed by display model
static SUPPORTED_MODELS: Lazy<Vec<(u32, &'static str)>> = Lazy::new(|| {
    vec![
        (0x3C, "Haswell-DT"),
        (0x3D, "Broadwell-U"),
        (0x45, "Haswell-ULT"),
        (0x46, "Crystal Well-DT"),
        (0x47, "Broadwell-H"),
        (0x4E, "Skylake"),
        (0x5E, "Skylake-S"),
        (0x66, "Cannon Lake-U"),
        (0x7E, "Ice Lake"),
        (0x8A, "Lakefield"),
        (0x8C, "Tiger Lake-U"),
        (0x8D, "Tiger Lake-H"),
        (0x8E, "Kaby Lake / Whiskey Lake / Comet Lake-U"),
        (0x97, "Alder Lake-S"),
        (0x9A, "Alder Lake-P"),
        (0x9C, "Jasper Lake"),
        (0x9E, "Kaby Lake-G / Coffee Lake"),
        (0xA5, "Comet Lake"),
        (0xA6, "Comet Lake"),
        (0xA7, "Rocket Lake"),
        (0xAA, "Meteor Lake"),
        (0xB7, "Raptor Lake-HX"),
        (0xBA, "Raptor Lake"),
        (0xBF, "Raptor Lake-S"),
    ]
});

/// Models whose MCHBAR sits at the Tiger Lake / Alder Lake address
const TGL_ADL_MODELS: [u32; 4] = [0x8C, 0x8D, 0x97, 0x9A];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuModel {
    pub signature: CpuSignature,
    pub name: &'static str,
}

impl CpuModel {
    /// Identify the running CPU, failing on non-Intel or unlisted models
    pub fn detect() -> Result<Self> {
        let vendor = cpuid::vendor();
        let signature = CpuSignature::current();
        tracing::info!("CPU: {} {}", vendor, signature);
        Self::identify(&vendor, signature)
    }

    pub fn identify(vendor: &str, signature: CpuSignature) -> Result<Self> {
        if vendor != INTEL_VENDOR {
            return Err(PowerguardError::UnsupportedCpu(format!(
                "vendor {vendor} is not {INTEL_VENDOR}"
            )));
        }

        if signature.family != 6 {
            return Err(PowerguardError::UnsupportedCpu(format!(
                "{signature} is not an Intel client part"
            )));
        }

        let name = SUPPORTED_MODELS
            .iter()
            .find(|(model, _)| *model == signature.model)
            .map(|(_, name)| *name)
            .ok_or_else(|| {
                PowerguardError::UnsupportedCpu(format!(
                    "{signature} is not in the list of supported models"
                ))
            })?;

        tracing::info!("Detected CPU architecture: Intel {}", name);
        Ok(Self { signature, name })
    }

    /// Best guess for the MCHBAR base when PCI config space is unreadable
    pub fn guess_mchbar_base(signature: Option<CpuSignature>) -> u64 {
        match signature {
            Some(sig) if sig.family == 6 && TGL_ADL_MODELS.contains(&sig.model) => {
                MCHBAR_BASE_TGL_ADL
            }
            _ => MCHBAR_BASE_DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(model: u32) -> CpuSignature {
        CpuSignature {
            family: 6,
            model,
            stepping: 1,
        }
    }

    #[test]
    fn test_identify_supported_model() {
        let cpu = CpuModel::identify("GenuineIntel", sig(0x8C)).unwrap();
        assert_eq!(cpu.name, "Tiger Lake-U");
    }

    #[test]
    fn test_identify_rejects_other_vendors_and_models() {
        assert!(matches!(
            CpuModel::identify("AuthenticAMD", sig(0x8C)),
            Err(PowerguardError::UnsupportedCpu(_))
        ));
        assert!(matches!(
            CpuModel::identify("GenuineIntel", sig(0x55)),
            Err(PowerguardError::UnsupportedCpu(_))
        ));
    }

    #[test]
    fn test_mchbar_guess() {
        assert_eq!(CpuModel::guess_mchbar_base(Some(sig(0x9A))), 0xFEDC_0000);
        assert_eq!(CpuModel::guess_mchbar_base(Some(sig(0x8E))), 0xFED1_0000);
        assert_eq!(CpuModel::guess_mchbar_base(None), 0xFED1_0000);
    }
}
