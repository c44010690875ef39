//! Messages posted to the control loop by its producers

use tokio::sync::oneshot;

use powerguard_raw::current_arch::hwp::{EPP_DEFAULT, EPP_PERFORMANCE};
use powerguard_raw::current_arch::mailbox::Plane;

use crate::enum_with_data;

enum_with_data! {
    /// Energy/performance preference requested by the load monitor
    pub enum HwpHint: u8 {
        Performance => ("performance", EPP_PERFORMANCE),
        Default => ("default", EPP_DEFAULT),
    }
    impl epp -> u8
}

/// Current voltage plane settings as read through the mailbox
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoltageReport {
    /// Offsets in mV, empty when undervolt is unsupported
    pub undervolt: Vec<(Plane, f64)>,
    /// Limits in A
    pub iccmax: Vec<(Plane, f64)>,
}

impl VoltageReport {
    pub fn undervolt_line(&self) -> String {
        self.undervolt
            .iter()
            .map(|(plane, mv)| format!("{plane}: {mv:.2} mV"))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn iccmax_line(&self) -> String {
        self.iccmax
            .iter()
            .map(|(plane, amps)| format!("{plane}: {amps:.2} A"))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[derive(Debug)]
pub enum ControlEvent {
    /// Re-read the profile source regardless of its modification marker
    Reload,
    /// The system woke up; voltage planes must be rewritten
    Resume,
    /// Load crossed a threshold
    Load(HwpHint),
    /// Read the voltage planes on behalf of the monitor view
    QueryVoltages(oneshot::Sender<VoltageReport>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_values() {
        assert_eq!(HwpHint::Performance.epp(), 0x20);
        assert_eq!(HwpHint::Default.epp(), 0x80);
        assert_eq!(HwpHint::all().len(), 2);
    }

    #[test]
    fn test_report_lines() {
        let report = VoltageReport {
            undervolt: vec![(Plane::Core, -99.6), (Plane::Gpu, 0.0)],
            iccmax: vec![(Plane::Core, 64.0)],
        };
        assert_eq!(report.undervolt_line(), "CORE: -99.60 mV | GPU: 0.00 mV");
        assert_eq!(report.iccmax_line(), "CORE: 64.00 A");
    }
}
