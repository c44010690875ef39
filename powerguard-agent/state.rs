//! Owned daemon state threaded through the control loop

use std::time::{Instant, SystemTime};

use crate::config::ProfileSet;
use crate::events::HwpHint;
use crate::named_enum;
use crate::orchestrator::capabilities::Capabilities;
use crate::power::PowerSource;

named_enum! {
    pub enum ControlState {
        Init => "INIT",
        Running => "RUNNING",
        Reloading => "RELOADING",
        Stopped => "STOPPED",
    }
}

/// Mailbox words last written for a power source
///
/// A tick only rewrites the voltage planes when the target differs from
/// this or a forced reapply is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFingerprint {
    pub source: PowerSource,
    pub words: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct HwpState {
    /// Latest hint requested by the load monitor
    pub hint: HwpHint,
    /// Hint last written, if auto mode is active
    pub applied: Option<HwpHint>,
    pub last_write: Option<Instant>,
}

impl Default for HwpState {
    fn default() -> Self {
        Self {
            hint: HwpHint::Default,
            applied: None,
            last_write: None,
        }
    }
}

#[derive(Debug)]
pub struct DaemonState {
    pub control: ControlState,
    pub profiles: ProfileSet,
    pub capabilities: Capabilities,
    /// Source selected on the last tick
    pub source: Option<PowerSource>,
    pub applied: Option<AppliedFingerprint>,
    /// Set by a resume event, cleared once the voltage planes are rewritten
    pub force_reapply: bool,
    /// Profile source marker seen at the last (re)load
    pub config_marker: Option<SystemTime>,
    pub hwp: HwpState,
}

impl DaemonState {
    pub fn new(
        profiles: ProfileSet,
        capabilities: Capabilities,
        config_marker: Option<SystemTime>,
    ) -> Self {
        Self {
            control: ControlState::Init,
            profiles,
            capabilities,
            source: None,
            applied: None,
            force_reapply: false,
            config_marker,
            hwp: HwpState::default(),
        }
    }

    /// Does the fingerprint differ from `target`, or is a reapply forced?
    pub fn needs_voltage_write(&self, target: &AppliedFingerprint) -> bool {
        self.force_reapply || self.applied.as_ref() != Some(target)
    }

    pub fn record_voltage_write(&mut self, target: AppliedFingerprint) {
        self.applied = Some(target);
        self.force_reapply = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    fn state() -> DaemonState {
        let profiles = ProfileSet::parse(SAMPLE).unwrap();
        DaemonState::new(profiles, Capabilities::all(), None)
    }

    #[test]
    fn test_fingerprint_suppresses_rewrites() {
        let mut state = state();
        let target = AppliedFingerprint {
            source: PowerSource::Ac,
            words: vec![0x8000_0011_F340_0000],
        };

        assert!(state.needs_voltage_write(&target));
        state.record_voltage_write(target.clone());
        assert!(!state.needs_voltage_write(&target));

        state.force_reapply = true;
        assert!(state.needs_voltage_write(&target));
        state.record_voltage_write(target.clone());
        assert!(!state.force_reapply);

        let battery = AppliedFingerprint {
            source: PowerSource::Battery,
            ..target
        };
        assert!(state.needs_voltage_write(&battery));
    }

    #[test]
    fn test_initial_state() {
        let state = state();
        assert_eq!(state.control, ControlState::Init);
        assert_eq!(state.control.name(), "INIT");
        assert_eq!(state.hwp.hint, HwpHint::Default);
    }
}
