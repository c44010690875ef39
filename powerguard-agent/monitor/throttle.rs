// Read-only decoding of per-core throttling reasons

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};

use powerguard_raw::current_arch::thermal::{msr::IA32_THERM_STATUS, ThermalStatus, ThrottleFlags};
use powerguard_raw::RegisterLayout;

use crate::common::RegisterAccess;
use crate::error::Result;
use crate::named_enum;

named_enum! {
    pub enum ThrottleCause {
        Thermal => "Thermal",
        CurrentLimit => "Current",
        PowerLimit => "Power",
        CrossDomain => "Cross-domain (e.g. GPU)",
        None => "None",
    }
}

impl ThrottleCause {
    /// Highest-priority cause among `flags`
    pub fn dominant(flags: &ThrottleFlags) -> Self {
        if flags.thermal {
            ThrottleCause::Thermal
        } else if flags.current_limit {
            ThrottleCause::CurrentLimit
        } else if flags.power_limit {
            ThrottleCause::PowerLimit
        } else if flags.cross_domain {
            ThrottleCause::CrossDomain
        } else {
            ThrottleCause::None
        }
    }

    /// Whether this cause is active in `flags`
    pub fn is_active(&self, flags: &ThrottleFlags) -> bool {
        match self {
            ThrottleCause::Thermal => flags.thermal,
            ThrottleCause::CurrentLimit => flags.current_limit,
            ThrottleCause::PowerLimit => flags.power_limit,
            ThrottleCause::CrossDomain => flags.cross_domain,
            ThrottleCause::None => !flags.any(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSnapshot {
    pub cpu: u32,
    pub status: ThermalStatus,
    pub temperature_c: Option<f64>,
}

impl ThrottleSnapshot {
    pub fn decode(cpu: u32, value: u64, tj_max: Option<f64>) -> Self {
        let status = ThermalStatus::from_msr_value(value);
        Self {
            cpu,
            status,
            temperature_c: tj_max.and_then(|t| status.temperature_c(t)),
        }
    }

    /// Dominant cause among the instantaneous status bits
    pub fn dominant_cause(&self) -> ThrottleCause {
        ThrottleCause::dominant(&self.status.current)
    }

    /// Dominant cause among events logged since the last clear
    pub fn dominant_logged_cause(&self) -> ThrottleCause {
        ThrottleCause::dominant(&self.status.sticky)
    }
}

/// Samples `IA32_THERM_STATUS` without ever writing it
pub struct ThrottleMonitor {
    regs: Arc<dyn RegisterAccess>,
    cpus: Vec<u32>,
    tj_max: Option<f64>,
}

impl ThrottleMonitor {
    pub fn new(regs: Arc<dyn RegisterAccess>, cpus: Vec<u32>, tj_max: Option<f64>) -> Self {
        Self { regs, cpus, tj_max }
    }

    pub fn sample(&self) -> Result<Vec<ThrottleSnapshot>> {
        self.cpus
            .iter()
            .map(|&cpu| {
                let value = self.regs.read_msr(cpu, IA32_THERM_STATUS)?;
                Ok(ThrottleSnapshot::decode(cpu, value, self.tj_max))
            })
            .collect()
    }

    /// Snapshots every `interval`, the first one immediately
    ///
    /// The stream is lazy; calling this again starts a fresh sequence.
    pub fn snapshots(
        &self,
        interval: Duration,
    ) -> impl Stream<Item = Result<Vec<ThrottleSnapshot>>> + '_ {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stream::unfold(ticker, move |mut ticker| async move {
            ticker.tick().await;
            Some((self.sample(), ticker))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    use crate::test_utils::FakeRegisters;

    #[test]
    fn test_power_limit_status_and_log() {
        // power limit status (bit 10) and log (bit 11) only
        let snapshot = ThrottleSnapshot::decode(0, 0xC00, Some(100.0));

        assert_eq!(snapshot.dominant_cause(), ThrottleCause::PowerLimit);
        assert!(snapshot.status.current.power_limit);
        assert!(snapshot.status.sticky.power_limit);
        assert!(!snapshot.status.current.thermal);
        assert_eq!(snapshot.temperature_c, None);
    }

    #[test]
    fn test_sticky_reported_separately() {
        // thermal log (bit 1) and current limit status (bit 12)
        let snapshot = ThrottleSnapshot::decode(2, 0x1002, None);

        assert_eq!(snapshot.dominant_cause(), ThrottleCause::CurrentLimit);
        assert_eq!(snapshot.dominant_logged_cause(), ThrottleCause::Thermal);
        assert!(!snapshot.status.current.thermal);
    }

    #[test]
    fn test_cause_priority() {
        let flags = ThrottleFlags {
            thermal: true,
            power_limit: true,
            current_limit: true,
            cross_domain: true,
            ..Default::default()
        };
        assert_eq!(ThrottleCause::dominant(&flags), ThrottleCause::Thermal);
        assert_eq!(
            ThrottleCause::dominant(&ThrottleFlags::default()),
            ThrottleCause::None
        );
        assert!(ThrottleCause::None.is_active(&ThrottleFlags::default()));
        assert!(!ThrottleCause::PowerLimit.is_active(&ThrottleFlags::default()));
    }

    #[tokio::test]
    async fn test_snapshot_stream_is_read_only() {
        let regs = Arc::new(FakeRegisters::client());
        regs.set(IA32_THERM_STATUS, 0x8832_0C00);
        let monitor = ThrottleMonitor::new(regs.clone(), vec![0, 1], Some(100.0));

        let batches: Vec<_> = monitor
            .snapshots(Duration::from_millis(1))
            .take(2)
            .collect()
            .await;

        assert_eq!(batches.len(), 2);
        let first = batches[0].as_ref().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].cpu, 1);
        assert_eq!(first[0].temperature_c, Some(50.0));
        assert!(regs.writes_to(IA32_THERM_STATUS).is_empty());
    }
}
