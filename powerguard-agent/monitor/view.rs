// Foreground status display for --monitor

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use powerguard_raw::current_arch::thermal::{self, ThrottleFlags};

use super::energy::{EnergyMonitor, EnergyPlane};
use super::throttle::{ThrottleCause, ThrottleMonitor};
use crate::common::RegisterAccess;
use crate::events::ControlEvent;
use crate::power::PowerSource;

/// Shortest accepted refresh interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

const CAUSES: [ThrottleCause; 4] = [
    ThrottleCause::Thermal,
    ThrottleCause::PowerLimit,
    ThrottleCause::CurrentLimit,
    ThrottleCause::CrossDomain,
];

pub fn status_line(
    source: Option<PowerSource>,
    flags: &ThrottleFlags,
    vcore_mv: Option<f64>,
    power: &[(EnergyPlane, f64)],
) -> String {
    let source = source.map_or("?", |s| s.name());
    let causes = CAUSES
        .iter()
        .map(|cause| {
            let state = if cause.is_active(flags) { "LIM" } else { "OK" };
            format!("{cause}: {state}")
        })
        .collect::<Vec<_>>()
        .join(" - ");

    let mut readings = Vec::with_capacity(power.len() + 2);
    if let Some(mv) = vcore_mv {
        readings.push(format!("VCore: {mv:.0} mV"));
    }
    readings.extend(power.iter().map(|(plane, w)| format!("{plane}: {w:.1} W")));
    if !power.is_empty() {
        let total: f64 = power.iter().map(|(_, w)| w).sum();
        readings.push(format!("Total: {total:.1} W"));
    }

    format!("[{source}] {causes} || {}", readings.join(" - "))
}

pub struct MonitorView {
    regs: Arc<dyn RegisterAccess>,
    throttle: ThrottleMonitor,
    energy: Option<EnergyMonitor>,
    source: watch::Receiver<Option<PowerSource>>,
    events: mpsc::Sender<ControlEvent>,
    interval: Duration,
    /// Emit status lines through tracing instead of redrawing the terminal
    to_log: bool,
}

impl MonitorView {
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        tj_max: Option<f64>,
        source: watch::Receiver<Option<PowerSource>>,
        events: mpsc::Sender<ControlEvent>,
        interval: Duration,
        to_log: bool,
    ) -> Self {
        let cpu = regs.cpus().first().copied().unwrap_or(0);
        let throttle = ThrottleMonitor::new(regs.clone(), vec![cpu], tj_max);
        let energy = match EnergyMonitor::new(regs.clone()) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                tracing::warn!("Power readings unavailable: {}", e);
                None
            }
        };
        Self {
            regs,
            throttle,
            energy,
            source,
            events,
            interval: interval.max(MIN_INTERVAL),
            to_log,
        }
    }

    fn emit(&self, line: &str) {
        if self.to_log {
            tracing::info!("{}", line);
        } else {
            let mut stdout = std::io::stdout().lock();
            // redraw in place, padding over a longer previous line
            let _ = write!(stdout, "\r{line:<160}");
            let _ = stdout.flush();
        }
    }

    async fn print_voltages(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(ControlEvent::QueryVoltages(tx)).await.is_err() {
            return;
        }
        match rx.await {
            Ok(report) if !report.undervolt.is_empty() => {
                let undervolt = report.undervolt_line();
                let iccmax = report.iccmax_line();
                if self.to_log {
                    tracing::info!("Undervolt: {}", undervolt);
                    tracing::info!("IccMax: {}", iccmax);
                } else {
                    println!("Undervolt: {undervolt}");
                    println!("IccMax: {iccmax}");
                }
            }
            Ok(_) => tracing::info!("Undervolt is not supported, no voltage status"),
            Err(_) => tracing::debug!("Control loop dropped the voltage query"),
        }
    }

    fn vcore_mv(&self) -> Option<f64> {
        let cpu = self.regs.cpus().first().copied().unwrap_or(0);
        self.regs
            .read_msr(cpu, thermal::msr::IA32_PERF_STATUS)
            .ok()
            .map(thermal::decode_vcore_mv)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        self.print_voltages().await;

        let snapshots = self.throttle.snapshots(self.interval);
        futures_util::pin_mut!(snapshots);

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = snapshots.next() => batch,
            };
            let Some(batch) = batch else { break };

            let flags = match batch.as_deref() {
                Ok([snapshot, ..]) => snapshot.status.current,
                Ok([]) => ThrottleFlags::default(),
                Err(e) => {
                    tracing::warn!("Unable to read the thermal status: {}", e);
                    ThrottleFlags::default()
                }
            };
            let power = self
                .energy
                .as_mut()
                .map(|energy| energy.power())
                .unwrap_or_default();
            let source = *self.source.borrow();

            let line = status_line(source, &flags, self.vcore_mv(), &power);
            self.emit(&line);
        }

        if !self.to_log {
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let flags = ThrottleFlags {
            power_limit: true,
            ..Default::default()
        };
        let power = [(EnergyPlane::Package, 12.34), (EnergyPlane::Graphics, 0.5)];
        let line = status_line(Some(PowerSource::Battery), &flags, Some(850.2), &power);

        assert_eq!(
            line,
            "[BATTERY] Thermal: OK - Power: LIM - Current: OK - Cross-domain (e.g. GPU): OK \
             || VCore: 850 mV - Package: 12.3 W - Graphics: 0.5 W - Total: 12.8 W"
        );
    }

    #[test]
    fn test_status_line_without_readings() {
        let line = status_line(None, &ThrottleFlags::default(), None, &[]);
        assert!(line.starts_with("[?] Thermal: OK"));
        assert!(line.ends_with("|| "));
    }
}
