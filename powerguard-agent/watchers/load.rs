// CPU load sampling for HWP auto mode

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{PowerguardError, Result};
use crate::events::{ControlEvent, HwpHint};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Moving average window, in samples
pub const WINDOW: usize = 5;
/// Average busy fraction that switches to the performance hint
pub const HIGH_LOAD: f64 = 0.75;
/// Average busy fraction the load must stay at or below before reverting
pub const LOW_LOAD: f64 = 0.40;
pub const LOW_LOAD_DEBOUNCE: Duration = Duration::from_secs(15);

/// Hysteresis over a moving average of busy fractions
#[derive(Debug)]
pub struct LoadMonitor {
    samples: VecDeque<f64>,
    hint: HwpHint,
    low_since: Option<Instant>,
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW),
            hint: HwpHint::Default,
            low_since: None,
        }
    }

    pub fn hint(&self) -> HwpHint {
        self.hint
    }

    pub fn average(&self) -> Option<f64> {
        (!self.samples.is_empty())
            .then(|| self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Feed one sample; returns a hint when it changes
    pub fn observe(&mut self, busy: f64, now: Instant) -> Option<HwpHint> {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(busy.clamp(0.0, 1.0));
        let average = self.average()?;

        match self.hint {
            HwpHint::Default if average >= HIGH_LOAD => {
                self.hint = HwpHint::Performance;
                self.low_since = None;
                Some(self.hint)
            }
            HwpHint::Performance if average <= LOW_LOAD => {
                let since = *self.low_since.get_or_insert(now);
                if now.duration_since(since) >= LOW_LOAD_DEBOUNCE {
                    self.hint = HwpHint::Default;
                    self.low_since = None;
                    Some(self.hint)
                } else {
                    None
                }
            }
            _ => {
                self.low_since = None;
                None
            }
        }
    }

    /// Forget history, e.g. after the gate closed
    pub fn reset(&mut self) {
        self.samples.clear();
        self.hint = HwpHint::Default;
        self.low_since = None;
    }
}

/// Aggregate `cpu` line counters: (busy, total) jiffies
fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.map(|f| f.parse().ok()).collect::<Option<_>>()?;
    if values.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // guest time is already part of user and nice
    let counted = &values[..values.len().min(8)];
    let total: u64 = counted.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

/// Busy fraction between consecutive reads of `/proc/stat`
pub struct ProcStatSampler {
    path: PathBuf,
    last: Option<(u64, u64)>,
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new("/proc/stat")
    }
}

impl ProcStatSampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }

    /// `None` on the first call, which only primes the counters
    pub fn sample(&mut self) -> Result<Option<f64>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            PowerguardError::EventSubscription(format!("{}: {}", self.path.display(), e))
        })?;
        let current = content.lines().find_map(parse_cpu_line).ok_or_else(|| {
            PowerguardError::EventSubscription(format!(
                "{}: no aggregate cpu line",
                self.path.display()
            ))
        })?;

        let busy = self.last.and_then(|(busy, total)| {
            let dt = current.1.checked_sub(total)?;
            let db = current.0.checked_sub(busy)?;
            (dt > 0).then(|| db as f64 / dt as f64)
        });
        self.last = Some(current);
        Ok(busy)
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Sample load while `gate` is true and post hint changes to the control loop
///
/// A sampling failure disables HWP auto switching for the process lifetime.
pub async fn run(
    mut sampler: ProcStatSampler,
    mut gate: watch::Receiver<bool>,
    events: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    let mut monitor = LoadMonitor::new();
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let active = *gate.borrow_and_update();
        if !active {
            monitor.reset();
            sampler.reset();
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let busy = match sampler.sample() {
            Ok(Some(busy)) => busy,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("{}. HWP auto mode disabled", e);
                return;
            }
        };
        tracing::trace!("CPU busy {:.2}", busy);

        if let Some(hint) = monitor.observe(busy, Instant::now()) {
            if events.send(ControlEvent::Load(hint)).await.is_err() {
                return;
            }
        }
    }
}
