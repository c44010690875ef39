// Single-writer control loop
// Every register mutation goes through this loop; watchers only post events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use powerguard_raw::current_arch::hwp::{self, EPP};
use powerguard_raw::current_arch::mailbox::{
    self, Plane, ICCMAX_MASK, MSR_OC_MAILBOX, VOLTAGE_OFFSET_MASK,
};
use powerguard_raw::current_arch::platform::{self, TDP_LEVEL};
use powerguard_raw::current_arch::rapl::{
    self, PowerLimits, RaplPowerUnit, MCHBAR_PKG_POWER_LIMIT, PKG_POWER_LIMIT,
    POWER_LIMIT_COMPARE_MASK,
};
use powerguard_raw::current_arch::thermal::{
    self, ThermalStatus, BD_PROCHOT, TARGET_OFFSET, THERMAL_LOG_CLEAR, THERMAL_STATUS_FIELDS,
};
use powerguard_raw::{Register, RegisterLayout};

use crate::common::RegisterAccess;
use crate::config::{Profile, ProfileSource, MAX_INTERVAL};
use crate::error::{PowerguardError, Result};
use crate::events::{ControlEvent, HwpHint, VoltageReport};
use crate::power::{PowerSource, PowerSourceProvider};
use crate::state::{AppliedFingerprint, ControlState, DaemonState};

/// Other tools may reset EPP, so an active hint is rewritten this often
pub const HWP_REWRITE_INTERVAL: Duration = Duration::from_secs(60);

/// Keep at least this many degrees between the trip point and TjMax
const TJ_MAX_MARGIN_C: f64 = 3.0;

/// Outcome of one enforcement pass
#[derive(Debug, Default)]
pub struct TickReport {
    pub source: Option<PowerSource>,
    /// The active profile is disabled, nothing was written
    pub skipped: bool,
    pub voltages_written: bool,
    pub errors: Vec<PowerguardError>,
    /// Time until the next scheduled tick
    pub wait: Duration,
}

impl TickReport {
    /// Read-back mismatches seen during this tick
    pub fn mismatches(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| matches!(e, PowerguardError::RegisterIo { .. }))
            .count()
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            match &e {
                PowerguardError::RegisterIo { .. } => tracing::error!("{}", e),
                _ => tracing::error!("Register write failed: {}", e),
            }
            self.errors.push(e);
        }
    }
}

pub struct ControlLoop {
    regs: Arc<dyn RegisterAccess>,
    power: Box<dyn PowerSourceProvider>,
    profile_source: Box<dyn ProfileSource>,
    state: DaemonState,
    events: mpsc::Receiver<ControlEvent>,
    debug: bool,
    hwp_gate: watch::Sender<bool>,
    source_tx: watch::Sender<Option<PowerSource>>,
}

impl ControlLoop {
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        power: Box<dyn PowerSourceProvider>,
        profile_source: Box<dyn ProfileSource>,
        state: DaemonState,
        events: mpsc::Receiver<ControlEvent>,
        debug: bool,
    ) -> Self {
        let (hwp_gate, _) = watch::channel(false);
        let (source_tx, _) = watch::channel(None);
        Self {
            regs,
            power,
            profile_source,
            state,
            events,
            debug,
            hwp_gate,
            source_tx,
        }
    }

    /// True while AC, HWP auto mode and HWP support all hold
    pub fn hwp_gate(&self) -> watch::Receiver<bool> {
        self.hwp_gate.subscribe()
    }

    pub fn source_updates(&self) -> watch::Receiver<Option<PowerSource>> {
        self.source_tx.subscribe()
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    fn first_cpu(&self) -> u32 {
        self.regs.cpus().first().copied().unwrap_or(0)
    }

    /// Run until cancelled
    ///
    /// The sleep between ticks is interrupted by events, so reloads and
    /// resumes are serviced without waiting out the interval.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.state.control = ControlState::Running;
        tracing::info!("Starting main loop");

        let mut events_open = true;
        let mut deadline = tokio::time::Instant::now() + self.tick_logged();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv(), if events_open => match event {
                    Some(event) => {
                        if self.handle_event(event) {
                            deadline = tokio::time::Instant::now() + self.tick_logged();
                        }
                    }
                    None => events_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    deadline = tokio::time::Instant::now() + self.tick_logged();
                }
            }
        }

        self.shutdown();
    }

    fn tick_logged(&mut self) -> Duration {
        let report = self.tick();
        if !report.errors.is_empty() {
            tracing::debug!(
                "Tick finished with {} errors ({} read-back mismatches)",
                report.errors.len(),
                report.mismatches()
            );
        }
        report.wait
    }

    fn shutdown(&mut self) {
        if matches!(self.state.hwp.applied, Some(HwpHint::Performance)) {
            if let Err(e) = self.write_epp(HwpHint::Default) {
                tracing::warn!("Unable to restore the default EPP: {}", e);
            }
        }
        self.state.hwp.applied = None;
        self.state.control = ControlState::Stopped;
        tracing::info!("Control loop stopped");
    }

    /// Apply one event; returns true when a tick should run right away
    pub fn handle_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Reload => {
                self.state.config_marker = self.profile_source.modified();
                self.reload();
                true
            }
            ControlEvent::Resume => {
                tracing::info!("Resumed from sleep, reapplying voltage planes");
                self.state.force_reapply = true;
                true
            }
            ControlEvent::Load(hint) => {
                tracing::info!("Load monitor requests the {} EPP hint", hint.name());
                self.state.hwp.hint = hint;
                if let Some(source) = self.state.source {
                    let mut report = TickReport::default();
                    self.update_hwp(source, &mut report);
                }
                false
            }
            ControlEvent::QueryVoltages(reply) => {
                if reply.send(self.read_voltages()).is_err() {
                    tracing::debug!("Voltage query dropped before the reply");
                }
                false
            }
        }
    }

    /// One enforcement pass
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.debug {
            self.log_thermal_status(&mut report);
        }

        let source = self.power.current();
        if self.state.source != Some(source) {
            tracing::info!("Power source: {}", source);
            self.state.source = Some(source);
            self.source_tx.send_replace(Some(source));
        }
        report.source = Some(source);

        if self.state.profiles.get(source).autoreload {
            self.check_autoreload();
        }

        let profile = self.state.profiles.get(source).clone();
        report.wait = Duration::try_from_secs_f64(profile.update_interval_s)
            .unwrap_or(MAX_INTERVAL)
            .min(MAX_INTERVAL);

        if !profile.enabled {
            tracing::debug!("{} profile is disabled, skipping writes", source);
            self.update_hwp(source, &mut report);
            report.skipped = true;
            return report;
        }

        let result = self.apply_temperature_target(&profile);
        report.record(result);
        let result = self.apply_ctdp(&profile);
        report.record(result);
        let result = self.apply_power_limits(&profile);
        report.record(result);
        let result = self.apply_power_limits_mchbar(&profile);
        report.record(result);
        let result = self.apply_bd_prochot(&profile);
        report.record(result);
        self.apply_voltages(source, &profile, &mut report);
        self.update_hwp(source, &mut report);

        report
    }

    fn check_autoreload(&mut self) {
        let marker = self.profile_source.modified();
        if marker.is_some() && marker != self.state.config_marker {
            self.state.config_marker = marker;
            self.reload();
        }
    }

    fn reload(&mut self) {
        self.state.control = ControlState::Reloading;
        tracing::info!("Reloading changes");
        match self.profile_source.load() {
            Ok(profiles) => {
                self.state.capabilities.report_unsupported(&profiles);
                self.state.profiles = profiles;
            }
            Err(e) => tracing::error!("{}. Keeping the previous profiles", e),
        }
        self.state.control = ControlState::Running;
    }

    /// Write `value` on every CPU and verify it on the first one in debug mode
    fn write_verified(&self, register: Register, value: u64, mask: u64) -> Result<()> {
        self.regs.write_msr_all(register.address, value)?;
        if self.debug {
            let read = self.regs.read_msr(self.first_cpu(), register.address)?;
            crate::verify_readback!(register.name, value, read, mask)?;
        }
        Ok(())
    }

    fn apply_temperature_target(&self, profile: &Profile) -> Result<()> {
        let (Some(trip), Some(tj_max)) = (profile.trip_temp_c, self.state.capabilities.tj_max)
        else {
            return Ok(());
        };
        if !self.state.capabilities.temperature_target {
            return Ok(());
        }

        let trip = trip.min(tj_max - TJ_MAX_MARGIN_C);
        let current = self
            .regs
            .read_msr(self.first_cpu(), thermal::TEMPERATURE_TARGET.address)?;
        let value = thermal::encode_temperature_target(current, trip, tj_max);
        self.write_verified(thermal::TEMPERATURE_TARGET, value, TARGET_OFFSET.mask())
    }

    fn apply_ctdp(&self, profile: &Profile) -> Result<()> {
        let Some(level) = profile.ctdp_level else {
            return Ok(());
        };
        if !self.state.capabilities.supports_ctdp(level) {
            return Ok(());
        }

        let current = self
            .regs
            .read_msr(self.first_cpu(), platform::CONFIG_TDP_CONTROL.address)?;
        let value = platform::encode_ctdp(current, level.level());
        self.write_verified(platform::CONFIG_TDP_CONTROL, value, TDP_LEVEL.mask())
    }

    /// Target `MSR_PKG_POWER_LIMIT` word, `None` when no limit is configured
    ///
    /// Unset fields keep what the register currently holds.
    fn power_limit_word(&self, profile: &Profile) -> Result<Option<u64>> {
        if !profile.has_power_limits() {
            return Ok(None);
        }

        let cpu = self.first_cpu();
        let units = match self.regs.read_msr(cpu, rapl::msr::MSR_RAPL_POWER_UNIT) {
            Ok(value) => RaplPowerUnit::from_msr_value(value),
            Err(e) => {
                tracing::debug!("Falling back to reference RAPL units: {}", e);
                RaplPowerUnit::reference()
            }
        };
        let current = units.decode_power_limit(self.regs.read_msr(cpu, PKG_POWER_LIMIT.address)?);

        let limits = PowerLimits {
            pl1_watts: profile.pl1_watts.unwrap_or(current.pl1_watts),
            pl1_seconds: profile.pl1_duration_s.unwrap_or(current.pl1_seconds),
            pl2_watts: profile.pl2_watts.unwrap_or(current.pl2_watts),
            pl2_seconds: profile.pl2_duration_s.unwrap_or(current.pl2_seconds),
        };
        Ok(Some(units.encode_power_limit(&limits)))
    }

    fn apply_power_limits(&self, profile: &Profile) -> Result<()> {
        match self.power_limit_word(profile)? {
            Some(value) => self.write_verified(PKG_POWER_LIMIT, value, POWER_LIMIT_COMPARE_MASK),
            None => Ok(()),
        }
    }

    /// Mirror the package limit into MCHBAR, which the EC also programs
    fn apply_power_limits_mchbar(&self, profile: &Profile) -> Result<()> {
        if !self.regs.has_mchbar() {
            return Ok(());
        }
        let Some(value) = self.power_limit_word(profile)? else {
            return Ok(());
        };

        self.regs
            .write_mchbar(MCHBAR_PKG_POWER_LIMIT.address, value)?;
        if self.debug {
            let read = self.regs.read_mchbar(MCHBAR_PKG_POWER_LIMIT.address)?;
            crate::verify_readback!(
                MCHBAR_PKG_POWER_LIMIT.name,
                value,
                read,
                POWER_LIMIT_COMPARE_MASK
            )?;
        }
        Ok(())
    }

    fn apply_bd_prochot(&self, profile: &Profile) -> Result<()> {
        if !profile.disable_bdprochot {
            return Ok(());
        }
        let current = self
            .regs
            .read_msr(self.first_cpu(), thermal::POWER_CTL.address)?;
        let value = thermal::disable_bd_prochot(current);
        self.write_verified(thermal::POWER_CTL, value, BD_PROCHOT.mask())
    }

    /// Mailbox words for every voltage plane of `profile`
    fn voltage_words(profile: &Profile) -> Result<Vec<(Plane, u64)>> {
        let mut words = Vec::with_capacity(Plane::ALL.len() + Plane::CURRENT.len());
        for (plane, mv) in profile.undervolt.iter() {
            words.push((plane, mailbox::encode_undervolt(plane, mv)?));
        }
        for (plane, amps) in profile.iccmax.iter() {
            words.push((plane, mailbox::encode_iccmax(plane, amps)?));
        }
        Ok(words)
    }

    fn apply_voltages(&mut self, source: PowerSource, profile: &Profile, report: &mut TickReport) {
        if !self.state.capabilities.undervolt {
            return;
        }
        // Leave the planes alone until some profile asks for them
        let configured = !profile.undervolt.is_zero() || profile.iccmax.iter().next().is_some();
        if !configured && self.state.applied.is_none() {
            return;
        }

        let words = match Self::voltage_words(profile) {
            Ok(words) => words,
            Err(e) => {
                report.record(Err(e));
                return;
            }
        };
        let target = AppliedFingerprint {
            source,
            words: words.iter().map(|(_, word)| *word).collect(),
        };
        if !self.state.needs_voltage_write(&target) {
            return;
        }

        let failures = report.errors.len();
        for (plane, word) in words {
            let result = self.write_mailbox(plane, word);
            report.record(result);
        }

        if report.errors.len() == failures {
            tracing::info!("{} voltage planes applied", source);
            self.state.record_voltage_write(target);
            report.voltages_written = true;
        }
    }

    fn write_mailbox(&self, plane: Plane, word: u64) -> Result<()> {
        self.regs.write_msr_all(MSR_OC_MAILBOX, word)?;
        if !self.debug {
            return Ok(());
        }

        let cmd = mailbox::MailboxCommand::decode(word);
        let (request, mask) = if cmd.command == mailbox::MailboxCommand::WRITE_ICCMAX {
            (mailbox::iccmax_read_request(plane)?, ICCMAX_MASK)
        } else {
            (mailbox::undervolt_read_request(plane), VOLTAGE_OFFSET_MASK)
        };
        let cpu = self.first_cpu();
        self.regs.write_msr(cpu, MSR_OC_MAILBOX, request)?;
        let read = self.regs.read_msr(cpu, MSR_OC_MAILBOX)?;
        crate::verify_readback!(plane.name(), word, read, mask)
    }

    /// Read every plane through the mailbox
    pub fn read_voltages(&self) -> VoltageReport {
        let mut report = VoltageReport::default();
        if !self.state.capabilities.undervolt {
            return report;
        }

        let cpu = self.first_cpu();
        let query = |request: u64| -> Result<u64> {
            self.regs.write_msr(cpu, MSR_OC_MAILBOX, request)?;
            self.regs.read_msr(cpu, MSR_OC_MAILBOX)
        };

        for plane in Plane::ALL {
            match query(mailbox::undervolt_read_request(plane)) {
                Ok(value) => report.undervolt.push((plane, mailbox::decode_undervolt(value))),
                Err(e) => tracing::warn!("Unable to read the {} offset: {}", plane, e),
            }
        }
        for plane in Plane::CURRENT {
            let result = mailbox::iccmax_read_request(plane)
                .map_err(PowerguardError::from)
                .and_then(&query);
            match result {
                Ok(value) => report.iccmax.push((plane, mailbox::decode_iccmax(value))),
                Err(e) => tracing::warn!("Unable to read the {} IccMax: {}", plane, e),
            }
        }
        report
    }

    /// Keep the EPP hint in line with the load monitor while auto mode is on
    ///
    /// Leaving auto mode (battery, disabled profile) restores the default EPP once.
    fn update_hwp(&mut self, source: PowerSource, report: &mut TickReport) {
        let active = source == PowerSource::Ac
            && self.state.profiles.ac.enabled
            && self.state.profiles.ac.hwp_auto_mode
            && self.state.capabilities.hwp;
        self.hwp_gate.send_replace(active);

        if active {
            let hint = self.state.hwp.hint;
            let due = self.state.hwp.applied != Some(hint)
                || self
                    .state
                    .hwp
                    .last_write
                    .map_or(true, |at| at.elapsed() >= HWP_REWRITE_INTERVAL);
            if due {
                let result = self.write_epp(hint);
                if result.is_ok() {
                    self.state.hwp.applied = Some(hint);
                    self.state.hwp.last_write = Some(Instant::now());
                }
                report.record(result);
            }
        } else if let Some(applied) = self.state.hwp.applied.take() {
            if applied != HwpHint::Default {
                let result = self.write_epp(HwpHint::Default);
                report.record(result);
            }
            self.state.hwp.hint = HwpHint::Default;
            self.state.hwp.last_write = None;
        }
    }

    fn write_epp(&self, hint: HwpHint) -> Result<()> {
        for &cpu in self.regs.cpus() {
            let current = self.regs.read_msr(cpu, hwp::IA32_HWP_REQUEST)?;
            self.regs
                .write_msr(cpu, hwp::IA32_HWP_REQUEST, hwp::encode_epp(current, hint.epp()))?;
        }
        if self.debug {
            let read = self.regs.read_msr(self.first_cpu(), hwp::IA32_HWP_REQUEST)?;
            crate::verify_readback!(
                hwp::HWP_REQUEST.name,
                hwp::encode_epp(0, hint.epp()),
                read,
                EPP.mask()
            )?;
        }
        Ok(())
    }

    /// Log each core's thermal status, then clear the sticky log bits
    fn log_thermal_status(&self, report: &mut TickReport) {
        for &cpu in self.regs.cpus() {
            let value = match self.regs.read_msr(cpu, thermal::THERM_STATUS.address) {
                Ok(value) => value,
                Err(e) => {
                    report.record(Err(e));
                    continue;
                }
            };
            for field in THERMAL_STATUS_FIELDS.iter() {
                tracing::debug!(
                    "core {} thermal status: {} = {}",
                    cpu,
                    field.name.replace('_', " "),
                    field.extract(value)
                );
            }
            if ThermalStatus::from_msr_value(value).sticky.any() {
                let result = self
                    .regs
                    .write_msr(cpu, thermal::THERM_STATUS.address, THERMAL_LOG_CLEAR);
                report.record(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::SystemTime;

    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use crate::config::tests::SAMPLE;
    use crate::config::ConfigFile;
    use crate::orchestrator::capabilities::Capabilities;
    use crate::power::MockPowerSourceProvider;
    use crate::test_utils::FakeRegisters;

    struct Harness {
        control: ControlLoop,
        regs: Arc<FakeRegisters>,
        source: Arc<Mutex<PowerSource>>,
        events: mpsc::Sender<ControlEvent>,
        config: tempfile::NamedTempFile,
    }

    fn harness(doc: &str, source: PowerSource, debug: bool) -> Harness {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config.write_all(doc.as_bytes()).unwrap();
        config.flush().unwrap();

        let profile_source = ConfigFile::new(config.path());
        let marker = profile_source.modified();
        let profiles = profile_source.load().unwrap();

        let regs = Arc::new(FakeRegisters::client());
        let capabilities = Capabilities::probe(regs.as_ref(), false);
        let state = DaemonState::new(profiles, capabilities, marker);

        let current = Arc::new(Mutex::new(source));
        let shared = current.clone();
        let mut power = MockPowerSourceProvider::new();
        power.expect_current().returning(move || *shared.lock());

        let (tx, rx) = mpsc::channel(8);
        let dyn_regs: Arc<dyn RegisterAccess> = regs.clone();
        let control = ControlLoop::new(
            dyn_regs,
            Box::new(power),
            Box::new(profile_source),
            state,
            rx,
            debug,
        );
        regs.clear_writes();

        Harness {
            control,
            regs,
            source: current,
            events: tx,
            config,
        }
    }

    fn rewrite(config: &tempfile::NamedTempFile, doc: &str) {
        std::fs::write(config.path(), doc).unwrap();
        // mtime granularity may hide a quick rewrite
        File::options()
            .write(true)
            .open(config.path())
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
    }

    fn pl1_raw(value: u64) -> u64 {
        value & 0x7FFF
    }

    #[test]
    fn test_battery_profile_selected() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        let report = h.control.tick();
        assert_eq!(report.wait, Duration::from_secs(5));

        *h.source.lock() = PowerSource::Battery;
        let report = h.control.tick();

        assert_eq!(report.source, Some(PowerSource::Battery));
        assert_eq!(report.wait, Duration::from_secs(30));
        let target = h.regs.get(thermal::msr::MSR_TEMPERATURE_TARGET).unwrap();
        assert_eq!(thermal::decode_temperature_target(target), 15);
        let limit = h.regs.get(rapl::msr::MSR_PKG_POWER_LIMIT).unwrap();
        assert_eq!(pl1_raw(limit), 29 * 8);
        assert_eq!(h.control.state().source, Some(PowerSource::Battery));
    }

    #[test]
    fn test_power_limits_rewritten_every_tick() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        h.control.tick();
        h.control.tick();

        let writes = h.regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT);
        assert_eq!(writes.len(), 2 * 4);
        assert!(writes.iter().all(|w| pl1_raw(*w) == 44 * 8));
        assert_eq!(
            h.regs.mchbar_value(MCHBAR_PKG_POWER_LIMIT.address),
            Some(writes[0])
        );
    }

    #[test]
    fn test_resume_forces_voltage_reapply() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        assert!(h.control.tick().voltages_written);
        assert!(!h.regs.writes_to(MSR_OC_MAILBOX).is_empty());

        h.regs.clear_writes();
        let report = h.control.tick();
        assert!(!report.voltages_written);
        assert!(h.regs.writes_to(MSR_OC_MAILBOX).is_empty());

        assert!(h.control.handle_event(ControlEvent::Resume));
        let report = h.control.tick();
        assert!(report.voltages_written);
        let core = mailbox::encode_undervolt(Plane::Core, -105.0).unwrap();
        assert!(h.regs.writes_to(MSR_OC_MAILBOX).contains(&core));
        assert!(!h.control.state().force_reapply);
    }

    #[test]
    fn test_autoreload_applies_new_limit() {
        let doc = SAMPLE.replace("\"hwp_auto_mode\": true", "\"hwp_auto_mode\": true, \"autoreload\": true");
        let mut h = harness(&doc, PowerSource::Ac, false);
        h.control.tick();

        rewrite(&h.config, &doc.replace("\"pl1_watts\": 44", "\"pl1_watts\": 40"));
        h.control.tick();

        let limit = h.regs.get(rapl::msr::MSR_PKG_POWER_LIMIT).unwrap();
        assert_eq!(pl1_raw(limit), 320);
    }

    #[test]
    fn test_without_autoreload_old_limit_persists() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        h.control.tick();

        rewrite(&h.config, &SAMPLE.replace("\"pl1_watts\": 44", "\"pl1_watts\": 40"));
        for _ in 0..3 {
            h.control.tick();
        }

        let limit = h.regs.get(rapl::msr::MSR_PKG_POWER_LIMIT).unwrap();
        assert_eq!(pl1_raw(limit), 352);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_profiles() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        rewrite(&h.config, &SAMPLE.replace("\"gpu\": -85", "\"gpu\": 20"));

        assert!(h.control.handle_event(ControlEvent::Reload));
        assert_eq!(h.control.state().profiles.ac.undervolt.gpu, -85.0);
        assert_eq!(h.control.state().control, ControlState::Running);
    }

    #[test]
    fn test_disabled_profile_skips_writes() {
        let doc = SAMPLE.replace("\"update_interval_s\": 30,", "\"update_interval_s\": 30, \"enabled\": false,");
        let mut h = harness(&doc, PowerSource::Battery, false);

        let report = h.control.tick();
        assert!(report.skipped);
        assert_eq!(report.wait, Duration::from_secs(30));
        assert!(h.regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).is_empty());

        *h.source.lock() = PowerSource::Ac;
        assert!(!h.control.tick().skipped);
        assert!(!h.regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).is_empty());
    }

    #[test]
    fn test_debug_mismatch_is_reported_and_loop_continues() {
        let mut h = harness(SAMPLE, PowerSource::Ac, true);
        h.regs.stick(rapl::msr::MSR_PKG_POWER_LIMIT);

        let report = h.control.tick();
        assert_eq!(report.mismatches(), 1);
        assert!(report.errors.iter().all(|e| !e.is_fatal()));
        // remaining writes of the tick still happen
        assert!(report.voltages_written);

        let report = h.control.tick();
        assert_eq!(report.mismatches(), 1);
        assert_eq!(h.regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).len(), 2 * 4);
    }

    #[test]
    fn test_debug_clears_thermal_log() {
        let mut h = harness(SAMPLE, PowerSource::Ac, true);
        h.regs.set(thermal::msr::IA32_THERM_STATUS, 0x8832_0C00);

        h.control.tick();
        assert_eq!(
            h.regs.get(thermal::msr::IA32_THERM_STATUS),
            Some(0x8832_0400)
        );
    }

    #[test]
    fn test_partial_power_limits_keep_register_fields() {
        let doc = r#"{
            "ac": { "update_interval_s": 5, "pl1_watts": 29 },
            "battery": { "update_interval_s": 30 }
        }"#;
        let mut h = harness(doc, PowerSource::Ac, false);
        h.control.tick();

        let limits = rapl::decode_power_limit(h.regs.get(rapl::msr::MSR_PKG_POWER_LIMIT).unwrap());
        assert_eq!(limits.pl1_watts, 29.0);
        assert_eq!(limits.pl2_watts, 44.0);
        assert!((limits.pl1_seconds - 28.0).abs() < 0.01);

        // no limits configured on battery, the register is left alone
        h.regs.clear_writes();
        *h.source.lock() = PowerSource::Battery;
        h.control.tick();
        assert!(h.regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).is_empty());
    }

    #[test]
    fn test_hwp_hint_follows_load_and_restores_default() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        let gate = h.control.hwp_gate();
        h.control.tick();
        assert!(*gate.borrow());

        h.control.handle_event(ControlEvent::Load(HwpHint::Performance));
        let epp = hwp::decode_epp(h.regs.get(hwp::IA32_HWP_REQUEST).unwrap());
        assert_eq!(epp, 0x20);

        *h.source.lock() = PowerSource::Battery;
        h.control.tick();
        assert!(!*gate.borrow());
        let epp = hwp::decode_epp(h.regs.get(hwp::IA32_HWP_REQUEST).unwrap());
        assert_eq!(epp, 0x80);

        h.regs.clear_writes();
        h.control.tick();
        assert!(h.regs.writes_to(hwp::IA32_HWP_REQUEST).is_empty());
    }

    #[test]
    fn test_disabling_profile_restores_default_epp() {
        let doc = SAMPLE.replace("\"hwp_auto_mode\": true", "\"hwp_auto_mode\": true, \"autoreload\": true");
        let mut h = harness(&doc, PowerSource::Ac, false);
        let gate = h.control.hwp_gate();
        h.control.tick();
        h.control.handle_event(ControlEvent::Load(HwpHint::Performance));
        assert_eq!(hwp::decode_epp(h.regs.get(hwp::IA32_HWP_REQUEST).unwrap()), 0x20);

        rewrite(&h.config, &doc.replace("\"autoreload\": true", "\"autoreload\": true, \"enabled\": false"));
        assert!(h.control.tick().skipped);
        assert!(!*gate.borrow());
        assert_eq!(hwp::decode_epp(h.regs.get(hwp::IA32_HWP_REQUEST).unwrap()), 0x80);

        // a late load event while disabled does not raise the hint again
        h.regs.clear_writes();
        h.control.handle_event(ControlEvent::Load(HwpHint::Performance));
        h.control.tick();
        assert!(h.regs.writes_to(hwp::IA32_HWP_REQUEST).is_empty());
    }

    #[test]
    fn test_reload_with_oversized_interval_keeps_running() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        rewrite(&h.config, &SAMPLE.replace("\"update_interval_s\": 5", "\"update_interval_s\": 1e30"));

        assert!(h.control.handle_event(ControlEvent::Reload));
        assert_eq!(h.control.state().profiles.ac.update_interval_s, 5.0);
        assert_eq!(h.control.tick().wait, Duration::from_secs(5));
    }

    #[test]
    fn test_query_voltages_reads_mailbox() {
        let mut h = harness(SAMPLE, PowerSource::Ac, false);
        h.control.tick();

        let (tx, mut rx) = oneshot::channel();
        assert!(!h.control.handle_event(ControlEvent::QueryVoltages(tx)));
        let report = rx.try_recv().unwrap();

        assert_eq!(report.undervolt.len(), 5);
        let (plane, core) = report.undervolt[0];
        assert_eq!(plane, Plane::Core);
        assert!((core + 105.0).abs() <= 1.0);
        assert_eq!(report.iccmax.len(), 3);
    }

    #[tokio::test]
    async fn test_run_services_events_and_stops() {
        let doc = SAMPLE.replace("\"update_interval_s\": 5", "\"update_interval_s\": 0.01");
        let h = harness(&doc, PowerSource::Ac, false);
        let regs = h.regs.clone();
        let events = h.events.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(h.control.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(regs.writes_to(rapl::msr::MSR_PKG_POWER_LIMIT).len() >= 2 * 4);

        regs.clear_writes();
        events.send(ControlEvent::Resume).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!regs.writes_to(MSR_OC_MAILBOX).is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
