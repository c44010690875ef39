use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use powerguard_raw::current_arch::mailbox::{Plane, ICCMAX_LIMIT_AMPS, UNDERVOLT_LIMIT_MV};

use crate::error::{PowerguardError, Result};
use crate::named_enum;
use crate::power::PowerSource;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/powerguard/powerguard.json";

/// Allowed trip temperature range in °C
pub const TRIP_TEMP_RANGE: (f64, f64) = (40.0, 97.0);

/// Shortest accepted interval or duration in seconds
const MIN_SECONDS: f64 = 0.001;

/// Longest accepted interval or duration
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

named_enum! {
    #[derive(Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum CtdpLevel {
        Nominal => "nominal",
        Down => "down",
        Up => "up",
    }
}

impl CtdpLevel {
    /// Value of the `MSR_CONFIG_TDP_CONTROL` level field
    pub fn level(&self) -> u8 {
        match self {
            CtdpLevel::Nominal => 0,
            CtdpLevel::Down => 1,
            CtdpLevel::Up => 2,
        }
    }
}

/// Per-plane voltage offsets in mV, zero or negative
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UndervoltOffsets {
    pub core: f64,
    pub gpu: f64,
    pub cache: f64,
    pub uncore: f64,
    pub analogio: f64,
}

impl UndervoltOffsets {
    pub fn get(&self, plane: Plane) -> f64 {
        match plane {
            Plane::Core => self.core,
            Plane::Gpu => self.gpu,
            Plane::Cache => self.cache,
            Plane::Uncore => self.uncore,
            Plane::AnalogIo => self.analogio,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Plane, f64)> + '_ {
        Plane::ALL.into_iter().map(move |plane| (plane, self.get(plane)))
    }

    pub fn is_zero(&self) -> bool {
        self.iter().all(|(_, mv)| mv == 0.0)
    }
}

/// Absolute per-plane current limits in A
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IccMaxLimits {
    pub core: Option<f64>,
    pub gpu: Option<f64>,
    pub cache: Option<f64>,
}

impl IccMaxLimits {
    pub fn get(&self, plane: Plane) -> Option<f64> {
        match plane {
            Plane::Core => self.core,
            Plane::Gpu => self.gpu,
            Plane::Cache => self.cache,
            Plane::Uncore | Plane::AnalogIo => None,
        }
    }

    /// Configured planes only
    pub fn iter(&self) -> impl Iterator<Item = (Plane, f64)> + '_ {
        Plane::CURRENT
            .into_iter()
            .filter_map(move |plane| self.get(plane).map(|amps| (plane, amps)))
    }
}

fn default_true() -> bool {
    true
}

/// Parameters enforced while on one power source
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub autoreload: bool,
    pub update_interval_s: f64,
    pub pl1_watts: Option<f64>,
    pub pl1_duration_s: Option<f64>,
    pub pl2_watts: Option<f64>,
    pub pl2_duration_s: Option<f64>,
    pub trip_temp_c: Option<f64>,
    #[serde(default)]
    pub undervolt: UndervoltOffsets,
    #[serde(default)]
    pub iccmax: IccMaxLimits,
    #[serde(default)]
    pub hwp_auto_mode: bool,
    pub ctdp_level: Option<CtdpLevel>,
    #[serde(default)]
    pub disable_bdprochot: bool,
}

impl Profile {
    /// True when at least one power limit field is configured
    pub fn has_power_limits(&self) -> bool {
        self.pl1_watts.is_some()
            || self.pl1_duration_s.is_some()
            || self.pl2_watts.is_some()
            || self.pl2_duration_s.is_some()
    }

    fn validate(&mut self, source: PowerSource) -> Result<()> {
        let finite = |name: &str, value: f64| {
            if value.is_finite() {
                Ok(value)
            } else {
                Err(PowerguardError::Config(format!(
                    "{source}: {name} must be a finite number"
                )))
            }
        };

        let seconds = |name: &str, value: f64| -> Result<f64> {
            let value = finite(name, value)?;
            if value > MAX_INTERVAL.as_secs_f64() {
                return Err(PowerguardError::Config(format!(
                    "{source}: {name} must not exceed {} s, got {value}",
                    MAX_INTERVAL.as_secs()
                )));
            }
            Ok(value.max(MIN_SECONDS))
        };

        self.update_interval_s = seconds("update_interval_s", self.update_interval_s)?;
        for (name, field) in [
            ("pl1_duration_s", &mut self.pl1_duration_s),
            ("pl2_duration_s", &mut self.pl2_duration_s),
        ] {
            if let Some(value) = field {
                *value = seconds(name, *value)?;
            }
        }
        for (name, field) in [
            ("pl1_watts", &mut self.pl1_watts),
            ("pl2_watts", &mut self.pl2_watts),
        ] {
            if let Some(value) = field {
                *value = finite(name, *value)?.max(MIN_SECONDS);
            }
        }

        if let Some(trip) = self.trip_temp_c {
            let trip = finite("trip_temp_c", trip)?;
            let valid = trip.clamp(TRIP_TEMP_RANGE.0, TRIP_TEMP_RANGE.1);
            if valid != trip {
                tracing::warn!(
                    "Overriding invalid trip_temp_c value in {}: {:.1} -> {:.1}",
                    source,
                    trip,
                    valid
                );
            }
            self.trip_temp_c = Some(valid);
        }

        for (plane, mv) in self.undervolt.iter() {
            let mv = finite("undervolt", mv)?;
            if mv > 0.0 {
                return Err(PowerguardError::Config(format!(
                    "{source}: undervolt offset for {plane} must not be positive ({mv} mV)"
                )));
            }
            if mv < UNDERVOLT_LIMIT_MV {
                return Err(PowerguardError::Config(format!(
                    "{source}: undervolt offset for {plane} must be >= {UNDERVOLT_LIMIT_MV} mV, got {mv}"
                )));
            }
        }

        for (plane, amps) in self.iccmax.iter() {
            if !amps.is_finite() || amps <= 0.0 || amps > ICCMAX_LIMIT_AMPS {
                return Err(PowerguardError::Config(format!(
                    "{source}: IccMax for {plane} must be in (0, {ICCMAX_LIMIT_AMPS}] A, got {amps}"
                )));
            }
        }

        if source == PowerSource::Battery && self.hwp_auto_mode {
            tracing::info!("hwp_auto_mode is only honoured in the AC profile");
        }

        Ok(())
    }
}

/// The AC and battery profiles plus global settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSet {
    pub ac: Profile,
    pub battery: Profile,
    /// Explicit sysfs `online` file used to detect AC power
    pub power_supply_path: Option<PathBuf>,
}

impl ProfileSet {
    pub fn get(&self, source: PowerSource) -> &Profile {
        match source {
            PowerSource::Ac => &self.ac,
            PowerSource::Battery => &self.battery,
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut set: ProfileSet = serde_json::from_str(content)?;
        set.validate()?;
        Ok(set)
    }

    fn validate(&mut self) -> Result<()> {
        self.ac.validate(PowerSource::Ac)?;
        self.battery.validate(PowerSource::Battery)?;

        if [&self.ac, &self.battery]
            .iter()
            .any(|p| p.undervolt.core != p.undervolt.cache)
        {
            tracing::warn!("On Skylake and newer CPUs CORE and CACHE undervolt values should match");
        }

        if [&self.ac, &self.battery]
            .iter()
            .any(|p| p.iccmax.iter().next().is_some())
        {
            tracing::warn!("Raising IccMax above design limits can damage your system");
        }

        Ok(())
    }

    /// Whether any profile needs the voltage mailbox
    pub fn uses_voltage_planes(&self) -> bool {
        [&self.ac, &self.battery]
            .iter()
            .any(|p| !p.undervolt.is_zero() || p.iccmax.iter().next().is_some())
    }
}

/// Where profiles come from, plus a change marker for autoreload
pub trait ProfileSource: Send {
    /// Modification marker; a different value means the source changed
    fn modified(&self) -> Option<SystemTime>;

    fn load(&self) -> Result<ProfileSet>;
}

/// JSON profile document on disk
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProfileSource for ConfigFile {
    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
    }

    fn load(&self) -> Result<ProfileSet> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            PowerguardError::Config(format!("Unable to read {}: {}", self.path.display(), e))
        })?;
        ProfileSet::parse(&content).map_err(|e| match e {
            PowerguardError::JsonError(e) => {
                PowerguardError::Config(format!("{}: {}", self.path.display(), e))
            }
            other => other,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"{
        "ac": {
            "update_interval_s": 5,
            "pl1_watts": 44,
            "pl1_duration_s": 28,
            "pl2_watts": 44,
            "pl2_duration_s": 0.002,
            "trip_temp_c": 95,
            "undervolt": { "core": -105, "gpu": -85, "cache": -105 },
            "hwp_auto_mode": true
        },
        "battery": {
            "update_interval_s": 30,
            "pl1_watts": 29,
            "pl1_duration_s": 28,
            "pl2_watts": 44,
            "pl2_duration_s": 0.002,
            "trip_temp_c": 85,
            "ctdp_level": "down"
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let set = ProfileSet::parse(SAMPLE).unwrap();
        assert!(set.ac.enabled);
        assert!(!set.ac.autoreload);
        assert_eq!(set.get(PowerSource::Battery).update_interval_s, 30.0);
        assert_eq!(set.ac.undervolt.get(Plane::Core), -105.0);
        assert_eq!(set.ac.undervolt.get(Plane::Uncore), 0.0);
        assert_eq!(set.battery.ctdp_level, Some(CtdpLevel::Down));
        assert!(set.battery.undervolt.is_zero());
        assert!(set.uses_voltage_planes());
        assert_eq!(set.power_supply_path, None);
    }

    #[test]
    fn test_trip_temperature_is_clamped() {
        let doc = SAMPLE.replace("\"trip_temp_c\": 95", "\"trip_temp_c\": 105");
        let set = ProfileSet::parse(&doc).unwrap();
        assert_eq!(set.ac.trip_temp_c, Some(97.0));
    }

    #[test]
    fn test_interval_floor() {
        let doc = SAMPLE.replace("\"update_interval_s\": 5", "\"update_interval_s\": 0");
        let set = ProfileSet::parse(&doc).unwrap();
        assert_eq!(set.ac.update_interval_s, 0.001);
    }

    #[test]
    fn test_positive_undervolt_is_config_error() {
        let doc = SAMPLE.replace("\"gpu\": -85", "\"gpu\": 10");
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));
    }

    #[test]
    fn test_interval_upper_bound() {
        let doc = SAMPLE.replace("\"update_interval_s\": 5", "\"update_interval_s\": 1e30");
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));

        let doc = SAMPLE.replace("\"pl1_duration_s\": 28", "\"pl1_duration_s\": 1e300");
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));

        let doc = SAMPLE.replace("\"update_interval_s\": 5", "\"update_interval_s\": 86400");
        let set = ProfileSet::parse(&doc).unwrap();
        assert_eq!(set.ac.update_interval_s, MAX_INTERVAL.as_secs_f64());
    }

    #[test]
    fn test_undervolt_below_field_range_is_config_error() {
        let doc = SAMPLE.replace("\"core\": -105", "\"core\": -1500");
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));

        let doc = SAMPLE.replace("\"core\": -105", "\"core\": -1000");
        let set = ProfileSet::parse(&doc).unwrap();
        assert_eq!(set.ac.undervolt.core, -1000.0);
    }

    #[test]
    fn test_iccmax_range() {
        let doc = SAMPLE.replace(
            "\"hwp_auto_mode\": true",
            "\"hwp_auto_mode\": true, \"iccmax\": { \"core\": 1023 }",
        );
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));

        // beyond the 10-bit field of quarter amps
        let doc = SAMPLE.replace(
            "\"hwp_auto_mode\": true",
            "\"hwp_auto_mode\": true, \"iccmax\": { \"cache\": 256 }",
        );
        assert!(matches!(
            ProfileSet::parse(&doc),
            Err(PowerguardError::Config(_))
        ));

        let doc = SAMPLE.replace(
            "\"hwp_auto_mode\": true",
            "\"hwp_auto_mode\": true, \"iccmax\": { \"gpu\": 64.5 }",
        );
        let set = ProfileSet::parse(&doc).unwrap();
        assert_eq!(set.ac.iccmax.iter().collect::<Vec<_>>(), vec![(Plane::Gpu, 64.5)]);
    }

    #[test]
    fn test_missing_interval_is_rejected() {
        let doc = SAMPLE.replace("\"update_interval_s\": 30,", "");
        assert!(ProfileSet::parse(&doc).is_err());
    }

    #[test]
    fn test_config_file_load_and_marker() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file.flush().unwrap();

        let source = ConfigFile::new(file.path());
        assert!(source.modified().is_some());
        let set = source.load().unwrap();
        assert_eq!(set.ac.pl1_watts, Some(44.0));

        let missing = ConfigFile::new(file.path().with_extension("missing"));
        assert!(missing.modified().is_none());
        assert!(matches!(missing.load(), Err(PowerguardError::Config(_))));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ \"ac\": ").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            ConfigFile::new(file.path()).load(),
            Err(PowerguardError::Config(_))
        ));
    }
}
