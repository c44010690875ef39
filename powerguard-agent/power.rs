//! Power source detection through sysfs

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::named_enum;

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

named_enum! {
    /// Which profile the control loop enforces
    pub enum PowerSource {
        Ac => "AC",
        Battery => "BATTERY",
    }
}

/// Answers "are we on AC right now?" for the control loop
#[cfg_attr(test, mockall::automock)]
pub trait PowerSourceProvider: Send {
    fn current(&self) -> PowerSource;
}

/// Reads the `online` attribute of a mains power supply
///
/// With no configured path the first supply whose `type` is `Mains`, or whose
/// name starts with `AC`, is used. When nothing is readable the system is
/// assumed to run on battery and a warning is logged once.
pub struct SysfsPowerSource {
    root: PathBuf,
    configured: Option<PathBuf>,
    warned: AtomicBool,
}

impl SysfsPowerSource {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self::with_root(POWER_SUPPLY_ROOT, configured)
    }

    pub fn with_root(root: impl Into<PathBuf>, configured: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            configured,
            warned: AtomicBool::new(false),
        }
    }

    fn online_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.configured {
            return Some(path.clone());
        }

        let mut supplies: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        supplies.sort();

        supplies
            .into_iter()
            .find(|supply| is_mains(supply))
            .map(|supply| supply.join("online"))
    }

    fn read_online(&self) -> Option<bool> {
        let path = self.online_path()?;
        let content = std::fs::read_to_string(&path).ok()?;
        match content.trim() {
            "0" => Some(false),
            "" => None,
            _ => content.trim().parse::<u8>().ok().map(|v| v != 0),
        }
    }
}

fn is_mains(supply: &Path) -> bool {
    let kind = std::fs::read_to_string(supply.join("type")).unwrap_or_default();
    if kind.trim() == "Mains" {
        return true;
    }
    supply
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("AC"))
        .unwrap_or(false)
}

impl PowerSourceProvider for SysfsPowerSource {
    fn current(&self) -> PowerSource {
        match self.read_online() {
            Some(true) => PowerSource::Ac,
            Some(false) => PowerSource::Battery,
            None => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "No valid power supply online file found. Assuming that the system is running on battery power"
                    );
                }
                PowerSource::Battery
            }
        }
    }
}
