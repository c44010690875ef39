use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PowerguardError {
    #[error("Insufficient privilege for {device}: {reason}. Run as root and check that Secure Boot / kernel lockdown does not restrict MSR and /dev/mem access")]
    Privilege { device: String, reason: String },

    #[error("Read-back mismatch on {register}: wrote 0x{written:X}, read 0x{read:X}")]
    RegisterIo {
        register: &'static str,
        written: u64,
        read: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event subscription failed: {0}")]
    EventSubscription(String),

    #[error("MSR operation failed: {0}")]
    Msr(String),

    #[error("MMIO operation failed: {0}")]
    Mmio(String),

    #[error("PCI operation failed: {0}")]
    Pci(String),

    #[error("Unsupported CPU: {0}")]
    UnsupportedCpu(String),

    #[error("Another instance holds {0}")]
    InstanceLocked(String),

    #[error("Control loop stopped: {0}")]
    ControlLoop(String),

    #[error("Invalid register value: {0}")]
    Codec(#[from] powerguard_raw::CodecError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Nix error: {0}")]
    NixError(#[from] nix::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("D-Bus error: {0}")]
    DBusError(#[from] zbus::Error),
}

impl PowerguardError {
    /// Errors that abort the daemon instead of degrading a feature
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PowerguardError::Privilege { .. }
                | PowerguardError::UnsupportedCpu(_)
                | PowerguardError::InstanceLocked(_)
                | PowerguardError::ControlLoop(_)
        )
    }

    /// 1 for fatal privilege/device failures, 2 for anything else that
    /// stopped startup (for example an invalid profile document)
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            1
        } else {
            2
        }
    }

    /// Classify an open failure on a privileged device node
    pub fn from_open(device: &str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => PowerguardError::Privilege {
                device: device.to_string(),
                reason: err.to_string(),
            },
            _ if err.kind() == io::ErrorKind::PermissionDenied => PowerguardError::Privilege {
                device: device.to_string(),
                reason: err.to_string(),
            },
            _ => PowerguardError::IoError(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, PowerguardError>;
