use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{PowerguardError, Result};

const MSR_PARAMETERS: &str = "/sys/module/msr/parameters/allow_writes";

pub struct MsrHandle {
    file: parking_lot::Mutex<File>,
    cpu_id: u32,
}

impl MsrHandle {
    pub fn new(cpu: u32) -> Result<Self> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PowerguardError::from_open(&path, e))?;

        tracing::debug!("Opened MSR handle {} for core {}", file.as_raw_fd(), cpu);

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            cpu_id: cpu,
        })
    }

    pub fn read(&self, addr: u64) -> Result<u64> {
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(addr)).map_err(|e| {
            PowerguardError::Msr(format!(
                "Failed to seek to MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        let mut buffer = [0u8; 8];
        file.read_exact(&mut buffer).map_err(|e| {
            PowerguardError::Msr(format!(
                "Failed to read MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        let value = u64::from_ne_bytes(buffer);
        tracing::trace!(
            "MSR read: CPU {} MSR 0x{:08x} = 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(value)
    }

    pub fn write(&self, addr: u64, value: u64) -> Result<()> {
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(addr)).map_err(|e| {
            PowerguardError::Msr(format!(
                "Failed to seek to MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        file.write_all(&value.to_ne_bytes()).map_err(|e| {
            PowerguardError::Msr(format!(
                "Failed to write MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        tracing::trace!(
            "MSR write: CPU {} MSR 0x{:08x} = 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(())
    }
}

/// Open MSR handles for a fixed set of logical CPUs
///
/// Handles are acquired together at start and closed when the value drops.
pub struct Msr {
    handles: BTreeMap<u32, MsrHandle>,
    cpus: Vec<u32>,
}

impl Msr {
    pub fn open(cpus: &[u32]) -> Result<Self> {
        if cpus.is_empty() {
            return Err(PowerguardError::Msr("No online CPUs to open".to_string()));
        }
        ensure_msr_module();

        let mut handles = BTreeMap::new();
        for &cpu in cpus {
            handles.insert(cpu, MsrHandle::new(cpu)?);
        }
        tracing::info!("Opened MSR handles for {} CPUs", handles.len());

        Ok(Self {
            cpus: handles.keys().copied().collect(),
            handles,
        })
    }

    fn handle(&self, cpu: u32) -> Result<&MsrHandle> {
        self.handles
            .get(&cpu)
            .ok_or_else(|| PowerguardError::Msr(format!("No MSR handle for CPU {cpu}")))
    }

    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    pub fn read(&self, cpu: u32, addr: u64) -> Result<u64> {
        self.handle(cpu)?.read(addr)
    }

    pub fn write(&self, cpu: u32, addr: u64, value: u64) -> Result<()> {
        self.handle(cpu)?.write(addr, value)
    }
}

/// Load the msr driver if its device nodes are missing
fn ensure_msr_module() {
    if Path::new("/dev/cpu/0/msr").exists() {
        return;
    }

    tracing::info!("MSR device nodes missing, loading the msr module");
    match std::process::Command::new("modprobe").arg("msr").status() {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!("modprobe msr exited with {}", status),
        Err(e) => tracing::warn!("Unable to run modprobe msr: {}", e),
    }
}

/// Ask the msr driver to stop warning about writes from userspace
pub fn allow_writes() {
    if !Path::new(MSR_PARAMETERS).exists() {
        return;
    }

    tracing::info!("Trying to unlock MSR allow_writes");
    if let Err(e) = std::fs::write(MSR_PARAMETERS, "on") {
        tracing::warn!(
            "Unable to set MSR allow_writes to on ({}). You might see warnings in kernel logs",
            e
        );
    }
}
