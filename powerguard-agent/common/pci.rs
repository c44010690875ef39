use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use powerguard_raw::current_arch::platform::PCI_MCHBAR_OFFSET;

use crate::error::{PowerguardError, Result};

const PCI_PROC_ROOT: &str = "/proc/bus/pci";

/// MCHBAR enable bit in the host bridge register
const MCHBAR_ENABLE: u64 = 1;
/// MCHBAR base is 32 KiB aligned
const MCHBAR_BASE_MASK: u64 = !0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

impl PciAddress {
    /// Host bridge, device 0:0.0
    pub const HOST_BRIDGE: PciAddress = PciAddress {
        bus: 0,
        device: 0,
        function: 0,
    };

    fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}/{:02x}/{:02x}.{}",
            PCI_PROC_ROOT, self.bus, self.device, self.function
        ))
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0000:{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Read-only handle on a device's PCI configuration space
pub struct PciHandle {
    file: parking_lot::Mutex<File>,
    address: PciAddress,
}

impl PciHandle {
    pub fn new(address: PciAddress) -> Result<Self> {
        let path = address.proc_path();
        let file = OpenOptions::new().read(true).open(&path).map_err(|e| {
            PowerguardError::Pci(format!("Failed to open {}: {}", path.display(), e))
        })?;

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            address,
        })
    }

    pub fn read32(&self, offset: u32) -> Result<u32> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64)).map_err(|e| {
            PowerguardError::Pci(format!(
                "Failed to seek to offset 0x{offset:X} on {}: {e}",
                self.address
            ))
        })?;

        let mut buffer = [0u8; 4];
        file.read_exact(&mut buffer).map_err(|e| {
            PowerguardError::Pci(format!(
                "Failed to read at offset 0x{offset:X} on {}: {e}",
                self.address
            ))
        })?;

        Ok(u32::from_le_bytes(buffer))
    }

    pub fn read64(&self, offset: u32) -> Result<u64> {
        let low = self.read32(offset)? as u64;
        let high = self.read32(offset + 4)? as u64;
        Ok(low | (high << 32))
    }
}

/// Physical MCHBAR base from the host bridge, if the window is enabled
pub fn read_mchbar_base() -> Result<u64> {
    let handle = PciHandle::new(PciAddress::HOST_BRIDGE)?;
    let raw = handle.read64(PCI_MCHBAR_OFFSET)?;
    decode_mchbar(raw)
}

fn decode_mchbar(raw: u64) -> Result<u64> {
    if raw & MCHBAR_ENABLE == 0 {
        return Err(PowerguardError::Pci(format!(
            "MCHBAR window is disabled (0x{raw:X})"
        )));
    }
    Ok(raw & MCHBAR_BASE_MASK)
}
