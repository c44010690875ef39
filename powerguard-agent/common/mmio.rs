use std::ffi::c_void;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{PowerguardError, Result};

const DEV_MEM: &str = "/dev/mem";

/// Page-aligned span covering a physical window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Physical address rounded down to the page
    pub aligned_base: u64,
    /// Mapped length rounded up to whole pages
    pub mapped_len: usize,
    /// Offset of the requested address inside the mapping
    pub lead: usize,
}

impl PageSpan {
    pub fn new(physaddr: u64, len: usize, page_size: usize) -> Self {
        let page = page_size as u64;
        let aligned_base = physaddr - physaddr % page;
        let lead = (physaddr - aligned_base) as usize;
        let mapped_len = (lead + len).div_ceil(page_size) * page_size;
        Self {
            aligned_base,
            mapped_len,
            lead,
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// A scoped `/dev/mem` mapping of a physical register window
///
/// The mapping is released when the value drops.
pub struct MmioMapping {
    base: NonNull<u8>,
    span: PageSpan,
    len: usize,
    physaddr: u64,
}

// SAFETY: the mapping is only accessed through volatile 32-bit reads and
// writes of device registers; no Rust references into it are handed out.
unsafe impl Send for MmioMapping {}
unsafe impl Sync for MmioMapping {}

impl MmioMapping {
    pub fn map(physaddr: u64, len: usize) -> Result<Self> {
        let span = PageSpan::new(physaddr, len, page_size());
        let length = NonZeroUsize::new(span.mapped_len)
            .ok_or_else(|| PowerguardError::Mmio("Cannot map an empty window".to_string()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(DEV_MEM)
            .map_err(|e| PowerguardError::from_open(DEV_MEM, e))?;

        // SAFETY: a fresh shared mapping of device memory; the file may be
        // closed once the mapping exists.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&file),
                span.aligned_base as libc::off_t,
            )
        }
        .map_err(|e| match e {
            Errno::EPERM | Errno::EACCES => PowerguardError::Privilege {
                device: DEV_MEM.to_string(),
                reason: e.to_string(),
            },
            _ => PowerguardError::Mmio(format!(
                "Failed to map 0x{:X} (+0x{:X}) from {}: {}",
                physaddr, len, DEV_MEM, e
            )),
        })?;

        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| PowerguardError::Mmio("mmap returned a null pointer".to_string()))?;

        tracing::info!(
            "Mapped physical window 0x{:X}-0x{:X}",
            physaddr,
            physaddr + len as u64
        );

        Ok(Self {
            base,
            span,
            len,
            physaddr,
        })
    }

    fn register_ptr(&self, offset: usize) -> Result<*mut u32> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return Err(PowerguardError::Mmio(format!(
                "Offset 0x{:X} outside the 0x{:X}-byte window at 0x{:X}",
                offset, self.len, self.physaddr
            )));
        }
        // SAFETY: bounds checked above; lead + len <= mapped_len
        Ok(unsafe { self.base.as_ptr().add(self.span.lead + offset) } as *mut u32)
    }

    pub fn read32(&self, offset: usize) -> Result<u32> {
        let ptr = self.register_ptr(offset)?;
        // SAFETY: aligned, in-bounds pointer into the live mapping
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        let ptr = self.register_ptr(offset)?;
        // SAFETY: aligned, in-bounds pointer into the live mapping
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }
}

impl Drop for MmioMapping {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len describe the mapping created in `map`
        let result = unsafe { munmap(self.base.as_ptr() as *mut c_void, self.span.mapped_len) };
        if let Err(e) = result {
            tracing::warn!("Failed to unmap 0x{:X}: {}", self.physaddr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_span_rounds_outward() {
        let span = PageSpan::new(0xFED1_59A0, 8, 4096);
        assert_eq!(span.aligned_base, 0xFED1_5000);
        assert_eq!(span.lead, 0x9A0);
        assert_eq!(span.mapped_len, 4096);

        let span = PageSpan::new(0xFED1_0FFC, 8, 4096);
        assert_eq!(span.aligned_base, 0xFED1_0000);
        assert_eq!(span.mapped_len, 8192);
    }

    #[test]
    fn test_page_span_aligned_window() {
        let span = PageSpan::new(0xFED1_0000, 0x8000, 4096);
        assert_eq!(span.lead, 0);
        assert_eq!(span.mapped_len, 0x8000);
    }
}
