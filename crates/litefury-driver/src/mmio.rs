//! Memory-mapped register window
//!
//! Maps the LiteFury's BAR0 AXI-Lite window into the process through the
//! VFIO device fd and exposes bounds-checked volatile 32-bit access.
//!
//! Register reads and writes must stay volatile: the fabric changes
//! register contents behind the compiler's back, and a write to
//! `START_FLAG` has side effects the compiler must not reorder or elide.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::bus::RegisterBus;
use crate::error::{LitefuryError, Result};
use crate::vfio::VfioDevice;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Mapped BAR0 register window.
///
/// Created during device acquisition, unmapped on drop. All access goes
/// through [`RegisterBus`]; offsets are validated against the mapped size
/// and 4-byte alignment before the pointer is touched, so a bad offset
/// surfaces as [`LitefuryError::BusFault`] rather than undefined behavior.
pub struct MappedWindow {
    ptr: NonNull<u8>,
    size: usize,
    bar: u32,
}

impl std::fmt::Debug for MappedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedWindow")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedWindow owns the mapping exclusively. Moving between
// threads doesn't invalidate it (mmap'd memory is process-wide).
unsafe impl Send for MappedWindow {}

// SAFETY: Sync - every access is a single bounds-checked volatile 32-bit
// load or store; the hardware serializes individual bus transactions.
// Sequencing of multi-register operations is the protocol layer's job.
unsafe impl Sync for MappedWindow {}

impl MappedWindow {
    /// Map a BAR region of `device`.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the region query or the mmap fails, or if
    /// the region has zero size (device not enabled / BAR not implemented).
    pub fn map(device: &VfioDevice, bar: u32) -> Result<Self> {
        let info = device.region_info(bar)?;

        if info.size == 0 {
            return Err(LitefuryError::acquire_failed(
                "window mapping",
                format!("BAR{bar} has zero size (not implemented in this bitstream?)"),
            ));
        }

        // SAFETY: the device fd is open and size/offset come from the
        // kernel's region info for it; on success the pointer is valid for
        // `size` bytes until munmap in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device.device_fd(),
                info.offset,
            )
            .map_err(|e| {
                LitefuryError::acquire_failed("window mapping", format!("Failed to mmap BAR{bar}: {e}"))
            })?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| LitefuryError::acquire_failed("window mapping", "mmap returned null"))?;

        tracing::info!(
            "Mapped BAR{bar} of {} at {ptr:p}, size={:#x}",
            device.pcie_address(),
            info.size
        );

        Ok(Self {
            ptr,
            size: info.size as usize,
            bar,
        })
    }

    fn check_access(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 {
            return Err(LitefuryError::bus_fault(offset, "unaligned 32-bit access"));
        }
        if offset + 4 > self.size {
            return Err(LitefuryError::bus_fault(
                offset,
                format!("beyond mapped window of {:#x} bytes", self.size),
            ));
        }
        Ok(())
    }

    /// Base pointer of the mapping (diagnostics only).
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl RegisterBus for MappedWindow {
    fn read32(&self, offset: usize) -> Result<u32> {
        self.check_access(offset)?;
        // SAFETY: offset is aligned and in bounds (checked above); ptr is
        // valid for self.size bytes; volatile because hardware owns the value.
        let value = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) };
        tracing::trace!("read32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.check_access(offset)?;
        tracing::trace!("write32 @ {offset:#x} = {value:#x}");
        // SAFETY: offset is aligned and in bounds (checked above); volatile
        // because the store triggers hardware side effects.
        unsafe {
            std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned in map(); Drop
        // runs at most once.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped BAR{}", self.bar);
    }
}
