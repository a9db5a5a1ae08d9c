//! PCIe BAR layout for the LiteFury prime-search bitstream.
//!
//! ```text
//! BAR  Size    Type                  Purpose
//! ──── ─────── ───────────────────── ─────────────────────────────────
//!  0   64 KB   32-bit non-prefetch   AXI-Lite register window (MMIO)
//! ```
//!
//! Only BAR0 is wired up in the bitstream. The prime-search register file
//! occupies the first 24 bytes of the AXI-Lite window; the remainder of
//! the 64 KB decode range reads as zero.

/// BAR0 — AXI-Lite control window.
pub mod bar0 {
    /// Size of the decode range in bytes.
    pub const SIZE: u64 = 64 * 1024;
    /// BAR index for VFIO region queries.
    pub const VFIO_INDEX: u32 = 0;
    /// 32-bit BAR.
    pub const IS_64BIT: bool = false;
    /// Register space must not be prefetched.
    pub const IS_PREFETCHABLE: bool = false;
}

/// Offset of the register file within the AXI-Lite window.
pub const AXI_OFFSET: usize = 0x0000;
