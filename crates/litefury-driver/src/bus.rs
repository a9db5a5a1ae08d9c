//! Register bus abstraction
//!
//! Everything above the mapping — protocol sequencing, the file-like
//! surface, the simulator — talks to the register window through
//! [`RegisterBus`]. The real implementation is [`crate::mmio::MappedWindow`];
//! [`crate::sim::SimulatedPipeline`] provides the hardware-free twin.

use crate::error::Result;
use std::fmt::Debug;
use std::sync::Arc;

/// One 32-bit register window.
///
/// Accesses are single volatile loads/stores against device-defined byte
/// offsets. Implementations bounds-check every access and report
/// out-of-window offsets as [`crate::LitefuryError::BusFault`]; they never
/// panic on bad offsets.
///
/// Writes take `&self`: the window is shared between the interrupt
/// listener and any number of file handles, and a 32-bit MMIO store is a
/// single bus transaction — serialization of *sequences* is the caller's
/// concern, not the bus's.
pub trait RegisterBus: Debug + Send + Sync {
    /// Read the 32-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if `offset + 4` exceeds the window.
    fn read32(&self, offset: usize) -> Result<u32>;

    /// Write the 32-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if `offset + 4` exceeds the window.
    fn write32(&self, offset: usize, value: u32) -> Result<()>;

    /// Size of the window in bytes.
    fn len(&self) -> usize;

    /// Whether the window is zero-sized (never true for a mapped device).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw shared view of the whole register window.
///
/// This is the escape hatch: direct load/store access to every offset with
/// **none** of the protocol layer's sequencing (no pre-search clear, no
/// seed-before-trigger ordering, no completion tracking). A stray store
/// through this handle can corrupt an in-flight search. Intended for
/// diagnostics and bring-up tooling, not as the primary interface.
#[derive(Debug, Clone)]
pub struct WindowMapping {
    bus: Arc<dyn RegisterBus>,
}

impl WindowMapping {
    pub(crate) fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self { bus }
    }

    /// Raw 32-bit load at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` on an out-of-window offset.
    pub fn load(&self, offset: usize) -> Result<u32> {
        self.bus.read32(offset)
    }

    /// Raw 32-bit store at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` on an out-of-window offset.
    pub fn store(&self, offset: usize, value: u32) -> Result<()> {
        self.bus.write32(offset, value)
    }

    /// Size of the window in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bus.len()
    }

    /// Whether the window is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }
}
