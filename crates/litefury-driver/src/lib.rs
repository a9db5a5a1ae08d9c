//! Pure Rust userspace driver for the LiteFury FPGA prime-search pipeline.
//!
//! The board exposes a 24-byte register file through BAR0: write a seed,
//! raise a trigger, and the fabric walks to the next prime while a cycle
//! counter measures the walk. Completion is signalled by MSI. This crate
//! owns the whole software side:
//!
//! ```text
//! client (CLI / collaborator)
//!     │  seek/read/write/control/map
//!     ▼
//! DeviceFile ── cursor surface ──┐
//!     │                          │ raw escape hatch
//!     ▼                          ▼
//! LitefuryDevice (protocol)   WindowMapping
//!     │  read32/write32
//!     ▼
//! RegisterBus ── MappedWindow (VFIO/MMIO)  or  SimulatedPipeline (CI)
//!
//! MSI ─▶ eventfd ─▶ listener thread ─▶ CompletionSignal ─▶ blocked control call
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use litefury_driver::{DeviceManager, BlockingSearch, DeviceFile, CTL_FIND_PRIME};
//! use std::sync::Arc;
//!
//! # fn main() -> litefury_driver::Result<()> {
//! let manager = DeviceManager::discover()?;
//! let device = Arc::new(manager.acquire_first()?);
//!
//! let file = DeviceFile::open(device);
//! let mut search = BlockingSearch::from_seed(1_000_000);
//! file.control(CTL_FIND_PRIME, &mut search)?;
//! println!("next prime after {}: {}", search.seed, search.result);
//! # Ok(())
//! # }
//! ```
//!
//! No hardware? [`sim::simulated_device`] builds the same stack over an
//! in-memory pipeline — every non-`#[ignore]` test in this crate runs
//! against it.
//!
//! # Concurrency contract
//!
//! One completion slot exists per device, not per request. The blocking
//! [`DeviceFile::control`] path serializes on the device's search gate and
//! is safe under contention. The raw cursor surface and [`WindowMapping`]
//! are *not* serialized against anything; interleaving them with an
//! in-flight search can pair a seed with the wrong result. See
//! `tests/concurrency.rs` for the demonstration of both halves.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod bus;
mod device;
mod discovery;
mod error;
mod file;
mod irq;
pub mod mmio;
pub mod setup;
pub mod sim;
pub mod vfio;

/// Hardware identification constants (re-exported from litefury-chip).
pub mod pcie_ids {
    pub use litefury_chip::pcie::{
        lspci_filter, DEVICE_NAME, LITEFURY_DEVICE_ID, LITEFURY_VENDOR_ID,
    };
}

pub use bus::{RegisterBus, WindowMapping};
pub use device::LitefuryDevice;
pub use discovery::{DeviceInfo, DeviceManager};
pub use error::{LitefuryError, Result};
pub use file::{BlockingSearch, DeviceFile, Interface, Whence, CTL_FIND_PRIME};
pub use irq::CompletionSignal;
pub use setup::{install, Driver, HostBridge, SetupStage, TeardownStack};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BlockingSearch, CompletionSignal, DeviceFile, DeviceManager, Interface, LitefuryDevice,
        LitefuryError, RegisterBus, Result, Whence, WindowMapping, CTL_FIND_PRIME,
    };
}
