//! LiteFury device context and register protocol
//!
//! [`LitefuryDevice`] is the single owned representation of one paired
//! board: the mapped register window, the MSI binding, the completion
//! signal, and the search gate. Every operation takes a reference to it;
//! there is no ambient state, so multiple contexts (e.g. one real board
//! and one simulator) coexist in one process.

use crate::bus::{RegisterBus, WindowMapping};
use crate::error::Result;
use crate::irq::{spawn_irq_listener, wake_listener, CompletionSignal};
use crate::mmio::MappedWindow;
use crate::vfio::VfioDevice;
use litefury_chip::{bar, regs};
use rustix::event::{eventfd, EventfdFlags};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
struct IrqRuntime {
    event_fd: Arc<OwnedFd>,
    shutdown: Arc<AtomicBool>,
    listener: Option<std::thread::JoinHandle<()>>,
}

/// One paired LiteFury board (or simulator).
///
/// Acquired with [`LitefuryDevice::acquire`], released exactly once when
/// the value is dropped. The context is shared (`Arc`) between the
/// interrupt listener and any number of file handles.
#[derive(Debug)]
pub struct LitefuryDevice {
    label: String,
    bus: Arc<dyn RegisterBus>,
    window_size: usize,
    completion: Arc<CompletionSignal>,
    /// Serializes the blocking clear→start→wait→read sequence. The raw
    /// cursor surface does not take this gate; see the crate docs for the
    /// concurrency contract.
    search_gate: Mutex<()>,
    irq: Option<IrqRuntime>,
    vfio: Option<VfioDevice>,
}

impl LitefuryDevice {
    /// Acquire the board at `pcie_address`.
    ///
    /// Ordered bring-up: open the VFIO device (device enable), map the
    /// BAR0 register window, enable bus-mastering, bind MSI vector 0 to an
    /// eventfd (irq allocation), spawn the interrupt listener (irq
    /// handler). A failure at any step rolls back every earlier step
    /// before returning — fds close, the window unmaps, and the
    /// config-space bits are cleared again.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` naming the failing step.
    pub fn acquire(pcie_address: &str) -> Result<Self> {
        tracing::info!("Acquiring LiteFury at {pcie_address}");

        let vfio = VfioDevice::open(pcie_address)?;

        let window = MappedWindow::map(&vfio, bar::bar0::VFIO_INDEX)?;
        let window_size = window.len();
        let bus: Arc<dyn RegisterBus> = Arc::new(window);

        vfio.enable_bus_master()?;

        let event_fd = match eventfd(0, EventfdFlags::CLOEXEC) {
            Ok(fd) => Arc::new(fd),
            Err(e) => {
                let _ = vfio.disable_bus_master();
                return Err(crate::LitefuryError::acquire_failed(
                    "irq allocation",
                    format!("eventfd failed: {e}"),
                ));
            }
        };

        if let Err(e) = vfio.enable_msi(event_fd.as_fd()) {
            let _ = vfio.disable_bus_master();
            return Err(e);
        }

        let completion = Arc::new(CompletionSignal::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let listener = match spawn_irq_listener(
            Arc::clone(&event_fd),
            Arc::clone(&completion),
            Arc::clone(&shutdown),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = vfio.disable_msi();
                let _ = vfio.disable_bus_master();
                return Err(e);
            }
        };

        tracing::info!("Acquired {pcie_address}: {window_size:#x}-byte register window, MSI bound");

        Ok(Self {
            label: pcie_address.to_string(),
            bus,
            window_size,
            completion,
            search_gate: Mutex::new(()),
            irq: Some(IrqRuntime {
                event_fd,
                shutdown,
                listener: Some(listener),
            }),
            vfio: Some(vfio),
        })
    }

    /// Build a context over an arbitrary register bus — used for the
    /// simulated pipeline and for tests. No VFIO resources, no listener;
    /// completion is signalled by whoever drives the bus.
    pub fn with_bus(bus: Arc<dyn RegisterBus>, label: impl Into<String>) -> Self {
        let window_size = bus.len();
        Self {
            label: label.into(),
            bus,
            window_size,
            completion: Arc::new(CompletionSignal::new()),
            search_gate: Mutex::new(()),
            irq: None,
            vfio: None,
        }
    }

    /// Release the device. Equivalent to dropping the last reference;
    /// provided for call sites that want the teardown to be explicit.
    pub fn release(self) {}

    /// PCIe address of the board, or the simulator label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of the mapped register window in bytes.
    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// The context's completion signal.
    #[must_use]
    pub fn completion(&self) -> &Arc<CompletionSignal> {
        &self.completion
    }

    // ── Register protocol ────────────────────────────────────────────────

    /// Read the 32-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` for an out-of-window or unaligned offset.
    pub fn read_register(&self, offset: usize) -> Result<u32> {
        self.bus.read32(offset)
    }

    /// Write the 32-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` for an out-of-window or unaligned offset.
    pub fn write_register(&self, offset: usize, value: u32) -> Result<()> {
        self.bus.write32(offset, value)
    }

    /// Zero the user-writable registers (`START_FLAG`, then
    /// `START_NUMBER`). Required before every new search: a stale trigger
    /// bit left in `START_FLAG` would fire the pipeline the moment a new
    /// seed lands.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if either store fails.
    pub fn clear_registers(&self) -> Result<()> {
        self.bus.write32(regs::START_FLAG, 0)?;
        self.bus.write32(regs::START_NUMBER, 0)?;
        Ok(())
    }

    /// Trigger a search from `seed`.
    ///
    /// The seed store must reach the fabric before the trigger store: the
    /// pipeline samples `START_NUMBER` on the `START_FLAG` transition.
    /// Program order on the bus gives us that; do not reorder these.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if either store fails.
    pub fn start_search(&self, seed: u32) -> Result<()> {
        self.bus.write32(regs::START_NUMBER, seed)?;
        self.bus.write32(regs::START_FLAG, regs::START)?;
        Ok(())
    }

    /// Whether a previously started search has completed.
    ///
    /// True iff `DONE_FLAG` reads exactly 1; any other pattern (including
    /// uninitialized garbage) counts as not done.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the load fails.
    pub fn check_complete(&self) -> Result<bool> {
        Ok(self.bus.read32(regs::DONE_FLAG)? == regs::DONE)
    }

    /// Read the search result.
    ///
    /// Only meaningful after [`Self::check_complete`] has returned true
    /// (or a completion interrupt fired); before that the register is
    /// device-undefined.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the load fails.
    pub fn read_result(&self) -> Result<u32> {
        self.bus.read32(regs::PRIME_NUMBER)
    }

    /// Read the 64-bit cycle counter as `(high << 32) | low`.
    ///
    /// The two halves are separate bus reads, not an atomic pair; the
    /// fabric is believed to freeze the counter once `DONE_FLAG` is set,
    /// so reading after completion is safe. That freeze is asserted
    /// against the simulator in tests, not verified on silicon.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if either load fails.
    pub fn read_cycle_count(&self) -> Result<u64> {
        let high = self.bus.read32(regs::CYCLE_COUNT_HIGH)?;
        let low = self.bus.read32(regs::CYCLE_COUNT_LOW)?;
        Ok((u64::from(high) << 32) | u64::from(low))
    }

    // ── Blocking search ──────────────────────────────────────────────────

    /// Run one search to completion, blocking on the interrupt.
    ///
    /// Holds the search gate across the whole clear→start→wait→read
    /// sequence, so concurrent callers serialize here and each gets the
    /// result of its own seed.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if [`Self::cancel_search`] fires during the
    /// wait (the output registers are not read in that case), or
    /// `BusFault` on a register access failure.
    pub fn find_prime(&self, seed: u32) -> Result<u32> {
        let _search = self
            .search_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.completion.reset();
        self.clear_registers()?;
        self.start_search(seed)?;
        self.completion.wait()?;
        let prime = self.read_result()?;
        tracing::debug!(seed, prime, "blocking search complete");
        Ok(prime)
    }

    /// Abort a blocking wait in progress. The waiter returns
    /// [`crate::LitefuryError::Interrupted`]; the hardware search itself
    /// is not stopped.
    pub fn cancel_search(&self) {
        self.completion.cancel();
    }

    /// Interrupt entry point: set the completion signal. The real driver
    /// reaches this through the eventfd listener, which has already
    /// acknowledged the vector; simulators call it directly.
    pub fn on_interrupt(&self) {
        self.completion.signal();
    }

    // ── Escape hatch ─────────────────────────────────────────────────────

    /// Share raw load/store access to the whole register window.
    ///
    /// Bypasses every sequencing guarantee of the protocol layer; see
    /// [`WindowMapping`]. The handle keeps the mapping alive even if the
    /// device context is dropped first.
    #[must_use]
    pub fn map_window(&self) -> WindowMapping {
        WindowMapping::new(Arc::clone(&self.bus))
    }
}

impl Drop for LitefuryDevice {
    fn drop(&mut self) {
        // Reverse of acquire: irq handler and vector first, then
        // bus-mastering; the window unmaps when its last Arc drops and the
        // VFIO fds close after that.
        if let Some(mut irq) = self.irq.take() {
            irq.shutdown.store(true, Ordering::Release);
            if let Some(vfio) = &self.vfio {
                let _ = vfio.disable_msi();
            }
            wake_listener(&irq.event_fd);
            if let Some(listener) = irq.listener.take() {
                let _ = listener.join();
            }
        }
        if let Some(vfio) = &self.vfio {
            let _ = vfio.disable_bus_master();
        }
        tracing::info!("Released device {}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPipeline;
    use litefury_chip::regs;

    fn simulated() -> (LitefuryDevice, Arc<SimulatedPipeline>) {
        let sim = Arc::new(SimulatedPipeline::new());
        let bus: Arc<dyn RegisterBus> = Arc::clone(&sim) as Arc<dyn RegisterBus>;
        let device = LitefuryDevice::with_bus(bus, "simulated");
        sim.attach_completion(Arc::clone(device.completion()));
        (device, sim)
    }

    #[test]
    fn start_search_writes_seed_before_trigger() {
        let (device, sim) = simulated();
        device.start_search(977).expect("start");

        let writes = sim.writes();
        let seed_pos = writes
            .iter()
            .position(|&(off, _)| off == regs::START_NUMBER)
            .expect("seed write recorded");
        let flag_pos = writes
            .iter()
            .position(|&(off, val)| off == regs::START_FLAG && val == regs::START)
            .expect("trigger write recorded");
        assert!(seed_pos < flag_pos, "seed must land before the trigger");
    }

    #[test]
    fn clear_registers_zeroes_only_writable_registers() {
        let (device, sim) = simulated();
        device.clear_registers().expect("clear");
        assert_eq!(
            sim.writes(),
            vec![(regs::START_FLAG, 0), (regs::START_NUMBER, 0)]
        );
    }

    #[test]
    fn check_complete_requires_exactly_one() {
        let (device, sim) = simulated();
        assert!(!device.check_complete().expect("fresh device not done"));

        sim.set_raw(regs::DONE_FLAG, 1);
        assert!(device.check_complete().expect("done"));

        for garbage in [2, 0x8000_0000, 0xFFFF_FFFF, 3] {
            sim.set_raw(regs::DONE_FLAG, garbage);
            assert!(
                !device.check_complete().expect("read ok"),
                "{garbage:#x} must not count as done"
            );
        }
    }

    #[test]
    fn cycle_count_composes_high_and_low() {
        let (device, sim) = simulated();
        sim.set_raw(regs::CYCLE_COUNT_HIGH, 0x1);
        sim.set_raw(regs::CYCLE_COUNT_LOW, 0x2);
        assert_eq!(device.read_cycle_count().expect("read"), 0x1_0000_0002);
    }

    #[test]
    fn cycle_count_frozen_after_completion() {
        let (device, _sim) = simulated();
        let prime = device.find_prime(10_000).expect("search");
        assert!(prime >= 10_000);

        let first = device.read_cycle_count().expect("first read");
        let second = device.read_cycle_count().expect("second read");
        assert_eq!(first, second, "counter must not move once DONE_FLAG is set");
        assert!(first > 0);
    }

    #[test]
    fn find_prime_returns_result_for_seed() {
        let (device, _sim) = simulated();
        assert_eq!(device.find_prime(17).expect("search"), 17);
        assert_eq!(device.find_prime(18).expect("search"), 19);
    }

    #[test]
    fn find_prime_clears_before_triggering() {
        let (device, sim) = simulated();
        device.find_prime(100).expect("search");
        let writes = sim.writes();
        // clear (flag, seed), then seed, then trigger
        assert_eq!(writes[0], (regs::START_FLAG, 0));
        assert_eq!(writes[1], (regs::START_NUMBER, 0));
        assert_eq!(writes[2], (regs::START_NUMBER, 100));
        assert_eq!(writes[3], (regs::START_FLAG, regs::START));
    }

    #[test]
    fn cancelled_search_reports_interrupted() {
        let (device, sim) = simulated();
        sim.set_auto_complete(false);

        let device = Arc::new(device);
        let worker = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || device.find_prime(4242))
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        device.cancel_search();

        match worker.join().expect("worker thread") {
            Err(crate::LitefuryError::Interrupted) => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }

    #[test]
    fn out_of_window_access_is_a_bus_fault() {
        let (device, _sim) = simulated();
        match device.read_register(0x1000) {
            Err(crate::LitefuryError::BusFault { offset, .. }) => assert_eq!(offset, 0x1000),
            other => panic!("expected BusFault, got {other:?}"),
        }
    }
}
