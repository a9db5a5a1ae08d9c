//! Simulated prime-search pipeline
//!
//! Implements [`RegisterBus`] over an in-memory register file with the same
//! contract as the bitstream: write a seed, raise the trigger, and the
//! "fabric" finds the next prime, latches it with a cycle count, and sets
//! the done flag. This enables:
//!
//! 1. **CI without hardware** — every protocol and file-surface test runs
//!    against the simulator.
//! 2. **Interrupt-path testing** — the simulator fires the device's
//!    completion signal exactly where the MSI would, or holds it back so
//!    cancellation paths can be exercised.
//! 3. **Write-order auditing** — every store is logged, so ordering
//!    requirements (seed before trigger) are assertable.
//!
//! The cycle model is deterministic: a fixed per-candidate cost, frozen
//! the moment the done flag is set — the freeze the real fabric is assumed
//! (but not proven) to implement.

// Register halves are deliberate 32-bit truncations of the 64-bit counter
#![allow(clippy::cast_possible_truncation)]

use crate::bus::RegisterBus;
use crate::device::LitefuryDevice;
use crate::error::{LitefuryError, Result};
use crate::irq::CompletionSignal;
use litefury_chip::regs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Simulated cycle cost per candidate examined.
const CYCLES_PER_CANDIDATE: u64 = 96;
/// Simulated fixed pipeline overhead in cycles.
const TRIGGER_OVERHEAD_CYCLES: u64 = 14;

/// Largest 32-bit prime; seeds beyond it saturate here.
const LARGEST_U32_PRIME: u32 = 4_294_967_291;

#[derive(Debug, Default)]
struct RegFile {
    start_flag: u32,
    start_number: u32,
    done_flag: u32,
    prime_number: u32,
    cycle_high: u32,
    cycle_low: u32,
    pending_seed: Option<u32>,
}

/// In-memory stand-in for the LiteFury prime-search bitstream.
#[derive(Debug)]
pub struct SimulatedPipeline {
    state: Mutex<RegFile>,
    writes: Mutex<Vec<(usize, u32)>>,
    completion: Mutex<Option<Arc<CompletionSignal>>>,
    auto_complete: AtomicBool,
    searches: AtomicU64,
    window_bytes: usize,
}

impl Default for SimulatedPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPipeline {
    /// Simulator with the real register-file span (24 bytes).
    #[must_use]
    pub fn new() -> Self {
        Self::with_window_bytes(regs::REGISTER_FILE_BYTES)
    }

    /// Simulator with a custom window size — undersized windows exercise
    /// the bring-up validation paths.
    #[must_use]
    pub fn with_window_bytes(window_bytes: usize) -> Self {
        Self {
            state: Mutex::new(RegFile::default()),
            writes: Mutex::new(Vec::new()),
            completion: Mutex::new(None),
            auto_complete: AtomicBool::new(true),
            searches: AtomicU64::new(0),
            window_bytes,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wire the simulator's "MSI" to a device's completion signal.
    pub fn attach_completion(&self, signal: Arc<CompletionSignal>) {
        *self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(signal);
    }

    /// When true (the default) a trigger write finishes the search
    /// immediately. When false the search stays pending until
    /// [`Self::finish_search`] — the hook for testing waits and
    /// cancellation.
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::Release);
    }

    /// Finish a pending search (manual-completion mode), firing the
    /// completion signal as the interrupt would.
    pub fn finish_search(&self) {
        let fired = {
            let mut state = self.lock_state();
            match state.pending_seed.take() {
                Some(seed) => {
                    Self::latch_result(&mut state, seed);
                    true
                }
                None => false,
            }
        };
        if fired {
            self.searches.fetch_add(1, Ordering::Relaxed);
            self.fire_completion();
        }
    }

    /// Test back door: set a register to an arbitrary value without going
    /// through the bus (models hardware-owned register contents).
    pub fn set_raw(&self, offset: usize, value: u32) {
        let mut state = self.lock_state();
        match offset {
            regs::START_FLAG => state.start_flag = value,
            regs::START_NUMBER => state.start_number = value,
            regs::DONE_FLAG => state.done_flag = value,
            regs::PRIME_NUMBER => state.prime_number = value,
            regs::CYCLE_COUNT_HIGH => state.cycle_high = value,
            regs::CYCLE_COUNT_LOW => state.cycle_low = value,
            _ => {}
        }
    }

    /// Every store seen on the bus, in order, as `(offset, value)`.
    #[must_use]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of searches the simulated fabric has completed.
    #[must_use]
    pub fn searches_completed(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    fn check_access(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 {
            return Err(LitefuryError::bus_fault(offset, "unaligned 32-bit access"));
        }
        if offset + 4 > self.window_bytes {
            return Err(LitefuryError::bus_fault(
                offset,
                format!("beyond simulated window of {:#x} bytes", self.window_bytes),
            ));
        }
        Ok(())
    }

    fn latch_result(state: &mut RegFile, seed: u32) {
        let prime = next_prime(seed);
        let candidates = u64::from(prime.saturating_sub(seed)) + 1;
        let cycles = candidates * CYCLES_PER_CANDIDATE + TRIGGER_OVERHEAD_CYCLES;
        state.prime_number = prime;
        state.cycle_high = (cycles >> 32) as u32;
        state.cycle_low = cycles as u32;
        state.done_flag = regs::DONE;
    }

    fn fire_completion(&self) {
        let signal = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(signal) = signal {
            signal.signal();
        }
    }
}

impl RegisterBus for SimulatedPipeline {
    fn read32(&self, offset: usize) -> Result<u32> {
        self.check_access(offset)?;
        let state = self.lock_state();
        Ok(match offset {
            regs::START_FLAG => state.start_flag,
            regs::START_NUMBER => state.start_number,
            regs::DONE_FLAG => state.done_flag,
            regs::PRIME_NUMBER => state.prime_number,
            regs::CYCLE_COUNT_HIGH => state.cycle_high,
            regs::CYCLE_COUNT_LOW => state.cycle_low,
            // Past the register file the AXI decode reads zero.
            _ => 0,
        })
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.check_access(offset)?;
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offset, value));

        let fired = {
            let mut state = self.lock_state();
            match offset {
                regs::START_FLAG => {
                    state.start_flag = value;
                    if value & regs::START != 0 {
                        // Trigger edge: the fabric samples the seed now.
                        state.done_flag = 0;
                        let seed = state.start_number;
                        if self.auto_complete.load(Ordering::Acquire) {
                            Self::latch_result(&mut state, seed);
                            true
                        } else {
                            state.pending_seed = Some(seed);
                            false
                        }
                    } else {
                        false
                    }
                }
                regs::START_NUMBER => {
                    state.start_number = value;
                    false
                }
                // Hardware-owned registers ignore host stores.
                _ => false,
            }
        };

        if fired {
            self.searches.fetch_add(1, Ordering::Relaxed);
            self.fire_completion();
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.window_bytes
    }
}

/// Build a ready-to-use simulated device: context, bus, and completion
/// signal wired together the way [`LitefuryDevice::acquire`] wires the
/// real board.
#[must_use]
pub fn simulated_device() -> (Arc<LitefuryDevice>, Arc<SimulatedPipeline>) {
    let sim = Arc::new(SimulatedPipeline::new());
    let bus: Arc<dyn RegisterBus> = Arc::clone(&sim) as Arc<dyn RegisterBus>;
    let device = Arc::new(LitefuryDevice::with_bus(bus, "simulated"));
    sim.attach_completion(Arc::clone(device.completion()));
    (device, sim)
}

/// Smallest prime ≥ `seed` — the search the fabric implements.
///
/// Seeds above the largest 32-bit prime saturate to it rather than
/// wrapping, which is more than the real pipeline promises.
#[must_use]
pub fn next_prime(seed: u32) -> u32 {
    if seed <= 2 {
        return 2;
    }
    let mut candidate = u64::from(seed) | 1;
    loop {
        if candidate > u64::from(u32::MAX) {
            return LARGEST_U32_PRIME;
        }
        if is_prime(candidate) {
            return candidate as u32;
        }
        candidate += 2;
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut divisor = 3u64;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}
