//! File-like device surface
//!
//! The compatibility surface the original clients drive: a per-handle byte
//! cursor positioned with [`DeviceFile::seek`] and used as the implicit
//! register address for [`DeviceFile::read`] and [`DeviceFile::write`],
//! plus the blocking [`DeviceFile::control`] command and the raw
//! [`DeviceFile::map_window`] escape hatch.
//!
//! Two inherited quirks are part of the contract and deliberately kept:
//!
//! - `read` always performs exactly one 32-bit register read and copies 4
//!   bytes, but the cursor advances by the *requested* count. Callers
//!   stay in sync with the register layout by always asking for 4 bytes;
//!   asking for 8 is how the cycle-count logger walks HIGH→LOW in one
//!   seek.
//! - `write` applies only the first 4 bytes of the buffer but advances the
//!   cursor by the full count — which is exactly what lets a client clear
//!   two adjacent registers with back-to-back 4-byte writes and no second
//!   seek.
//!
//! Addressed access (`read_register`/`write_register` on the device) is
//! the primary API; this module exists for collaborators written against
//! the cursor model.

// Host-side timing trace narrows u128 micros; registers never need it wider
#![allow(clippy::cast_possible_truncation)]

use crate::bus::WindowMapping;
use crate::device::LitefuryDevice;
use crate::error::{LitefuryError, Result};
use litefury_chip::regs;
use std::sync::Arc;
use std::time::Instant;

/// Control command: run one blocking search (`payload.seed` in,
/// `payload.result` out).
pub const CTL_FIND_PRIME: u32 = 0;

/// In/out payload of the blocking-search control command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockingSearch {
    /// Seed the search starts from.
    pub seed: u32,
    /// Search result; written only on success.
    pub result: u32,
}

impl BlockingSearch {
    /// Payload for a search from `seed`.
    #[must_use]
    pub fn from_seed(seed: u32) -> Self {
        Self { seed, result: 0 }
    }
}

/// Cursor positioning mode for [`DeviceFile::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute offset from the start of the register window.
    Set,
    /// Offset relative to the current cursor.
    Current,
}

/// The registered device interface: hands out per-open file handles over
/// one shared device context.
#[derive(Debug, Clone)]
pub struct Interface {
    device: Arc<LitefuryDevice>,
}

impl Interface {
    /// Build the interface for a device, validating that its window
    /// actually covers the register file.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the mapped window is smaller than the
    /// register file (wrong bitstream or truncated BAR).
    pub fn new(device: Arc<LitefuryDevice>) -> Result<Self> {
        let window = device.window_size();
        if window < regs::REGISTER_FILE_BYTES {
            return Err(LitefuryError::acquire_failed(
                "interface registration",
                format!(
                    "register window is {window} bytes, need {}",
                    regs::REGISTER_FILE_BYTES
                ),
            ));
        }
        Ok(Self { device })
    }

    /// Open a file handle. No resource acquisition happens here — the
    /// device was fully acquired at pairing time.
    #[must_use]
    pub fn open(&self) -> DeviceFile {
        DeviceFile::open(Arc::clone(&self.device))
    }

    /// The shared device context behind this interface.
    #[must_use]
    pub fn device(&self) -> &Arc<LitefuryDevice> {
        &self.device
    }
}

/// One open handle: a cursor over the register window.
///
/// Handles are cheap and independent; the register window and completion
/// signal behind them are shared.
#[derive(Debug)]
pub struct DeviceFile {
    device: Arc<LitefuryDevice>,
    cursor: i64,
    /// Host-side timing of the last trigger, for trace-level profiling.
    triggered_at: Option<Instant>,
}

impl DeviceFile {
    /// Open a handle on `device` with the cursor at offset 0.
    #[must_use]
    pub fn open(device: Arc<LitefuryDevice>) -> Self {
        tracing::debug!("File opened on {}", device.label());
        Self {
            device,
            cursor: 0,
            triggered_at: None,
        }
    }

    /// Current cursor position.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Move the cursor; returns the new position.
    ///
    /// No bounds check happens here — an out-of-window cursor faults at
    /// the next access, as the bus would.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        self.cursor = match whence {
            Whence::Set => offset,
            Whence::Current => self.cursor + offset,
        };
        tracing::trace!("seek to {}", self.cursor);
        self.cursor
    }

    fn cursor_offset(&self) -> Result<usize> {
        usize::try_from(self.cursor)
            .map_err(|_| LitefuryError::bus_fault(0, format!("negative cursor {}", self.cursor)))
    }

    /// Read the register at the cursor into `buf`.
    ///
    /// Performs exactly one 32-bit register read, copies its 4 bytes into
    /// the front of `buf`, advances the cursor by `buf.len()`, and returns
    /// the 4 bytes copied.
    ///
    /// # Errors
    ///
    /// `InvalidBuffer` if `buf` holds fewer than 4 bytes (nothing is read
    /// from the device); `BusFault` if the cursor is outside the window.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 4 {
            return Err(LitefuryError::InvalidBuffer {
                needed: 4,
                got: buf.len(),
            });
        }

        let offset = self.cursor_offset()?;
        let value = self.device.read_register(offset)?;
        buf[..4].copy_from_slice(&value.to_ne_bytes());

        if offset == regs::DONE_FLAG && value == regs::DONE {
            if let Some(triggered) = self.triggered_at.take() {
                tracing::trace!(
                    elapsed_us = triggered.elapsed().as_micros() as u64,
                    "search observed complete (host-side timing)"
                );
            }
        }

        self.cursor += i64::try_from(buf.len()).unwrap_or(i64::MAX);
        Ok(4)
    }

    /// Write the first 4 bytes of `data` to the register at the cursor.
    ///
    /// Advances the cursor by `data.len()` and returns `data.len()` — the
    /// whole buffer is consumed even though one register is written.
    ///
    /// # Errors
    ///
    /// `InvalidBuffer` if `data` holds fewer than 4 bytes (nothing reaches
    /// the device); `BusFault` if the cursor is outside the window.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() < 4 {
            return Err(LitefuryError::InvalidBuffer {
                needed: 4,
                got: data.len(),
            });
        }

        let offset = self.cursor_offset()?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[..4]);
        let value = u32::from_ne_bytes(word);

        if offset == regs::START_FLAG && value & regs::START != 0 {
            self.triggered_at = Some(Instant::now());
        }

        self.device.write_register(offset, value)?;
        self.cursor += i64::try_from(data.len()).unwrap_or(i64::MAX);
        Ok(data.len())
    }

    /// Issue a control command.
    ///
    /// Only [`CTL_FIND_PRIME`] is defined: clear the registers, start a
    /// search from `payload.seed`, block until the completion interrupt,
    /// and store the result in `payload.result`. The cursor is untouched.
    ///
    /// # Errors
    ///
    /// `UnsupportedCommand` for any other command id, rejected before any
    /// hardware access. `Interrupted` if the wait is cancelled — the
    /// payload is left unmodified. `BusFault` on register access failure.
    pub fn control(&self, command: u32, payload: &mut BlockingSearch) -> Result<()> {
        match command {
            CTL_FIND_PRIME => {
                let result = self.device.find_prime(payload.seed)?;
                payload.result = result;
                Ok(())
            }
            other => Err(LitefuryError::UnsupportedCommand { command: other }),
        }
    }

    /// Raw shared mapping of the whole register window.
    ///
    /// Escape hatch: see [`WindowMapping`] for the (lack of) guarantees.
    #[must_use]
    pub fn map_window(&self) -> WindowMapping {
        self.device.map_window()
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        tracing::debug!("File closed on {}", self.device.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::simulated_device;

    #[test]
    fn read_copies_four_bytes_and_advances_by_request() {
        let (device, sim) = simulated_device();
        sim.set_raw(regs::PRIME_NUMBER, 0x1234_5678);

        let mut file = DeviceFile::open(device);
        file.seek(regs::PRIME_NUMBER as i64, Whence::Set);

        let mut buf = [0u8; 8];
        let copied = file.read(&mut buf).expect("read");
        assert_eq!(copied, 4);
        assert_eq!(u32::from_ne_bytes(buf[..4].try_into().unwrap()), 0x1234_5678);
        assert_eq!(&buf[4..], &[0u8; 4], "tail untouched");
        // Cursor moved by the requested 8 bytes, not the 4 copied.
        assert_eq!(file.cursor(), regs::PRIME_NUMBER as i64 + 8);
    }

    #[test]
    fn sequential_writes_hit_adjacent_registers() {
        let (device, sim) = simulated_device();
        let mut file = DeviceFile::open(device);

        // The classic pre-search clear: seek once, write twice.
        file.seek(regs::START_FLAG as i64, Whence::Set);
        file.write(&0u32.to_ne_bytes()).expect("clear flag");
        file.write(&0u32.to_ne_bytes()).expect("clear seed");

        assert_eq!(
            sim.writes(),
            vec![(regs::START_FLAG, 0), (regs::START_NUMBER, 0)]
        );
    }

    #[test]
    fn write_applies_only_first_word() {
        let (device, sim) = simulated_device();
        let mut file = DeviceFile::open(device);

        file.seek(regs::START_NUMBER as i64, Whence::Set);
        let mut data = Vec::new();
        data.extend_from_slice(&0xAAAA_AAAAu32.to_ne_bytes());
        data.extend_from_slice(&0xBBBB_BBBBu32.to_ne_bytes());
        let written = file.write(&data).expect("write");

        assert_eq!(written, 8);
        assert_eq!(sim.writes(), vec![(regs::START_NUMBER, 0xAAAA_AAAA)]);
        assert_eq!(file.cursor(), regs::START_NUMBER as i64 + 8);
    }

    #[test]
    fn short_buffers_are_rejected_without_touching_hardware() {
        let (device, sim) = simulated_device();
        let mut file = DeviceFile::open(device);

        let mut small = [0u8; 3];
        assert!(matches!(
            file.read(&mut small),
            Err(LitefuryError::InvalidBuffer { needed: 4, got: 3 })
        ));
        assert!(matches!(
            file.write(&[1, 2]),
            Err(LitefuryError::InvalidBuffer { needed: 4, got: 2 })
        ));
        assert!(sim.writes().is_empty());
        assert_eq!(file.cursor(), 0, "failed transfers must not move the cursor");
    }

    #[test]
    fn seek_modes_compose() {
        let (device, _sim) = simulated_device();
        let mut file = DeviceFile::open(device);

        assert_eq!(file.seek(8, Whence::Set), 8);
        assert_eq!(file.seek(4, Whence::Current), 12);
        assert_eq!(file.seek(-12, Whence::Current), 0);
    }

    #[test]
    fn negative_cursor_faults_at_access() {
        let (device, _sim) = simulated_device();
        let mut file = DeviceFile::open(device);
        file.seek(-4, Whence::Set);
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read(&mut buf),
            Err(LitefuryError::BusFault { .. })
        ));
    }

    #[test]
    fn control_runs_a_blocking_search() {
        let (device, _sim) = simulated_device();
        let file = DeviceFile::open(device);

        let mut payload = BlockingSearch::from_seed(1_000_000);
        file.control(CTL_FIND_PRIME, &mut payload).expect("control");
        assert_eq!(payload.seed, 1_000_000);
        assert_eq!(payload.result, 1_000_003);
    }

    #[test]
    fn unknown_command_is_rejected_before_hardware() {
        let (device, sim) = simulated_device();
        let file = DeviceFile::open(device);

        let mut payload = BlockingSearch::from_seed(7);
        match file.control(99, &mut payload) {
            Err(LitefuryError::UnsupportedCommand { command: 99 }) => {}
            other => panic!("expected UnsupportedCommand, got {other:?}"),
        }
        assert!(sim.writes().is_empty(), "rejected command must not touch registers");
        assert_eq!(payload, BlockingSearch::from_seed(7));
    }

    #[test]
    fn cancelled_control_leaves_payload_unmodified() {
        let (device, sim) = simulated_device();
        sim.set_auto_complete(false);
        let file = DeviceFile::open(Arc::clone(&device));

        let mut payload = BlockingSearch::from_seed(123_456);
        let cancel = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                device.cancel_search();
            })
        };
        let outcome = file.control(CTL_FIND_PRIME, &mut payload);
        cancel.join().expect("cancel thread");

        assert!(matches!(outcome, Err(LitefuryError::Interrupted)));
        assert_eq!(payload, BlockingSearch::from_seed(123_456));
    }

    #[test]
    fn interface_rejects_undersized_window() {
        use crate::sim::SimulatedPipeline;
        let sim = Arc::new(SimulatedPipeline::with_window_bytes(16));
        let bus: Arc<dyn crate::RegisterBus> = sim;
        let device = Arc::new(LitefuryDevice::with_bus(bus, "short-window"));
        match Interface::new(device) {
            Err(LitefuryError::AcquireFailed { step, .. }) => {
                assert_eq!(step, "interface registration");
            }
            other => panic!("expected AcquireFailed, got {other:?}"),
        }
    }

    #[test]
    fn map_window_shares_raw_access() {
        let (device, sim) = simulated_device();
        let file = DeviceFile::open(device);
        let window = file.map_window();

        window.store(regs::START_NUMBER, 555).expect("raw store");
        assert_eq!(window.load(regs::START_NUMBER).expect("raw load"), 555);
        assert_eq!(window.len(), regs::REGISTER_FILE_BYTES);
        // Raw stores are visible on the same bus the protocol uses.
        assert_eq!(sim.writes(), vec![(regs::START_NUMBER, 555)]);
    }
}
