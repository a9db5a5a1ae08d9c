//! Interrupt delivery and completion synchronization
//!
//! The board raises one MSI when a search finishes. VFIO turns that into a
//! counter increment on an eventfd; a listener thread blocks on the
//! eventfd, acknowledges the vector by consuming the count, and sets the
//! device's [`CompletionSignal`]. A caller blocked in the control path
//! wakes up, reads the result, and returns.
//!
//! The signal is one slot per device, not per request: two concurrent
//! blocking searches would race on it. The device's search gate keeps at
//! most one blocking search outstanding.

// Millisecond counts for error reporting fit in u64
#![allow(clippy::cast_possible_truncation)]

use crate::error::{LitefuryError, Result};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct SignalState {
    completed: bool,
    cancelled: bool,
}

/// Single-slot completion signal.
///
/// Set by the interrupt path, consumed by exactly one blocking waiter.
/// Cancellation wakes the waiter with a distinct [`LitefuryError::Interrupted`]
/// so "search finished" and "wait aborted" cannot be confused.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Create an empty signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the slot complete and wake the waiter.
    ///
    /// Interrupt-path safe: no allocation, no blocking beyond the short
    /// internal critical section.
    pub fn signal(&self) {
        let mut state = self.lock();
        state.completed = true;
        drop(state);
        self.cond.notify_one();
    }

    /// Wake any waiter with [`LitefuryError::Interrupted`].
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Discard a stale completion or cancellation left in the slot.
    ///
    /// Called before triggering a new search so an interrupt from a
    /// previous, unwaited search cannot satisfy the new wait.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.completed = false;
        state.cancelled = false;
    }

    /// Block until the slot is signalled, consuming it.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if [`Self::cancel`] fires first.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        while !state.completed && !state.cancelled {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::consume(&mut state)
    }

    /// Block until the slot is signalled or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` on cancellation, `Timeout` after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        while !state.completed && !state.cancelled {
            let now = std::time::Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Err(LitefuryError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            };
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Self::consume(&mut state)
    }

    fn consume(state: &mut SignalState) -> Result<()> {
        if state.cancelled {
            state.cancelled = false;
            return Err(LitefuryError::Interrupted);
        }
        state.completed = false;
        Ok(())
    }
}

/// Spawn the interrupt listener bound to `completion`.
///
/// Each loop iteration blocks on the eventfd; the read both acknowledges
/// the MSI (consuming the counter) and wakes the thread. A shutdown is a
/// deliberate self-post of the eventfd with `shutdown` already set.
///
/// # Errors
///
/// Returns `AcquireFailed` if the OS refuses to spawn the thread.
pub(crate) fn spawn_irq_listener(
    event_fd: Arc<OwnedFd>,
    completion: Arc<CompletionSignal>,
    shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("litefury-irq".into())
        .spawn(move || loop {
            let mut count = [0u8; 8];
            match rustix::io::read(&*event_fd, &mut count) {
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => {
                    tracing::warn!("IRQ eventfd read failed, listener exiting: {e}");
                    break;
                }
            }
            if shutdown.load(Ordering::Acquire) {
                tracing::debug!("IRQ listener shutting down");
                break;
            }
            tracing::trace!("interrupt: search complete");
            completion.signal();
        })
        .map_err(|e| {
            LitefuryError::acquire_failed("irq handler", format!("cannot spawn listener: {e}"))
        })
}

/// Wake the listener thread for shutdown by posting the eventfd.
pub(crate) fn wake_listener(event_fd: &OwnedFd) {
    let one = 1u64.to_ne_bytes();
    if let Err(e) = rustix::io::write(event_fd, &one) {
        tracing::warn!("Failed to wake IRQ listener: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_then_wait_completes() {
        let signal = CompletionSignal::new();
        signal.signal();
        assert!(signal.wait().is_ok());
    }

    #[test]
    fn wait_consumes_the_slot() {
        let signal = CompletionSignal::new();
        signal.signal();
        signal.wait().expect("first wait consumes the signal");
        // Slot is empty again; a bounded wait must time out.
        match signal.wait_timeout(Duration::from_millis(10)) {
            Err(LitefuryError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn cancel_wakes_waiter_with_interrupted() {
        let signal = Arc::new(CompletionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.cancel();
        match waiter.join().expect("waiter thread") {
            Err(LitefuryError::Interrupted) => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }

    #[test]
    fn cancel_does_not_leave_slot_completed() {
        let signal = CompletionSignal::new();
        signal.cancel();
        match signal.wait_timeout(Duration::from_millis(10)) {
            Err(LitefuryError::Interrupted) => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
        // Cancellation was consumed; the slot is empty again.
        match signal.wait_timeout(Duration::from_millis(10)) {
            Err(LitefuryError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn signal_from_another_thread_unblocks_wait() {
        let signal = Arc::new(CompletionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(waiter.join().expect("waiter thread").is_ok());
    }

    #[test]
    fn reset_discards_stale_completion() {
        let signal = CompletionSignal::new();
        signal.signal();
        signal.reset();
        match signal.wait_timeout(Duration::from_millis(10)) {
            Err(LitefuryError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
