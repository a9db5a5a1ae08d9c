//! Driver bring-up and teardown
//!
//! Pairing a board with a host runs three ordered steps: map the register
//! window (device acquisition), build the file interface, and register
//! that interface with the host subsystem. Each completed step pushes a
//! named release token onto a [`TeardownStack`]; a failure unwinds the
//! stack, releasing exactly the steps that completed, newest first. Full
//! shutdown is the same walk from the top.
//!
//! The stack length is the setup progress counter — the single source of
//! truth for how far bring-up got. There is no other bookkeeping to drift
//! out of sync with it.

use crate::device::LitefuryDevice;
use crate::error::Result;
use crate::file::Interface;
use litefury_chip::pcie::DEVICE_NAME;
use std::sync::Arc;

/// How far bring-up has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Nothing acquired.
    Uninitialized,
    /// Register window mapped, device acquired.
    WindowMapped,
    /// File interface built and validated.
    InterfaceRegistered,
    /// Interface registered with the host subsystem; fully live.
    HostRegistered,
}

impl SetupStage {
    /// Stage reached after `progress` completed steps.
    #[must_use]
    pub fn from_progress(progress: usize) -> Self {
        match progress {
            0 => Self::Uninitialized,
            1 => Self::WindowMapped,
            2 => Self::InterfaceRegistered,
            _ => Self::HostRegistered,
        }
    }
}

/// Stack of acquired-resource release tokens.
///
/// `push` records a completed step; `unwind` releases everything in
/// reverse acquisition order. Steps never observed by the stack are never
/// touched by it.
#[derive(Default)]
pub struct TeardownStack {
    steps: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl std::fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownStack")
            .field("progress", &self.steps.len())
            .field("steps", &self.labels())
            .finish()
    }
}

impl TeardownStack {
    /// Empty stack (progress 0).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed steps — the setup progress counter.
    #[must_use]
    pub fn progress(&self) -> usize {
        self.steps.len()
    }

    /// Labels of completed steps, oldest first.
    #[must_use]
    pub fn labels(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(label, _)| *label).collect()
    }

    /// Record a completed step and its release action.
    pub fn push(&mut self, label: &'static str, release: impl FnOnce() + Send + 'static) {
        self.steps.push((label, Box::new(release)));
    }

    /// Release all completed steps, newest first. Returns the labels in
    /// the order they were released.
    pub fn unwind(&mut self) -> Vec<&'static str> {
        let mut released = Vec::with_capacity(self.steps.len());
        while let Some((label, release)) = self.steps.pop() {
            tracing::debug!("Releasing {label}");
            release();
            released.push(label);
        }
        released
    }
}

/// Host-side registration seam.
///
/// The real host integration (udev events, a daemon registry, an RPC
/// surface) lives outside this crate; it only has to accept an
/// [`Interface`] under a name and hand it back out to clients.
pub trait HostBridge: Send + Sync {
    /// Register a device interface under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration (duplicate
    /// name, host shutting down, …). On error the driver unwinds bring-up.
    fn register(&self, name: &str, interface: Interface) -> Result<()>;

    /// Remove a previous registration. Called during teardown; must not
    /// fail.
    fn unregister(&self, name: &str);
}

/// A fully brought-up driver instance.
///
/// Dropping it (or calling [`Driver::shutdown`]) walks the teardown stack:
/// host unregistration, interface release, device release — the exact
/// reverse of bring-up.
#[derive(Debug)]
pub struct Driver {
    interface: Interface,
    stack: TeardownStack,
}

impl Driver {
    /// The registered interface.
    #[must_use]
    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Current setup stage (always `HostRegistered` for a live driver).
    #[must_use]
    pub fn stage(&self) -> SetupStage {
        SetupStage::from_progress(self.stack.progress())
    }

    /// Tear the driver down explicitly. Equivalent to dropping it.
    pub fn shutdown(mut self) {
        tracing::info!("Shutting down driver");
        self.stack.unwind();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.stack.progress() > 0 {
            self.stack.unwind();
        }
    }
}

/// Bring up the driver for the board at `pcie_address` and register it
/// with `host` under [`DEVICE_NAME`].
///
/// # Errors
///
/// Returns the failing step's error after unwinding every step that had
/// already completed.
pub fn install(host: Arc<dyn HostBridge>, pcie_address: &str) -> Result<Driver> {
    let device = Arc::new(LitefuryDevice::acquire(pcie_address)?);
    install_with_device(host, device)
}

/// Bring-up over an already-acquired device (real or simulated).
///
/// # Errors
///
/// Same contract as [`install`].
pub fn install_with_device(
    host: Arc<dyn HostBridge>,
    device: Arc<LitefuryDevice>,
) -> Result<Driver> {
    let mut stack = TeardownStack::new();

    // Step 1: the device holds the mapped window; releasing the step
    // releases the context.
    {
        let device = Arc::clone(&device);
        stack.push("window mapping", move || drop(device));
    }
    tracing::debug!("Setup stage: {:?}", SetupStage::from_progress(stack.progress()));

    // Step 2: build and validate the file interface.
    let interface = match Interface::new(Arc::clone(&device)) {
        Ok(interface) => interface,
        Err(e) => {
            stack.unwind();
            return Err(e);
        }
    };
    {
        let interface = interface.clone();
        stack.push("interface registration", move || drop(interface));
    }
    tracing::debug!("Setup stage: {:?}", SetupStage::from_progress(stack.progress()));

    // Step 3: hand the interface to the host.
    if let Err(e) = host.register(DEVICE_NAME, interface.clone()) {
        stack.unwind();
        return Err(e);
    }
    {
        let host = Arc::clone(&host);
        stack.push("host registration", move || host.unregister(DEVICE_NAME));
    }

    tracing::info!("Driver installed as {DEVICE_NAME}");
    Ok(Driver { interface, stack })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LitefuryError;
    use crate::sim::simulated_device;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Host double that records registration traffic and can be told to
    /// refuse registration.
    #[derive(Default)]
    struct RecordingHost {
        refuse: AtomicBool,
        events: Mutex<Vec<String>>,
    }

    impl RecordingHost {
        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn log(&self, event: String) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }

    impl HostBridge for RecordingHost {
        fn register(&self, name: &str, _interface: Interface) -> Result<()> {
            if self.refuse.load(Ordering::Acquire) {
                self.log(format!("register-refused {name}"));
                return Err(LitefuryError::acquire_failed(
                    "host registration",
                    "host refused",
                ));
            }
            self.log(format!("register {name}"));
            Ok(())
        }

        fn unregister(&self, name: &str) {
            self.log(format!("unregister {name}"));
        }
    }

    #[test]
    fn stack_unwinds_in_reverse_order() {
        let released: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let mut stack = TeardownStack::new();
        for label in ["a", "b", "c"] {
            let released = Arc::clone(&released);
            stack.push(label, move || {
                released
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(label);
            });
        }
        assert_eq!(stack.progress(), 3);

        let order = stack.unwind();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(
            *released.lock().unwrap_or_else(PoisonError::into_inner),
            vec!["c", "b", "a"]
        );
        assert_eq!(stack.progress(), 0);
    }

    #[test]
    fn partial_stack_releases_only_completed_steps() {
        // Failure between steps 2 and 3: the stack has never heard of
        // step 3, so the unwind can only touch 1 and 2.
        let mut stack = TeardownStack::new();
        stack.push("one", || {});
        stack.push("two", || {});
        assert_eq!(stack.progress(), 2);
        assert_eq!(stack.unwind(), vec!["two", "one"]);
    }

    #[test]
    fn full_install_reaches_host_registered() {
        let host = Arc::new(RecordingHost::default());
        let (device, _sim) = simulated_device();

        let driver = install_with_device(host.clone(), device).expect("install");
        assert_eq!(driver.stage(), SetupStage::HostRegistered);
        assert_eq!(host.events(), vec!["register prime_finder"]);

        driver.shutdown();
        assert_eq!(
            host.events(),
            vec!["register prime_finder", "unregister prime_finder"]
        );
    }

    #[test]
    fn failure_at_interface_step_releases_device_only() {
        use crate::sim::SimulatedPipeline;

        let host = Arc::new(RecordingHost::default());
        let sim = Arc::new(SimulatedPipeline::with_window_bytes(8));
        let bus: Arc<dyn crate::RegisterBus> = sim;
        let device = Arc::new(LitefuryDevice::with_bus(bus, "short-window"));
        let weak_device = Arc::downgrade(&device);

        let err = install_with_device(host.clone(), device).expect_err("must fail at step 2");
        assert!(matches!(
            err,
            LitefuryError::AcquireFailed {
                step: "interface registration",
                ..
            }
        ));
        // Step 1 was rolled back (the context is gone), step 3 never ran.
        assert!(weak_device.upgrade().is_none(), "device context leaked");
        assert!(host.events().is_empty(), "host must never hear of the device");
    }

    #[test]
    fn failure_at_host_step_releases_interface_and_device() {
        let host = Arc::new(RecordingHost::default());
        host.refuse.store(true, Ordering::Release);

        let (device, _sim) = simulated_device();
        let weak_device = Arc::downgrade(&device);

        let err = install_with_device(host.clone(), device).expect_err("must fail at step 3");
        assert!(matches!(
            err,
            LitefuryError::AcquireFailed {
                step: "host registration",
                ..
            }
        ));
        assert!(weak_device.upgrade().is_none(), "device context leaked");
        // The host saw the refused attempt and nothing else — in
        // particular no unregister for a registration that never happened.
        assert_eq!(host.events(), vec!["register-refused prime_finder"]);
    }

    #[test]
    fn failure_at_acquire_touches_nothing() {
        // Step 1 fails (no such board); steps 2 and 3 must never run.
        let host = Arc::new(RecordingHost::default());
        let err = install(host.clone(), "0000:ff:1f.7").expect_err("no hardware on CI");
        assert!(matches!(err, LitefuryError::AcquireFailed { .. }));
        assert!(host.events().is_empty());
    }

    #[test]
    fn stage_names_follow_progress() {
        assert_eq!(SetupStage::from_progress(0), SetupStage::Uninitialized);
        assert_eq!(SetupStage::from_progress(1), SetupStage::WindowMapped);
        assert_eq!(SetupStage::from_progress(2), SetupStage::InterfaceRegistered);
        assert_eq!(SetupStage::from_progress(3), SetupStage::HostRegistered);
    }
}
