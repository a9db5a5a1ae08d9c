//! Error types for LiteFury driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, LitefuryError>;

/// Errors that can occur while driving the prime-search pipeline
#[derive(Debug, Error)]
pub enum LitefuryError {
    /// A resource-acquisition step failed during device bring-up.
    ///
    /// Fatal: everything acquired before the failing step has already been
    /// rolled back by the time this is returned. Not retried.
    #[error("Acquire failed at {step}: {reason}")]
    AcquireFailed {
        /// Name of the bring-up step that failed
        step: &'static str,
        /// Reason for failure
        reason: String,
    },

    /// A register access did not complete
    #[error("Bus fault at register offset {offset:#x}: {reason}")]
    BusFault {
        /// Byte offset of the attempted access
        offset: usize,
        /// Reason for failure
        reason: String,
    },

    /// Caller-supplied buffer cannot hold one register value
    #[error("Invalid buffer: need at least {needed} bytes, got {got}")]
    InvalidBuffer {
        /// Minimum byte count required
        needed: usize,
        /// Byte count supplied
        got: usize,
    },

    /// A data transfer moved fewer bytes than requested
    #[error("Partial copy: {copied} of {requested} bytes")]
    PartialCopy {
        /// Bytes actually transferred
        copied: usize,
        /// Bytes requested
        requested: usize,
    },

    /// A blocking wait was cancelled before the hardware signalled.
    ///
    /// Distinct from completion: the search may still be running.
    #[error("Wait interrupted before completion")]
    Interrupted,

    /// A blocking wait gave up after the given duration
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Control command id is not part of the device contract.
    ///
    /// Rejected before any hardware access.
    #[error("Unsupported control command {command:#x}")]
    UnsupportedCommand {
        /// Rejected command id
        command: u32,
    },

    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No LiteFury boards detected on the system
    #[error("No LiteFury devices detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// I/O error during sysfs or device-file access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl LitefuryError {
    /// Create an acquire-failed error
    pub fn acquire_failed(step: &'static str, reason: impl Into<String>) -> Self {
        Self::AcquireFailed {
            step,
            reason: reason.into(),
        }
    }

    /// Create a bus-fault error
    pub fn bus_fault(offset: usize, reason: impl Into<String>) -> Self {
        Self::BusFault {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_diagnostic_details() {
        let cases: Vec<(LitefuryError, &str)> = vec![
            (
                LitefuryError::acquire_failed("irq allocation", "no MSI"),
                "Acquire failed at irq allocation: no MSI",
            ),
            (
                LitefuryError::bus_fault(0x20, "beyond mapped window"),
                "Bus fault at register offset 0x20: beyond mapped window",
            ),
            (
                LitefuryError::InvalidBuffer { needed: 4, got: 2 },
                "Invalid buffer: need at least 4 bytes, got 2",
            ),
            (
                LitefuryError::PartialCopy {
                    copied: 2,
                    requested: 4,
                },
                "Partial copy: 2 of 4 bytes",
            ),
            (
                LitefuryError::UnsupportedCommand { command: 7 },
                "Unsupported control command 0x7",
            ),
            (
                LitefuryError::Interrupted,
                "Wait interrupted before completion",
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }
}
