//! PCIe identifiers for the LiteFury board.
//!
//! The board enumerates with the Xilinx vendor ID and the 7-series PCIe
//! endpoint device ID; there is no board-specific subsystem ID to key on,
//! so the driver matches on this pair alone.

/// Xilinx vendor ID (PCI-SIG assigned).
pub const LITEFURY_VENDOR_ID: u16 = 0x10EE;

/// Device ID presented by the LiteFury's PCIe endpoint block.
pub const LITEFURY_DEVICE_ID: u16 = 0x7014;

/// Name the driver registers under and the CLI reports.
pub const DEVICE_NAME: &str = "prime_finder";

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{LITEFURY_VENDOR_ID:04x}:{LITEFURY_DEVICE_ID:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lspci_filter_formats_ids() {
        assert_eq!(lspci_filter(), "10ee:7014");
    }
}
