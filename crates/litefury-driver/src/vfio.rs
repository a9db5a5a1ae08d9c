//! VFIO device access — pure Rust userspace PCIe control
//!
//! The LiteFury board is driven entirely from userspace through Linux VFIO
//! (Virtual Function I/O):
//!
//! - BAR0 register window mapping (MMIO)
//! - MSI interrupt delivery through an eventfd
//! - IOMMU isolation
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Board bound to `vfio-pci` (see [`bind_to_vfio`])
//! 3. User in the `vfio` group or root permissions
//!
//! # Setup commands
//!
//! ```bash
//! # Bind the board to vfio-pci
//! echo "10ee 7014" > /sys/bus/pci/drivers/vfio-pci/new_id
//!
//! # Grant user access
//! sudo chown $USER /dev/vfio/$IOMMU_GROUP
//! ```
//!
//! VFIO ioctls use libc: rustix::ioctl requires an Ioctl trait impl per
//! variant, and VFIO has a dozen ioctls with varied semantics (int, struct,
//! fd ptr, C string). Everything else goes through rustix.

// FFI/ioctl casts are intentional - the VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use crate::error::{LitefuryError, Result};
use rustix::io::{pread, pwrite};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd};

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// All VFIO ioctls are plain `_IO(';', base + offset)` numbers:
/// `(type << 8) | nr`, with no size or direction encoded.
mod ioctls {
    use std::os::raw::c_ulong;

    /// Helper to create ioctl number: _IO(type, nr) = (type << 8) | nr
    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // VFIO container ioctls
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // VFIO group ioctls
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // VFIO device ioctls
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_GET_IRQ_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 9);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    // API version
    pub const VFIO_API_VERSION: i32 = 0;

    // IOMMU types
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    // Group status flags
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    // IRQ set flags
    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

    // vfio-pci fixed indices
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
    pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
}

/// VFIO device info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VfioRegionInfo {
    /// Size of this structure (for versioning)
    pub argsz: u32,
    /// Region flags (capabilities, permissions)
    pub flags: u32,
    /// Region index (BAR number, or the config-space index)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset from the device fd at which to mmap / pread this region
    pub offset: u64,
}

/// VFIO group status structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// VFIO IRQ info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    count: u32,
}

/// VFIO IRQ set header (no payload — used to disable a vector)
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
}

/// VFIO IRQ set carrying a single eventfd payload
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSetFd {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    data: i32,
}

/// PCI config-space command register offset and bus-master bit.
const PCI_COMMAND: u64 = 0x04;
const PCI_COMMAND_MASTER: u16 = 1 << 2;

/// Open VFIO handles for one PCIe device.
///
/// Holding this struct is what keeps the device usable: the container,
/// group, and device fds must all stay open for the lifetime of any BAR
/// mapping or IRQ binding made through them.
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    container: File,
    /// VFIO group fd (kept open for the device's lifetime)
    #[allow(dead_code)]
    group: File,
    device: File,
}

impl VfioDevice {
    /// Open the VFIO container/group/device chain for `pcie_address`.
    ///
    /// This is the "device enable" step of bring-up: once the device fd is
    /// handed out, the kernel has reset the function and made its regions
    /// and interrupts accessible.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` naming the sub-step that failed. All fds
    /// opened before the failure are closed before returning.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!("Opening VFIO device {pcie_address}");

        let iommu_group = find_iommu_group(pcie_address)?;
        tracing::debug!("IOMMU group: {iommu_group}");

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| {
                LitefuryError::acquire_failed("device enable", format!("Cannot open /dev/vfio/vfio: {e}"))
            })?;

        // SAFETY: VFIO_GET_API_VERSION takes no argument; the fd is valid
        // (just opened) and the kernel returns the version or -errno.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };

        if api_version != ioctls::VFIO_API_VERSION {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                format!("Unsupported VFIO API version: {api_version}"),
            ));
        }

        // SAFETY: VFIO_CHECK_EXTENSION takes the extension id as the third
        // argument; the kernel returns 1 if supported.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if has_type1 != 1 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                "VFIO Type1v2 IOMMU not supported",
            ));
        }

        let group_path = format!("/dev/vfio/{iommu_group}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| {
                LitefuryError::acquire_failed("device enable", format!("Cannot open {group_path}: {e}"))
            })?;

        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };

        // SAFETY: the group fd is valid and group_status matches the kernel
        // struct layout; the kernel fills in the flags.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };

        if ret < 0 || (group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE) == 0 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                "VFIO group not viable (all devices in the group must be bound to vfio-pci)",
            ));
        }

        // SAFETY: the third argument is a pointer to the container fd; the
        // kernel reads it to attach the group.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                format!("Failed to set container: {}", std::io::Error::last_os_error()),
            ));
        }

        // SAFETY: enables the Type1v2 IOMMU backend on the container; both
        // values were validated above.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                format!("Failed to set IOMMU: {}", std::io::Error::last_os_error()),
            ));
        }

        let pcie_address_cstr = std::ffi::CString::new(pcie_address).map_err(|e| {
            LitefuryError::acquire_failed("device enable", format!("Invalid PCIe address: {e}"))
        })?;

        // SAFETY: the kernel reads the null-terminated address string and
        // returns a new device fd (or -1).
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                pcie_address_cstr.as_ptr(),
            )
        };

        if device_fd < 0 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                format!("Failed to get device fd: {}", std::io::Error::last_os_error()),
            ));
        }

        // SAFETY: device_fd is a freshly returned open fd (checked >= 0);
        // File takes ownership and will close it.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut device_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };

        // SAFETY: the device fd is valid and device_info matches the kernel
        // layout; the kernel fills in region and IRQ counts.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut device_info,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "device enable",
                format!("Failed to get device info: {}", std::io::Error::last_os_error()),
            ));
        }

        tracing::info!(
            "VFIO device {pcie_address}: {} regions, {} IRQs",
            device_info.num_regions,
            device_info.num_irqs
        );

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container,
            group,
            device,
        })
    }

    /// PCIe address this device was opened with.
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Borrow the device fd (for mmap of BAR regions).
    #[must_use]
    pub fn device_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    /// Query size and mmap offset of a device region.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the ioctl is rejected.
    pub fn region_info(&self, index: u32) -> Result<VfioRegionInfo> {
        let mut info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };

        // SAFETY: the device fd is valid and info matches the kernel layout;
        // the kernel fills in size/offset/flags for the requested index.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut info,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "window mapping",
                format!(
                    "Failed to get region {index} info: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }

        tracing::debug!(
            "Region {index}: size={:#x}, offset={:#x}, flags={:#x}",
            info.size,
            info.offset,
            info.flags
        );

        Ok(info)
    }

    /// Read the PCI command register through the VFIO config region.
    fn read_command(&self, config_offset: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        pread(&self.device, &mut buf, config_offset + PCI_COMMAND).map_err(|e| {
            LitefuryError::acquire_failed("bus mastering", format!("config read failed: {e}"))
        })?;
        // PCI config space is little-endian
        Ok(u16::from_le_bytes(buf))
    }

    fn write_command(&self, config_offset: u64, command: u16) -> Result<()> {
        pwrite(&self.device, &command.to_le_bytes(), config_offset + PCI_COMMAND).map_err(|e| {
            LitefuryError::acquire_failed("bus mastering", format!("config write failed: {e}"))
        })?;
        Ok(())
    }

    /// Set the bus-master enable bit in the PCI command register.
    ///
    /// Required before the endpoint may signal MSI (an MSI is a posted
    /// memory write issued by the device).
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the config region cannot be accessed.
    pub fn enable_bus_master(&self) -> Result<()> {
        let config = self.region_info(ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?;
        let command = self.read_command(config.offset)?;
        self.write_command(config.offset, command | PCI_COMMAND_MASTER)?;
        tracing::debug!("Bus mastering enabled for {}", self.pcie_address);
        Ok(())
    }

    /// Clear the bus-master enable bit. Best-effort counterpart of
    /// [`Self::enable_bus_master`] for teardown and rollback.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the config region cannot be accessed.
    pub fn disable_bus_master(&self) -> Result<()> {
        let config = self.region_info(ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?;
        let command = self.read_command(config.offset)?;
        self.write_command(config.offset, command & !PCI_COMMAND_MASTER)?;
        tracing::debug!("Bus mastering disabled for {}", self.pcie_address);
        Ok(())
    }

    /// Number of MSI vectors the device exposes.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the ioctl is rejected.
    pub fn msi_vector_count(&self) -> Result<u32> {
        let mut info = VfioIrqInfo {
            argsz: std::mem::size_of::<VfioIrqInfo>() as u32,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            ..Default::default()
        };

        // SAFETY: the device fd is valid and info matches the kernel layout;
        // the kernel fills in the vector count for the MSI index.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_IRQ_INFO as _,
                &raw mut info,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "irq allocation",
                format!("Failed to get IRQ info: {}", std::io::Error::last_os_error()),
            ));
        }

        Ok(info.count)
    }

    /// Route MSI vector 0 to `event_fd`.
    ///
    /// Every interrupt the board raises becomes a counter increment on the
    /// eventfd; reading the eventfd consumes (acknowledges) it.
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the device exposes no MSI vector or the
    /// kernel rejects the binding.
    pub fn enable_msi(&self, event_fd: BorrowedFd<'_>) -> Result<()> {
        let vectors = self.msi_vector_count()?;
        if vectors == 0 {
            return Err(LitefuryError::acquire_failed(
                "irq allocation",
                "device exposes no MSI vectors",
            ));
        }

        let irq_set = VfioIrqSetFd {
            argsz: std::mem::size_of::<VfioIrqSetFd>() as u32,
            flags: ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count: 1,
            data: event_fd.as_raw_fd(),
        };

        // SAFETY: the device fd is valid; irq_set matches the kernel's
        // vfio_irq_set header followed by one eventfd payload, with argsz
        // covering both.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "irq allocation",
                format!("Failed to bind MSI eventfd: {}", std::io::Error::last_os_error()),
            ));
        }

        tracing::info!("MSI vector 0 bound to eventfd for {}", self.pcie_address);
        Ok(())
    }

    /// Tear down the MSI vector binding installed by [`Self::enable_msi`].
    ///
    /// # Errors
    ///
    /// Returns `AcquireFailed` if the kernel rejects the teardown.
    pub fn disable_msi(&self) -> Result<()> {
        let irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags: ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count: 0,
        };

        // SAFETY: header-only vfio_irq_set with count=0 disables the index;
        // argsz covers the header.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };

        if ret < 0 {
            return Err(LitefuryError::acquire_failed(
                "irq allocation",
                format!("Failed to disable MSI: {}", std::io::Error::last_os_error()),
            ));
        }

        tracing::debug!("MSI disabled for {}", self.pcie_address);
        Ok(())
    }
}

/// Find the IOMMU group number for a PCIe device.
///
/// Reads the `/sys/bus/pci/devices/{addr}/iommu_group` symlink.
///
/// # Errors
///
/// Returns `AcquireFailed` if the symlink cannot be read or parsed.
pub fn find_iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");

    let target = std::fs::read_link(&link).map_err(|e| {
        LitefuryError::acquire_failed(
            "device enable",
            format!("Cannot read IOMMU group for {pcie_address}: {e}. Is IOMMU enabled?"),
        )
    })?;

    target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| {
            LitefuryError::acquire_failed(
                "device enable",
                format!("Cannot parse IOMMU group from {target:?}"),
            )
        })
}

// ── VFIO device binding helpers ───────────────────────────────────────────────
// These replace the manual unbind/new_id shell workflow.

/// Bind a LiteFury board to `vfio-pci`, unbinding any existing driver.
///
/// Requires root or `CAP_SYS_ADMIN`.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    use litefury_chip::pcie::{LITEFURY_DEVICE_ID, LITEFURY_VENDOR_ID};
    use std::path::Path;

    tracing::info!("Binding {pcie_address} to vfio-pci");

    let driver_unbind = format!("/sys/bus/pci/devices/{pcie_address}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address).map_err(|e| {
            LitefuryError::acquire_failed("device enable", format!("Cannot unbind {pcie_address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        std::fs::write(new_id, format!("{LITEFURY_VENDOR_ID:04x} {LITEFURY_DEVICE_ID:04x}"))
            .map_err(|e| {
                LitefuryError::acquire_failed("device enable", format!("Cannot write vfio-pci/new_id: {e}"))
            })?;
    }

    let bind_path = "/sys/bus/pci/drivers/vfio-pci/bind";
    std::fs::write(bind_path, pcie_address).map_err(|e| {
        LitefuryError::acquire_failed("device enable", format!("Cannot bind to vfio-pci: {e}"))
    })?;

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind a board from `vfio-pci`.
///
/// # Errors
///
/// Returns an error if the sysfs write fails.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    let unbind = "/sys/bus/pci/drivers/vfio-pci/unbind";
    std::fs::write(unbind, pcie_address).map_err(|e| {
        LitefuryError::acquire_failed("device enable", format!("Cannot unbind from vfio-pci: {e}"))
    })?;

    tracing::info!("{pcie_address} unbound from vfio-pci");
    Ok(())
}
