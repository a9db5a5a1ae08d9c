//! List LiteFury boards found on the PCIe bus.

use litefury_driver::{DeviceManager, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("litefury_driver=info")
        .init();

    let manager = DeviceManager::discover()?;
    println!("LiteFury devices: {}", manager.device_count());

    for info in manager.devices() {
        println!(
            "[{}] {}  (IOMMU group {})",
            info.index,
            info.pcie_address,
            info.iommu_group
                .map_or_else(|| "none".into(), |g| g.to_string())
        );
    }

    Ok(())
}
