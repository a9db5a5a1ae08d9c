//! Blocking search against the simulated pipeline — runs anywhere.

use litefury_driver::sim::simulated_device;
use litefury_driver::{BlockingSearch, DeviceFile, Result, CTL_FIND_PRIME};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("litefury_driver=debug")
        .init();

    let (device, sim) = simulated_device();
    let file = DeviceFile::open(device);

    for seed in [17u32, 1_000, 840_000, 1_000_000] {
        let mut search = BlockingSearch::from_seed(seed);
        file.control(CTL_FIND_PRIME, &mut search)?;
        println!("{:>9} -> {}", search.seed, search.result);
    }

    println!("searches completed: {}", sim.searches_completed());
    Ok(())
}
