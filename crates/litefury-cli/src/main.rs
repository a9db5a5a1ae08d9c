//! `litefury` — command-line clients for the prime-search driver.
//!
//! ```text
//! USAGE:
//!   litefury enumerate                 List boards on the PCIe bus
//!   litefury search [--seed N]         One blocking search (interrupt-driven)
//!   litefury log --runs N <out.csv>    Polled searches, CSV cycle-count log
//!   litefury bind-vfio <pcie-addr>     Bind a board to vfio-pci (root)
//!   litefury unbind-vfio <pcie-addr>   Unbind from vfio-pci (root)
//! ```
//!
//! `search` is the interactive client: it issues the blocking control
//! command and lets the MSI wake it. `log` is the polling client: it
//! drives the cursor surface only — seek/write/read — and busy-polls the
//! done flag, appending `seed, prime, cycles` rows to a CSV file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use litefury_chip::regs;
use litefury_driver::{BlockingSearch, DeviceFile, DeviceManager, LitefuryDevice, Whence, CTL_FIND_PRIME};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "litefury", about = "LiteFury prime-search CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all LiteFury boards and their IOMMU groups.
    Enumerate,
    /// Run one blocking prime search via the control command.
    Search {
        /// Seed to search from; prompted for if omitted.
        #[arg(long)]
        seed: Option<u32>,
        /// PCIe address (e.g. 0000:01:00.0); first discovered board if omitted.
        #[arg(long)]
        device: Option<String>,
    },
    /// Run polled searches and append (seed, prime, cycles) rows to a CSV file.
    Log {
        /// Output CSV path.
        output: PathBuf,
        /// Number of searches to run.
        #[arg(long, default_value_t = 1000)]
        runs: u32,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,
        /// PCIe address; first discovered board if omitted.
        #[arg(long)]
        device: Option<String>,
    },
    /// Bind a board to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Unbind a board from vfio-pci.
    UnbindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Search { seed, device } => cmd_search(seed, device.as_deref())?,
        Cmd::Log {
            output,
            runs,
            poll_ms,
            device,
        } => cmd_log(&output, runs, poll_ms, device.as_deref())?,
        Cmd::BindVfio { pcie_addr } => litefury_driver::vfio::bind_to_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => litefury_driver::vfio::unbind_from_vfio(&pcie_addr)?,
    }

    Ok(())
}

fn acquire(device: Option<&str>) -> Result<Arc<LitefuryDevice>> {
    let device = match device {
        Some(addr) => LitefuryDevice::acquire(addr)?,
        None => DeviceManager::discover()?.acquire_first()?,
    };
    Ok(Arc::new(device))
}

fn cmd_enumerate() -> Result<()> {
    let manager = DeviceManager::discover()?;
    println!("LiteFury devices: {}", manager.device_count());

    for info in manager.devices() {
        println!(
            "[{}] {}  vendor:device {}  IOMMU group {}",
            info.index,
            info.pcie_address,
            litefury_chip::pcie::lspci_filter(),
            info.iommu_group
                .map_or_else(|| "none".into(), |g| g.to_string()),
        );
    }

    Ok(())
}

fn cmd_search(seed: Option<u32>, device: Option<&str>) -> Result<()> {
    let seed = match seed {
        Some(seed) => seed,
        None => {
            print!("Enter the start number: ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim().parse().context("seed must be a number")?
        }
    };

    let file = DeviceFile::open(acquire(device)?);
    let mut search = BlockingSearch::from_seed(seed);
    file.control(CTL_FIND_PRIME, &mut search)?;

    println!("{}", search.result);
    Ok(())
}

fn cmd_log(output: &std::path::Path, runs: u32, poll_ms: u64, device: Option<&str>) -> Result<()> {
    let mut file = DeviceFile::open(acquire(device)?);
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .with_context(|| format!("cannot open {}", output.display()))?;

    // Seeds in [800_000, 1_800_000), as the original measurement runs used.
    let mut rng = XorShift64::from_clock();

    for count in 1..=runs {
        let seed = 800_000 + (rng.next() % 1_000_000) as u32;

        // Clear: one seek, two adjacent writes.
        file.seek(regs::START_FLAG as i64, Whence::Set);
        file.write(&0u32.to_ne_bytes())?;
        file.write(&0u32.to_ne_bytes())?;

        // Seed before trigger.
        file.seek(regs::START_NUMBER as i64, Whence::Set);
        file.write(&seed.to_ne_bytes())?;
        file.seek(regs::START_FLAG as i64, Whence::Set);
        file.write(&regs::START.to_ne_bytes())?;

        // Busy-poll the done flag.
        loop {
            file.seek(regs::DONE_FLAG as i64, Whence::Set);
            if read_u32(&mut file)? == regs::DONE {
                break;
            }
            std::thread::sleep(Duration::from_millis(poll_ms));
        }

        // One seek, two reads: the cursor walks HIGH then LOW.
        file.seek(regs::CYCLE_COUNT_HIGH as i64, Whence::Set);
        let high = read_u32(&mut file)?;
        let low = read_u32(&mut file)?;
        let cycles = (u64::from(high) << 32) | u64::from(low);

        file.seek(regs::PRIME_NUMBER as i64, Whence::Set);
        let prime = read_u32(&mut file)?;

        writeln!(log, "{seed}, {prime}, {cycles}")?;
        println!("{count}");
    }

    Ok(())
}

fn read_u32(file: &mut DeviceFile) -> Result<u32> {
    let mut buf = [0u8; 4];
    let copied = file.read(&mut buf)?;
    anyhow::ensure!(copied == 4, "short register read: {copied} bytes");
    Ok(u32::from_ne_bytes(buf))
}

/// Small xorshift64* generator for measurement seeds; no crypto, no
/// reproducibility requirement, so the wall clock is entropy enough.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn from_clock() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x9E37_79B9_7F4A_7C15, |d| d.as_nanos() as u64);
        Self {
            state: nanos | 1,
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}
