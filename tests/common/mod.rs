//! Shared setup for the integration tests: logging init and a simulated
//! device backend, so each test file doesn't repeat the bring-up dance.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use unvme::config::UnvmeConfig;
use unvme::driver::{ControllerDriver, DmaProvider};
use unvme::pci::PciAddress;
use unvme::sim::{SimControllerDriver, SimDmaProvider};
use unvme::NsHandle;

/// 512-byte blocks, 4 KiB pages, 1 GiB namespace: enough headroom for any
/// test's LBA range without making the backing `Vec<u8>` unreasonably big.
pub const BLOCK_SIZE: u32 = 512;
pub const PAGE_SIZE: u32 = 4096;
pub const BLOCK_COUNT: u64 = 1 << 21;

static NEXT_BUS: AtomicU8 = AtomicU8::new(1);

/// A PCI address no earlier call in this test binary has used, so sessions
/// opened against it never share a [`unvme::session::Controller`] with an
/// unrelated test running concurrently on another thread.
pub fn unique_pci() -> PciAddress {
    let bus = NEXT_BUS.fetch_add(1, Ordering::SeqCst);
    PciAddress::parse(&format!("{bus:02x}:00.0")).unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn sim_backend() -> (Arc<dyn ControllerDriver>, Arc<dyn DmaProvider>) {
    let driver: Arc<dyn ControllerDriver> = Arc::new(SimControllerDriver::new(BLOCK_SIZE, PAGE_SIZE, BLOCK_COUNT));
    let dma: Arc<dyn DmaProvider> = Arc::new(SimDmaProvider::new(256 << 20));
    (driver, dma)
}

pub fn test_config() -> UnvmeConfig {
    UnvmeConfig {
        log_path: std::env::temp_dir().join("unvme-tests.log"),
        ..Default::default()
    }
}

/// Opens a session against a fresh simulated controller on its own PCI
/// address: `qcount` queues of `qsize` entries each.
pub fn open_sim_session(qcount: u32, qsize: u32) -> NsHandle {
    init_logging();
    let pci = unique_pci();
    let (driver, dma) = sim_backend();
    unvme::open(&pci, 1, qcount, qsize, driver, dma, &test_config()).unwrap()
}
