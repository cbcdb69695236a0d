//! External collaborator interfaces.
//!
//! The IOMMU/VFIO binding layer and the low-level NVMe controller driver
//! are deliberately out of scope for this crate: they encode NVMe wire
//! structures and touch MMIO doorbells. What the core needs from them is
//! captured here as two traits. Production backends (a VFIO-backed
//! `DmaProvider`, a real MMIO/doorbell `ControllerDriver`) are expected to
//! live in a separate crate and are not shipped here; `src/sim.rs` provides
//! an in-process pair for tests, benches, and demos.

use crate::error::UnvmeError;
use crate::pci::PciAddress;

/// A registered DMA-capable buffer: virtual base, device-physical base, and
/// size in bytes. Three machine words, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTuple {
    pub virt: usize,
    pub phys: u64,
    pub size: usize,
}

impl DmaTuple {
    /// The device-physical address corresponding to virtual address `ptr`,
    /// which must lie within `[virt, virt + size)`.
    pub fn phys_of(&self, ptr: usize) -> u64 {
        debug_assert!(ptr >= self.virt && ptr < self.virt + self.size);
        self.phys + (ptr - self.virt) as u64
    }

    pub fn contains(&self, ptr: usize, len: usize) -> bool {
        ptr >= self.virt && ptr.saturating_add(len) <= self.virt + self.size
    }
}

/// Allocates and frees IOMMU-pinned, physically-contiguous DMA memory.
///
/// Implementations pin memory with the IOMMU so the returned physical
/// address is stable and safe for the device to access directly.
pub trait DmaProvider: Send + Sync {
    fn alloc(&self, size: usize) -> Result<DmaTuple, UnvmeError>;
    fn free(&self, tuple: DmaTuple) -> Result<(), UnvmeError>;
}

/// Opaque handle to an open controller, as returned by
/// [`ControllerDriver::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerHandle(pub u64);

/// The result of polling a queue's completion ring once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPoll {
    /// Command `cid` completed; `status` is the raw completion status
    /// field (0 means success).
    Completed { cid: u16, status: u16 },
    /// No completion is ready yet.
    Empty,
    /// The controller itself reported an error unrelated to a specific
    /// command (e.g. a fatal controller status).
    ControllerError(u32),
}

/// Controller identify data needed to build a [`crate::session::Namespace`].
#[derive(Debug, Clone)]
pub struct IdentifyController {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub mdts: u8,
    pub page_shift: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct IdentifyNamespace {
    pub block_count: u64,
    pub block_shift: u8,
}

/// Feature identifiers used with `get_feature`. Only the one feature the
/// session manager needs is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    NumberOfQueues,
}

/// The low-level NVMe controller driver: admin-queue bring-up, queue
/// create/delete, identify commands, command encoding, and doorbell
/// addresses. Out of scope for this crate; this trait is the boundary
/// the core (`session.rs`, `queue.rs`) is written against.
pub trait ControllerDriver: Send + Sync {
    /// Binds to the controller at `pci` and returns a handle. Called once
    /// per process, on the first `open`.
    fn open(&self, pci: &PciAddress) -> Result<ControllerHandle, UnvmeError>;

    /// Programs ASQ/ACQ/AQA and waits for CSTS.RDY, using the caller's
    /// pre-allocated admin submission/completion ring DMA tuples.
    fn setup_adminq(
        &self,
        ctrl: ControllerHandle,
        asq: DmaTuple,
        acq: DmaTuple,
        qsize: u16,
    ) -> Result<(), UnvmeError>;

    fn identify_controller(&self, ctrl: ControllerHandle) -> Result<IdentifyController, UnvmeError>;

    fn identify_namespace(
        &self,
        ctrl: ControllerHandle,
        nsid: u32,
    ) -> Result<IdentifyNamespace, UnvmeError>;

    fn get_feature(&self, ctrl: ControllerHandle, feature: Feature) -> Result<u32, UnvmeError>;

    /// Creates one NVMe I/O queue pair with id `qid` backed by the given
    /// submission/completion ring DMA tuples.
    fn create_ioq(
        &self,
        ctrl: ControllerHandle,
        qid: u16,
        sq: DmaTuple,
        cq: DmaTuple,
        qsize: u16,
    ) -> Result<(), UnvmeError>;

    fn delete_ioq(&self, ctrl: ControllerHandle, qid: u16) -> Result<(), UnvmeError>;

    /// Encodes and submits a read/write command on queue `qid`, ringing the
    /// submission doorbell. `opcode` is `0x02` (read) or `0x01` (write).
    fn cmd_rw(
        &self,
        ctrl: ControllerHandle,
        qid: u16,
        opcode: u8,
        cid: u16,
        nsid: u32,
        slba: u64,
        nlb: u16,
        prp1: u64,
        prp2: u64,
    ) -> Result<(), UnvmeError>;

    /// Polls queue `qid`'s completion ring once.
    fn check_completion(&self, ctrl: ControllerHandle, qid: u16) -> CompletionPoll;

    /// Tears the controller down. Called on last `close`.
    fn delete(&self, ctrl: ControllerHandle) -> Result<(), UnvmeError>;
}
