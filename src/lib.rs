//! A user-space NVMe client library.
//!
//! Drives an NVMe controller directly from user space over a
//! VFIO/IOMMU-mapped file descriptor, bypassing the kernel block layer.
//! Binding the device and encoding the NVMe wire protocol are someone
//! else's job: this crate takes a [`DmaProvider`] and a [`ControllerDriver`]
//! (see [`driver`]) as its only hardware-facing inputs and builds the DMA
//! registry, descriptor pool, queue-pair engine, request scheduler, and
//! session/namespace manager on top of them.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use unvme::{driver::{DmaProvider, ControllerDriver}, pci::PciAddress, config::UnvmeConfig};
//! # fn example(driver: Arc<dyn ControllerDriver>, dma: Arc<dyn DmaProvider>) -> Result<(), unvme::error::UnvmeError> {
//! let pci = PciAddress::parse("01:00.0")?;
//! let ns = unvme::open(&pci, 1, 4, 64, driver, dma, &UnvmeConfig::default())?;
//! let buf = unvme::alloc(&ns, 4096)?;
//! unvme::write(&ns, 0, buf, 0, 8)?;
//! unvme::read(&ns, 0, buf, 0, 8)?;
//! unvme::free(&ns, buf)?;
//! unvme::close(ns)?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod descriptor;
pub mod diag;
pub mod dma;
pub mod driver;
pub mod error;
pub mod namespace;
pub mod pci;
pub mod queue;
pub mod scheduler;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use descriptor::Opcode;
use driver::{ControllerDriver, DmaProvider};
use error::UnvmeError;
use pci::PciAddress;
use scheduler::PollResult;
use session::{Controller, Session};

pub use config::UnvmeConfig;

/// Registry of bound controllers, keyed by PCI address, so repeated
/// `open` calls against the same device share one controller and its
/// monotonic qid counter (spec.md S4.5). Guarded by the same process-wide
/// lock that serializes `open`/`close`/`alloc`/`free` (spec.md S4.6): the
/// DMA provider and admin ring are not assumed reentrant.
static CONTROLLERS: OnceLock<Mutex<HashMap<PciAddress, Arc<Controller>>>> = OnceLock::new();

fn controllers() -> &'static Mutex<HashMap<PciAddress, Arc<Controller>>> {
    CONTROLLERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// An open namespace session: the handle every other facade function
/// operates on.
pub struct NsHandle {
    session: Session,
    default_timeout: Duration,
    back_pressure_timeout: Duration,
}

/// An in-flight request returned by [`aread`]/[`awrite`], polled with
/// [`apoll`].
#[derive(Debug, Clone, Copy)]
pub struct IoDescriptor {
    qid: u16,
    index: usize,
}

/// The result of polling an [`IoDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still outstanding; call `apoll` again.
    Pending,
    /// Every chunk completed successfully.
    Done,
    /// Every chunk completed, but the device reported an error status on
    /// at least one of them.
    DeviceError(u16),
}

/// Binds (or reuses an existing binding of) the controller at `pci` and
/// opens an I/O session of `qcount` queues of `qsize` entries against
/// namespace `nsid`. Serialized process-wide (spec.md S4.6).
pub fn open(
    pci: &PciAddress,
    nsid: u32,
    qcount: u32,
    qsize: u32,
    driver: Arc<dyn ControllerDriver>,
    dma_provider: Arc<dyn DmaProvider>,
    config: &UnvmeConfig,
) -> Result<NsHandle, UnvmeError> {
    let mut guard = controllers().lock().unwrap();

    if let Some(existing) = guard.get(pci) {
        let session = existing.open_session(nsid, qcount, qsize)?;
        return Ok(NsHandle {
            session,
            default_timeout: config.default_timeout,
            back_pressure_timeout: config.back_pressure_timeout,
        });
    }

    if diag::init(&config.log_path).is_err() {
        // Non-fatal: the crate degrades to no diagnostic log rather than
        // failing `open` over a log file the caller may not even want.
    }

    let controller = Arc::new(Controller::open(pci, driver, dma_provider, nsid)?);
    let session = controller.open_session(nsid, qcount, qsize)?;
    guard.insert(*pci, controller);

    Ok(NsHandle {
        session,
        default_timeout: config.default_timeout,
        back_pressure_timeout: config.back_pressure_timeout,
    })
}

/// Closes a session: frees every DMA buffer it still owns, tears down its
/// queues, and (if this was the last session against the controller)
/// deletes the controller and removes it from the registry. Serialized by
/// the same process-wide lock as `open`, so a concurrent `open` against the
/// same PCI address can never observe the controller between teardown and
/// eviction and hand back a dead handle.
pub fn close(ns: NsHandle) -> Result<(), UnvmeError> {
    let mut guard = controllers().lock().unwrap();
    let pci = ns.session.pci();
    let controller_torn_down = ns.session.close()?;
    if controller_torn_down {
        guard.remove(&pci);
    }
    Ok(())
}

/// Allocates a DMA-capable buffer registered with `ns`'s session.
pub fn alloc(ns: &NsHandle, size: usize) -> Result<usize, UnvmeError> {
    let _guard = controllers().lock().unwrap();
    ns.session.dma.alloc(size)
}

/// Releases a buffer previously returned by [`alloc`].
pub fn free(ns: &NsHandle, buf: usize) -> Result<(), UnvmeError> {
    let _guard = controllers().lock().unwrap();
    ns.session.dma.free(buf)
}

/// The namespace geometry `ns` was opened against (block size, `maxbpio`,
/// queue counts, …), for callers that need to size requests against it.
pub fn namespace(ns: &NsHandle) -> &namespace::Namespace {
    &ns.session.namespace
}

/// The qids backing `ns`, in allocation order. Mostly useful for tests
/// asserting on the session manager's qid-monotonicity guarantee.
pub fn qids(ns: &NsHandle) -> Vec<u16> {
    ns.session.queues.iter().map(|q| q.lock().unwrap().qid).collect()
}

fn queue_for<'a>(ns: &'a NsHandle, qid: u16) -> Result<&'a Mutex<queue::QueuePair>, UnvmeError> {
    ns.session
        .queues
        .get(qid as usize)
        .ok_or(UnvmeError::InvalidQueueId { qid, qcount: ns.session.namespace.qcount })
}

/// Submits exactly one command — no splitting. `nlb > maxbpio` is
/// rejected rather than chunked (spec.md S8's reject-path property).
#[allow(clippy::too_many_arguments)]
fn submit(
    ns: &NsHandle,
    qid: u16,
    opcode: Opcode,
    buf: usize,
    slba: u64,
    nlb: u32,
) -> Result<IoDescriptor, UnvmeError> {
    let (tuple, _offset) = ns.session.dma.resolve(buf)?;
    let phys = tuple.phys_of(buf);

    let queue = queue_for(ns, qid)?;
    let mut qp = queue.lock().unwrap();
    let index = scheduler::submit_single(
        &mut qp,
        &ns.session.namespace,
        ns.session.driver(),
        ns.session.handle(),
        ns.session.clock(),
        ns.back_pressure_timeout,
        ns.session.namespace.nsid,
        opcode,
        slba,
        nlb,
        tuple,
        phys,
    )?;
    Ok(IoDescriptor { qid, index })
}

/// Submits, splitting across `ceil(nlb / maxbpio)` commands sharing one
/// descriptor. Backs the synchronous `read`/`write` wrappers only.
#[allow(clippy::too_many_arguments)]
fn submit_chunked(
    ns: &NsHandle,
    qid: u16,
    opcode: Opcode,
    buf: usize,
    slba: u64,
    nlb: u32,
) -> Result<IoDescriptor, UnvmeError> {
    let (tuple, _offset) = ns.session.dma.resolve(buf)?;
    let phys = tuple.phys_of(buf);

    let queue = queue_for(ns, qid)?;
    let mut qp = queue.lock().unwrap();
    let index = scheduler::submit_chunked(
        &mut qp,
        &ns.session.namespace,
        ns.session.driver(),
        ns.session.handle(),
        ns.session.clock(),
        ns.back_pressure_timeout,
        ns.session.namespace.nsid,
        opcode,
        slba,
        nlb,
        tuple,
        phys,
    )?;
    Ok(IoDescriptor { qid, index })
}

/// Submits an asynchronous read of `nlb` blocks starting at `slba` into
/// `buf` on queue `qid`. `qid` must be `< qcount` from [`open`]. Rejects
/// `nlb > maxbpio` rather than splitting it.
pub fn aread(ns: &NsHandle, qid: u16, buf: usize, slba: u64, nlb: u32) -> Result<IoDescriptor, UnvmeError> {
    submit(ns, qid, Opcode::Read, buf, slba, nlb)
}

/// Submits an asynchronous write of `nlb` blocks starting at `slba` from
/// `buf` on queue `qid`. Rejects `nlb > maxbpio` rather than splitting it.
pub fn awrite(ns: &NsHandle, qid: u16, buf: usize, slba: u64, nlb: u32) -> Result<IoDescriptor, UnvmeError> {
    submit(ns, qid, Opcode::Write, buf, slba, nlb)
}

/// Polls `iod` for completion. `timeout == Duration::ZERO` is a
/// non-blocking probe; otherwise blocks up to `timeout`.
pub fn apoll(ns: &NsHandle, iod: IoDescriptor, timeout: Duration) -> Result<PollOutcome, UnvmeError> {
    let queue = queue_for(ns, iod.qid)?;
    let mut qp = queue.lock().unwrap();

    let result = if timeout.is_zero() {
        scheduler::poll_once(&mut qp, iod.index, ns.session.driver(), ns.session.handle(), ns.session.clock())?
    } else {
        scheduler::wait(&mut qp, iod.index, ns.session.driver(), ns.session.handle(), ns.session.clock(), timeout)?
    };

    Ok(match result {
        PollResult::Pending => PollOutcome::Pending,
        PollResult::Done { error: None } => PollOutcome::Done,
        PollResult::Done { error: Some(status) } => PollOutcome::DeviceError(status),
    })
}

/// Synchronous read: submits and blocks until completion or `ns`'s
/// configured default timeout elapses.
pub fn read(ns: &NsHandle, qid: u16, buf: usize, slba: u64, nlb: u32) -> Result<(), UnvmeError> {
    sync_rw(ns, qid, Opcode::Read, buf, slba, nlb)
}

/// Synchronous write: submits and blocks until completion or `ns`'s
/// configured default timeout elapses.
pub fn write(ns: &NsHandle, qid: u16, buf: usize, slba: u64, nlb: u32) -> Result<(), UnvmeError> {
    sync_rw(ns, qid, Opcode::Write, buf, slba, nlb)
}

fn sync_rw(
    ns: &NsHandle,
    qid: u16,
    opcode: Opcode,
    buf: usize,
    slba: u64,
    nlb: u32,
) -> Result<(), UnvmeError> {
    let iod = submit_chunked(ns, qid, opcode, buf, slba, nlb)?;
    match apoll(ns, iod, ns.default_timeout)? {
        PollOutcome::Done => Ok(()),
        PollOutcome::DeviceError(status) => Err(UnvmeError::DeviceError(status)),
        // Only reachable if `ns.default_timeout` is itself zero (a
        // non-blocking probe), which `apoll` never resolves with a wait.
        PollOutcome::Pending => Err(UnvmeError::Timeout),
    }
}
