//! Session / namespace manager (spec.md S4.5): controller bring-up,
//! namespace identification, and per-session queue-pair lifecycle.
//!
//! A [`Controller`] is shared by every [`Session`] opened against the same
//! PCI address within a process: it owns the admin-queue bring-up and the
//! monotonically increasing queue-id counter so qids never collide across
//! sessions, even after one closes and another opens. The admin queue
//! itself is not modeled as a `QueuePair` — identify and feature commands
//! go straight through [`ControllerDriver`], which is exactly the
//! wire-encoding job spec.md S1 puts out of scope.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::diag;
use crate::dma::DmaRegistry;
use crate::driver::{ControllerDriver, ControllerHandle, DmaProvider, DmaTuple, Feature};
use crate::error::UnvmeError;
use crate::namespace::Namespace;
use crate::pci::PciAddress;
use crate::queue::{QueuePair, CQ_ENTRY_SIZE, SQ_ENTRY_SIZE};

/// Entries in the admin submission/completion rings, per spec.md S4.5.
const ADMIN_QSIZE: u16 = 8;

/// Conservative device queue-size ceiling. The original discovers this
/// from CC.MQES; the `ControllerDriver` boundary here doesn't expose raw
/// controller-capabilities register reads (that's wire-level, out of
/// scope per spec.md S1), so callers are bounded by this constant instead.
const DEFAULT_MAX_QSIZE: u32 = 4096;

/// A bound controller: admin bring-up done, identify data cached, shared
/// by every session opened against it.
pub struct Controller {
    pci: PciAddress,
    driver: Arc<dyn ControllerDriver>,
    dma_provider: Arc<dyn DmaProvider>,
    handle: ControllerHandle,
    admin_namespace: Namespace,
    /// Admin submission/completion ring DMA tuples, freed in
    /// `close_session` when the last session against this controller
    /// closes (`unvme_adminq_delete`'s `vfio_dma_free` calls in the
    /// original, `original_source/src/unvme_core.c` ~188-253).
    asq: DmaTuple,
    acq: DmaTuple,
    next_qid: Mutex<u16>,
    open_sessions: AtomicU32,
}

impl Controller {
    /// Binds to `pci`, brings up the admin queue, and identifies the
    /// controller and `default_nsid` (spec.md S4.5's "admin copy").
    pub fn open(
        pci: &PciAddress,
        driver: Arc<dyn ControllerDriver>,
        dma_provider: Arc<dyn DmaProvider>,
        default_nsid: u32,
    ) -> Result<Self, UnvmeError> {
        let handle = driver.open(pci)?;

        let asq = dma_provider.alloc(ADMIN_QSIZE as usize * SQ_ENTRY_SIZE)?;
        let acq = dma_provider.alloc(ADMIN_QSIZE as usize * CQ_ENTRY_SIZE)?;
        driver.setup_adminq(handle, asq, acq, ADMIN_QSIZE)?;

        let ic = driver.identify_controller(handle)?;
        let page_size = 1u32 << ic.page_shift;
        let prplist_capacity = page_size / 8;
        let maxppio = if ic.mdts == 0 {
            prplist_capacity + 1
        } else {
            (1u32 << ic.mdts).min(prplist_capacity + 1)
        };

        let raw_qcount = driver.get_feature(handle, Feature::NumberOfQueues)?;
        let nsqa = raw_qcount & 0xFFFF;
        let ncqa = (raw_qcount >> 16) & 0xFFFF;
        let dev_max_qcount = nsqa.min(ncqa) + 1;

        let admin_namespace = build_namespace(
            &driver,
            handle,
            default_nsid,
            &ic,
            page_size,
            maxppio,
            dev_max_qcount,
        )?;

        log::info!(
            target: "unvme::session",
            "opened controller {pci} vendor={:#06x} model={:?} page_size={page_size}",
            ic.vendor_id,
            ic.model,
        );

        Ok(Controller {
            pci: *pci,
            driver,
            dma_provider,
            handle,
            admin_namespace,
            asq,
            acq,
            next_qid: Mutex::new(1), // qid 0 is reserved for the admin queue
            open_sessions: AtomicU32::new(0),
        })
    }

    /// The DMA provider this controller was bound with, so [`Session`] can
    /// free its queues' rings and PRP scratch at teardown.
    pub fn dma_provider(&self) -> &Arc<dyn DmaProvider> {
        &self.dma_provider
    }

    pub fn pci(&self) -> PciAddress {
        self.pci
    }

    /// The namespace geometry for `nsid`, reusing the admin-time identify
    /// when it matches the default namespace and re-identifying otherwise
    /// (spec.md S4.5's "identify overrides for non-admin nsid").
    fn namespace_for(&self, nsid: u32) -> Result<Namespace, UnvmeError> {
        if nsid == self.admin_namespace.nsid {
            return Ok(self.admin_namespace.clone());
        }
        let ic = self.driver.identify_controller(self.handle)?;
        let page_size = self.admin_namespace.page_size;
        build_namespace(
            &self.driver,
            self.handle,
            nsid,
            &ic,
            page_size,
            self.admin_namespace.maxppio,
            self.admin_namespace.dev_max_qcount,
        )
    }

    /// Opens an I/O session: `qcount` queue pairs of `qsize` entries each,
    /// with qids allocated monotonically so no two sessions (even
    /// sequential ones) ever share a qid while this controller is bound.
    pub fn open_session(
        self: &Arc<Self>,
        nsid: u32,
        qcount: u32,
        qsize: u32,
    ) -> Result<Session, UnvmeError> {
        if qcount < 1 || qsize < 2 || qcount > self.admin_namespace.dev_max_qcount || qsize > DEFAULT_MAX_QSIZE
        {
            return Err(UnvmeError::InvalidQueueConfig { qcount, qsize });
        }

        let mut namespace = self.namespace_for(nsid)?;
        namespace.qcount = qcount;
        namespace.qsize = qsize;
        namespace.maxiopq = qsize - 1;

        let mut qids = Vec::with_capacity(qcount as usize);
        {
            let mut next = self.next_qid.lock().unwrap();
            for _ in 0..qcount {
                qids.push(*next);
                *next += 1;
            }
        }

        let mut queues = Vec::with_capacity(qcount as usize);
        for qid in qids {
            let qp = QueuePair::new(qid, qsize as u16, namespace.page_size, self.dma_provider.as_ref())?;
            self.driver.create_ioq(self.handle, qid, qp.sq(), qp.cq(), qsize as u16)?;
            queues.push(Mutex::new(qp));
        }

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        log::debug!(target: "unvme::session", "opened session nsid={nsid} qcount={qcount} qsize={qsize}");

        Ok(Session {
            controller: Arc::clone(self),
            namespace,
            queues,
            dma: DmaRegistry::new(Arc::clone(&self.dma_provider)),
        })
    }

    /// Tears down `qids`' I/O queues and, if this was the last open
    /// session, deletes the controller itself (admin last), per spec.md
    /// S4.5's close ordering. Returns whether this close tore the
    /// controller down, so the facade can drop it from the process-wide
    /// registry (spec.md S8's open/close balance property: a controller
    /// must be re-initialized, not reused stale, on the next `open` of the
    /// same PCI address).
    fn close_session(&self, qids: &[u16]) -> Result<bool, UnvmeError> {
        for &qid in qids {
            self.driver.delete_ioq(self.handle, qid)?;
        }
        if self.open_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.driver.delete(self.handle)?;
            self.dma_provider.free(self.asq)?;
            self.dma_provider.free(self.acq)?;
            log::info!(target: "unvme::session", "last session closed, controller deleted");
            diag::close();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn clock(&self) -> &dyn Clock {
        &crate::clock::SystemClock
    }

    pub fn driver(&self) -> &dyn ControllerDriver {
        self.driver.as_ref()
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle
    }
}

#[allow(clippy::too_many_arguments)]
fn build_namespace(
    driver: &Arc<dyn ControllerDriver>,
    handle: ControllerHandle,
    nsid: u32,
    ic: &crate::driver::IdentifyController,
    page_size: u32,
    maxppio: u32,
    dev_max_qcount: u32,
) -> Result<Namespace, UnvmeError> {
    let idns = driver.identify_namespace(handle, nsid)?;
    let block_size = 1u32 << idns.block_shift;
    Namespace::validate(block_size, page_size, idns.block_count)?;

    let nbpp = page_size / block_size;
    Ok(Namespace {
        nsid,
        vendor_id: ic.vendor_id,
        serial: ic.serial.clone(),
        model: ic.model.clone(),
        firmware: ic.firmware.clone(),
        block_count: idns.block_count,
        page_size,
        page_shift: ic.page_shift as u32,
        block_size,
        block_shift: idns.block_shift as u32,
        nbpp,
        maxppio,
        maxbpio: maxppio * nbpp,
        qcount: 0,
        qsize: 0,
        maxiopq: 0,
        dev_max_qsize: DEFAULT_MAX_QSIZE,
        dev_max_qcount,
    })
}

/// One open I/O session: a namespace view and the queue pairs backing it.
/// Dropping without calling [`Session::close`] leaks the underlying NVMe
/// I/O queues (the controller-side `delete_ioq` never runs) and any DMA
/// buffers the session allocated never get `free_all`'d — `close` is the
/// only path that runs the spec's teardown ordering.
pub struct Session {
    controller: Arc<Controller>,
    pub namespace: Namespace,
    /// One mutex per queue pair: different qids run fully concurrently,
    /// while concurrent callers on the *same* qid serialize on it rather
    /// than needing compile-time single-thread ownership of `QueuePair`.
    pub queues: Vec<Mutex<QueuePair>>,
    pub dma: DmaRegistry,
}

impl Session {
    pub fn driver(&self) -> &dyn ControllerDriver {
        self.controller.driver()
    }

    pub fn handle(&self) -> ControllerHandle {
        self.controller.handle()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.controller.clock()
    }

    pub fn pci(&self) -> PciAddress {
        self.controller.pci()
    }

    /// Frees every DMA buffer the session still owns — including each
    /// queue's own submission ring, completion ring, and PRP-list scratch,
    /// which were allocated directly through the DMA provider and are not
    /// in the user-facing registry `self.dma` tracks — and tears down this
    /// session's queues (deleting the controller too if this was the last
    /// open session). Returns whether the controller was torn down, so the
    /// facade can evict it from the process-wide registry.
    pub fn close(self) -> Result<bool, UnvmeError> {
        self.dma.free_all();
        let dma_provider = self.controller.dma_provider();
        let mut qids = Vec::with_capacity(self.queues.len());
        for q in &self.queues {
            let qp = q.lock().unwrap();
            qp.free_dma(dma_provider.as_ref())?;
            qids.push(qp.qid);
        }
        self.controller.close_session(&qids)
    }
}
