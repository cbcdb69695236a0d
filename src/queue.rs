//! Queue-pair engine (spec.md S4.3): owns one submission/completion ring
//! pair's bookkeeping, the per-queue cid bitmap, the next-cid cursor, and
//! the descriptor pool for in-flight requests on this queue.
//!
//! The actual ring writes and doorbell MMIO are the controller driver's
//! job (spec.md S6, out of scope here); this module builds PRP lists,
//! allocates cids, enforces back-pressure, and demultiplexes completions
//! onto the owning descriptor.

use std::time::Duration;

use crate::clock::{deadline_elapsed, deadline_from_timeout, Clock};
use crate::descriptor::{DescriptorPool, Opcode};
use crate::driver::{CompletionPoll, ControllerDriver, ControllerHandle, DmaProvider, DmaTuple};
use crate::error::UnvmeError;
use crate::namespace::Namespace;

/// Descriptors pre-populated on a queue's free ring at creation, per
/// spec.md S4.5. Independent of `qsize`: it bounds concurrent *requests*,
/// not concurrent commands (which `qsize - 1` already bounds).
const DESCRIPTOR_POOL_SIZE: usize = 16;

/// NVMe submission/completion queue entry sizes in bytes, fixed by the
/// protocol. `pub(crate)` so `session.rs` can size the admin ring the same
/// way.
pub(crate) const SQ_ENTRY_SIZE: usize = 64;
pub(crate) const CQ_ENTRY_SIZE: usize = 16;

pub struct QueuePair {
    pub qid: u16,
    qsize: u16,
    cidmask: Vec<u64>,
    cid_cursor: u16,
    cidcount: u32,
    pub descriptors: DescriptorPool,
    sq: DmaTuple,
    cq: DmaTuple,
    prp_scratch: DmaTuple,
}

impl QueuePair {
    /// Allocates this queue's submission ring, completion ring, and
    /// PRP-list scratch (`qsize * page_size` bytes, indexed by cid — the
    /// sizing that keeps the submit path allocation-free, per Design Notes
    /// S9), and pre-populates its descriptor pool. The caller is
    /// responsible for passing `sq()`/`cq()` to the controller driver's
    /// `create_ioq` and for calling [`QueuePair::free_dma`] at teardown.
    pub fn new(
        qid: u16,
        qsize: u16,
        page_size: u32,
        dma: &dyn DmaProvider,
    ) -> Result<Self, UnvmeError> {
        let sq = dma.alloc(qsize as usize * SQ_ENTRY_SIZE)?;
        let cq = dma.alloc(qsize as usize * CQ_ENTRY_SIZE)?;
        let scratch = dma.alloc(qsize as usize * page_size as usize)?;
        let mask_words = (qsize as usize).div_ceil(64);
        Ok(QueuePair {
            qid,
            qsize,
            cidmask: vec![0u64; mask_words],
            cid_cursor: 0,
            cidcount: 0,
            descriptors: DescriptorPool::new(DESCRIPTOR_POOL_SIZE, qsize),
            sq,
            cq,
            prp_scratch: scratch,
        })
    }

    /// This queue's submission ring DMA tuple, for `create_ioq`.
    pub fn sq(&self) -> DmaTuple {
        self.sq
    }

    /// This queue's completion ring DMA tuple, for `create_ioq`.
    pub fn cq(&self) -> DmaTuple {
        self.cq
    }

    /// Frees the submission ring, completion ring, and PRP-list scratch
    /// back to `dma`. Must be called by the owning session at teardown —
    /// there is no `Drop` impl, since freeing is fallible and the original
    /// (`unvme_ioq_delete`, `original_source/src/unvme_core.c` ~271-289)
    /// frees them only after the controller driver's own queue-delete
    /// command has been issued.
    pub fn free_dma(&self, dma: &dyn DmaProvider) -> Result<(), UnvmeError> {
        dma.free(self.sq)?;
        dma.free(self.cq)?;
        dma.free(self.prp_scratch)?;
        Ok(())
    }

    pub fn cidcount(&self) -> u32 {
        self.cidcount
    }

    pub fn maxiopq(&self) -> u32 {
        self.qsize as u32 - 1
    }

    fn cid_set(&mut self, cid: u16) {
        self.cidmask[cid as usize / 64] |= 1 << (cid as usize % 64);
    }

    fn cid_clear(&mut self, cid: u16) {
        self.cidmask[cid as usize / 64] &= !(1 << (cid as usize % 64));
    }

    fn cid_is_set(&self, cid: u16) -> bool {
        self.cidmask[cid as usize / 64] & (1 << (cid as usize % 64)) != 0
    }

    /// Finds the first clear bit starting at `cid_cursor`, wrapping modulo
    /// `qsize`, and advances the cursor past it.
    fn alloc_cid(&mut self) -> u16 {
        let qsize = self.qsize;
        let mut cid = self.cid_cursor;
        loop {
            if !self.cid_is_set(cid) {
                self.cid_cursor = (cid + 1) % qsize;
                return cid;
            }
            cid = (cid + 1) % qsize;
        }
    }

    /// Submits one NVMe command for a slice of a user request, building the
    /// PRP list as spec.md S4.3 step 5 describes. Applies the queue-full
    /// back-pressure drain (step 3) internally before allocating a cid.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_one(
        &mut self,
        ns: &Namespace,
        desc_index: usize,
        driver: &dyn ControllerDriver,
        ctrl: ControllerHandle,
        clock: &dyn Clock,
        back_pressure_timeout: Duration,
        nsid: u32,
        opcode: Opcode,
        slba: u64,
        nlb: u32,
        tuple: DmaTuple,
        phys: u64,
    ) -> Result<(), UnvmeError> {
        // Step 1: bounds.
        if nlb > ns.maxbpio {
            return Err(UnvmeError::RequestTooLarge { nlb, max: ns.maxbpio });
        }
        if slba.saturating_add(nlb as u64) > ns.block_count {
            return Err(UnvmeError::OutOfRange { slba, nlb, blockcount: ns.block_count });
        }
        let byte_len = nlb as u64 * ns.block_size as u64;
        if phys < tuple.phys || phys + byte_len > tuple.phys + tuple.size as u64 {
            return Err(UnvmeError::UnregisteredBuffer);
        }

        // Step 2: alignment.
        if phys % ns.block_size as u64 != 0 {
            return Err(UnvmeError::Unaligned);
        }

        // Step 3: back-pressure. A timeout here means the queue is wedged,
        // not merely slow: surfaced as `QueueStuck` rather than `Timeout`.
        if self.cidcount as u16 + 1 == self.qsize {
            self.complete_one(driver, ctrl, clock, back_pressure_timeout)
                .map_err(|e| match e {
                    UnvmeError::Timeout => UnvmeError::QueueStuck { qid: self.qid },
                    other => other,
                })?;
        }

        // Step 4: cid allocation.
        let cid = self.alloc_cid();

        // Step 5: PRP list.
        let numpages = ns.pages_for(nlb);
        let (prp1, prp2) = self.build_prp(ns, cid, phys, numpages)?;

        // Step 6: encode + submit.
        driver.cmd_rw(
            ctrl,
            self.qid,
            opcode.nvme_code(),
            cid,
            nsid,
            slba,
            nlb as u16,
            prp1,
            prp2,
        )?;

        // Step 7: bookkeeping.
        self.cid_set(cid);
        self.cidcount += 1;
        let desc = self.descriptors.get_mut(desc_index);
        desc.cid_set(cid);
        desc.cidcount += 1;

        Ok(())
    }

    /// Writes the PRP list page for commands spanning 3+ pages, returning
    /// `(prp1, prp2)` per spec.md S4.3 step 5.
    fn build_prp(
        &mut self,
        ns: &Namespace,
        cid: u16,
        phys: u64,
        numpages: u32,
    ) -> Result<(u64, u64), UnvmeError> {
        match numpages {
            0 | 1 => Ok((phys, 0)),
            2 => Ok((phys, phys + ns.page_size as u64)),
            _ => {
                let page_size = ns.page_size as usize;
                let slot_virt = self.prp_scratch.virt + cid as usize * page_size;
                let slot_phys = self.prp_scratch.phys + cid as usize as u64 * ns.page_size as u64;
                // SAFETY: `slot_virt` is within the queue's own PRP scratch
                // allocation (`qsize * page_size` bytes, indexed by cid),
                // which outlives this queue and is not aliased: only this
                // function, under the queue's single-owner-thread
                // discipline, ever writes this cid's slot.
                let entries = unsafe {
                    std::slice::from_raw_parts_mut(slot_virt as *mut u64, numpages as usize - 1)
                };
                for (i, entry) in entries.iter_mut().enumerate() {
                    *entry = phys + (i as u64 + 1) * ns.page_size as u64;
                }
                Ok((phys, slot_phys))
            }
        }
    }

    /// Polls the completion ring, blocking (with cooperative yields)
    /// until one command completes, demultiplexing it onto its owning
    /// descriptor.
    ///
    /// Returns `Ok((cid, error_status))` on a completion and
    /// `Err(Timeout)` once `timeout` elapses without one — including
    /// immediately, for `timeout == ZERO` (a non-blocking probe).
    pub fn complete_one(
        &mut self,
        driver: &dyn ControllerDriver,
        ctrl: ControllerHandle,
        clock: &dyn Clock,
        timeout: Duration,
    ) -> Result<(u16, Option<u16>), UnvmeError> {
        let mut deadline = None;
        loop {
            match driver.check_completion(ctrl, self.qid) {
                CompletionPoll::Completed { cid, status } => {
                    return self.reap(cid, status);
                }
                CompletionPoll::ControllerError(code) => {
                    return Err(UnvmeError::DeviceError(code as u16));
                }
                CompletionPoll::Empty => {
                    if timeout.is_zero() {
                        return Err(UnvmeError::Timeout);
                    }
                    let deadline = *deadline
                        .get_or_insert_with(|| deadline_from_timeout(clock, timeout));
                    if deadline_elapsed(clock, deadline) {
                        return Err(UnvmeError::Timeout);
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Locates the in-use descriptor owning `cid`, clears the bit on both
    /// bitmaps, decrements both cidcounts, and records the error (if any)
    /// on the descriptor.
    fn reap(&mut self, cid: u16, status: u16) -> Result<(u16, Option<u16>), UnvmeError> {
        let candidates = self.descriptors.in_use_from_descnext();
        let owner = candidates
            .into_iter()
            .find(|&i| self.descriptors.get_ref(i).cid_is_set(cid));

        let Some(owner) = owner else {
            return Err(UnvmeError::Fatal(format!(
                "completion for cid {cid} matched no in-use descriptor on queue {}",
                self.qid
            )));
        };

        self.cid_clear(cid);
        self.cidcount -= 1;

        let desc = self.descriptors.get_mut(owner);
        desc.cid_clear(cid);
        desc.cidcount -= 1;
        let error = if status != 0 {
            desc.error = Some(status);
            Some(status)
        } else {
            None
        };

        self.descriptors.advance_descnext_past_drained();

        Ok((cid, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::sim::{SimControllerDriver, SimDmaProvider};
    use std::sync::Arc;

    fn namespace(qsize: u32) -> Namespace {
        Namespace {
            nsid: 1,
            vendor_id: 0x1234,
            serial: "sim0".into(),
            model: "sim-model".into(),
            firmware: "0.1".into(),
            block_count: 1 << 20,
            page_size: 4096,
            page_shift: 12,
            block_size: 512,
            block_shift: 9,
            nbpp: 8,
            maxppio: 4,
            maxbpio: 32,
            qcount: 1,
            qsize,
            maxiopq: qsize - 1,
            dev_max_qsize: 4096,
            dev_max_qcount: 64,
        }
    }

    #[test]
    fn single_page_command_has_no_prp2() {
        let ns = namespace(8);
        let dma = SimDmaProvider::new(1 << 20);
        let sim = SimControllerDriver::new(ns.block_size, ns.page_size, ns.block_count);
        let ctrl = sim.open(&crate::pci::PciAddress::parse("00:00.0").unwrap()).unwrap();

        let mut qp = QueuePair::new(0, ns.qsize as u16, ns.page_size, &dma).unwrap();
        let desc = qp.descriptors.get().unwrap();

        let buf = dma.alloc(8192).unwrap();
        let result = qp.submit_one(
            &ns,
            desc,
            &sim,
            ctrl,
            &SystemClock,
            Duration::from_secs(1),
            ns.nsid,
            Opcode::Write,
            0,
            8, // exactly nbpp blocks -> 1 page
            buf,
            buf.phys,
        );
        assert!(result.is_ok());
        assert_eq!(qp.descriptors.get_ref(desc).cidcount, 1);
    }

    #[test]
    fn two_page_command_sets_prp2_to_prp1_plus_page() {
        let ns = namespace(8);
        let dma = SimDmaProvider::new(1 << 20);
        let sim = SimControllerDriver::new(ns.block_size, ns.page_size, ns.block_count);
        let ctrl = sim.open(&crate::pci::PciAddress::parse("00:00.0").unwrap()).unwrap();
        let mut qp = QueuePair::new(0, ns.qsize as u16, ns.page_size, &dma).unwrap();
        let desc = qp.descriptors.get().unwrap();
        let buf = dma.alloc(2 * ns.page_size as usize).unwrap();

        qp.submit_one(
            &ns,
            desc,
            &sim,
            ctrl,
            &SystemClock,
            Duration::from_secs(1),
            ns.nsid,
            Opcode::Read,
            0,
            16, // two pages worth of blocks
            buf,
            buf.phys,
        )
        .unwrap();

        let last = sim.last_command().unwrap();
        assert_eq!(last.prp2, last.prp1 + ns.page_size as u64);
    }

    #[test]
    fn queue_full_drains_one_before_submitting() {
        let ns = namespace(2); // maxiopq = 1
        let dma = SimDmaProvider::new(1 << 20);
        let sim = Arc::new(SimControllerDriver::new(ns.block_size, ns.page_size, ns.block_count));
        let ctrl = sim.open(&crate::pci::PciAddress::parse("00:00.0").unwrap()).unwrap();
        let mut qp = QueuePair::new(0, ns.qsize as u16, ns.page_size, &dma).unwrap();
        let d1 = qp.descriptors.get().unwrap();
        let d2 = qp.descriptors.get().unwrap();
        let buf = dma.alloc(ns.page_size as usize).unwrap();

        qp.submit_one(&ns, d1, sim.as_ref(), ctrl, &SystemClock, Duration::from_secs(1), ns.nsid, Opcode::Write, 0, 1, buf, buf.phys).unwrap();
        assert_eq!(qp.cidcount(), 1);

        // Second submit must drain the first (sim completes immediately).
        qp.submit_one(&ns, d2, sim.as_ref(), ctrl, &SystemClock, Duration::from_secs(1), ns.nsid, Opcode::Write, 1, 1, buf, buf.phys).unwrap();
        assert_eq!(qp.cidcount(), 1, "drain should have freed the first cid");
    }
}
