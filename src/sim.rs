//! In-process simulator for [`DmaProvider`] and [`ControllerDriver`].
//!
//! Stands in for the VFIO binding and the real NVMe controller driver
//! (both out of scope, spec.md S1/S6) so the core can be exercised without
//! hardware. Grounded on `original_source/test/unvme/unvme_sim_test.c`: a
//! single backing buffer plays the namespace's logical blocks, commands
//! complete synchronously against it, and DMA "physical" addresses are
//! just offsets into a real leaked allocation (identity `virt == phys`,
//! so PRP math exercises the same arithmetic the real driver would see).
//!
//! Enabled by the `sim` feature (on by default) or under `#[cfg(test)]`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::driver::{
    CompletionPoll, ControllerDriver, ControllerHandle, DmaProvider, DmaTuple, Feature,
    IdentifyController, IdentifyNamespace,
};
use crate::error::UnvmeError;
use crate::pci::PciAddress;

/// Bump-allocates DMA buffers out of one real, leaked backing allocation.
/// Never reclaims space on free (adequate for the lifetime of a test or
/// bench process); `free` only removes the bookkeeping entry so
/// [`crate::dma::DmaRegistry`]'s double-free detection has something to
/// exercise against.
pub struct SimDmaProvider {
    inner: Mutex<SimDmaInner>,
}

struct SimDmaInner {
    base: usize,
    capacity: usize,
    next_offset: usize,
    live: HashMap<usize, usize>,
}

const SIM_ALIGNMENT: usize = 4096;

impl SimDmaProvider {
    pub fn new(capacity: usize) -> Self {
        let buf = vec![0u8; capacity].into_boxed_slice();
        let base = Box::leak(buf).as_mut_ptr() as usize;
        SimDmaProvider {
            inner: Mutex::new(SimDmaInner { base, capacity, next_offset: 0, live: HashMap::new() }),
        }
    }
}

impl DmaProvider for SimDmaProvider {
    fn alloc(&self, size: usize) -> Result<DmaTuple, UnvmeError> {
        let mut guard = self.inner.lock().unwrap();
        let aligned = size.div_ceil(SIM_ALIGNMENT) * SIM_ALIGNMENT;
        if guard.next_offset + aligned > guard.capacity {
            return Err(UnvmeError::Fatal("simulated dma arena exhausted".into()));
        }
        let offset = guard.next_offset;
        guard.next_offset += aligned;
        let virt = guard.base + offset;
        guard.live.insert(virt, size);
        Ok(DmaTuple { virt, phys: virt as u64, size })
    }

    fn free(&self, tuple: DmaTuple) -> Result<(), UnvmeError> {
        self.inner.lock().unwrap().live.remove(&tuple.virt);
        Ok(())
    }
}

/// One command as last submitted to [`SimControllerDriver::cmd_rw`], kept
/// for test assertions on PRP construction.
#[derive(Debug, Clone, Copy)]
pub struct LastCommand {
    pub qid: u16,
    pub cid: u16,
    pub opcode: u8,
    pub slba: u64,
    pub nlb: u16,
    pub prp1: u64,
    pub prp2: u64,
}

struct Completion {
    cid: u16,
    status: u16,
}

/// A simulated controller backing one namespace's logical blocks with a
/// single in-memory buffer. Commands execute and complete synchronously
/// inside `cmd_rw`; `check_completion` just drains the per-queue
/// completion queue `cmd_rw` pushed onto.
pub struct SimControllerDriver {
    block_size: u32,
    page_size: u32,
    nbpp: u32,
    storage: Mutex<Vec<u8>>,
    queues: Mutex<HashMap<u16, VecDeque<Completion>>>,
    last: Mutex<Option<LastCommand>>,
}

impl SimControllerDriver {
    pub fn new(block_size: u32, page_size: u32, block_count: u64) -> Self {
        SimControllerDriver {
            block_size,
            page_size,
            nbpp: page_size / block_size,
            storage: Mutex::new(vec![0u8; block_count as usize * block_size as usize]),
            queues: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
        }
    }

    pub fn last_command(&self) -> Option<LastCommand> {
        *self.last.lock().unwrap()
    }

    /// Reconstructs the data-page virtual addresses a command's PRP1/PRP2
    /// cover, following the same 1/2/N-page rule `queue.rs` uses to build
    /// them.
    fn prp_pages(&self, prp1: u64, prp2: u64, numpages: u32) -> Vec<u64> {
        match numpages {
            0 | 1 => vec![prp1],
            2 => vec![prp1, prp2],
            n => {
                let mut pages = vec![prp1];
                // SAFETY: `prp2` is this simulator's own identity-mapped
                // address for the PRP list page `queue.rs` wrote, sized
                // for exactly `numpages - 1` entries.
                let list = unsafe {
                    std::slice::from_raw_parts(prp2 as *const u64, n as usize - 1)
                };
                pages.extend_from_slice(list);
                pages
            }
        }
    }

    fn execute(&self, opcode: u8, slba: u64, nlb: u16, prp1: u64, prp2: u64) -> u16 {
        let numpages = (nlb as u32).div_ceil(self.nbpp).max(1);
        let pages = self.prp_pages(prp1, prp2, numpages);
        let mut storage = self.storage.lock().unwrap();
        let mut remaining = nlb as u32;
        let mut lba = slba;

        for page_addr in pages {
            if remaining == 0 {
                break;
            }
            let blocks = remaining.min(self.nbpp);
            let bytes = blocks as usize * self.block_size as usize;
            let store_off = lba as usize * self.block_size as usize;
            if store_off + bytes > storage.len() {
                return 0x02; // out-of-range, mirrors a device-reported LBA error
            }

            // SAFETY: `page_addr` is an identity-mapped address returned by
            // this simulator's own `SimDmaProvider`, sized for at least one
            // page, which is always >= `bytes` by construction.
            let page_slice = unsafe {
                std::slice::from_raw_parts_mut(page_addr as *mut u8, bytes)
            };
            match opcode {
                0x01 => storage[store_off..store_off + bytes].copy_from_slice(page_slice),
                0x02 => page_slice.copy_from_slice(&storage[store_off..store_off + bytes]),
                _ => return 0x01, // invalid opcode
            }

            lba += blocks as u64;
            remaining -= blocks;
        }

        0
    }
}

impl ControllerDriver for SimControllerDriver {
    fn open(&self, _pci: &PciAddress) -> Result<ControllerHandle, UnvmeError> {
        Ok(ControllerHandle(1))
    }

    fn setup_adminq(
        &self,
        _ctrl: ControllerHandle,
        _asq: DmaTuple,
        _acq: DmaTuple,
        _qsize: u16,
    ) -> Result<(), UnvmeError> {
        Ok(())
    }

    fn identify_controller(&self, _ctrl: ControllerHandle) -> Result<IdentifyController, UnvmeError> {
        Ok(IdentifyController {
            vendor_id: 0x1d1d,
            serial: "SIM0000000000000001".into(),
            model: "unvme simulated controller".into(),
            firmware: "0.1".into(),
            mdts: 5,
            page_shift: self.page_size.trailing_zeros() as u8,
        })
    }

    fn identify_namespace(
        &self,
        _ctrl: ControllerHandle,
        _nsid: u32,
    ) -> Result<IdentifyNamespace, UnvmeError> {
        let block_count = (self.storage.lock().unwrap().len() / self.block_size as usize) as u64;
        Ok(IdentifyNamespace { block_count, block_shift: self.block_size.trailing_zeros() as u8 })
    }

    fn get_feature(&self, _ctrl: ControllerHandle, feature: Feature) -> Result<u32, UnvmeError> {
        match feature {
            // NSQA/NCQA in the low/high halfwords, 0-based, per the NVMe
            // Number of Queues feature encoding.
            Feature::NumberOfQueues => Ok((63u32 << 16) | 63u32),
        }
    }

    fn create_ioq(
        &self,
        _ctrl: ControllerHandle,
        qid: u16,
        _sq: DmaTuple,
        _cq: DmaTuple,
        _qsize: u16,
    ) -> Result<(), UnvmeError> {
        self.queues.lock().unwrap().entry(qid).or_default();
        Ok(())
    }

    fn delete_ioq(&self, _ctrl: ControllerHandle, qid: u16) -> Result<(), UnvmeError> {
        self.queues.lock().unwrap().remove(&qid);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn cmd_rw(
        &self,
        _ctrl: ControllerHandle,
        qid: u16,
        opcode: u8,
        cid: u16,
        _nsid: u32,
        slba: u64,
        nlb: u16,
        prp1: u64,
        prp2: u64,
    ) -> Result<(), UnvmeError> {
        let status = self.execute(opcode, slba, nlb, prp1, prp2);
        *self.last.lock().unwrap() = Some(LastCommand { qid, cid, opcode, slba, nlb, prp1, prp2 });
        self.queues.lock().unwrap().entry(qid).or_default().push_back(Completion { cid, status });
        Ok(())
    }

    fn check_completion(&self, _ctrl: ControllerHandle, qid: u16) -> CompletionPoll {
        match self.queues.lock().unwrap().entry(qid).or_default().pop_front() {
            Some(Completion { cid, status }) => CompletionPoll::Completed { cid, status },
            None => CompletionPoll::Empty,
        }
    }

    fn delete(&self, _ctrl: ControllerHandle) -> Result<(), UnvmeError> {
        Ok(())
    }
}
