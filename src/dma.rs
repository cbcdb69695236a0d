//! DMA registry (spec.md S4.1): per-session bookkeeping of allocated DMA
//! buffers, and resolution of a caller virtual pointer to the enclosing
//! tuple at submission time.
//!
//! The hot path is `resolve`, which runs on every command submission. The
//! array is expected to hold tens of entries at most, so a linear scan
//! beats a tree here; a [`spin::Mutex`] serializes with concurrent
//! alloc/free on the *same* session without paying for an OS mutex on a
//! path that is supposed to stay allocation- and syscall-free.

use std::sync::Arc;

use spin::Mutex;

use crate::driver::{DmaProvider, DmaTuple};
use crate::error::UnvmeError;

/// Number of new slots reserved each time the registry's backing array
/// grows, per spec.md S4.1.
const GROWTH_CHUNK: usize = 256;

#[derive(Default)]
struct Inner {
    tuples: Vec<DmaTuple>,
}

/// Tracks every DMA buffer a session has allocated and not yet freed.
pub struct DmaRegistry {
    provider: Arc<dyn DmaProvider>,
    inner: Mutex<Inner>,
}

impl DmaRegistry {
    pub fn new(provider: Arc<dyn DmaProvider>) -> Self {
        DmaRegistry {
            provider,
            inner: Mutex::new(Inner { tuples: Vec::with_capacity(GROWTH_CHUNK) }),
        }
    }

    /// Allocates a new DMA-capable buffer and records it in the registry.
    /// Returns the virtual base address.
    pub fn alloc(&self, size: usize) -> Result<usize, UnvmeError> {
        let tuple = self.provider.alloc(size)?;
        let mut guard = self.inner.lock();
        if guard.tuples.len() == guard.tuples.capacity() {
            guard.tuples.reserve(GROWTH_CHUNK);
        }
        guard.tuples.push(tuple);
        Ok(tuple.virt)
    }

    /// Releases the buffer whose virtual base is `ptr`. Linear-scans for a
    /// match, swap-removes it from the array, and returns the freed tuple
    /// to the provider.
    pub fn free(&self, ptr: usize) -> Result<(), UnvmeError> {
        let tuple = {
            let mut guard = self.inner.lock();
            let index = guard
                .tuples
                .iter()
                .position(|t| t.virt == ptr)
                .ok_or(UnvmeError::UnregisteredBuffer)?;
            guard.tuples.swap_remove(index)
        };
        self.provider.free(tuple)
    }

    /// Finds the tuple enclosing virtual address `ptr`, returning the tuple
    /// and the caller's offset into it.
    pub fn resolve(&self, ptr: usize) -> Result<(DmaTuple, usize), UnvmeError> {
        let guard = self.inner.lock();
        guard
            .tuples
            .iter()
            .find(|t| ptr >= t.virt && ptr < t.virt + t.size)
            .map(|t| (*t, ptr - t.virt))
            .ok_or(UnvmeError::UnregisteredBuffer)
    }

    /// Frees every buffer still outstanding. Called at session teardown
    /// (spec.md S3: "destroying a session frees every DMA buffer still in
    /// its registry — defensive leak closure").
    pub fn free_all(&self) {
        let tuples = std::mem::take(&mut self.inner.lock().tuples);
        for tuple in tuples {
            let _ = self.provider.free(tuple);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDmaProvider;

    fn registry() -> DmaRegistry {
        DmaRegistry::new(Arc::new(SimDmaProvider::new(1 << 20)))
    }

    #[test]
    fn alloc_then_resolve_finds_offset() {
        let reg = registry();
        let ptr = reg.alloc(4096).unwrap();
        let (tuple, offset) = reg.resolve(ptr + 100).unwrap();
        assert_eq!(offset, 100);
        assert_eq!(tuple.phys_of(ptr + 100), tuple.phys + 100);
    }

    #[test]
    fn free_then_resolve_fails() {
        let reg = registry();
        let ptr = reg.alloc(4096).unwrap();
        reg.free(ptr).unwrap();
        assert!(matches!(reg.resolve(ptr), Err(UnvmeError::UnregisteredBuffer)));
    }

    #[test]
    fn double_free_returns_error_without_panic() {
        let reg = registry();
        let ptr = reg.alloc(4096).unwrap();
        reg.free(ptr).unwrap();
        assert!(matches!(reg.free(ptr), Err(UnvmeError::UnregisteredBuffer)));
    }

    #[test]
    fn free_swaps_last_tuple_into_freed_slot() {
        let reg = registry();
        let a = reg.alloc(4096).unwrap();
        let b = reg.alloc(4096).unwrap();
        let c = reg.alloc(4096).unwrap();
        reg.free(a).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.resolve(b).is_ok());
        assert!(reg.resolve(c).is_ok());
    }
}
