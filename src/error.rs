//! Error taxonomy for the unvme core.
//!
//! Mirrors the five classes from the design: usage errors, transient
//! back-pressure (handled internally and never surfaced here), device
//! errors, timeouts, and fatal invariant violations.

use thiserror::Error;

/// Errors the public facade and core modules can report.
#[derive(Debug, Error)]
pub enum UnvmeError {
    /// The PCI address string was not `BB:DD.F` (or `BB.DD.F`) hex.
    #[error("invalid pci address {0:?}")]
    InvalidPciAddress(String),

    /// `qcount < 1` or `qsize < 2`, or a value exceeds the controller's
    /// advertised maximum.
    #[error("invalid queue configuration: qcount={qcount} qsize={qsize}")]
    InvalidQueueConfig { qcount: u32, qsize: u32 },

    /// `qid` was not in `[0, qcount)` for the session.
    #[error("queue id {qid} out of range for qcount={qcount}")]
    InvalidQueueId { qid: u16, qcount: u32 },

    /// `free`/`resolve` was given a pointer not tracked by this session's
    /// DMA registry.
    #[error("buffer not registered with this session")]
    UnregisteredBuffer,

    /// A single request's block count exceeds `maxbpio` after splitting
    /// would still leave a too-large chunk, or the caller asked for more
    /// than the controller can ever serve in one command-chain.
    #[error("request exceeds max blocks per i/o: nlb={nlb} max={max}")]
    RequestTooLarge { nlb: u32, max: u32 },

    /// `slba + nlb` would run past the namespace's block count.
    #[error("lba range out of bounds: slba={slba} nlb={nlb} blockcount={blockcount}")]
    OutOfRange { slba: u64, nlb: u32, blockcount: u64 },

    /// A physical address was not a multiple of the block size.
    #[error("unaligned physical address")]
    Unaligned,

    /// The namespace's block size does not divide its page size, or the
    /// namespace reports fewer than 8 blocks.
    #[error("invalid namespace geometry: block_size={block_size} page_size={page_size}")]
    InvalidGeometry { block_size: u32, page_size: u32 },

    /// The controller reported a non-zero completion status for a command.
    #[error("device reported error status {0:#x}")]
    DeviceError(u16),

    /// A caller-supplied timeout elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The queue-full back-pressure drain inside `submit` itself timed out.
    /// Spec.md S5 treats this as equivalent to a hardware hang.
    #[error("queue {qid} appears stuck: back-pressure drain timed out")]
    QueueStuck { qid: u16 },

    /// A completion referenced a command-id that no in-use descriptor
    /// claims. Indicates firmware or memory corruption; callers that reach
    /// this should treat the session as unrecoverable.
    #[error("fatal controller invariant violated: {0}")]
    Fatal(String),
}

impl UnvmeError {
    /// True for the class of errors spec.md S7 calls fatal invariant
    /// violations: these are not meant to be retried or recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UnvmeError::Fatal(_))
    }
}
