//! Request scheduler (spec.md S4.4): splits a user request larger than a
//! queue-pair's `maxbpio` into consecutive `submit_one` calls sharing one
//! descriptor, and drains completions for it either non-blockingly
//! (`poll_once`, backing the facade's `apoll`) or to exhaustion with a
//! deadline (`wait`, backing the synchronous `read`/`write` wrappers).

use std::time::Duration;

use crate::clock::Clock;
use crate::descriptor::Opcode;
use crate::driver::{ControllerDriver, ControllerHandle, DmaTuple};
use crate::error::UnvmeError;
use crate::namespace::Namespace;
use crate::queue::QueuePair;

/// The outcome of a single non-blocking poll against an in-flight
/// request's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// At least one chunk is still outstanding.
    Pending,
    /// Every chunk completed. `error` is the first non-zero status seen,
    /// if any.
    Done { error: Option<u16> },
}

/// Submits exactly one command for `nlb` blocks — no splitting. Rejects
/// `nlb > maxbpio` before touching the descriptor pool, per spec.md S8's
/// reject-path property: a rejected request leaves cid/descriptor counts
/// on the queue unchanged. Backs the facade's `aread`/`awrite`.
#[allow(clippy::too_many_arguments)]
pub fn submit_single(
    qp: &mut QueuePair,
    ns: &Namespace,
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
) -> Result<usize, UnvmeError> {
    if nlb == 0 || nlb > ns.maxbpio {
        return Err(UnvmeError::RequestTooLarge { nlb, max: ns.maxbpio });
    }

    let desc_index = qp
        .descriptors
        .get()
        .ok_or_else(|| UnvmeError::Fatal("descriptor pool exhausted".into()))?;

    if let Err(err) =
        qp.submit_one(ns, desc_index, driver, ctrl, clock, back_pressure_timeout, nsid, opcode, slba, nlb, tuple, phys)
    {
        recycle_after_failure(qp, desc_index, driver, ctrl, clock, back_pressure_timeout)?;
        return Err(err);
    }

    Ok(desc_index)
}

/// Submits `nlb` blocks starting at `slba` against `tuple`/`phys`,
/// splitting into `ceil(nlb / maxbpio)` commands sharing one descriptor.
/// Returns the descriptor index the caller polls to track completion.
/// Backs the facade's synchronous `read`/`write` convenience wrapper,
/// which is allowed to split where `aread`/`awrite` are not (spec.md
/// S4.4).
#[allow(clippy::too_many_arguments)]
pub fn submit_chunked(
    qp: &mut QueuePair,
    ns: &Namespace,
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
) -> Result<usize, UnvmeError> {
    if nlb == 0 {
        return Err(UnvmeError::RequestTooLarge { nlb, max: ns.maxbpio });
    }

    let desc_index = qp
        .descriptors
        .get()
        .ok_or_else(|| UnvmeError::Fatal("descriptor pool exhausted".into()))?;

    let mut remaining = nlb;
    let mut cursor_slba = slba;
    let mut cursor_phys = phys;

    while remaining > 0 {
        let chunk = remaining.min(ns.maxbpio);
        if let Err(err) = qp.submit_one(
            ns,
            desc_index,
            driver,
            ctrl,
            clock,
            back_pressure_timeout,
            nsid,
            opcode,
            cursor_slba,
            chunk,
            tuple,
            cursor_phys,
        ) {
            recycle_after_failure(qp, desc_index, driver, ctrl, clock, back_pressure_timeout)?;
            return Err(err);
        }

        remaining -= chunk;
        cursor_slba += chunk as u64;
        cursor_phys += chunk as u64 * ns.block_size as u64;
    }

    Ok(desc_index)
}

/// Drains and recycles `desc_index` after a failed `submit_one`, so an
/// ordinary usage error (out-of-range LBA, unregistered buffer, …) on one
/// chunk of a request doesn't permanently strand a descriptor pool slot —
/// every chunk submitted before the failing one is already in flight and
/// must still be reaped (spec.md S5: "once submitted, a command must be
/// reaped"). Mirrors the original's `unvme_do_submit`, which polls/drains
/// and calls `unvme_put_desc` before returning NULL on any submit
/// rejection.
fn recycle_after_failure(
    qp: &mut QueuePair,
    desc_index: usize,
    driver: &dyn ControllerDriver,
    ctrl: ControllerHandle,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<(), UnvmeError> {
    let deadline = crate::clock::deadline_from_timeout(clock, timeout);

    while qp.descriptors.get_ref(desc_index).cidcount > 0 {
        if crate::clock::deadline_elapsed(clock, deadline) {
            return Err(UnvmeError::QueueStuck { qid: qp.qid });
        }
        let remaining = deadline.saturating_duration_since(clock.now());
        match qp.complete_one(driver, ctrl, clock, remaining) {
            Ok(_) => {}
            Err(UnvmeError::Timeout) => return Err(UnvmeError::QueueStuck { qid: qp.qid }),
            Err(e) => return Err(e),
        }
    }

    qp.descriptors.put(desc_index);
    Ok(())
}

/// Drains any completions already posted, without blocking, and reports
/// whether the request at `desc_index` is fully done. Callers that get
/// `Pending` are expected to call again later (the facade's `apoll`).
pub fn poll_once(
    qp: &mut QueuePair,
    desc_index: usize,
    driver: &dyn ControllerDriver,
    ctrl: ControllerHandle,
    clock: &dyn Clock,
) -> Result<PollResult, UnvmeError> {
    loop {
        match qp.complete_one(driver, ctrl, clock, Duration::ZERO) {
            Ok(_) => {}
            Err(UnvmeError::Timeout) => break,
            Err(e) => return Err(e),
        }
    }
    report(qp, desc_index)
}

/// Blocks (cooperatively yielding between polls) until the request at
/// `desc_index` is fully done or `timeout` elapses in total. A request
/// split across several commands (`submit_chunked`) needs several
/// `complete_one` calls to drain; each is given only the *remaining* budget
/// against one shared deadline, not a fresh `timeout` of its own, so the
/// total time this function can block is bounded by `timeout` regardless of
/// how many commands the descriptor is waiting on (spec.md S5: "`apoll(iod,
/// t)` polls until `t` seconds on the monotonic clock elapse").
pub fn wait(
    qp: &mut QueuePair,
    desc_index: usize,
    driver: &dyn ControllerDriver,
    ctrl: ControllerHandle,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<PollResult, UnvmeError> {
    let deadline = crate::clock::deadline_from_timeout(clock, timeout);

    while qp.descriptors.get_ref(desc_index).cidcount > 0 {
        if crate::clock::deadline_elapsed(clock, deadline) {
            return Err(UnvmeError::Timeout);
        }
        let remaining = deadline.saturating_duration_since(clock.now());
        qp.complete_one(driver, ctrl, clock, remaining)?;
    }

    report(qp, desc_index)
}

/// Reads the descriptor's outcome and, if fully drained, returns it to the
/// pool.
fn report(qp: &mut QueuePair, desc_index: usize) -> Result<PollResult, UnvmeError> {
    let desc = qp.descriptors.get_ref(desc_index);
    if desc.cidcount > 0 {
        return Ok(PollResult::Pending);
    }
    let error = desc.error;
    qp.descriptors.put(desc_index);
    Ok(PollResult::Done { error })
}
