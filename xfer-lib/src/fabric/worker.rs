use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::context::Context;
use super::directory::{self, AmMessage, WorkerShared};
use super::request::{ReqState, ReqArena, ReqToken};
use crate::api::XferStatus;
use crate::error::{Result, XferError};

/// Operations at or under this size complete inline when nothing is queued
/// ahead of them on the worker.
pub(crate) const INLINE_MAX: usize = 8 * 1024;

/// Receive-side active-message attributes handed to handlers.
pub struct AmAttrs {
    pub rendezvous: bool,
}

/// Handler for one active-message id. Runs inside whichever thread drives
/// `progress()`. An `InvalidParam` return aborts delivery of that message
/// only.
pub(crate) type AmHandler =
    Arc<dyn Fn(&[u8], &[u8], &AmAttrs) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStatus {
    Armed,
    Busy,
}

/// Registration of a local byte range with the fabric.
#[derive(Debug)]
pub struct MemHandle {
    base: u64,
    len: usize,
}

impl MemHandle {
    fn check(&self, addr: u64, len: usize) -> Result<()> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(XferError::InvalidParam("descriptor overflows"))?;
        if addr < self.base || end > self.base + self.len as u64 {
            return Err(XferError::Backend("local access outside registration"));
        }
        Ok(())
    }
}

/// Imported authorization for one-sided access to a remote region.
#[derive(Debug, Clone, Copy)]
pub struct Rkey {
    base: u64,
    len: u64,
}

impl Rkey {
    fn check(&self, addr: u64, len: usize) -> Result<()> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(XferError::InvalidParam("descriptor overflows"))?;
        if addr < self.base || end > self.base + self.len {
            // The RDMA equivalent of a protection fault.
            return Err(XferError::Backend("remote access out of range"));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RkeyBlob {
    base: u64,
    len: u64,
}

pub fn register_memory(_ctx: &Context, addr: u64, len: usize) -> Result<MemHandle> {
    if addr == 0 {
        return Err(XferError::InvalidParam("null region"));
    }
    Ok(MemHandle { base: addr, len })
}

pub fn pack_rkey(_ctx: &Context, mem: &MemHandle) -> Result<Bytes> {
    let blob = RkeyBlob { base: mem.base, len: mem.len as u64 };
    Ok(Bytes::from(bincode::serialize(&blob).expect("rkey blob")))
}

struct EpInner {
    remote: Arc<WorkerShared>,
    closed: AtomicBool,
}

/// A local handle addressing one peer worker.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EpInner>,
}

impl Endpoint {
    fn remote(&self) -> Result<&Arc<WorkerShared>> {
        if self.inner.closed.load(SeqCst) {
            return Err(XferError::Backend("endpoint disconnected"));
        }
        Ok(&self.inner.remote)
    }

    pub fn import_rkey(&self, blob: &[u8]) -> Result<Rkey> {
        self.remote()?;
        let b: RkeyBlob = bincode::deserialize(blob)
            .map_err(|_| XferError::InvalidParam("malformed rkey blob"))?;
        Ok(Rkey { base: b.base, len: b.len })
    }
}

enum PendingKind {
    Copy { src: u64, dst: u64, len: usize },
    Flush,
    SendAm { target: Arc<WorkerShared>, id: u8, header: Vec<u8>, payload: *const u8, payload_len: usize },
}

struct PendingOp {
    tok: ReqToken,
    kind: PendingKind,
}

// Deferred sends carry a raw pointer into a buffer the request tail keeps
// alive until completion.
unsafe impl Send for PendingOp {}

struct WorkerState {
    arena: ReqArena,
    queue: VecDeque<PendingOp>,
    handlers: HashMap<u8, AmHandler>,
}

/// The unit of fabric progress: owns one event fd, a deferred-op queue and
/// the request arena for every token it hands out. Internally serialized,
/// which is what `ThreadingMode::Worker` promises.
pub struct Worker {
    ctx: Arc<Context>,
    shared: Arc<WorkerShared>,
    inbox_rx: crossbeam_channel::Receiver<AmMessage>,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(ctx: Arc<Context>) -> Result<Worker> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = directory::register_worker(tx)?;
        Ok(Worker {
            ctx,
            shared,
            inbox_rx: rx,
            state: Mutex::new(WorkerState {
                arena: ReqArena::default(),
                queue: VecDeque::new(),
                handlers: HashMap::new(),
            }),
        })
    }

    /// This worker's connect-address blob.
    pub fn endpoint_address(&self) -> Bytes {
        directory::pack_address(self.shared.id)
    }

    pub fn connect(&self, blob: &[u8]) -> Result<Endpoint> {
        let remote = directory::lookup(blob)?;
        Ok(Endpoint {
            inner: Arc::new(EpInner { remote, closed: AtomicBool::new(false) }),
        })
    }

    /// Initiate endpoint teardown. Completion needs no further progress in
    /// this provider; the signature stays non-blocking for parity with
    /// fabrics where it does.
    pub fn disconnect_nb(&self, ep: &Endpoint) -> Result<()> {
        ep.inner.closed.store(true, SeqCst);
        Ok(())
    }

    pub fn register_am_handler(&self, id: u8, handler: AmHandler) {
        self.state.lock().handlers.insert(id, handler);
    }

    /// Eager active-message send. `Ok(None)` means the message was delivered
    /// inline and no token exists; callers must not wait in that case.
    pub fn send_am(
        &self,
        ep: &Endpoint,
        id: u8,
        header: &[u8],
        payload: &[u8],
        _eager: bool,
    ) -> Result<Option<ReqToken>> {
        let target = ep.remote()?.clone();
        let mut st = self.state.lock();
        if payload.len() <= INLINE_MAX && st.queue.is_empty() {
            drop(st);
            target.deliver(AmMessage {
                id,
                header: header.to_vec(),
                payload: payload.to_vec(),
                rendezvous: false,
            })?;
            return Ok(None);
        }
        let tok = st.arena.alloc();
        st.queue.push_back(PendingOp {
            tok,
            kind: PendingKind::SendAm {
                target,
                id,
                header: header.to_vec(),
                payload: payload.as_ptr(),
                payload_len: payload.len(),
            },
        });
        Ok(Some(tok))
    }

    /// One-sided read of `[raddr, raddr+len)` into `[laddr, laddr+len)`.
    pub fn read(
        &self,
        ep: &Endpoint,
        raddr: u64,
        rkey: &Rkey,
        laddr: u64,
        lmem: &MemHandle,
        len: usize,
    ) -> Result<Option<ReqToken>> {
        ep.remote()?;
        rkey.check(raddr, len)?;
        lmem.check(laddr, len)?;
        self.post_copy(raddr, laddr, len)
    }

    /// One-sided write of `[laddr, laddr+len)` into `[raddr, raddr+len)`.
    pub fn write(
        &self,
        ep: &Endpoint,
        laddr: u64,
        lmem: &MemHandle,
        raddr: u64,
        rkey: &Rkey,
        len: usize,
    ) -> Result<Option<ReqToken>> {
        ep.remote()?;
        lmem.check(laddr, len)?;
        rkey.check(raddr, len)?;
        self.post_copy(laddr, raddr, len)
    }

    fn post_copy(&self, src: u64, dst: u64, len: usize) -> Result<Option<ReqToken>> {
        if len == 0 {
            return Ok(None);
        }
        let mut st = self.state.lock();
        if len <= INLINE_MAX && st.queue.is_empty() {
            copy_bytes(src, dst, len);
            return Ok(None);
        }
        let tok = st.arena.alloc();
        st.queue.push_back(PendingOp { tok, kind: PendingKind::Copy { src, dst, len } });
        Ok(Some(tok))
    }

    /// Completes once every previously posted one-sided operation on this
    /// endpoint has reached remote visibility. FIFO execution of the
    /// deferred queue is what makes this a barrier.
    pub fn flush_endpoint(&self, ep: &Endpoint) -> Result<Option<ReqToken>> {
        ep.remote()?;
        let mut st = self.state.lock();
        if st.queue.is_empty() {
            return Ok(None);
        }
        let tok = st.arena.alloc();
        st.queue.push_back(PendingOp { tok, kind: PendingKind::Flush });
        Ok(Some(tok))
    }

    /// Poll one token, driving the worker once.
    pub fn test(&self, tok: ReqToken) -> Result<XferStatus> {
        self.progress();
        match self.state.lock().arena.state(tok) {
            Some(ReqState::Pending) => Ok(XferStatus::InProgress),
            Some(ReqState::Failed(reason)) => Err(XferError::Backend(reason)),
            // A stale token means the operation completed and its slot was
            // recycled.
            Some(ReqState::Done) | None => Ok(XferStatus::Done),
        }
    }

    pub fn cancel(&self, tok: ReqToken) {
        self.state.lock().arena.cancel(tok);
    }

    pub fn release(&self, tok: ReqToken) {
        self.state.lock().arena.release(tok);
    }

    /// Run `f` against the request arena under the worker lock. The chain
    /// threads its links through the fabric-managed request records.
    pub(crate) fn with_arena<R>(&self, f: impl FnOnce(&mut ReqArena) -> R) -> R {
        f(&mut self.state.lock().arena)
    }

    /// Hand the serialized send buffer to the request tail; it is dropped
    /// when the slot is freed.
    pub fn set_am_buffer(&self, tok: ReqToken, buf: Vec<u8>) {
        let mut st = self.state.lock();
        if let Some(slot) = st.arena.get(tok) {
            slot.am_buffer = Some(buf);
        }
    }

    /// Advance the worker: run deferred operations in order, then dispatch
    /// inbound active messages. Returns the number of events processed.
    /// Each call retires a bounded batch; callers loop until it reports no
    /// progress.
    pub fn progress(&self) -> usize {
        const OPS_PER_PASS: usize = 4;

        self.shared.event.drain();
        let mut n = 0;

        {
            let mut st = self.state.lock();
            for _ in 0..OPS_PER_PASS {
                let Some(op) = st.queue.pop_front() else { break };
                n += execute(&mut st, op);
            }
        }

        while let Ok(msg) = self.inbox_rx.try_recv() {
            n += 1;
            let handler = self.state.lock().handlers.get(&msg.id).cloned();
            match handler {
                Some(h) => {
                    let attrs = AmAttrs { rendezvous: msg.rendezvous };
                    if let Err(e) = h(&msg.header, &msg.payload, &attrs) {
                        warn!(id = msg.id, error = %e, "active message rejected");
                    }
                }
                None => warn!(id = msg.id, "no handler for active message"),
            }
        }

        n
    }

    pub fn event_fd(&self) -> RawFd {
        self.shared.event.fd()
    }

    /// Park discipline: once `Armed`, the next enqueue rings the event fd
    /// and poll may block. `Busy` means undrained work raced the arm.
    pub fn arm(&self) -> Result<ArmStatus> {
        if !self.ctx.eventing() {
            return Err(XferError::Backend("context built without eventing"));
        }
        self.shared.armed.store(true, SeqCst);
        let busy =
            !self.inbox_rx.is_empty() || !self.state.lock().queue.is_empty();
        if busy {
            self.shared.armed.store(false, SeqCst);
            return Ok(ArmStatus::Busy);
        }
        Ok(ArmStatus::Armed)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        directory::unregister_worker(self.shared.id);
    }
}

fn execute(st: &mut WorkerState, op: PendingOp) -> usize {
    match st.arena.state(op.tok) {
        // Cancelled or already-released entry; skip.
        Some(ReqState::Done) | Some(ReqState::Failed(_)) | None => return 0,
        Some(ReqState::Pending) => {}
    }
    match op.kind {
        PendingKind::Copy { src, dst, len } => copy_bytes(src, dst, len),
        PendingKind::Flush => {}
        PendingKind::SendAm { target, id, header, payload, payload_len } => {
            let payload =
                unsafe { std::slice::from_raw_parts(payload, payload_len) };
            let msg = AmMessage {
                id,
                header,
                payload: payload.to_vec(),
                rendezvous: false,
            };
            if let Err(e) = target.deliver(msg) {
                warn!(error = %e, "active message delivery failed");
                st.arena.fail(op.tok, "active message delivery failed");
                return 1;
            }
        }
    }
    st.arena.complete(op.tok);
    1
}

fn copy_bytes(src: u64, dst: u64, len: usize) {
    // Ranges were validated against registrations at post time. Loopback
    // transfers may overlap, hence the memmove-style copy.
    unsafe {
        std::ptr::copy(src as *const u8, dst as *mut u8, len);
    }
}
