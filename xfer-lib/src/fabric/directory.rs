//! Process-wide worker directory.
//!
//! The shared-memory provider resolves opaque endpoint-address blobs to live
//! workers through this table. A blob is only a versioned `(magic, worker)`
//! record; everything above the wrapper treats it as bytes.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XferError, last_errno};

const ADDR_MAGIC: u32 = 0x5846_4142; // "XFAB"

static DIRECTORY: Lazy<DashMap<u64, Arc<WorkerShared>>> = Lazy::new(DashMap::new);
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Serialize, Deserialize)]
struct AddrBlob {
    magic: u32,
    worker: u64,
}

/// An inbound active message, as queued on the target worker.
pub(crate) struct AmMessage {
    pub id: u8,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub rendezvous: bool,
}

/// The half of a worker other workers may touch: its inbox and its wakeup
/// machinery.
pub(crate) struct WorkerShared {
    pub id: u64,
    pub inbox_tx: crossbeam_channel::Sender<AmMessage>,
    pub event: EventFd,
    pub armed: AtomicBool,
}

impl std::fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShared")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl WorkerShared {
    /// Queue `msg` on this worker and ring its event fd if it is parked.
    pub(crate) fn deliver(&self, msg: AmMessage) -> Result<()> {
        self.inbox_tx
            .send(msg)
            .map_err(|_| XferError::Backend("target worker is gone"))?;
        if self.armed.swap(false, SeqCst) {
            self.event.signal();
        }
        Ok(())
    }
}

pub(crate) fn register_worker(
    inbox_tx: crossbeam_channel::Sender<AmMessage>,
) -> Result<Arc<WorkerShared>> {
    let shared = Arc::new(WorkerShared {
        id: NEXT_WORKER_ID.fetch_add(1, SeqCst),
        inbox_tx,
        event: EventFd::new()?,
        armed: AtomicBool::new(false),
    });
    DIRECTORY.insert(shared.id, shared.clone());
    Ok(shared)
}

pub(crate) fn unregister_worker(id: u64) {
    DIRECTORY.remove(&id);
}

pub(crate) fn pack_address(id: u64) -> Bytes {
    let blob = AddrBlob { magic: ADDR_MAGIC, worker: id };
    // Two u32/u64 fields; cannot fail.
    Bytes::from(bincode::serialize(&blob).expect("address blob"))
}

/// Resolve an address blob to the worker it names.
pub(crate) fn lookup(blob: &[u8]) -> Result<Arc<WorkerShared>> {
    let addr: AddrBlob = bincode::deserialize(blob)
        .map_err(|_| XferError::InvalidParam("malformed endpoint address"))?;
    if addr.magic != ADDR_MAGIC {
        return Err(XferError::InvalidParam("malformed endpoint address"));
    }
    DIRECTORY
        .get(&addr.worker)
        .map(|w| w.value().clone())
        .ok_or(XferError::NotFound("no worker at address"))
}

/// Thin RAII eventfd. Non-blocking so `drain` can be called opportunistically
/// from every progress pass.
pub(crate) struct EventFd(RawFd);

impl EventFd {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_errno("eventfd"));
        }
        Ok(EventFd(fd))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.0
    }

    pub(crate) fn signal(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(self.0, &one as *const u64 as *const libc::c_void, 8)
        };
        if ret != 8 {
            tracing::warn!(fd = self.0, "short write to event fd");
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf: u64 = 0;
        unsafe {
            // EAGAIN when nobody signalled; nothing to do either way.
            libc::read(self.0, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let shared = register_worker(tx).unwrap();
        let blob = pack_address(shared.id);
        let found = lookup(&blob).unwrap();
        assert_eq!(found.id, shared.id);
        unregister_worker(shared.id);
        assert!(lookup(&blob).is_err());
    }

    #[test]
    fn garbage_blob_is_invalid_param() {
        let err = lookup(b"not an address").unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAM");
    }

    #[test]
    fn eventfd_signal_and_drain() {
        let ev = EventFd::new().unwrap();
        ev.signal();
        let mut fds =
            [libc::pollfd { fd: ev.fd(), events: libc::POLLIN, revents: 0 }];
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        assert_eq!(n, 1);
        ev.drain();
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        assert_eq!(n, 0);
    }
}
