//! Transfer posting: descriptor lists in, request chain out.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::api::{XferOp, XferOptArgs, XferStatus};
use crate::chain::RequestChain;
use crate::engine::{LocalMd, RemoteMd, XferEngine};
use crate::error::{Result, XferError};
use crate::fabric::{ReqToken, Worker};

/// One local byte range and the registration it lives in.
#[derive(Clone, Copy)]
pub struct LocalDesc<'a> {
    pub addr: u64,
    pub len: usize,
    pub md: &'a LocalMd,
}

/// One remote byte range and the imported metadata it lives in.
#[derive(Clone, Copy)]
pub struct RemoteDesc<'a> {
    pub addr: u64,
    pub len: usize,
    pub md: &'a RemoteMd,
}

/// Agent-owned handle over one transfer's request chain. Bound to a single
/// worker for its whole life; every token in the chain was produced by that
/// worker.
#[derive(Debug)]
pub struct XferHandle {
    worker_id: usize,
    chain: RequestChain,
}

impl XferHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether any token is still linked to this handle.
    pub fn has_pending(&self) -> bool {
        !self.chain.is_empty()
    }
}

impl XferEngine {
    /// Stable thread→worker sharding: repeated calls from one thread land
    /// on the same worker.
    pub(crate) fn worker_id_for_current_thread(&self) -> usize {
        let mut h = DefaultHasher::new();
        std::thread::current().id().hash(&mut h);
        (h.finish() % self.shared.workers.len() as u64) as usize
    }

    /// Allocate a transfer handle towards a loaded peer, pinned to the
    /// calling thread's worker.
    pub fn prep_xfer(&self, remote_agent: &str) -> Result<XferHandle> {
        self.check_conn(remote_agent)?;
        Ok(XferHandle {
            worker_id: self.worker_id_for_current_thread(),
            chain: RequestChain::default(),
        })
    }

    /// Issue one read/write per descriptor pair on the handle's worker,
    /// append an endpoint flush, and optionally a completion notification.
    /// Returns the chain's aggregate status.
    pub fn post_xfer(
        &self,
        op: XferOp,
        local: &[LocalDesc<'_>],
        remote: &[RemoteDesc<'_>],
        remote_agent: &str,
        handle: &mut XferHandle,
        opts: Option<&XferOptArgs>,
    ) -> Result<XferStatus> {
        if local.len() != remote.len() {
            return Err(XferError::InvalidParam("descriptor count mismatch"));
        }

        let worker_id = handle.worker_id;
        let worker = self.worker(worker_id);

        for (l, r) in local.iter().zip(remote) {
            if l.len != r.len {
                return Err(XferError::InvalidParam("descriptor length mismatch"));
            }
            let ep = &r.md.conn.eps[worker_id];
            let rkey = &r.md.rkeys[worker_id];
            let posted = match op {
                XferOp::Read => {
                    worker.read(ep, r.addr, rkey, l.addr, &l.md.mem, l.len)
                }
                XferOp::Write => {
                    worker.write(ep, l.addr, &l.md.mem, r.addr, rkey, l.len)
                }
            };
            track(worker, handle, posted)?;
        }

        // Barrier: the notification below must not be observable before
        // every preceding operation reached remote visibility.
        if let Some(first) = remote.first() {
            let posted = worker.flush_endpoint(&first.md.conn.eps[worker_id]);
            track(worker, handle, posted)?;
        }

        if let Some(msg) = opts.and_then(|o| o.notif_msg.as_deref()) {
            let posted = self.notif_send_priv(remote_agent, msg, worker_id);
            track(worker, handle, posted)?;
        }

        handle.chain.status(worker)
    }

    /// Poll the handle. A terminal error does not drain the chain; the
    /// caller releases it.
    pub fn check_xfer(&self, handle: &mut XferHandle) -> Result<XferStatus> {
        handle.chain.status(self.worker(handle.worker_id))
    }

    /// Cancel whatever is still in flight and free the handle.
    pub fn release_req(&self, mut handle: XferHandle) -> Result<()> {
        handle.chain.release(self.worker(handle.worker_id))
    }
}

/// Per-step bookkeeping: track in-progress tokens, pass inline completions
/// through, and drain the whole chain on the first error.
fn track(
    worker: &Worker,
    handle: &mut XferHandle,
    posted: Result<Option<ReqToken>>,
) -> Result<()> {
    match posted {
        Ok(Some(tok)) => {
            handle.chain.append(worker, tok);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            let _ = handle.chain.release(worker);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::XferConfig;

    #[test]
    fn sharding_is_deterministic_per_thread() {
        let mut cfg = XferConfig::new("shard");
        cfg.num_workers = 4;
        let engine = XferEngine::new(cfg).unwrap();

        let first = engine.worker_id_for_current_thread();
        for _ in 0..16 {
            assert_eq!(engine.worker_id_for_current_thread(), first);
        }

        // Handles inherit the calling thread's worker.
        engine.connect("shard").unwrap();
        let h = engine.prep_xfer("shard").unwrap();
        assert_eq!(h.worker_id(), first);
    }

    #[test]
    fn prep_requires_loaded_peer() {
        let engine = XferEngine::new(XferConfig::new("prep")).unwrap();
        assert_eq!(engine.prep_xfer("ghost").unwrap_err().code(), "NOT_FOUND");
    }
}
