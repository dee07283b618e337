//! Request chain: the set of in-flight tokens behind one transfer handle.
//!
//! Links live inside the fabric-managed request records (`prev`/`next` slot
//! indices), so appending a token costs no allocation and releasing the
//! chain maps back to per-token `release` calls on the owning worker.

use tracing::debug;

use crate::api::XferStatus;
use crate::error::{Result, XferError};
use crate::fabric::{ReqState, ReqToken, Worker};

#[derive(Default, Debug)]
pub(crate) struct RequestChain {
    head: Option<u32>,
    tail: Option<u32>,
}

impl RequestChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// O(1) tail append. Completion is associative, so order within the
    /// chain never matters to `status`.
    pub(crate) fn append(&mut self, worker: &Worker, tok: ReqToken) {
        worker.with_arena(|arena| {
            let slot = tok.slot;
            {
                let s = arena.get_by_slot(slot);
                s.prev = self.tail;
                s.next = None;
            }
            match self.tail {
                Some(t) => arena.get_by_slot(t).next = Some(slot),
                None => self.head = Some(slot),
            }
            self.tail = Some(slot);
        });
    }

    /// Poll every token. Completed ones are unlinked and returned to the
    /// worker; pending ones stay chained. A terminal failure is returned
    /// with the chain left intact for the caller to release.
    pub(crate) fn status(&mut self, worker: &Worker) -> Result<XferStatus> {
        if self.head.is_none() {
            return Ok(XferStatus::Done);
        }
        worker.progress();

        worker.with_arena(|arena| {
            let mut out = XferStatus::Done;
            let mut cur = self.head;
            while let Some(slot) = cur {
                match arena.state(arena.token_at(slot)) {
                    Some(ReqState::Pending) => out = XferStatus::InProgress,
                    Some(ReqState::Failed(reason)) => {
                        return Err(XferError::Backend(reason));
                    }
                    Some(ReqState::Done) | None => {}
                }
                cur = arena.get_by_slot(slot).next;
            }

            // No terminal failure: retire completed tokens, keep the rest.
            let mut cur = self.head.take();
            self.tail = None;
            while let Some(slot) = cur {
                cur = arena.get_by_slot(slot).next;
                let tok = arena.token_at(slot);
                match arena.state(tok) {
                    Some(ReqState::Pending) => {
                        {
                            let s = arena.get_by_slot(slot);
                            s.prev = self.tail;
                            s.next = None;
                        }
                        match self.tail {
                            Some(t) => arena.get_by_slot(t).next = Some(slot),
                            None => self.head = Some(slot),
                        }
                        self.tail = Some(slot);
                    }
                    _ => arena.release(tok),
                }
            }
            Ok(out)
        })
    }

    /// Cancel every uncompleted token, then return all of them to the
    /// worker. Leaves the chain empty.
    pub(crate) fn release(&mut self, worker: &Worker) -> Result<()> {
        if self.head.is_some() {
            debug!("releasing a chain with requests still linked");
        }
        worker.with_arena(|arena| {
            let mut cur = self.head.take();
            self.tail = None;
            while let Some(slot) = cur {
                cur = arena.get_by_slot(slot).next;
                let tok = arena.token_at(slot);
                if arena.state(tok) == Some(ReqState::Pending) {
                    arena.cancel(tok);
                }
                arena.release(tok);
            }
        });
        Ok(())
    }

    #[cfg(test)]
    fn len(&self, worker: &Worker) -> usize {
        worker.with_arena(|arena| {
            let mut n = 0;
            let mut cur = self.head;
            while let Some(slot) = cur {
                n += 1;
                cur = arena.get_by_slot(slot).next;
            }
            n
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Context, ThreadingMode, pack_rkey, register_memory};

    const BIG: usize = 64 * 1024;

    struct Rig {
        worker: Worker,
        ep: crate::fabric::Endpoint,
        src: Vec<u8>,
        dst: Vec<u8>,
    }

    fn rig() -> Rig {
        let ctx = Context::new(Vec::new(), ThreadingMode::Worker, true).unwrap();
        let worker = Worker::new(ctx).unwrap();
        let ep = worker.connect(&worker.endpoint_address()).unwrap();
        Rig { worker, ep, src: vec![0xda; BIG], dst: vec![0; BIG] }
    }

    fn post_big_write(r: &Rig) -> ReqToken {
        let ctx = Context::new(Vec::new(), ThreadingMode::Worker, true).unwrap();
        let lmem =
            register_memory(&ctx, r.src.as_ptr() as u64, r.src.len()).unwrap();
        let rmem =
            register_memory(&ctx, r.dst.as_ptr() as u64, r.dst.len()).unwrap();
        let rkey =
            r.ep.import_rkey(&pack_rkey(&ctx, &rmem).unwrap()).unwrap();
        r.worker
            .write(
                &r.ep,
                r.src.as_ptr() as u64,
                &lmem,
                r.dst.as_ptr() as u64,
                &rkey,
                BIG,
            )
            .unwrap()
            .expect("large write must go asynchronous")
    }

    #[test]
    fn empty_chain_reports_done() {
        let r = rig();
        let mut chain = RequestChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.status(&r.worker).unwrap(), XferStatus::Done);
    }

    #[test]
    fn status_retires_completed_tokens() {
        let r = rig();
        let mut chain = RequestChain::default();
        chain.append(&r.worker, post_big_write(&r));
        chain.append(&r.worker, post_big_write(&r));
        assert_eq!(chain.len(&r.worker), 2);

        // status drives the worker, so the deferred copies land here.
        while chain.status(&r.worker).unwrap() == XferStatus::InProgress {}
        assert!(chain.is_empty());
        assert_eq!(r.dst, vec![0xda; BIG]);
        assert_eq!(r.worker.with_arena(|a| a.live_count()), 0);
    }

    #[test]
    fn release_cancels_pending_tokens() {
        let r = rig();
        let mut chain = RequestChain::default();
        chain.append(&r.worker, post_big_write(&r));
        chain.release(&r.worker).unwrap();
        assert!(chain.is_empty());

        // The cancelled copy must not run once the worker progresses.
        r.worker.progress();
        assert_eq!(r.dst, vec![0; BIG]);
        assert_eq!(r.worker.with_arena(|a| a.live_count()), 0);
    }

    #[test]
    fn mixed_chain_keeps_only_pending() {
        let r = rig();
        let mut chain = RequestChain::default();
        let first = post_big_write(&r);
        chain.append(&r.worker, first);
        // Let the first copy land, then queue another behind it.
        r.worker.progress();
        let second = post_big_write(&r);
        chain.append(&r.worker, second);

        assert_eq!(chain.len(&r.worker), 2);
        while chain.status(&r.worker).unwrap() == XferStatus::InProgress {}
        assert!(chain.is_empty());
        assert_eq!(r.worker.with_arena(|a| a.live_count()), 0);
    }
}
