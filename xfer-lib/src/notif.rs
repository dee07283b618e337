//! Notification pipeline.
//!
//! Notifications ride the `NOTIF` active message. The receive handler runs
//! on whichever thread drives `progress()`: the progress thread appends to
//! its private list (and publishes it under the notif mutex after each
//! made-progress pass), caller threads append to the main list. A drain
//! splices the main list first, then the published list.

use std::thread::ThreadId;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::api::NotifList;
use crate::engine::{AmOp, XferEngine};
use crate::error::{Result, XferError};
use crate::fabric::ReqToken;

/// Payload record of a `NOTIF` message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct NotifPayload {
    pub name: String,
    pub msg: String,
}

pub(crate) fn encode_notif(name: &str, msg: &str) -> Vec<u8> {
    let record = NotifPayload { name: name.to_string(), msg: msg.to_string() };
    bincode::serialize(&record).expect("notif payload")
}

pub(crate) fn decode_notif(bytes: &[u8]) -> Result<NotifPayload> {
    bincode::deserialize(bytes)
        .map_err(|_| XferError::InvalidParam("malformed notification payload"))
}

pub(crate) struct NotifQueues {
    pthr_id: Mutex<Option<ThreadId>>,
    /// Appended only by the progress thread.
    pthr_priv: Mutex<NotifList>,
    /// Fed from `pthr_priv` under this mutex; drained by callers.
    published: Mutex<NotifList>,
    /// Appended by caller threads that drive progress themselves.
    main: Mutex<NotifList>,
}

impl NotifQueues {
    pub(crate) fn new() -> Self {
        NotifQueues {
            pthr_id: Mutex::new(None),
            pthr_priv: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            main: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_progress_thread(&self, id: Option<ThreadId>) {
        *self.pthr_id.lock() = id;
    }

    pub(crate) fn is_progress_thread(&self) -> bool {
        *self.pthr_id.lock() == Some(std::thread::current().id())
    }

    pub(crate) fn push(&self, name: String, msg: String) {
        if self.is_progress_thread() {
            self.pthr_priv.lock().push((name, msg));
        } else {
            self.main.lock().push((name, msg));
        }
    }

    /// Progress-thread side: move the private batch into the published
    /// list.
    pub(crate) fn publish(&self) {
        let mut batch = self.pthr_priv.lock();
        if batch.is_empty() {
            return;
        }
        self.published.lock().append(&mut batch);
    }

    /// Caller side: splice the main list, then the published list.
    pub(crate) fn drain_into(&self, out: &mut NotifList) {
        out.append(&mut self.main.lock());
        out.append(&mut self.published.lock());
    }
}

impl XferEngine {
    /// Ship `(local_agent, msg)` to `remote_agent` over the given worker.
    /// The serialized buffer is parked in the request tail until the send
    /// lands; an inline send frees it on return.
    pub(crate) fn notif_send_priv(
        &self,
        remote_agent: &str,
        msg: &str,
        worker_id: usize,
    ) -> Result<Option<ReqToken>> {
        let conn = self.lookup_conn(remote_agent)?;
        let payload = encode_notif(&self.local_agent, msg);
        let worker = self.worker(worker_id);
        let tok = worker.send_am(
            &conn.eps[worker_id],
            AmOp::Notif.id(),
            &AmOp::Notif.header(),
            &payload,
            true,
        )?;
        if let Some(tok) = tok {
            worker.set_am_buffer(tok, payload);
        }
        Ok(tok)
    }

    /// Standalone notification outside any transfer. The token is not
    /// tracked; the fabric finishes the send on a later progress pass.
    pub fn gen_notif(&self, remote_agent: &str, msg: &str) -> Result<()> {
        let worker_id = self.worker_id_for_current_thread();
        if let Some(tok) = self.notif_send_priv(remote_agent, msg, worker_id)? {
            self.worker(worker_id).release(tok);
        }
        Ok(())
    }

    /// Drain pending notifications into `notifs`, which must be empty.
    pub fn get_notifs(&self, notifs: &mut NotifList) -> Result<()> {
        if !notifs.is_empty() {
            return Err(XferError::InvalidParam("output list must be empty"));
        }
        if !self.pthr_on {
            while self.progress() > 0 {}
        }
        self.notifs.drain_into(notifs);
        Ok(())
    }
}
