//! The backend engine: construction, connection catalog, memory and rkey
//! directory. Transfer posting lives in `xfer`, the notification pipeline
//! in `notif`, the background thread in `progress`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::api::{ConnInfo, MemKind, SmallVec, XferConfig};
use crate::device::DeviceCtx;
use crate::error::{Result, XferError};
use crate::fabric::{
    self, Context, Endpoint, MemHandle, Rkey, ThreadingMode, Worker,
};
use crate::notif::{self, NotifQueues};

/// Active-message opcodes. Carried in a fixed 8-byte little-endian header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AmOp {
    ConnCheck = 1,
    Disconnect = 2,
    Notif = 3,
}

impl AmOp {
    pub(crate) fn id(self) -> u8 {
        self as u8
    }

    pub(crate) fn header(self) -> [u8; 8] {
        (self as u64).to_le_bytes()
    }

    pub(crate) fn matches(self, hdr: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 8]>::try_from(hdr) else { return false };
        u64::from_le_bytes(bytes) == self as u64
    }
}

/// Catalog entry for one peer: one endpoint per local worker.
pub(crate) struct Connection {
    pub remote_agent: String,
    pub eps: SmallVec<Endpoint>,
    pub connected: AtomicBool,
}

/// Local registration record. The packed rkey is the public metadata blob
/// advertised for this registration.
pub struct LocalMd {
    pub(crate) mem: MemHandle,
    pub(crate) rkey_blob: Bytes,
}

/// Imported remote registration: the peer connection plus one imported rkey
/// per local worker.
pub struct RemoteMd {
    pub(crate) conn: Arc<Connection>,
    pub(crate) rkeys: SmallVec<Rkey>,
}

impl std::fmt::Debug for RemoteMd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMd").finish_non_exhaustive()
    }
}

/// State the background progress thread shares with the engine.
pub(crate) struct EngineShared {
    pub workers: Vec<Worker>,
    pub notifs: Arc<NotifQueues>,
    pub device: Arc<DeviceCtx>,
    pub stop: AtomicBool,
    pub delay_ms: u64,
    pub active: Mutex<bool>,
    pub active_cv: Condvar,
}

pub struct XferEngine {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) ctx: Arc<Context>,
    pub(crate) conns: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    pub(crate) notifs: Arc<NotifQueues>,
    pub(crate) device: Arc<DeviceCtx>,
    pub(crate) local_agent: String,
    conn_info: Bytes,
    pub(crate) pthr_on: bool,
    pub(crate) pthr: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub(crate) pthr_starts: AtomicUsize,
}

impl std::fmt::Debug for XferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XferEngine")
            .field("local_agent", &self.local_agent)
            .finish_non_exhaustive()
    }
}

impl XferEngine {
    pub fn new(config: XferConfig) -> Result<XferEngine> {
        if config.num_workers == 0 {
            return Err(XferError::InvalidParam("num_workers must be >= 1"));
        }
        if config.enable_progress_thread
            && !Context::supports(ThreadingMode::Worker)
        {
            return Err(XferError::NotSupported("worker threading unavailable"));
        }

        let ctx = Context::new(
            config.parse_device_list(),
            ThreadingMode::Worker,
            config.enable_progress_thread,
        )?;

        let conns: Arc<RwLock<HashMap<String, Arc<Connection>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let notifs = Arc::new(NotifQueues::new());
        let device = Arc::new(DeviceCtx::from_env());

        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            let worker = Worker::new(ctx.clone())?;
            register_am_handlers(&worker, &conns, &notifs);
            workers.push(worker);
        }
        // The engine advertises a single worker address; every peer worker
        // connects to it. The remaining workers act as transfer origins.
        let conn_info = workers
            .last()
            .expect("num_workers checked above")
            .endpoint_address();

        let engine = XferEngine {
            shared: Arc::new(EngineShared {
                workers,
                notifs: notifs.clone(),
                device: device.clone(),
                stop: AtomicBool::new(false),
                delay_ms: config.progress_delay_ms,
                active: Mutex::new(false),
                active_cv: Condvar::new(),
            }),
            ctx,
            conns,
            notifs,
            device,
            local_agent: config.local_agent,
            conn_info,
            pthr_on: config.enable_progress_thread,
            pthr: Mutex::new(None),
            pthr_starts: AtomicUsize::new(0),
        };
        engine.progress_thread_start()?;
        debug!(
            agent = %engine.local_agent,
            workers = engine.shared.workers.len(),
            progress_thread = engine.pthr_on,
            "engine up"
        );
        Ok(engine)
    }

    pub fn local_agent(&self) -> &str {
        &self.local_agent
    }

    pub fn supported_mem_kinds(&self) -> Vec<MemKind> {
        vec![MemKind::Host, MemKind::Device]
    }

    pub(crate) fn worker(&self, worker_id: usize) -> &Worker {
        &self.shared.workers[worker_id]
    }

    /* Connection management */

    /// Connect-address blob peers feed to `load_remote_conn_info`.
    pub fn get_conn_info(&self) -> ConnInfo {
        ConnInfo(self.conn_info.clone())
    }

    pub fn check_conn(&self, remote_agent: &str) -> Result<()> {
        if self.conns.read().contains_key(remote_agent) {
            Ok(())
        } else {
            Err(XferError::NotFound("unknown peer"))
        }
    }

    pub(crate) fn lookup_conn(&self, remote_agent: &str) -> Result<Arc<Connection>> {
        self.conns
            .read()
            .get(remote_agent)
            .cloned()
            .ok_or(XferError::NotFound("unknown peer"))
    }

    /// Create one endpoint per worker towards the advertised address. On any
    /// endpoint failure the ones already created are torn down and the peer
    /// is not inserted.
    pub fn load_remote_conn_info(
        &self,
        remote_agent: &str,
        info: &ConnInfo,
    ) -> Result<()> {
        let mut map = self.conns.write();
        if map.contains_key(remote_agent) {
            return Err(XferError::InvalidParam("peer already loaded"));
        }

        let mut eps: SmallVec<Endpoint> = SmallVec::new();
        for worker in &self.shared.workers {
            match worker.connect(&info.0) {
                Ok(ep) => eps.push(ep),
                Err(e) => {
                    for (i, ep) in eps.iter().enumerate() {
                        let _ = self.shared.workers[i].disconnect_nb(ep);
                    }
                    return Err(e);
                }
            }
        }

        map.insert(
            remote_agent.to_string(),
            Arc::new(Connection {
                remote_agent: remote_agent.to_string(),
                eps,
                connected: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Handshake with a loaded peer: every worker sends a `CONN_CHECK`
    /// carrying the local agent name, eager-forced. Connecting to oneself
    /// loads the loopback connection instead.
    pub fn connect(&self, remote_agent: &str) -> Result<()> {
        if remote_agent == self.local_agent {
            let info = self.get_conn_info();
            return self.load_remote_conn_info(remote_agent, &info);
        }
        let conn = self.lookup_conn(remote_agent)?;

        let hdr = AmOp::ConnCheck.header();
        let mut pending = Vec::new();
        let mut failure = None;
        for (i, worker) in self.shared.workers.iter().enumerate() {
            match worker.send_am(
                &conn.eps[i],
                AmOp::ConnCheck.id(),
                &hdr,
                self.local_agent.as_bytes(),
                true,
            ) {
                Ok(Some(tok)) => pending.push((i, tok)),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Wait the in-flight sends out even on failure; their tokens go
        // back to the worker either way.
        for (i, tok) in pending {
            let worker = self.worker(i);
            while !worker.test(tok)?.is_done() {}
            worker.release(tok);
        }

        match failure {
            Some(e) => Err(e),
            None => {
                conn.connected.store(true, SeqCst);
                Ok(())
            }
        }
    }

    /// Remove the peer from the catalog, tearing its endpoints down
    /// non-blocking. The entry is removed even when a teardown fails.
    pub(crate) fn end_conn(&self, remote_agent: &str) -> Result<()> {
        let conn = self
            .conns
            .write()
            .remove(remote_agent)
            .ok_or(XferError::NotFound("unknown peer"))?;

        let mut failed = false;
        for (i, ep) in conn.eps.iter().enumerate() {
            if self.shared.workers[i].disconnect_nb(ep).is_err() {
                failed = true;
            }
        }
        if failed {
            return Err(XferError::Backend("endpoint teardown failed"));
        }
        Ok(())
    }

    /// Notify the peer with a fire-and-forget `DISCONNECT`, then drop the
    /// connection locally. The receiver only validates the message;
    /// teardown stays with this side.
    pub fn disconnect(&self, remote_agent: &str) -> Result<()> {
        if remote_agent != self.local_agent {
            let conn = self.lookup_conn(remote_agent)?;
            debug!(
                agent = %conn.remote_agent,
                connected = conn.connected.load(SeqCst),
                "tearing down peer"
            );
            let hdr = AmOp::Disconnect.header();
            for (i, worker) in self.shared.workers.iter().enumerate() {
                match worker.send_am(
                    &conn.eps[i],
                    AmOp::Disconnect.id(),
                    &hdr,
                    self.local_agent.as_bytes(),
                    true,
                ) {
                    Ok(Some(tok)) => worker.release(tok),
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "disconnect notice not sent"),
                }
            }
        }
        self.end_conn(remote_agent)
    }

    /* Memory and rkey directory */

    /// Register `[addr, addr+len)` with the fabric. Device registrations
    /// run through the device-context helper first and may restart the
    /// progress thread.
    pub fn register_mem(
        &self,
        addr: u64,
        len: usize,
        kind: MemKind,
        dev_id: u64,
    ) -> Result<LocalMd> {
        if kind == MemKind::Device && self.device.update(addr, dev_id)? {
            self.progress_thread_restart()?;
        }
        let mem = fabric::register_memory(&self.ctx, addr, len)?;
        let rkey_blob = fabric::pack_rkey(&self.ctx, &mem)?;
        Ok(LocalMd { mem, rkey_blob })
    }

    pub fn deregister_mem(&self, md: LocalMd) {
        drop(md);
    }

    /// Public metadata blob for a registration: its packed rkey.
    pub fn get_public_data(&self, md: &LocalMd) -> Bytes {
        md.rkey_blob.clone()
    }

    fn md_helper(&self, blob: &[u8], agent: &str) -> Result<RemoteMd> {
        let conn = self.lookup_conn(agent)?;
        let mut rkeys: SmallVec<Rkey> = SmallVec::new();
        for ep in &conn.eps {
            match ep.import_rkey(blob) {
                Ok(rkey) => rkeys.push(rkey),
                Err(e) => {
                    // Unwind the imports made so far.
                    rkeys.clear();
                    return Err(e);
                }
            }
        }
        Ok(RemoteMd { conn, rkeys })
    }

    /// Import one's own registration for loopback transfers.
    pub fn load_local_md(&self, md: &LocalMd) -> Result<RemoteMd> {
        self.md_helper(&md.rkey_blob, &self.local_agent)
    }

    /// Import a peer's advertised registration blob against every worker's
    /// endpoint to that peer.
    pub fn load_remote_md(
        &self,
        blob: &[u8],
        _kind: MemKind,
        remote_agent: &str,
    ) -> Result<RemoteMd> {
        self.md_helper(blob, remote_agent)
    }

    pub fn unload_md(&self, md: RemoteMd) {
        drop(md);
    }
}

impl Drop for XferEngine {
    fn drop(&mut self) {
        self.progress_thread_stop();
    }
}

fn register_am_handlers(
    worker: &Worker,
    conns: &Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    notifs: &Arc<NotifQueues>,
) {
    let catalog = conns.clone();
    worker.register_am_handler(
        AmOp::ConnCheck.id(),
        Arc::new(move |hdr, payload, attrs| {
            if !AmOp::ConnCheck.matches(hdr) {
                return Err(XferError::InvalidParam("unexpected opcode"));
            }
            if attrs.rendezvous {
                return Err(XferError::InvalidParam("control message must be eager"));
            }
            let peer = std::str::from_utf8(payload)
                .map_err(|_| XferError::InvalidParam("malformed agent name"))?;
            if !catalog.read().contains_key(peer) {
                warn!(peer, "connection check from unknown agent");
                return Err(XferError::InvalidParam("unknown peer"));
            }
            Ok(())
        }),
    );

    worker.register_am_handler(
        AmOp::Disconnect.id(),
        Arc::new(move |hdr, _payload, attrs| {
            if !AmOp::Disconnect.matches(hdr) {
                return Err(XferError::InvalidParam("unexpected opcode"));
            }
            if attrs.rendezvous {
                return Err(XferError::InvalidParam("control message must be eager"));
            }
            // Teardown happens on the originator; the notice is only
            // validated here.
            Ok(())
        }),
    );

    let queues = notifs.clone();
    worker.register_am_handler(
        AmOp::Notif.id(),
        Arc::new(move |hdr, payload, attrs| {
            if !AmOp::Notif.matches(hdr) {
                return Err(XferError::InvalidParam("unexpected opcode"));
            }
            if attrs.rendezvous {
                return Err(XferError::InvalidParam("control message must be eager"));
            }
            let record = notif::decode_notif(payload)?;
            queues.push(record.name, record.msg);
            Ok(())
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::XferConfig;
    use crate::device::{DeviceCtxHandle, DevicePtr};

    fn engine(agent: &str) -> XferEngine {
        XferEngine::new(XferConfig::new(agent)).unwrap()
    }

    #[test]
    fn duplicate_conn_info_load_is_invalid_param() {
        let a = engine("dup-a");
        let b = engine("dup-b");
        a.load_remote_conn_info("dup-b", &b.get_conn_info()).unwrap();
        let err =
            a.load_remote_conn_info("dup-b", &b.get_conn_info()).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAM");
    }

    #[test]
    fn connect_requires_loaded_peer() {
        let a = engine("lone-a");
        assert_eq!(a.connect("stranger").unwrap_err().code(), "NOT_FOUND");
        assert_eq!(a.check_conn("stranger").unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn self_connect_populates_catalog() {
        let a = engine("self-a");
        a.connect("self-a").unwrap();
        a.check_conn("self-a").unwrap();
    }

    #[test]
    fn zero_workers_refused() {
        let mut cfg = XferConfig::new("none");
        cfg.num_workers = 0;
        assert_eq!(XferEngine::new(cfg).unwrap_err().code(), "INVALID_PARAM");
    }

    #[test]
    fn remote_md_unwinds_on_bad_blob() {
        let a = engine("md-a");
        a.connect("md-a").unwrap();
        let err = a
            .load_remote_md(b"garbage blob", MemKind::Host, "md-a")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAM");
    }

    #[test]
    fn one_endpoint_and_rkey_per_worker() {
        let mut cfg = XferConfig::new("inv-a");
        cfg.num_workers = 3;
        let a = XferEngine::new(cfg).unwrap();
        a.connect("inv-a").unwrap();
        assert_eq!(a.lookup_conn("inv-a").unwrap().eps.len(), 3);

        let buf = vec![0_u8; 1024];
        let md = a
            .register_mem(buf.as_ptr() as u64, buf.len(), MemKind::Host, 0)
            .unwrap();
        let rmd = a.load_local_md(&md).unwrap();
        assert_eq!(rmd.rkeys.len(), 3);
        a.unload_md(rmd);
        a.deregister_mem(md);
    }

    fn fake_device_query(_addr: u64) -> crate::error::Result<Option<DevicePtr>> {
        Ok(Some(DevicePtr { device: 0, ctx: DeviceCtxHandle(0xd0) }))
    }

    #[test]
    fn first_device_registration_restarts_progress_thread() {
        let mut cfg = XferConfig::new("dev-a");
        cfg.num_workers = 2;
        cfg.enable_progress_thread = true;
        cfg.progress_delay_ms = 5;
        let a = XferEngine::new(cfg).unwrap();
        a.device.set_query(fake_device_query);
        assert_eq!(a.progress_thread_starts(), 1);

        let buf = vec![0u8; 4096];
        let md = a
            .register_mem(buf.as_ptr() as u64, buf.len(), MemKind::Device, 0)
            .unwrap();
        assert_eq!(a.progress_thread_starts(), 2);

        // Second device registration binds nothing new.
        let md2 = a
            .register_mem(buf.as_ptr() as u64, buf.len(), MemKind::Device, 0)
            .unwrap();
        assert_eq!(a.progress_thread_starts(), 2);
        a.deregister_mem(md);
        a.deregister_mem(md2);
    }
}
