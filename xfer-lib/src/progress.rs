//! Background progress engine.
//!
//! One dedicated thread drives every worker: spin while any worker reports
//! progress, publish notifications after each made-progress pass, then arm
//! all workers (retrying on `Busy`) and park in `poll` on their event fds,
//! bounded by the configured delay.

use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;

use tracing::error;

use crate::engine::{EngineShared, XferEngine};
use crate::error::{Result, XferError};
use crate::fabric::ArmStatus;

impl XferEngine {
    /// Drive every worker once from the calling thread. Used directly when
    /// the background thread is disabled.
    pub fn progress(&self) -> usize {
        self.shared.workers.iter().map(|w| w.progress()).sum()
    }

    pub(crate) fn progress_thread_start(&self) -> Result<()> {
        self.shared.stop.store(false, SeqCst);
        if !self.pthr_on {
            return Ok(());
        }

        *self.shared.active.lock() = false;
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("xfer_progress".to_string())
            .spawn(move || progress_loop(shared))
            .map_err(|_| XferError::Backend("failed to spawn progress thread"))?;
        self.pthr_starts.fetch_add(1, SeqCst);

        // Hand control back only once the thread runs under the device
        // context and is inside its loop.
        let mut active = self.shared.active.lock();
        while !*active {
            self.shared.active_cv.wait(&mut active);
        }
        drop(active);

        *self.pthr.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn progress_thread_stop(&self) {
        if !self.pthr_on {
            return;
        }
        self.shared.stop.store(true, SeqCst);
        if let Some(handle) = self.pthr.lock().take()
            && handle.join().is_err()
        {
            error!("progress thread panicked");
        }
    }

    /// Stop + start. Invoked when the device helper captures its context,
    /// so the restarted thread applies it before driving workers.
    pub(crate) fn progress_thread_restart(&self) -> Result<()> {
        self.progress_thread_stop();
        self.progress_thread_start()
    }

    pub(crate) fn progress_thread_starts(&self) -> usize {
        self.pthr_starts.load(SeqCst)
    }
}

fn progress_loop(shared: Arc<EngineShared>) {
    shared.device.apply();
    shared.notifs.set_progress_thread(Some(std::thread::current().id()));

    {
        let mut active = shared.active.lock();
        *active = true;
        shared.active_cv.notify_one();
    }

    let mut fds: Vec<libc::pollfd> = shared
        .workers
        .iter()
        .map(|w| libc::pollfd { fd: w.event_fd(), events: libc::POLLIN, revents: 0 })
        .collect();

    while !shared.stop.load(SeqCst) {
        // Spin while anything moves.
        let mut made_progress = false;
        for worker in &shared.workers {
            while worker.progress() > 0 {
                made_progress = true;
            }
        }
        if made_progress {
            shared.notifs.publish();
            continue;
        }

        // Arm and park. A Busy arm means a completion raced in between;
        // go back to spinning instead of sleeping on it.
        loop {
            let mut all_armed = true;
            for worker in &shared.workers {
                match worker.arm() {
                    Ok(ArmStatus::Armed) => {}
                    Ok(ArmStatus::Busy) => {
                        all_armed = false;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to arm worker");
                        all_armed = false;
                        break;
                    }
                }
            }
            if !all_armed || shared.stop.load(SeqCst) {
                break;
            }

            let n = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    shared.delay_ms as libc::c_int,
                )
            };
            if n > 0 {
                for (i, pfd) in fds.iter_mut().enumerate() {
                    if pfd.revents & libc::POLLIN != 0 {
                        while shared.workers[i].progress() > 0 {}
                        pfd.revents = 0;
                    }
                }
                shared.notifs.publish();
            }
        }
    }

    shared.notifs.set_progress_thread(None);
}

#[cfg(test)]
mod tests {
    use crate::api::XferConfig;
    use crate::engine::XferEngine;

    fn engine(agent: &str) -> XferEngine {
        let mut cfg = XferConfig::new(agent);
        cfg.num_workers = 2;
        cfg.enable_progress_thread = true;
        cfg.progress_delay_ms = 5;
        XferEngine::new(cfg).unwrap()
    }

    #[test]
    fn constructor_waits_for_active_thread() {
        let a = engine("pthr-a");
        assert_eq!(a.progress_thread_starts(), 1);
    }

    #[test]
    fn restart_counts_two_starts() {
        let a = engine("pthr-b");
        a.progress_thread_restart().unwrap();
        assert_eq!(a.progress_thread_starts(), 2);
    }

    #[test]
    fn background_thread_delivers_notifications() {
        let a = engine("pthr-c");
        let b = engine("pthr-d");
        a.load_remote_conn_info("pthr-d", &b.get_conn_info()).unwrap();
        b.load_remote_conn_info("pthr-c", &a.get_conn_info()).unwrap();
        a.connect("pthr-d").unwrap();

        a.gen_notif("pthr-d", "ping").unwrap();

        // b's progress thread picks the message up; no caller-side progress.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let mut out = Vec::new();
            b.get_notifs(&mut out).unwrap();
            if !out.is_empty() {
                assert_eq!(out, vec![("pthr-c".to_string(), "ping".to_string())]);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "notification lost");
            std::thread::yield_now();
        }
    }
}
