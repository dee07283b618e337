//! Device-memory context workaround.
//!
//! Fabric workers must run under the device context that owns the memory
//! they move. The engine captures that context from the first device
//! registration and restarts the progress thread so the background worker
//! picks it up.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, XferError};

/// Any non-empty value disables device-pointer detection entirely.
pub(crate) const DEVICE_WA_ENV: &str = "XFER_DISABLE_DEVICE_ADDR_WA";

/// Opaque driver context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceCtxHandle(pub u64);

#[derive(Debug, Clone, Copy)]
pub(crate) struct DevicePtr {
    pub device: u64,
    pub ctx: DeviceCtxHandle,
}

/// Classifies an address; `Ok(None)` means host memory. With no device
/// driver linked in, everything is host memory.
pub(crate) type DeviceQuery = fn(u64) -> Result<Option<DevicePtr>>;

fn host_only_query(_addr: u64) -> Result<Option<DevicePtr>> {
    Ok(None)
}

#[derive(Default)]
struct Captured {
    device: Option<u64>,
    ctx: Option<DeviceCtxHandle>,
}

pub(crate) struct DeviceCtx {
    enabled: bool,
    query: Mutex<DeviceQuery>,
    captured: Mutex<Captured>,
}

impl DeviceCtx {
    pub(crate) fn new(enabled: bool) -> Self {
        DeviceCtx {
            enabled,
            query: Mutex::new(host_only_query),
            captured: Mutex::new(Captured::default()),
        }
    }

    pub(crate) fn from_env() -> Self {
        let disabled = std::env::var_os(DEVICE_WA_ENV)
            .is_some_and(|v| !v.is_empty());
        if disabled {
            debug!("device address workaround disabled by {DEVICE_WA_ENV}");
        }
        Self::new(!disabled)
    }

    /// Inspect a device registration. Returns `Ok(true)` when this was the
    /// first binding and the progress thread must be restarted to apply the
    /// captured context.
    ///
    /// The helper captures at most one `(device, context)` pair for the
    /// lifetime of the engine; later registrations must match both.
    pub(crate) fn update(&self, addr: u64, claimed_dev: u64) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let mut cap = self.captured.lock();
        if let Some(dev) = cap.device
            && dev != claimed_dev
        {
            return Err(XferError::NotSupported(
                "device id differs from first registration",
            ));
        }
        let query = *self.query.lock();
        let Some(info) = query(addr)? else {
            // Host-resident after all; nothing to bind.
            return Ok(false);
        };
        if info.device != claimed_dev {
            return Err(XferError::NotSupported(
                "address does not belong to the claimed device",
            ));
        }
        if let Some(ctx) = cap.ctx {
            if ctx != info.ctx {
                return Err(XferError::NotSupported("conflicting device context"));
            }
            return Ok(false);
        }
        cap.device = Some(claimed_dev);
        cap.ctx = Some(info.ctx);
        Ok(true)
    }

    /// Bind the captured context on the calling thread; no-op when nothing
    /// was captured yet.
    pub(crate) fn apply(&self) {
        if let Some(ctx) = self.captured.lock().ctx {
            debug!(ctx = ctx.0, "applying device context");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_query(&self, query: DeviceQuery) {
        *self.query.lock() = query;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev0_query(_addr: u64) -> Result<Option<DevicePtr>> {
        Ok(Some(DevicePtr { device: 0, ctx: DeviceCtxHandle(0xc0) }))
    }

    fn dev1_other_ctx(_addr: u64) -> Result<Option<DevicePtr>> {
        Ok(Some(DevicePtr { device: 1, ctx: DeviceCtxHandle(0xc1) }))
    }

    #[test]
    fn first_binding_requests_restart_once() {
        let d = DeviceCtx::new(true);
        d.set_query(dev0_query);
        assert!(d.update(0x1000, 0).unwrap());
        assert!(!d.update(0x2000, 0).unwrap());
    }

    #[test]
    fn host_pointer_is_ignored() {
        let d = DeviceCtx::new(true);
        assert!(!d.update(0x1000, 0).unwrap());
    }

    #[test]
    fn mismatched_device_id_is_not_supported() {
        let d = DeviceCtx::new(true);
        d.set_query(dev0_query);
        let err = d.update(0x1000, 3).unwrap_err();
        assert_eq!(err.code(), "NOT_SUPPORTED");
    }

    #[test]
    fn second_device_is_refused() {
        let d = DeviceCtx::new(true);
        d.set_query(dev0_query);
        assert!(d.update(0x1000, 0).unwrap());
        d.set_query(dev1_other_ctx);
        let err = d.update(0x2000, 1).unwrap_err();
        assert_eq!(err.code(), "NOT_SUPPORTED");
    }

    #[test]
    fn disabled_helper_does_nothing() {
        let d = DeviceCtx::new(false);
        d.set_query(dev0_query);
        assert!(!d.update(0x1000, 0).unwrap());
    }
}
