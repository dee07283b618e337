use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, XferError};

/// Fabric threading levels, from least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// One thread drives everything.
    Single,
    /// Distinct threads may touch the context, one at a time.
    Context,
    /// Distinct threads may touch distinct workers concurrently; a single
    /// worker serializes internally.
    Worker,
}

/// Process-local fabric state shared by all workers of one engine.
pub struct Context {
    devices: Vec<String>,
    mode: ThreadingMode,
    eventing: bool,
}

impl Context {
    pub fn new(
        devices: Vec<String>,
        mode: ThreadingMode,
        eventing: bool,
    ) -> Result<Arc<Context>> {
        if !Self::supports(mode) {
            return Err(XferError::NotSupported("threading mode"));
        }
        if eventing && mode == ThreadingMode::Single {
            // Arming from a progress thread needs at least worker-level
            // serialization.
            return Err(XferError::NotSupported("eventing needs worker threading"));
        }
        debug!(?devices, ?mode, eventing, "fabric context up");
        Ok(Arc::new(Context { devices, mode, eventing }))
    }

    /// The shared-memory provider honours every level.
    pub fn supports(_mode: ThreadingMode) -> bool {
        true
    }

    pub fn eventing(&self) -> bool {
        self.eventing
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn mode(&self) -> ThreadingMode {
        self.mode
    }
}
