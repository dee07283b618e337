//! Types used in the public API.

use bytes::Bytes;

use crate::utils::hex::fmt_hex;

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Memory kinds this backend can register and move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    Host,
    Device,
}

/// One-sided transfer direction, from the local engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XferOp {
    Read,
    Write,
}

/// Aggregate state of a posted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    Done,
    InProgress,
}

impl XferStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, XferStatus::Done)
    }
}

/// Opaque connect-address blob advertised by an engine.
///
/// Size and content are fabric-defined; peers pass it back verbatim to
/// [`crate::XferEngine::load_remote_conn_info`].
#[derive(Clone, PartialEq, Eq)]
pub struct ConnInfo(pub Bytes);

impl std::fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

/// Optional per-post arguments.
#[derive(Debug, Clone, Default)]
pub struct XferOptArgs {
    /// When set, the peer observes `(local_agent, msg)` through its
    /// `get_notifs` after every preceding descriptor has reached remote
    /// visibility.
    pub notif_msg: Option<String>,
}

/// Drained notifications: `(sender agent, payload)` pairs.
pub type NotifList = Vec<(String, String)>;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct XferConfig {
    /// Number of fabric workers. Fixed after construction; must be >= 1.
    pub num_workers: usize,
    /// Spawn the background progress thread.
    pub enable_progress_thread: bool,
    /// Poll timeout of the progress thread, in milliseconds.
    pub progress_delay_ms: u64,
    /// Name this engine advertises to peers.
    pub local_agent: String,
    /// Fabric device names, comma- or space-separated. Empty means "any".
    pub device_list: String,
}

impl XferConfig {
    pub fn new(local_agent: impl Into<String>) -> Self {
        XferConfig {
            num_workers: 1,
            enable_progress_thread: false,
            progress_delay_ms: 100,
            local_agent: local_agent.into(),
            device_list: String::new(),
        }
    }

    pub(crate) fn parse_device_list(&self) -> Vec<String> {
        self.device_list
            .split([',', ' '])
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_splits_on_comma_and_space() {
        let mut cfg = XferConfig::new("a");
        cfg.device_list = "mlx5_0, mlx5_1 eth0".to_string();
        assert_eq!(cfg.parse_device_list(), vec!["mlx5_0", "mlx5_1", "eth0"]);

        cfg.device_list = String::new();
        assert!(cfg.parse_device_list().is_empty());
    }

    #[test]
    fn conn_info_formats_as_hex() {
        let info = ConnInfo(Bytes::from_static(&[0xde, 0xad, 0x01]));
        assert_eq!(format!("{info}"), "dead01");
    }
}
