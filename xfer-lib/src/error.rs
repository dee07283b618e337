use syscalls::Errno;

pub type Result<T> = std::result::Result<T, XferError>;

/// Error half of the backend status contract. In-progress is not an error;
/// it is reported through [`crate::api::XferStatus`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum XferError {
    #[error("NotFound: {0}")]
    NotFound(&'static str),
    #[error("InvalidParam: {0}")]
    InvalidParam(&'static str),
    #[error("NotSupported: {0}")]
    NotSupported(&'static str),
    #[error("{0}")]
    Errno(#[from] Errno),
    #[error("BackendError: {0}")]
    Backend(&'static str),
}

impl XferError {
    /// Stable code string. Upper layers compare these verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            XferError::NotFound(_) => "NOT_FOUND",
            XferError::InvalidParam(_) => "INVALID_PARAM",
            XferError::NotSupported(_) => "NOT_SUPPORTED",
            XferError::Errno(_) => "ERRNO",
            XferError::Backend(_) => "BACKEND_ERROR",
        }
    }
}

pub(crate) fn last_errno(context: &'static str) -> XferError {
    let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    tracing::debug!(code, context, "syscall failed");
    XferError::Errno(Errno::new(code))
}
