use thiserror::Error;

/// Errors surfaced by the cellular subsystem to its callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellularError {
    #[error("operation {0} is not supported by this modem technology")]
    UnsupportedOperation(&'static str),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid apn: {0}")]
    InvalidApn(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("modem is not registered on a network")]
    NotRegistered,

    #[error("a data session is already established")]
    AlreadyConnected,

    #[error("another request is already in flight")]
    DeviceBusy,

    #[error("operation timed out")]
    Timeout,

    /// The request was cancelled before it could complete, e.g. a pending
    /// start that got superseded by a stop.
    #[error("operation aborted")]
    Aborted,

    /// The modem refused the request because it is not ready for it yet.
    #[error("modem is in the wrong state for this operation")]
    WrongState,
}

/// Failures reported by a [`crate::modem::ModemTransport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("wrong state")]
    WrongState,

    #[error("missing or unknown apn: {0}")]
    InvalidApn(String),

    #[error("no network")]
    NoNetwork,

    #[error("rpc timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

impl From<RpcError> for CellularError {
    fn from(value: RpcError) -> Self {
        match value {
            RpcError::WrongState => CellularError::WrongState,
            RpcError::InvalidApn(msg) => CellularError::InvalidApn(msg),
            RpcError::NoNetwork => {
                CellularError::OperationFailed("no network".to_string())
            }
            RpcError::Timeout => CellularError::Timeout,
            RpcError::Failed(msg) => CellularError::OperationFailed(msg),
        }
    }
}

pub type Result<T, E = CellularError> = std::result::Result<T, E>;
