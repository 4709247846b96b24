use thiserror::Error;
use zone_ipc::IpcError;
use zone_runtime::{NetError, RuntimeError};

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("bad configuration: {0}")]
    Config(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("zone operation failed: {0}")]
    Operation(String),

    #[error("timed out")]
    Timeout,

    #[error("state store: {0}")]
    Store(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
