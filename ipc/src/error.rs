use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("syscall failed: {0}")]
    Os(#[from] Errno),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame or payload")]
    Parse,

    #[error("could not encode payload")]
    Serialization,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("peer violated the protocol")]
    NaughtyPeer,

    #[error("peer removed")]
    RemovedPeer,

    #[error("processor is closing")]
    Closing,

    #[error("timed out")]
    Timeout,

    #[error("remote error {code}: {message}")]
    User { code: i32, message: String },

    #[error("fd already registered")]
    FdAlreadyRegistered,

    #[error("fd not registered")]
    FdNotFound,
}

impl IpcError {
    pub fn user(code: i32, message: impl Into<String>) -> Self {
        IpcError::User {
            code,
            message: message.into(),
        }
    }
}
