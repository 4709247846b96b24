use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("syscall failed: {0}")]
    Os(#[from] Errno),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process setup failed: {0}")]
    ProcessSetup(String),

    #[error("capability setup failed: {0}")]
    Capability(String),

    #[error("bad rlimit: {0}")]
    Rlimit(String),

    #[error("sysctl: {0}")]
    Sysctl(String),

    #[error("hostname: {0}")]
    Hostname(String),

    #[error("cgroup: {0}")]
    Cgroup(String),

    #[error("attach failed: {0}")]
    Attach(String),

    #[error("could not encode control message")]
    Encode,

    #[error("could not decode control message")]
    Decode,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("syscall failed: {0}")]
    Os(#[from] Errno),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink request rejected: {0}")]
    Netlink(Errno),

    #[error("netlink response lost data")]
    DataLost,

    #[error("malformed netlink data: {0}")]
    Parse(String),

    #[error("bad network configuration: {0}")]
    Config(String),

    #[error("no such network device: {0}")]
    NotFound(String),
}
