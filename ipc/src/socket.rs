use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::stat::{umask, Mode};
use tracing::{debug, trace};

use crate::error::IpcError;
use crate::types::MessageHeader;

// big enough for any sane payload, small enough to catch garbage lengths
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// A connected stream socket carrying framed messages. Reads are expected to
/// be driven by the processor loop only; writes from any thread serialize on
/// the internal lock. Closed exactly once, on drop.
pub struct Socket {
    stream: Stream,
    write_lock: Mutex<()>,
}

impl Socket {
    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path.as_ref())?;
        trace!("connected to {}", path.as_ref().display());
        Ok(Socket {
            stream: Stream::Unix(stream),
            write_lock: Mutex::new(()),
        })
    }

    pub fn connect_inet(addr: impl ToSocketAddrs) -> Result<Self, IpcError> {
        let stream = TcpStream::connect(addr)?;
        Ok(Socket {
            stream: Stream::Tcp(stream),
            write_lock: Mutex::new(()),
        })
    }

    fn from_unix(stream: UnixStream) -> Self {
        Socket {
            stream: Stream::Unix(stream),
            write_lock: Mutex::new(()),
        }
    }

    fn from_tcp(stream: TcpStream) -> Self {
        Socket {
            stream: Stream::Tcp(stream),
            write_lock: Mutex::new(()),
        }
    }

    pub fn fd(&self) -> RawFd {
        match &self.stream {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }

    fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        // std retries EINTR inside write_all
        match &self.stream {
            Stream::Unix(s) => (&*s).write_all(buf),
            Stream::Tcp(s) => (&*s).write_all(buf),
        }
    }

    fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        match &self.stream {
            Stream::Unix(s) => (&*s).read_exact(buf),
            Stream::Tcp(s) => (&*s).read_exact(buf),
        }
    }

    /// Header, then u32-BE payload length, then the payload bytes, written
    /// under the socket's write lock so concurrent senders interleave whole
    /// frames only.
    pub fn write_frame(&self, header: &MessageHeader, payload: &[u8]) -> Result<(), IpcError> {
        let _guard = self.write_lock.lock().unwrap();
        self.write_all(&header.encode())?;
        self.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.write_all(payload)?;
        Ok(())
    }

    pub fn read_header(&self) -> Result<MessageHeader, IpcError> {
        let mut buf = [0u8; MessageHeader::ENCODED_LEN];
        self.read_exact(&mut buf).map_err(map_read_err)?;
        Ok(MessageHeader::decode(&buf))
    }

    pub fn read_payload(&self) -> Result<Vec<u8>, IpcError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).map_err(map_read_err)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_PAYLOAD {
            debug!("refusing frame with payload length {}", len);
            return Err(IpcError::Parse);
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).map_err(map_read_err)?;
        Ok(payload)
    }
}

fn map_read_err(e: std::io::Error) -> IpcError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
            IpcError::PeerDisconnected
        }
        _ => IpcError::Io(e),
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Listening endpoint handing out connected [`Socket`]s.
pub struct Acceptor {
    listener: Listener,
    unix_path: Option<PathBuf>,
}

impl Acceptor {
    /// Binds a unix socket node with mode 0666, replacing a stale node and
    /// creating the parent directory when missing.
    pub fn listen_unix(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match std::fs::remove_file(path) {
            Ok(_) => debug!("removed stale socket node {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let old_mask = umask(Mode::from_bits_truncate(0o111));
        let bound = UnixListener::bind(path);
        umask(old_mask);

        Ok(Acceptor {
            listener: Listener::Unix(bound?),
            unix_path: Some(path.to_path_buf()),
        })
    }

    /// Port 0 binds an ephemeral port; see [`Acceptor::local_port`].
    pub fn listen_inet(host: &str, port: u16) -> Result<Self, IpcError> {
        let listener = TcpListener::bind((host, port))?;
        Ok(Acceptor {
            listener: Listener::Tcp(listener),
            unix_path: None,
        })
    }

    pub fn fd(&self) -> RawFd {
        match &self.listener {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            Listener::Unix(_) => None,
        }
    }

    pub fn accept(&self) -> Result<Socket, IpcError> {
        match &self.listener {
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                Ok(Socket::from_unix(stream))
            }
            Listener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                Ok(Socket::from_tcp(stream))
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UniqueId;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn frame_round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.socket");
        let acceptor = Acceptor::listen_unix(&path).unwrap();

        let client = Socket::connect_unix(&path).unwrap();
        let server = acceptor.accept().unwrap();

        let header = MessageHeader {
            method_id: 7,
            message_id: UniqueId::new(),
        };
        client.write_frame(&header, b"hello").unwrap();

        let got = server.read_header().unwrap();
        assert_eq!(got, header);
        assert_eq!(server.read_payload().unwrap(), b"hello");
    }

    #[test]
    fn socket_node_mode_is_0666() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.socket");
        let _acceptor = Acceptor::listen_unix(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn stale_node_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.socket");
        {
            let _first = Acceptor::listen_unix(&path).unwrap();
        }
        // first acceptor dropped; binding again must succeed even if the
        // node were left behind
        std::fs::write(&path, b"").ok();
        let _second = Acceptor::listen_unix(&path).unwrap();
    }

    #[test]
    fn closed_peer_reads_as_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eof.socket");
        let acceptor = Acceptor::listen_unix(&path).unwrap();
        let client = Socket::connect_unix(&path).unwrap();
        let server = acceptor.accept().unwrap();
        drop(client);
        assert!(matches!(
            server.read_header(),
            Err(IpcError::PeerDisconnected)
        ));
    }
}
