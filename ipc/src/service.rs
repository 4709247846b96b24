use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::epoll::EpollFlags;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::epoll::EventPoll;
use crate::error::IpcError;
use crate::processor::{PeerCallback, Processor};
use crate::result::MethodResult;
use crate::socket::Acceptor;
use crate::types::{MethodId, PeerId};

const MAX_PEERS: usize = 500;

/// Listening RPC endpoint: an acceptor feeding peers into a processor.
/// Register methods and signal handlers before `start`.
pub struct Service {
    poll: Arc<EventPoll>,
    processor: Processor,
    acceptor: Arc<Acceptor>,
    started: bool,
}

impl Service {
    pub fn new(poll: Arc<EventPoll>, socket_path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let acceptor = Arc::new(Acceptor::listen_unix(socket_path)?);
        let processor = Processor::new(Arc::clone(&poll), "service", MAX_PEERS)?;
        Ok(Service {
            poll,
            processor,
            acceptor,
            started: false,
        })
    }

    pub fn start(&mut self) -> Result<(), IpcError> {
        if self.started {
            return Ok(());
        }
        self.processor.start()?;

        let acceptor = Arc::clone(&self.acceptor);
        let processor = self.processor.clone();
        self.poll.add_fd(
            self.acceptor.fd(),
            EpollFlags::EPOLLIN,
            Box::new(move |_, _| {
                match acceptor.accept() {
                    Ok(socket) => {
                        debug!("accepted connection on fd {}", socket.fd());
                        if let Err(e) = processor.add_peer(socket) {
                            warn!("adding accepted peer failed: {}", e);
                        }
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
                true
            }),
        )?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self, wait: bool) {
        if !self.started {
            return;
        }
        self.poll.remove_fd(self.acceptor.fd());
        self.processor.stop(wait);
        self.started = false;
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub fn peer_count(&self) -> usize {
        self.processor.peer_count()
    }

    pub fn set_new_peer_callback(&self, cb: PeerCallback) {
        self.processor.set_new_peer_callback(cb);
    }

    pub fn set_removed_peer_callback(&self, cb: PeerCallback) {
        self.processor.set_removed_peer_callback(cb);
    }

    pub fn set_method<Req, Res, F>(&self, method_id: MethodId, handler: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(PeerId, Req, MethodResult<Res>) -> Result<(), IpcError> + Send + Sync + 'static,
    {
        self.processor.set_method(method_id, handler);
    }

    pub fn remove_method(&self, method_id: MethodId) {
        self.processor.remove_method(method_id);
    }

    pub fn set_signal_handler<T, F>(&self, method_id: MethodId, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(PeerId, T) -> Result<(), IpcError> + Send + Sync + 'static,
    {
        self.processor.set_signal_handler(method_id, handler);
    }

    /// Fire-and-forget to every subscribed peer.
    pub fn signal<T: Serialize>(&self, method_id: MethodId, data: &T) -> Result<(), IpcError> {
        self.processor.broadcast_signal(method_id, data)
    }

    pub fn call_sync<Req, Res>(
        &self,
        peer_id: PeerId,
        method_id: MethodId,
        request: &Req,
        timeout: Duration,
    ) -> Result<Res, IpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        self.processor.call_sync(peer_id, method_id, request, timeout)
    }

    pub fn call_async<Req, Res, F>(
        &self,
        peer_id: PeerId,
        method_id: MethodId,
        request: &Req,
        on_reply: F,
    ) where
        Req: Serialize,
        Res: DeserializeOwned + 'static,
        F: FnOnce(Result<Res, IpcError>) + Send + 'static,
    {
        self.processor.call_async(peer_id, method_id, request, on_reply);
    }

    pub fn remove_peer(&self, peer_id: PeerId) {
        self.processor.remove_peer(peer_id);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop(true);
    }
}
