use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::epoll::EventPoll;
use crate::error::IpcError;
use crate::processor::Processor;
use crate::socket::Socket;
use crate::types::{MethodId, PeerId};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Connecting RPC endpoint: one socket, one peer (the server). Signal
/// handlers must be registered before `connect_unix`/`connect_inet`, so the
/// REGISTER_SIGNAL announcement on peer add covers them.
pub struct Client {
    processor: Processor,
    peer_id: Option<PeerId>,
}

impl Client {
    pub fn new(poll: Arc<EventPoll>) -> Result<Self, IpcError> {
        let processor = Processor::new(poll, "client", 1)?;
        Ok(Client {
            processor,
            peer_id: None,
        })
    }

    pub fn connect_unix(&mut self, socket_path: impl AsRef<Path>) -> Result<(), IpcError> {
        let socket = Socket::connect_unix(socket_path)?;
        self.attach(socket)
    }

    pub fn connect_inet(&mut self, addr: impl ToSocketAddrs) -> Result<(), IpcError> {
        let socket = Socket::connect_inet(addr)?;
        self.attach(socket)
    }

    fn attach(&mut self, socket: Socket) -> Result<(), IpcError> {
        self.processor.start()?;
        self.peer_id = Some(self.processor.add_peer(socket)?);
        Ok(())
    }

    fn server(&self) -> Result<PeerId, IpcError> {
        self.peer_id.ok_or(IpcError::PeerDisconnected)
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub fn stop(&mut self, wait: bool) {
        self.processor.stop(wait);
        self.peer_id = None;
    }

    pub fn set_signal_handler<T, F>(&self, method_id: MethodId, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(PeerId, T) -> Result<(), IpcError> + Send + Sync + 'static,
    {
        self.processor.set_signal_handler(method_id, handler);
    }

    pub fn call_sync<Req, Res>(
        &self,
        method_id: MethodId,
        request: &Req,
        timeout: Duration,
    ) -> Result<Res, IpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        self.processor
            .call_sync(self.server()?, method_id, request, timeout)
    }

    pub fn call_async<Req, Res, F>(
        &self,
        method_id: MethodId,
        request: &Req,
        on_reply: F,
    ) -> Result<(), IpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned + 'static,
        F: FnOnce(Result<Res, IpcError>) + Send + 'static,
    {
        self.processor
            .call_async(self.server()?, method_id, request, on_reply);
        Ok(())
    }

    pub fn signal<T: Serialize>(&self, method_id: MethodId, data: &T) -> Result<(), IpcError> {
        self.processor.signal(self.server()?, method_id, data)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.processor.is_running() {
            self.stop(true);
        }
    }
}
