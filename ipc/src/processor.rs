use std::collections::HashMap;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use nix::sys::epoll::EpollFlags;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::epoll::EventPoll;
use crate::error::IpcError;
use crate::queue::RequestQueue;
use crate::result::MethodResult;
use crate::socket::Socket;
use crate::types::{
    from_payload, to_payload, ErrorReply, MessageHeader, MethodId, PeerId, RegisterSignals,
    UniqueId, ERROR_METHOD_ID, REGISTER_SIGNAL_METHOD_ID, RETURN_METHOD_ID,
};

/// Resolves a pending call exactly once. Returns Err(Parse) when the reply
/// payload would not decode, so the caller can apply the removal policy.
pub(crate) type ResultProcess =
    Box<dyn FnOnce(Result<&[u8], IpcError>) -> Result<(), IpcError> + Send>;

type MethodSlot =
    Arc<dyn Fn(PeerId, UniqueId, &[u8], &Arc<Shared>) -> Result<(), IpcError> + Send + Sync>;
type SignalSlot = Arc<dyn Fn(PeerId, &[u8]) -> Result<(), IpcError> + Send + Sync>;

pub type PeerCallback = Arc<dyn Fn(PeerId, RawFd) + Send + Sync>;

pub(crate) enum Request {
    Method {
        peer_id: PeerId,
        method_id: MethodId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
        process: ResultProcess,
    },
    Signal {
        peer_id: PeerId,
        method_id: MethodId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
    },
    AddPeer {
        peer_id: PeerId,
        socket: Arc<Socket>,
    },
    RemovePeer {
        peer_id: PeerId,
    },
    SendResult {
        peer_id: PeerId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
    },
    Finish,
}

struct PeerInfo {
    peer_id: PeerId,
    socket: Arc<Socket>,
}

struct PendingCall {
    peer_id: PeerId,
    process: ResultProcess,
}

/// Why a peer is being removed; decides what its pending calls resolve with.
#[derive(Clone, Copy, Debug)]
enum RemoveKind {
    Disconnected,
    Naughty,
    Parse,
    Serialization,
    Removed,
    Closing,
}

impl RemoveKind {
    fn pending_error(self) -> IpcError {
        match self {
            RemoveKind::Removed => IpcError::RemovedPeer,
            RemoveKind::Closing => IpcError::Closing,
            // transport and protocol trouble all read as a lost peer
            _ => IpcError::PeerDisconnected,
        }
    }
}

struct State {
    running: bool,
    peers: Vec<PeerInfo>,
    methods: HashMap<MethodId, MethodSlot>,
    signals: HashMap<MethodId, SignalSlot>,
    pending: HashMap<UniqueId, PendingCall>,
    signal_peers: HashMap<MethodId, Vec<PeerId>>,
    new_peer_cb: Option<PeerCallback>,
    removed_peer_cb: Option<PeerCallback>,
}

pub(crate) struct Shared {
    log_prefix: String,
    poll: Arc<EventPoll>,
    pub(crate) queue: RequestQueue<Request>,
    state: Mutex<State>,
    state_cv: Condvar,
    next_peer_id: AtomicU64,
    max_peers: usize,
}

/// Deferred user-callback invocations, run after the state lock is released.
type Deferred = Vec<Box<dyn FnOnce() + Send>>;

fn run_deferred(deferred: Deferred) {
    for f in deferred {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            warn!("ipc callback panicked");
        }
    }
}

impl Shared {
    fn peer_socket(&self, peer_id: PeerId) -> Option<Arc<Socket>> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .iter()
            .find(|p| p.peer_id == peer_id)
            .map(|p| Arc::clone(&p.socket))
    }

    /// Must be called with the state lock held; returns callbacks to run
    /// after the lock is released.
    fn remove_peer_locked(&self, state: &mut State, peer_id: PeerId, kind: RemoveKind) -> Deferred {
        let mut deferred: Deferred = Vec::new();

        let idx = match state.peers.iter().position(|p| p.peer_id == peer_id) {
            Some(idx) => idx,
            None => {
                trace!("{}: peer {} already removed", self.log_prefix, peer_id);
                return deferred;
            }
        };

        info!(
            "{}: removing {} ({:?})",
            self.log_prefix, peer_id, kind
        );

        // purge signal addressee lists
        state.signal_peers.retain(|_, peers| {
            peers.retain(|p| *p != peer_id);
            !peers.is_empty()
        });

        // fail every pending call addressed to this peer
        let stale: Vec<UniqueId> = state
            .pending
            .iter()
            .filter(|(_, call)| call.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        for message_id in stale {
            if let Some(call) = state.pending.remove(&message_id) {
                let err = kind.pending_error();
                deferred.push(Box::new(move || {
                    let _ = (call.process)(Err(err));
                }));
            }
        }

        let peer = state.peers.remove(idx);
        let fd = peer.socket.fd();
        self.poll.remove_fd(fd);

        if let Some(cb) = state.removed_peer_cb.clone() {
            deferred.push(Box::new(move || cb(peer_id, fd)));
        }

        // socket closes here, once, when the last Arc drops
        drop(peer);
        self.state_cv.notify_all();
        deferred
    }

    fn remove_peer(self: &Arc<Self>, peer_id: PeerId, kind: RemoveKind) {
        let deferred = {
            let mut state = self.state.lock().unwrap();
            self.remove_peer_locked(&mut state, peer_id, kind)
        };
        run_deferred(deferred);
    }

    fn peer_id_by_fd(&self, fd: RawFd) -> Option<PeerId> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .iter()
            .find(|p| p.socket.fd() == fd)
            .map(|p| p.peer_id)
    }

    pub(crate) fn send_error(
        self: &Arc<Self>,
        peer_id: PeerId,
        message_id: UniqueId,
        code: i32,
        message: &str,
    ) {
        let payload = to_payload(&ErrorReply {
            message_id,
            code,
            message: message.to_string(),
        });
        self.queue.push_back(Request::Signal {
            peer_id,
            method_id: ERROR_METHOD_ID,
            message_id: UniqueId::new(),
            data: payload,
        });
    }

    pub(crate) fn send_result(
        self: &Arc<Self>,
        peer_id: PeerId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
    ) {
        // FIFO keeps replies in call order even when later calls resolve
        // while earlier replies still sit in the queue
        self.queue.push_back(Request::SendResult {
            peer_id,
            message_id,
            data,
        });
    }

    fn handle_lost_connection(self: &Arc<Self>, fd: RawFd) {
        if let Some(peer_id) = self.peer_id_by_fd(fd) {
            self.remove_peer(peer_id, RemoveKind::Disconnected);
        }
    }

    /// One frame from one peer socket, dispatched per the protocol rules.
    fn handle_input(self: &Arc<Self>, fd: RawFd) {
        let (peer_id, socket) = {
            let state = self.state.lock().unwrap();
            match state.peers.iter().find(|p| p.socket.fd() == fd) {
                Some(p) => (p.peer_id, Arc::clone(&p.socket)),
                None => {
                    trace!("{}: input on unknown fd {}", self.log_prefix, fd);
                    return;
                }
            }
        };

        let header = match socket.read_header() {
            Ok(h) => h,
            Err(IpcError::PeerDisconnected) => {
                self.remove_peer(peer_id, RemoveKind::Disconnected);
                return;
            }
            Err(e) => {
                debug!("{}: header read from {} failed: {}", self.log_prefix, peer_id, e);
                self.remove_peer(peer_id, RemoveKind::Naughty);
                return;
            }
        };
        let payload = match socket.read_payload() {
            Ok(p) => p,
            Err(IpcError::PeerDisconnected) => {
                self.remove_peer(peer_id, RemoveKind::Disconnected);
                return;
            }
            Err(e) => {
                debug!("{}: payload read from {} failed: {}", self.log_prefix, peer_id, e);
                self.remove_peer(peer_id, RemoveKind::Parse);
                return;
            }
        };

        trace!(
            "{}: frame from {}: method {:#x} message {}",
            self.log_prefix,
            peer_id,
            header.method_id,
            header.message_id
        );

        match header.method_id {
            RETURN_METHOD_ID => self.on_return(peer_id, header.message_id, &payload),
            ERROR_METHOD_ID => self.on_error_frame(peer_id, &payload),
            REGISTER_SIGNAL_METHOD_ID => self.on_register_signals(peer_id, &payload),
            method_id => {
                let method = self.state.lock().unwrap().methods.get(&method_id).cloned();
                if let Some(slot) = method {
                    self.on_remote_method(peer_id, header.message_id, &payload, slot);
                    return;
                }
                let signal = self.state.lock().unwrap().signals.get(&method_id).cloned();
                if let Some(slot) = signal {
                    self.on_remote_signal(peer_id, &payload, slot);
                    return;
                }
                warn!(
                    "{}: no method or signal handler for id {:#x}",
                    self.log_prefix, method_id
                );
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
        }
    }

    fn on_return(self: &Arc<Self>, peer_id: PeerId, message_id: UniqueId, payload: &[u8]) {
        let call = self.state.lock().unwrap().pending.remove(&message_id);
        let call = match call {
            Some(call) => call,
            None => {
                warn!(
                    "{}: unexpected RETURN for message {}",
                    self.log_prefix, message_id
                );
                self.remove_peer(peer_id, RemoveKind::Naughty);
                return;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| (call.process)(Ok(payload))));
        match outcome {
            Ok(Err(IpcError::Parse)) => {
                // reply would not decode: protocol violation
                self.remove_peer(peer_id, RemoveKind::Parse);
            }
            Ok(_) => {}
            Err(_) => warn!("{}: reply callback panicked", self.log_prefix),
        }
    }

    fn on_error_frame(self: &Arc<Self>, peer_id: PeerId, payload: &[u8]) {
        let reply: ErrorReply = match from_payload(payload) {
            Ok(r) => r,
            Err(_) => {
                self.remove_peer(peer_id, RemoveKind::Parse);
                return;
            }
        };
        let call = self.state.lock().unwrap().pending.remove(&reply.message_id);
        match call {
            Some(call) => {
                let err = IpcError::user(reply.code, reply.message);
                if catch_unwind(AssertUnwindSafe(|| (call.process)(Err(err)))).is_err() {
                    warn!("{}: reply callback panicked", self.log_prefix);
                }
            }
            None => {
                warn!(
                    "{}: ERROR for unknown message {}",
                    self.log_prefix, reply.message_id
                );
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
        }
    }

    fn on_register_signals(self: &Arc<Self>, peer_id: PeerId, payload: &[u8]) {
        let announce: RegisterSignals = match from_payload(payload) {
            Ok(a) => a,
            Err(_) => {
                self.remove_peer(peer_id, RemoveKind::Parse);
                return;
            }
        };
        let mut state = self.state.lock().unwrap();
        for id in announce.ids {
            let peers = state.signal_peers.entry(id).or_default();
            if !peers.contains(&peer_id) {
                peers.push(peer_id);
            }
        }
    }

    fn on_remote_method(
        self: &Arc<Self>,
        peer_id: PeerId,
        message_id: UniqueId,
        payload: &[u8],
        slot: MethodSlot,
    ) {
        let outcome = catch_unwind(AssertUnwindSafe(|| slot(peer_id, message_id, payload, self)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(IpcError::User { code, message })) => {
                debug!("{}: method handler returned user error {}", self.log_prefix, code);
                self.send_error(peer_id, message_id, code, &message);
            }
            Ok(Err(IpcError::Parse)) => {
                self.remove_peer(peer_id, RemoveKind::Parse);
            }
            Ok(Err(e)) => {
                error!("{}: method handler failed: {}", self.log_prefix, e);
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
            Err(_) => {
                error!("{}: method handler panicked", self.log_prefix);
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
        }
    }

    fn on_remote_signal(self: &Arc<Self>, peer_id: PeerId, payload: &[u8], slot: SignalSlot) {
        let outcome = catch_unwind(AssertUnwindSafe(|| slot(peer_id, payload)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(IpcError::User { .. })) => {
                // user errors from signal handlers have nowhere to go
                debug!("{}: discarding user error from signal handler", self.log_prefix);
            }
            Ok(Err(IpcError::Parse)) => {
                self.remove_peer(peer_id, RemoveKind::Parse);
            }
            Ok(Err(e)) => {
                error!("{}: signal handler failed: {}", self.log_prefix, e);
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
            Err(_) => {
                error!("{}: signal handler panicked", self.log_prefix);
                self.remove_peer(peer_id, RemoveKind::Naughty);
            }
        }
    }

    /// One request per dispatch tick; the eventfd keeps the poll hot while
    /// items remain.
    fn handle_event(self: &Arc<Self>) -> bool {
        let request = match self.queue.pop() {
            Some(r) => r,
            None => return false,
        };
        match request {
            Request::Method {
                peer_id,
                method_id,
                message_id,
                data,
                process,
            } => self.on_method_request(peer_id, method_id, message_id, data, process),
            Request::Signal {
                peer_id,
                method_id,
                message_id,
                data,
            } => self.on_signal_request(peer_id, method_id, message_id, data),
            Request::AddPeer { peer_id, socket } => self.on_add_peer(peer_id, socket),
            Request::RemovePeer { peer_id } => {
                self.remove_peer(peer_id, RemoveKind::Removed);
            }
            Request::SendResult {
                peer_id,
                message_id,
                data,
            } => self.on_send_result(peer_id, message_id, data),
            Request::Finish => self.on_finish(),
        }
        true
    }

    fn on_method_request(
        self: &Arc<Self>,
        peer_id: PeerId,
        method_id: MethodId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
        process: ResultProcess,
    ) {
        let socket = match self.peer_socket(peer_id) {
            Some(s) => s,
            None => {
                debug!("{}: call to missing {}", self.log_prefix, peer_id);
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    let _ = process(Err(IpcError::PeerDisconnected));
                }));
                return;
            }
        };
        let payload = match data {
            Ok(p) => p,
            Err(_) => {
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    let _ = process(Err(IpcError::Serialization));
                }));
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.pending.contains_key(&message_id) {
                error!(
                    "{}: duplicate pending message {}",
                    self.log_prefix, message_id
                );
            }
            state
                .pending
                .insert(message_id, PendingCall { peer_id, process });
        }

        let header = MessageHeader {
            method_id,
            message_id,
        };
        if let Err(e) = socket.write_frame(&header, &payload) {
            warn!("{}: sending call failed: {}", self.log_prefix, e);
            // resolve the fresh pending with a send error, then drop the peer
            let call = self.state.lock().unwrap().pending.remove(&message_id);
            if let Some(call) = call {
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    let _ = (call.process)(Err(IpcError::Serialization));
                }));
            }
            self.remove_peer(peer_id, RemoveKind::Serialization);
        }
    }

    fn on_signal_request(
        self: &Arc<Self>,
        peer_id: PeerId,
        method_id: MethodId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
    ) {
        let socket = match self.peer_socket(peer_id) {
            Some(s) => s,
            None => {
                debug!("{}: signal to missing {}", self.log_prefix, peer_id);
                return;
            }
        };
        let payload = match data {
            Ok(p) => p,
            Err(_) => {
                self.remove_peer(peer_id, RemoveKind::Serialization);
                return;
            }
        };
        let header = MessageHeader {
            method_id,
            message_id,
        };
        if let Err(e) = socket.write_frame(&header, &payload) {
            warn!("{}: sending signal failed: {}", self.log_prefix, e);
            self.remove_peer(peer_id, RemoveKind::Serialization);
        }
    }

    fn on_add_peer(self: &Arc<Self>, peer_id: PeerId, socket: Arc<Socket>) {
        let fd = socket.fd();
        let (ids, new_cb) = {
            let mut state = self.state.lock().unwrap();
            if state.peers.len() >= self.max_peers {
                error!(
                    "{}: too many peers, refusing {}",
                    self.log_prefix, peer_id
                );
                return;
            }
            state.peers.push(PeerInfo {
                peer_id,
                socket: Arc::clone(&socket),
            });
            let ids: Vec<MethodId> = state.signals.keys().copied().collect();
            (ids, state.new_peer_cb.clone())
        };

        // announce locally handled signals before anything else reaches the peer
        let announce = to_payload(&RegisterSignals { ids });
        let header = MessageHeader {
            method_id: REGISTER_SIGNAL_METHOD_ID,
            message_id: UniqueId::new(),
        };
        let sent = match announce {
            Ok(payload) => socket.write_frame(&header, &payload),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("{}: signal announce to {} failed: {}", self.log_prefix, peer_id, e);
            self.remove_peer(peer_id, RemoveKind::Serialization);
            return;
        }

        let handler_shared = Arc::clone(self);
        let registered = self.poll.add_fd(
            fd,
            EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP,
            Box::new(move |fd, events| {
                if events.intersects(
                    EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR,
                ) {
                    handler_shared.handle_lost_connection(fd);
                    return false;
                }
                if events.contains(EpollFlags::EPOLLIN) {
                    handler_shared.handle_input(fd);
                }
                true
            }),
        );
        if let Err(e) = registered {
            error!("{}: registering peer fd failed: {}", self.log_prefix, e);
            self.remove_peer(peer_id, RemoveKind::Disconnected);
            return;
        }

        info!("{}: new {} on fd {}", self.log_prefix, peer_id, fd);
        if let Some(cb) = new_cb {
            if catch_unwind(AssertUnwindSafe(|| cb(peer_id, fd))).is_err() {
                warn!("{}: new-peer callback panicked", self.log_prefix);
            }
        }
    }

    fn on_send_result(
        self: &Arc<Self>,
        peer_id: PeerId,
        message_id: UniqueId,
        data: Result<Vec<u8>, IpcError>,
    ) {
        let socket = match self.peer_socket(peer_id) {
            Some(s) => s,
            None => {
                debug!("{}: result for missing {}", self.log_prefix, peer_id);
                return;
            }
        };
        let payload = match data {
            Ok(p) => p,
            Err(_) => {
                error!("{}: reply payload would not encode", self.log_prefix);
                self.remove_peer(peer_id, RemoveKind::Serialization);
                return;
            }
        };
        let header = MessageHeader {
            method_id: RETURN_METHOD_ID,
            message_id,
        };
        if let Err(e) = socket.write_frame(&header, &payload) {
            warn!("{}: sending result failed: {}", self.log_prefix, e);
            self.remove_peer(peer_id, RemoveKind::Serialization);
        }
    }

    fn on_finish(self: &Arc<Self>) {
        debug!("{}: finishing", self.log_prefix);

        // drain whatever queued up behind the finish request
        while let Some(request) = self.queue.pop() {
            match request {
                Request::Method { process, .. } => {
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        let _ = process(Err(IpcError::Closing));
                    }));
                }
                Request::RemovePeer { peer_id } => {
                    self.remove_peer(peer_id, RemoveKind::Removed)
                }
                Request::SendResult {
                    peer_id,
                    message_id,
                    data,
                } => self.on_send_result(peer_id, message_id, data),
                // queued connections and signals are dropped on the floor
                Request::Signal { .. } | Request::AddPeer { .. } | Request::Finish => {}
            }
        }

        loop {
            let peer_id = {
                let state = self.state.lock().unwrap();
                state.peers.last().map(|p| p.peer_id)
            };
            match peer_id {
                Some(peer_id) => self.remove_peer(peer_id, RemoveKind::Closing),
                None => break,
            }
        }

        self.poll.remove_fd(self.queue.fd());
        self.state.lock().unwrap().running = false;
        self.state_cv.notify_all();
    }
}

/// Single-threaded message router. All handler and callback invocations run
/// on the thread dispatching the event poll; every other thread talks to the
/// processor exclusively through its request queue. Clones are handles onto
/// the same processor.
pub struct Processor {
    shared: Arc<Shared>,
}

impl Clone for Processor {
    fn clone(&self) -> Self {
        Processor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Processor {
    pub fn new(
        poll: Arc<EventPoll>,
        log_prefix: impl Into<String>,
        max_peers: usize,
    ) -> Result<Self, IpcError> {
        Ok(Processor {
            shared: Arc::new(Shared {
                log_prefix: log_prefix.into(),
                poll,
                queue: RequestQueue::new()?,
                state: Mutex::new(State {
                    running: false,
                    peers: Vec::new(),
                    methods: HashMap::new(),
                    signals: HashMap::new(),
                    pending: HashMap::new(),
                    signal_peers: HashMap::new(),
                    new_peer_cb: None,
                    removed_peer_cb: None,
                }),
                state_cv: Condvar::new(),
                next_peer_id: AtomicU64::new(0),
                max_peers,
            }),
        })
    }

    pub fn start(&self) -> Result<(), IpcError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.poll.add_fd(
            self.shared.queue.fd(),
            EpollFlags::EPOLLIN,
            Box::new(move |_, _| {
                shared.handle_event();
                true
            }),
        )
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    /// With `wait`, blocks until the drain completed: no handler will run
    /// again and every pending call has been resolved. Must not be awaited
    /// from the processor thread itself.
    pub fn stop(&self, wait: bool) {
        if !self.is_running() {
            return;
        }
        self.shared.queue.push_back(Request::Finish);
        if wait {
            let mut state = self.shared.state.lock().unwrap();
            while state.running {
                state = self.shared.state_cv.wait(state).unwrap();
            }
        }
    }

    pub fn set_new_peer_callback(&self, cb: PeerCallback) {
        self.shared.state.lock().unwrap().new_peer_cb = Some(cb);
    }

    pub fn set_removed_peer_callback(&self, cb: PeerCallback) {
        self.shared.state.lock().unwrap().removed_peer_cb = Some(cb);
    }

    pub fn peer_count(&self) -> usize {
        self.shared.state.lock().unwrap().peers.len()
    }

    pub fn set_method<Req, Res, F>(&self, method_id: MethodId, handler: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(PeerId, Req, MethodResult<Res>) -> Result<(), IpcError> + Send + Sync + 'static,
    {
        debug_assert!(method_id < ERROR_METHOD_ID, "reserved method id");
        let slot: MethodSlot = Arc::new(
            move |peer_id, message_id, payload, shared: &Arc<Shared>| {
                let request: Req = from_payload(payload)?;
                let result = MethodResult::new(Arc::clone(shared), peer_id, message_id);
                handler(peer_id, request, result)
            },
        );
        self.shared.state.lock().unwrap().methods.insert(method_id, slot);
    }

    pub fn remove_method(&self, method_id: MethodId) {
        self.shared.state.lock().unwrap().methods.remove(&method_id);
    }

    /// Handlers registered before the first peer is added are announced via
    /// REGISTER_SIGNAL on every peer add.
    pub fn set_signal_handler<T, F>(&self, method_id: MethodId, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(PeerId, T) -> Result<(), IpcError> + Send + Sync + 'static,
    {
        debug_assert!(method_id < ERROR_METHOD_ID, "reserved method id");
        let slot: SignalSlot = Arc::new(move |peer_id, payload| {
            let data: T = from_payload(payload)?;
            handler(peer_id, data)
        });
        self.shared.state.lock().unwrap().signals.insert(method_id, slot);
    }

    pub fn add_peer(&self, socket: Socket) -> Result<PeerId, IpcError> {
        if !self.is_running() {
            return Err(IpcError::Closing);
        }
        let peer_id = PeerId(self.shared.next_peer_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.shared.queue.push_back(Request::AddPeer {
            peer_id,
            socket: Arc::new(socket),
        });
        Ok(peer_id)
    }

    /// Synchronous removal: returns after the peer is gone and its pending
    /// calls resolved with RemovedPeer. Must not be called from the
    /// processor thread.
    pub fn remove_peer(&self, peer_id: PeerId) {
        self.shared
            .queue
            .remove_if(|r| matches!(r, Request::AddPeer { peer_id: p, .. } if *p == peer_id));
        self.shared.queue.push_back(Request::RemovePeer { peer_id });

        let mut state = self.shared.state.lock().unwrap();
        while state.running && state.peers.iter().any(|p| p.peer_id == peer_id) {
            state = self.shared.state_cv.wait(state).unwrap();
        }
    }

    pub fn call_async<Req, Res, F>(
        &self,
        peer_id: PeerId,
        method_id: MethodId,
        request: &Req,
        on_reply: F,
    ) -> UniqueId
    where
        Req: Serialize,
        Res: DeserializeOwned + 'static,
        F: FnOnce(Result<Res, IpcError>) + Send + 'static,
    {
        let message_id = UniqueId::new();
        let process: ResultProcess = Box::new(move |outcome| match outcome {
            Ok(payload) => match from_payload::<Res>(payload) {
                Ok(value) => {
                    on_reply(Ok(value));
                    Ok(())
                }
                Err(_) => {
                    on_reply(Err(IpcError::Parse));
                    Err(IpcError::Parse)
                }
            },
            Err(e) => {
                on_reply(Err(e));
                Ok(())
            }
        });

        if !self.is_running() {
            let _ = process(Err(IpcError::Closing));
            return message_id;
        }

        self.shared.queue.push_back(Request::Method {
            peer_id,
            method_id,
            message_id,
            data: to_payload(request),
            process,
        });
        message_id
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
        let (tx, rx) = mpsc::sync_channel(1);
        self.call_async::<Req, Res, _>(peer_id, method_id, request, move |outcome| {
            let _ = tx.send(outcome);
        });
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            // a late RETURN lands in a closed channel and is discarded
            Err(_) => Err(IpcError::Timeout),
        }
    }

    pub fn signal<T: Serialize>(
        &self,
        peer_id: PeerId,
        method_id: MethodId,
        data: &T,
    ) -> Result<(), IpcError> {
        if !self.is_running() {
            return Err(IpcError::Closing);
        }
        self.shared.queue.push_back(Request::Signal {
            peer_id,
            method_id,
            message_id: UniqueId::new(),
            data: to_payload(data),
        });
        Ok(())
    }

    /// Sends to every peer that announced handling `method_id`.
    pub fn broadcast_signal<T: Serialize>(
        &self,
        method_id: MethodId,
        data: &T,
    ) -> Result<(), IpcError> {
        if !self.is_running() {
            return Err(IpcError::Closing);
        }
        let payload = to_payload(data)?;
        let peers: Vec<PeerId> = self
            .shared
            .state
            .lock()
            .unwrap()
            .signal_peers
            .get(&method_id)
            .cloned()
            .unwrap_or_default();
        trace!("broadcasting {:#x} to {} peers", method_id, peers.len());
        for peer_id in peers {
            self.shared.queue.push_back(Request::Signal {
                peer_id,
                method_id,
                message_id: UniqueId::new(),
                data: Ok(payload.clone()),
            });
        }
        Ok(())
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop(false);
        }
    }
}
