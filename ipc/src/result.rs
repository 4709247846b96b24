use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::processor::Shared;
use crate::types::{to_payload, PeerId, UniqueId};

/// Handed to a method handler to resolve the call, immediately or later.
/// The facade is Send, so a handler may stash it and reply from an
/// application thread once the real work finished.
pub struct MethodResult<Res: Serialize + Send + 'static> {
    shared: Arc<Shared>,
    peer_id: PeerId,
    message_id: UniqueId,
    _response: PhantomData<fn(Res)>,
}

impl<Res: Serialize + Send + 'static> MethodResult<Res> {
    pub(crate) fn new(shared: Arc<Shared>, peer_id: PeerId, message_id: UniqueId) -> Self {
        MethodResult {
            shared,
            peer_id,
            message_id,
            _response: PhantomData,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sends the RETURN frame for this call.
    pub fn set(self, value: &Res) {
        let payload = to_payload(value);
        self.shared.send_result(self.peer_id, self.message_id, payload);
    }

    /// Sends an ERROR frame; the caller sees `IpcError::User`.
    pub fn set_error(self, code: i32, message: &str) {
        self.shared
            .send_error(self.peer_id, self.message_id, code, message);
    }
}

impl MethodResult<()> {
    pub fn set_void(self) {
        self.set(&());
    }
}
