use std::fmt;

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::IpcError;

pub type MethodId = u64;

/// Reserved ids at the top of the numeric domain; applications use the rest.
pub const RETURN_METHOD_ID: MethodId = u64::MAX;
pub const REGISTER_SIGNAL_METHOD_ID: MethodId = u64::MAX - 1;
pub const ERROR_METHOD_ID: MethodId = u64::MAX - 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Message identity: wall clock at creation plus a random uuid.
/// The clock may step backwards; ids are only ever compared for equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct UniqueId {
    pub secs: i64,
    pub nanos: i64,
    pub uuid: [u8; 16],
}

impl UniqueId {
    pub const ENCODED_LEN: usize = 32;

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let now = clock_gettime(ClockId::CLOCK_REALTIME).unwrap_or_else(|_| TimeSpec::new(0, 0));
        UniqueId {
            secs: now.tv_sec(),
            nanos: now.tv_nsec(),
            uuid: Uuid::new_v4().into_bytes(),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.secs.to_le_bytes());
        buf[8..16].copy_from_slice(&self.nanos.to_le_bytes());
        buf[16..32].copy_from_slice(&self.uuid);
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut secs = [0u8; 8];
        let mut nanos = [0u8; 8];
        let mut uuid = [0u8; 16];
        secs.copy_from_slice(&buf[0..8]);
        nanos.copy_from_slice(&buf[8..16]);
        uuid.copy_from_slice(&buf[16..32]);
        UniqueId {
            secs: i64::from_le_bytes(secs),
            nanos: i64::from_le_bytes(nanos),
            uuid,
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first uuid bytes are enough to tell messages apart in logs
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.uuid[0], self.uuid[1], self.uuid[2], self.uuid[3]
        )
    }
}

/// Fixed 40-byte frame header; the payload follows as a u32-BE length prefix
/// plus exactly that many codec bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub method_id: MethodId,
    pub message_id: UniqueId,
}

impl MessageHeader {
    pub const ENCODED_LEN: usize = 8 + UniqueId::ENCODED_LEN;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.method_id.to_le_bytes());
        self.message_id.encode(&mut buf[8..]);
        buf
    }

    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut method = [0u8; 8];
        method.copy_from_slice(&buf[0..8]);
        MessageHeader {
            method_id: u64::from_le_bytes(method),
            message_id: UniqueId::decode(&buf[8..]),
        }
    }
}

/// Payload of REGISTER_SIGNAL: the signal ids the sender handles.
#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterSignals {
    pub ids: Vec<MethodId>,
}

/// Payload of ERROR: identifies the failed call and carries the user error.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorReply {
    pub message_id: UniqueId,
    pub code: i32,
    pub message: String,
}

pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        debug!("payload encode failed: {}", e);
        IpcError::Serialization
    })
}

pub fn from_payload<T: DeserializeOwned>(buf: &[u8]) -> Result<T, IpcError> {
    bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| {
            debug!("payload decode failed: {}", e);
            IpcError::Parse
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_differ() {
        let a = UniqueId::new();
        let b = UniqueId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn header_round_trip() {
        let hdr = MessageHeader {
            method_id: 42,
            message_id: UniqueId::new(),
        };
        let bytes = hdr.encode();
        assert_eq!(MessageHeader::decode(&bytes), hdr);
    }

    #[test]
    fn reserved_ids_descend_from_max() {
        assert_eq!(RETURN_METHOD_ID, u64::MAX);
        assert_eq!(REGISTER_SIGNAL_METHOD_ID, u64::MAX - 1);
        assert_eq!(ERROR_METHOD_ID, u64::MAX - 2);
    }

    #[test]
    fn payload_round_trip() {
        let msg = RegisterSignals { ids: vec![1, 2, 3] };
        let bytes = to_payload(&msg).unwrap();
        let back: RegisterSignals = from_payload(&bytes).unwrap();
        assert_eq!(back.ids, vec![1, 2, 3]);
    }
}
