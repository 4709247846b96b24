//! Socket-based RPC between the zone daemon, its clients and in-zone helpers.
//!
//! A single-threaded [`processor::Processor`] routes method calls, one-way
//! signals and peer lifecycle over framed stream sockets, driven by an
//! [`epoll::EventPoll`]. [`service::Service`] and [`client::Client`] are the
//! two ends most code uses.

pub mod client;
pub mod epoll;
pub mod error;
pub mod processor;
pub(crate) mod queue;
pub mod result;
pub mod service;
pub mod socket;
pub mod types;

pub use client::Client;
pub use epoll::{EventPoll, ThreadDispatcher};
pub use error::IpcError;
pub use processor::Processor;
pub use result::MethodResult;
pub use service::Service;
pub use socket::{Acceptor, Socket};
pub use types::{MethodId, PeerId, UniqueId};
