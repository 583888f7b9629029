pub mod local;
pub mod node;
pub mod rpc;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::ServerId;
use crate::consensus::{Ack, Execute, Multicast};

pub use local::{LocalCluster, LocalNetwork};
pub use node::Node;
pub use tcp::{TcpDirectory, TcpPeer};

/*
    Network communication is point-to-point and request/response: a
    replica hands a message to a peer and waits for the peer's reply. The
    protocol assumes every configured replica stays reachable for the whole
    run; a failed call is surfaced, never retried at this layer beyond the
    connection attempts a transport is configured with.
*/

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("unknown peer {0}")]
    UnknownPeer(ServerId),

    #[error("peer {0} has halted")]
    PeerHalted(ServerId),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected response: expected {0}")]
    UnexpectedResponse(&'static str),
}

/// Callable handle to one peer replica.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Delivers a stamped request and returns the peer's acknowledgment.
    async fn multicast(&self, message: Multicast) -> Result<Ack, NetworkError>;

    /// Instructs the peer to execute a request once it reaches its queue head.
    async fn execute(&self, message: Execute) -> Result<(), NetworkError>;
}

/// Service discovery: resolves a server id to a callable peer handle.
pub trait Directory: Send + Sync {
    fn lookup(&self, id: ServerId) -> Result<Arc<dyn PeerClient>, NetworkError>;
}
