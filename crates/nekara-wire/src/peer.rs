//! PeerHandle: an addressable reference to a remote node.
//!
//! A handle is bound to the host node's transport and forwards payloads to
//! the peer it names. It does no buffering and no retries.

use crate::error::WireResult;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;

/// Stateless proxy for sending to one remote node.
#[derive(Clone)]
pub struct PeerHandle {
    peer_id: String,
    transport: Arc<dyn Transport>,
}

impl PeerHandle {
    pub fn new(peer_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport,
        }
    }

    /// Id of the remote node this handle addresses.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Forward a raw payload to the peer through the host's transport.
    pub async fn send(&self, payload: impl Into<String>) -> WireResult<()> {
        self.transport.send(&self.peer_id, payload.into()).await
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
