//! Registries of exposed remote methods and known peers.
//!
//! Both are thread-safe and cheap to clone; clones share the same table.

use crate::error::{WireError, WireResult};
use crate::handler::RemoteMethod;
use crate::peer::PeerHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Name → handler table for functions this node exposes.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, RemoteMethod>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handler under `name`, replacing any earlier one.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn register(&self, name: impl Into<String>, handler: RemoteMethod) -> bool {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        methods.insert(name.into(), handler).is_some()
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        methods.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<RemoteMethod> {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

/// Thread-safe registry of peers known to this node.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. An id that is already present is rejected rather than
    /// overwritten, so a topology mistake surfaces at the call site.
    pub fn add_peer(&self, peer_id: impl Into<String>, handle: PeerHandle) -> WireResult<()> {
        let peer_id = peer_id.into();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&peer_id) {
            return Err(WireError::DuplicatePeer(peer_id));
        }
        peers.insert(peer_id, handle);
        Ok(())
    }

    pub fn get_peer(&self, peer_id: &str) -> WireResult<PeerHandle> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| WireError::PeerNotFound(peer_id.to_string()))
    }

    /// Remove a peer. Absent ids are ignored.
    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerHandle> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer_id)
    }

    /// Ids of all known peers, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}
