//! Transport boundary and the in-process transport.
//!
//! The engine only ever calls [`Transport::send`]; a transport calls
//! [`Node::handle_message`] for every payload addressed to its node. Routing
//! and delivery belong to the transport, correlation to the engine.

use crate::error::{WireError, WireResult};
use crate::node::Node;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The send capability a node is built on.
///
/// Implementations must accept concurrent calls and need not preserve order
/// across recipients. Returning `Ok` means the payload was handed off, not
/// that it was delivered.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, recipient: &str, payload: String) -> WireResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    drop_all: AtomicBool,
    delivered: AtomicU64,
}

/// In-process queue transport: one unbounded inbox per attached node.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<MemoryInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A send capability routed through this network.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Route payloads addressed to `node` into its `handle_message`.
    ///
    /// The pump holds only a weak reference and stops once the node is
    /// dropped or detached. Re-attaching replaces the previous inbox.
    pub fn attach(&self, node: &Arc<Node>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let node_id = node.id().to_string();
        {
            let mut inboxes = self.inner.inboxes.write().unwrap_or_else(|e| e.into_inner());
            inboxes.insert(node_id.clone(), tx);
        }

        let weak = Arc::downgrade(node);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(node) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = node.handle_message(&payload) {
                    debug!(node = %node_id, error = %e, "Inbound payload rejected");
                }
            }
            debug!(node = %node_id, "Memory inbox closed");
        })
    }

    /// Stop routing to `node_id`. Returns `false` if it was not attached.
    pub fn detach(&self, node_id: &str) -> bool {
        let mut inboxes = self.inner.inboxes.write().unwrap_or_else(|e| e.into_inner());
        inboxes.remove(node_id).is_some()
    }

    /// Accept and silently discard every payload while set.
    pub fn set_drop_all(&self, drop_all: bool) {
        self.inner.drop_all.store(drop_all, Ordering::SeqCst);
    }

    /// Number of payloads queued for delivery so far.
    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send(&self, recipient: &str, payload: String) -> WireResult<()> {
        if self.inner.drop_all.load(Ordering::SeqCst) {
            debug!(recipient = %recipient, "Dropping payload");
            return Ok(());
        }

        let inbox = {
            let inboxes = self.inner.inboxes.read().unwrap_or_else(|e| e.into_inner());
            inboxes.get(recipient).cloned()
        };
        let inbox = inbox.ok_or_else(|| WireError::UnknownRecipient(recipient.to_string()))?;
        inbox.send(payload).map_err(|_| WireError::ConnectionClosed)?;
        self.inner.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
