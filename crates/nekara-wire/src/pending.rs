//! Pending-request table: outstanding requests awaiting settlement.
//!
//! Each entry holds the completion sender, the caller's cancellation flag and
//! the abort handle of its timeout timer. Settling removes the entry under
//! the table lock, so whichever of reply, timeout or send failure gets there
//! first wins and every later attempt finds nothing to settle.

use crate::error::RequestError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

/// What a request's completion resolves to.
pub type Outcome = Result<Value, RequestError>;

/// Terminal state of a settled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Fulfilled,
    /// Remote error or local send failure.
    Failed,
    TimedOut,
    Cancelled,
}

impl Settlement {
    fn of(outcome: &Outcome) -> Self {
        match outcome {
            Ok(_) => Settlement::Fulfilled,
            Err(RequestError::TimedOut { .. }) => Settlement::TimedOut,
            Err(RequestError::Cancelled) => Settlement::Cancelled,
            Err(_) => Settlement::Failed,
        }
    }
}

/// Caller-side cancellation flag. One-way: once set it stays set.
///
/// Cancelling is advisory. It does not retract the request from the peer;
/// it only makes the eventual reply or timeout settle as
/// [`RequestError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

struct PendingEntry {
    func: String,
    completion: oneshot::Sender<Outcome>,
    cancel: CancelHandle,
    timer: Option<AbortHandle>,
}

/// Thread-safe table of outstanding requests, keyed by request id.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry for `id`. Returns `None` if `id` is already pending.
    pub(crate) fn register(
        &self,
        id: &str,
        func: &str,
    ) -> Option<(oneshot::Receiver<Outcome>, CancelHandle)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(id) {
            return None;
        }
        let (completion, receiver) = oneshot::channel();
        let cancel = CancelHandle::new();
        entries.insert(
            id.to_string(),
            PendingEntry {
                func: func.to_string(),
                completion,
                cancel: cancel.clone(),
                timer: None,
            },
        );
        Some((receiver, cancel))
    }

    /// Attach the timeout timer to an entry. If the entry is already gone
    /// the timer is aborted on the spot.
    pub(crate) fn arm_timer(&self, id: &str, timer: AbortHandle) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => {
                drop(entries);
                timer.abort();
            }
        }
    }

    /// Settle the request `id` and remove it from the table.
    ///
    /// A cancelled request always settles as [`RequestError::Cancelled`],
    /// whatever `outcome` says. Returns `None` if there was nothing to settle.
    pub fn settle(&self, id: &str, outcome: Outcome) -> Option<Settlement> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(id)?
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }

        let outcome = if entry.cancel.is_cancelled() {
            Err(RequestError::Cancelled)
        } else {
            outcome
        };
        let settlement = Settlement::of(&outcome);
        debug!(request_id = %id, func = %entry.func, ?settlement, "Request settled");

        if entry.completion.send(outcome).is_err() {
            debug!(request_id = %id, "Caller dropped the completion before settlement");
        }
        Some(settlement)
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    /// Ids of all outstanding requests, sorted.
    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Caller's view of an outstanding request: await it for the outcome,
/// cancel it through [`PendingCall::cancel`].
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    label: String,
    completion: oneshot::Receiver<Outcome>,
    cancel: CancelHandle,
}

impl PendingCall {
    pub(crate) fn new(
        id: String,
        label: impl Into<String>,
        completion: oneshot::Receiver<Outcome>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            completion,
            cancel,
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Label for logs; the function name unless overridden.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn cancel(&self) {
        debug!(request_id = %self.id, label = %self.label, "Cancellation requested");
        self.cancel.cancel();
    }

    /// A cloneable handle for cancelling from elsewhere.
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait(self) -> Outcome {
        self.await
    }
}

impl Future for PendingCall {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.completion)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Abandoned)))
    }
}
