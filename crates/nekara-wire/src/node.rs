//! Node: the request/response correlation engine.
//!
//! A [`Node`] owns its id, the methods it exposes, the peers it knows and
//! the table of requests it is waiting on. It sends through an
//! `Arc<dyn Transport>` and is fed inbound payloads through
//! [`Node::handle_message`].
//!
//! Every request ends in exactly one of four states: fulfilled, failed,
//! timed out or cancelled. Reply, timer and send failure all race through
//! [`PendingTable::settle`]; the first one removes the entry and the rest
//! find nothing.
//!
//! `request` and `handle_message` spawn tasks and must be called from within
//! a Tokio runtime.

use crate::error::{RemoteError, RequestError, WireError, WireResult};
use crate::handler::{method, reply_method, IncomingCall, RemoteMethod, Responder};
use crate::message::{classify, encode, request_id, Inbound, RequestMessage, ResponseMessage};
use crate::peer::PeerHandle;
use crate::pending::{PendingCall, PendingTable};
use crate::registry::{MethodRegistry, PeerRegistry};
use crate::transport::Transport;
use nekara_types::config::WireConfig;
use nekara_types::ids::{IdGenerator, RandomIds};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One protocol participant.
pub struct Node {
    id: String,
    config: WireConfig,
    methods: MethodRegistry,
    pending: PendingTable,
    peers: PeerRegistry,
    transport: Arc<dyn Transport>,
    ids: Arc<dyn IdGenerator>,
    responder: Responder,
}

impl Node {
    /// Create a node with a random id.
    pub fn new(config: WireConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_ids(config, transport, Arc::new(RandomIds))
    }

    /// Create a node drawing its own id and every message id from `ids`.
    pub fn with_ids(
        config: WireConfig,
        transport: Arc<dyn Transport>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let id = ids.token(config.id_token_len);
        let responder = Responder::new(
            id.clone(),
            Arc::clone(&transport),
            Arc::clone(&ids),
            config.id_token_len,
        );
        info!(node_id = %id, node_name = %config.node_name, "Node created");
        Self {
            id,
            config,
            methods: MethodRegistry::new(),
            pending: PendingTable::new(),
            peers: PeerRegistry::new(),
            transport,
            ids,
            responder,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WireConfig {
        &self.config
    }

    /// Outstanding requests of this node.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    // -- remote methods -----------------------------------------------------

    /// Expose `handler` under `name`, replacing any earlier handler.
    ///
    /// The handler is responsible for answering through
    /// [`IncomingCall::reply`]; the engine never replies for it.
    pub fn register_remote_method<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.register_method(name, method(handler));
    }

    /// Expose a function whose result is sent back as the reply.
    pub fn register_reply_method<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        self.register_method(name, reply_method(handler));
    }

    /// Expose an already boxed handler.
    pub fn register_method(&self, name: impl Into<String>, handler: RemoteMethod) {
        let name = name.into();
        if self.methods.register(name.clone(), handler) {
            debug!(node_id = %self.id, func = %name, "Replaced remote method");
        } else {
            debug!(node_id = %self.id, func = %name, "Registered remote method");
        }
    }

    // -- peers --------------------------------------------------------------

    /// A handle addressing `peer_id` through this node's transport.
    pub fn peer_handle(&self, peer_id: impl Into<String>) -> PeerHandle {
        PeerHandle::new(peer_id, Arc::clone(&self.transport))
    }

    pub fn add_peer(&self, peer_id: impl Into<String>, handle: PeerHandle) -> WireResult<()> {
        self.peers.add_peer(peer_id, handle)
    }

    pub fn get_peer(&self, peer_id: &str) -> WireResult<PeerHandle> {
        self.peers.get_peer(peer_id)
    }

    pub fn remove_peer(&self, peer_id: &str) {
        if self.peers.remove_peer(peer_id).is_some() {
            debug!(node_id = %self.id, peer = %peer_id, "Removed peer");
        }
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    // -- outgoing -----------------------------------------------------------

    /// Call `func` on `recipient` with the configured default timeout.
    pub fn request(&self, recipient: &str, func: &str, args: Vec<Value>) -> PendingCall {
        self.request_with_timeout(recipient, func, args, self.config.request_timeout())
    }

    /// Call `func` on `recipient`, settling as timed out after `timeout`.
    ///
    /// Returns as soon as the send has been started. Pass `Duration::MAX` to
    /// wait indefinitely.
    pub fn request_with_timeout(
        &self,
        recipient: &str,
        func: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> PendingCall {
        let (id, completion, cancel) = loop {
            let id = request_id(&*self.ids, self.config.id_token_len);
            if let Some((completion, cancel)) = self.pending.register(&id, func) {
                break (id, completion, cancel);
            }
            debug!(request_id = %id, "Request id already pending, drawing another");
        };
        debug!(
            request_id = %id,
            recipient = %recipient,
            func = %func,
            args = args.len(),
            "Requesting"
        );

        let message = RequestMessage::new(id.clone(), &self.id, recipient, func, args);
        match encode(&message.into()) {
            Ok(payload) => {
                let transport = Arc::clone(&self.transport);
                let pending = self.pending.clone();
                let recipient = recipient.to_string();
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&recipient, payload).await {
                        warn!(
                            request_id = %id,
                            recipient = %recipient,
                            error = %e,
                            "Failed to send request"
                        );
                        pending.settle(&id, Err(RequestError::SendFailure(e.to_string())));
                    }
                });
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to encode request");
                self.pending
                    .settle(&id, Err(RequestError::SendFailure(e.to_string())));
            }
        }

        let pending = self.pending.clone();
        let timer_id = id.clone();
        let timer_func = func.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(request_id = %timer_id, func = %timer_func, ?timeout, "Request timed out");
            pending.settle(
                &timer_id,
                Err(RequestError::TimedOut {
                    func: timer_func,
                    after: timeout,
                }),
            );
        });
        self.pending.arm_timer(&id, timer.abort_handle());

        PendingCall::new(id, func, completion, cancel)
    }

    /// Like [`Node::request`], taking any serializable argument list.
    ///
    /// A JSON array becomes the argument list, `null` means no arguments, and
    /// any other value is passed as the single argument.
    pub fn request_args<A: Serialize>(
        &self,
        recipient: &str,
        func: &str,
        args: A,
    ) -> WireResult<PendingCall> {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        Ok(self.request(recipient, func, args))
    }

    /// Request and wait for the outcome.
    pub async fn call(
        &self,
        recipient: &str,
        func: &str,
        args: Vec<Value>,
    ) -> Result<Value, RequestError> {
        self.request(recipient, func, args).await
    }

    /// Answer request `request_id` on `recipient`. Touches no local state.
    pub async fn respond(
        &self,
        recipient: &str,
        request_id: &str,
        data: Value,
        is_error: bool,
    ) -> WireResult<()> {
        self.responder
            .respond(recipient, request_id, data, is_error)
            .await
    }

    // -- incoming -----------------------------------------------------------

    /// Handle one inbound payload.
    ///
    /// Errors describe the payload itself (unknown function, unmatched
    /// response, malformed input). Outcomes of individual requests are
    /// delivered through their [`PendingCall`], never here.
    pub fn handle_message(&self, payload: &str) -> WireResult<()> {
        match classify(payload) {
            Inbound::Request(request) => self.handle_request(request),
            Inbound::Response(response) => self.handle_response(response),
            Inbound::Malformed { reason, payload } => {
                warn!(node_id = %self.id, reason = %reason, "Unexpected message");
                Err(WireError::UnexpectedMessage { reason, payload })
            }
        }
    }

    fn handle_request(&self, request: RequestMessage) -> WireResult<()> {
        let Some(handler) = self.methods.get(&request.func) else {
            warn!(
                node_id = %self.id,
                request_id = %request.id,
                sender = %request.sender,
                func = %request.func,
                "Unexpected request for unregistered method"
            );
            if self.config.reply_on_unknown_method {
                self.reject_unknown(&request);
            }
            return Err(WireError::UnexpectedRequest {
                request_id: request.id,
                sender: request.sender,
                func: request.func,
            });
        };

        debug!(
            node_id = %self.id,
            request_id = %request.id,
            sender = %request.sender,
            func = %request.func,
            "Dispatching request"
        );
        let call = IncomingCall::new(request, self.responder.clone());
        tokio::spawn(async move {
            let request_id = call.id().to_string();
            let result = handler(call).await;
            debug!(request_id = %request_id, %result, "Remote method finished");
        });
        Ok(())
    }

    fn reject_unknown(&self, request: &RequestMessage) {
        let response = request.create_error_response(
            self.responder.next_response_id(),
            json!({
                "type": "UnexpectedRequest",
                "message": format!("No remote method '{}' on node {}", request.func, self.id),
            }),
        );
        let responder = self.responder.clone();
        tokio::spawn(async move {
            if let Err(e) = responder.send(response).await {
                warn!(error = %e, "Failed to send unknown-method error response");
            }
        });
    }

    fn handle_response(&self, response: ResponseMessage) -> WireResult<()> {
        let ResponseMessage {
            response_to,
            data,
            error,
            sender,
            ..
        } = response;

        let outcome = if error {
            Err(RequestError::Remote(RemoteError::from_data(data)))
        } else {
            Ok(data)
        };

        match self.pending.settle(&response_to, outcome) {
            Some(settlement) => {
                debug!(
                    node_id = %self.id,
                    request_id = %response_to,
                    sender = %sender,
                    ?settlement,
                    "Response handled"
                );
                Ok(())
            }
            None => {
                warn!(
                    node_id = %self.id,
                    response_to = %response_to,
                    sender = %sender,
                    "Unexpected response"
                );
                Err(WireError::UnexpectedResponse { response_to })
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_name", &self.config.node_name)
            .field("methods", &self.methods)
            .field("pending", &self.pending)
            .field("peers", &self.peers.peer_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::pending::Settlement;
    use crate::transport::MemoryNetwork;
    use nekara_types::ids::SeededIds;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Hands out a fixed script of tokens, then falls back to a seeded source.
    struct ScriptedIds {
        script: Mutex<VecDeque<&'static str>>,
        fallback: SeededIds,
    }

    impl ScriptedIds {
        fn new(script: &[&'static str]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback: SeededIds::new(0),
            }
        }
    }

    impl IdGenerator for ScriptedIds {
        fn token(&self, len: usize) -> String {
            match self.script.lock().unwrap().pop_front() {
                Some(token) => token.to_string(),
                None => self.fallback.token(len),
            }
        }
    }

    fn silent_node() -> (MemoryNetwork, Node) {
        let network = MemoryNetwork::new();
        network.set_drop_all(true);
        let node = Node::new(WireConfig::default(), network.transport());
        (network, node)
    }

    fn response_payload(node: &Node, response_to: &str, data: Value, error: bool) -> String {
        let response = ResponseMessage::new(
            "res-TEST".to_string(),
            "remote",
            node.id(),
            response_to,
            data,
            error,
        );
        encode(&Message::Response(response)).unwrap()
    }

    #[tokio::test]
    async fn test_node_id_from_generator() {
        let network = MemoryNetwork::new();
        let node = Node::with_ids(
            WireConfig::default(),
            network.transport(),
            Arc::new(ScriptedIds::new(&["NODE"])),
        );
        assert_eq!(node.id(), "NODE");
        assert_eq!(node.config().id_token_len, 16);
    }

    #[tokio::test]
    async fn test_colliding_request_id_is_redrawn() {
        let network = MemoryNetwork::new();
        network.set_drop_all(true);
        let node = Node::with_ids(
            WireConfig::default(),
            network.transport(),
            Arc::new(ScriptedIds::new(&["NODE", "AAAA", "AAAA", "BBBB"])),
        );

        let first = node.request("peer", "f", vec![]);
        let second = node.request("peer", "f", vec![]);
        assert_eq!(first.id(), "req-AAAA");
        assert_eq!(second.id(), "req-BBBB");
        assert_eq!(node.pending().ids(), vec!["req-AAAA", "req-BBBB"]);
    }

    #[tokio::test]
    async fn test_response_fulfils_request() {
        let (_network, node) = silent_node();
        let call = node.request("remote", "get", vec![json!("key")]);
        assert_eq!(call.label(), "get");

        node.handle_message(&response_payload(&node, call.id(), json!({"v": 1}), false))
            .unwrap();
        assert!(node.pending().is_empty());
        assert_eq!(call.await.unwrap(), json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_error_response_fails_request() {
        let (_network, node) = silent_node();
        let call = node.request("remote", "assert", vec![json!(false)]);

        let data = json!({"type": "AssertionFailure", "message": "expected true"});
        node.handle_message(&response_payload(&node, call.id(), data.clone(), true))
            .unwrap();

        match call.await {
            Err(RequestError::Remote(remote)) => {
                assert_eq!(remote.kind.as_deref(), Some("AssertionFailure"));
                assert_eq!(remote.message, "expected true");
                assert_eq!(remote.data, data);
            }
            other => panic!("Expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmatched_response_is_reported() {
        let (_network, node) = silent_node();
        let err = node
            .handle_message(&response_payload(&node, "req-NEVER", json!(1), false))
            .unwrap_err();
        assert!(matches!(err, WireError::UnexpectedResponse { response_to } if response_to == "req-NEVER"));
    }

    #[tokio::test]
    async fn test_malformed_leaves_pending_untouched() {
        let (_network, node) = silent_node();
        let call = node.request("remote", "f", vec![]);

        let err = node.handle_message("{\"id\": 5}").unwrap_err();
        assert!(matches!(err, WireError::UnexpectedMessage { .. }));
        assert!(node.pending().contains(call.id()));
    }

    #[tokio::test]
    async fn test_unknown_method_without_reply() {
        let network = MemoryNetwork::new();
        let config = WireConfig {
            reply_on_unknown_method: false,
            ..WireConfig::default()
        };
        let node = Arc::new(Node::new(config, network.transport()));
        let _pump = network.attach(&node);

        let request = RequestMessage::new("req-X".to_string(), node.id(), node.id(), "nope", vec![]);
        let err = node
            .handle_message(&encode(&request.into()).unwrap())
            .unwrap_err();
        assert!(matches!(err, WireError::UnexpectedRequest { func, .. } if func == "nope"));

        tokio::task::yield_now().await;
        assert_eq!(network.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_runs_detached() {
        let (_network, node) = silent_node();
        let release = Arc::new(Notify::new());
        let finished = Arc::new(Notify::new());
        {
            let release = Arc::clone(&release);
            let finished = Arc::clone(&finished);
            node.register_remote_method("slow", move |_call| {
                let release = Arc::clone(&release);
                let finished = Arc::clone(&finished);
                async move {
                    release.notified().await;
                    finished.notify_one();
                    Value::Null
                }
            });
        }

        let request = RequestMessage::new("req-S".to_string(), "remote", node.id(), "slow", vec![]);
        // Returns while the handler is still parked.
        node.handle_message(&encode(&request.into()).unwrap())
            .unwrap();

        release.notify_one();
        finished.notified().await;
    }

    #[tokio::test]
    async fn test_respond_settles_remote_request() {
        let network = MemoryNetwork::new();
        let caller = Arc::new(Node::new(WireConfig::default(), network.transport()));
        let config = WireConfig {
            reply_on_unknown_method: false,
            ..WireConfig::default()
        };
        let responder = Arc::new(Node::new(config, network.transport()));
        let _caller_pump = network.attach(&caller);
        let _responder_pump = network.attach(&responder);

        // The responder exposes nothing, so only the explicit answer settles it.
        let call = caller.request(responder.id(), "manual", vec![]);
        responder
            .respond(caller.id(), call.id(), json!("answered"), false)
            .await
            .unwrap();

        assert_eq!(call.await.unwrap(), json!("answered"));
        assert!(caller.pending().is_empty());
    }

    #[tokio::test]
    async fn test_request_args_shapes() {
        let (_network, node) = silent_node();

        let pair = node.request_args("r", "f", ("lock", 3)).unwrap();
        let single = node.request_args("r", "f", "only").unwrap();
        let none = node.request_args("r", "f", ()).unwrap();
        assert_eq!(node.pending().len(), 3);

        for call in [pair, single, none] {
            node.handle_message(&response_payload(&node, call.id(), json!(0), false))
                .unwrap();
            assert!(call.await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_peer_management() {
        let (_network, node) = silent_node();
        node.add_peer("p1", node.peer_handle("p1")).unwrap();
        assert!(matches!(
            node.add_peer("p1", node.peer_handle("p1")),
            Err(WireError::DuplicatePeer(_))
        ));
        assert_eq!(node.get_peer("p1").unwrap().peer_id(), "p1");

        node.remove_peer("p1");
        node.remove_peer("p1");
        assert!(matches!(node.get_peer("p1"), Err(WireError::PeerNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_cannot_be_resettled() {
        let (_network, node) = silent_node();
        let call = node.request_with_timeout("remote", "f", vec![], Duration::from_millis(10));
        let id = call.id().to_string();

        assert!(matches!(call.await, Err(RequestError::TimedOut { .. })));
        assert!(!node.pending().contains(&id));
        assert_eq!(node.pending().settle(&id, Ok(json!(1))), None::<Settlement>);
    }
}
