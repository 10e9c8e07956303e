//! Remote method handlers and the capability they use to answer.
//!
//! The engine invokes a handler and walks away. It never replies on the
//! handler's behalf and never times a handler out: a handler that wants its
//! caller to see a result must call [`IncomingCall::reply`] (or
//! [`IncomingCall::reply_error`]) itself. [`reply_method`] wraps the common
//! case of "answer with whatever the function returns".

use crate::error::WireResult;
use crate::message::{encode, response_id, RequestMessage, ResponseMessage};
use crate::transport::Transport;
use futures::future::{BoxFuture, FutureExt};
use nekara_types::ids::IdGenerator;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A registered remote method.
///
/// The value the future resolves to is only logged by the engine; answering
/// the caller is the handler's job.
pub type RemoteMethod = Arc<dyn Fn(IncomingCall) -> BoxFuture<'static, Value> + Send + Sync>;

/// Box an async closure into a [`RemoteMethod`].
pub fn method<F, Fut>(handler: F) -> RemoteMethod
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    Arc::new(move |call| handler(call).boxed())
}

/// Wrap a function of the arguments into a [`RemoteMethod`] that answers the
/// caller with its result: `Ok` as data, `Err` as an error response.
pub fn reply_method<F, Fut>(handler: F) -> RemoteMethod
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    Arc::new(move |call: IncomingCall| {
        let result = handler(call.args().to_vec());
        async move {
            let (data, is_error) = match result.await {
                Ok(value) => (value, false),
                Err(value) => (value, true),
            };
            if let Err(e) = call.reply_with(data.clone(), is_error).await {
                warn!(
                    request_id = %call.id(),
                    func = %call.func(),
                    error = %e,
                    "Failed to send reply"
                );
            }
            data
        }
        .boxed()
    })
}

/// The outbound half of a node: builds responses and hands them to the
/// transport. Cheap to clone.
#[derive(Clone)]
pub struct Responder {
    node_id: String,
    transport: Arc<dyn Transport>,
    ids: Arc<dyn IdGenerator>,
    token_len: usize,
}

impl Responder {
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        ids: Arc<dyn IdGenerator>,
        token_len: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            ids,
            token_len,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A fresh `res-` id.
    pub fn next_response_id(&self) -> String {
        response_id(&*self.ids, self.token_len)
    }

    /// Answer `request_id` on `recipient`.
    pub async fn respond(
        &self,
        recipient: &str,
        request_id: &str,
        data: Value,
        is_error: bool,
    ) -> WireResult<()> {
        let response = ResponseMessage::new(
            self.next_response_id(),
            &self.node_id,
            recipient,
            request_id,
            data,
            is_error,
        );
        self.send(response).await
    }

    /// Encode and send an already-built response to its recipient.
    pub async fn send(&self, response: ResponseMessage) -> WireResult<()> {
        debug!(
            response_to = %response.response_to,
            recipient = %response.recipient,
            error = response.error,
            "Sending response"
        );
        let recipient = response.recipient.clone();
        let payload = encode(&response.into())?;
        self.transport.send(&recipient, payload).await
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// A request delivered to a handler, together with the means to answer it.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    request: RequestMessage,
    responder: Responder,
}

impl IncomingCall {
    pub fn new(request: RequestMessage, responder: Responder) -> Self {
        Self { request, responder }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn sender(&self) -> &str {
        &self.request.sender
    }

    pub fn func(&self) -> &str {
        &self.request.func
    }

    pub fn args(&self) -> &[Value] {
        &self.request.args
    }

    pub fn request(&self) -> &RequestMessage {
        &self.request
    }

    /// Answer the caller with a result.
    pub async fn reply(&self, data: Value) -> WireResult<()> {
        self.reply_with(data, false).await
    }

    /// Answer the caller with a failure; it surfaces there as a remote error.
    pub async fn reply_error(&self, data: Value) -> WireResult<()> {
        self.reply_with(data, true).await
    }

    async fn reply_with(&self, data: Value, is_error: bool) -> WireResult<()> {
        let id = self.responder.next_response_id();
        let response = if is_error {
            self.request.create_error_response(id, data)
        } else {
            self.request.create_response(id, data)
        };
        self.responder.send(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use crate::message::{classify, Inbound};
    use async_trait::async_trait;
    use nekara_types::ids::SeededIds;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingTransport {
        fn responses(&self) -> Vec<(String, ResponseMessage)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(to, payload)| match classify(payload) {
                    Inbound::Response(msg) => (to.clone(), msg),
                    other => panic!("Expected response, got {other:?}"),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, recipient: &str, payload: String) -> Result<(), WireError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), payload));
            Ok(())
        }
    }

    fn incoming(transport: Arc<RecordingTransport>, args: Vec<Value>) -> IncomingCall {
        let request = RequestMessage::new("req-1".to_string(), "client", "server", "op", args);
        let responder = Responder::new("server", transport, Arc::new(SeededIds::new(9)), 16);
        IncomingCall::new(request, responder)
    }

    #[tokio::test]
    async fn test_reply_goes_back_to_sender() {
        let transport = Arc::new(RecordingTransport::default());
        let call = incoming(transport.clone(), vec![json!(1)]);

        call.reply(json!("done")).await.unwrap();

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        let (to, msg) = &responses[0];
        assert_eq!(to, "client");
        assert_eq!(msg.sender, "server");
        assert_eq!(msg.response_to, "req-1");
        assert_eq!(msg.data, json!("done"));
        assert!(!msg.error);
        assert!(msg.id.starts_with("res-"));
    }

    #[tokio::test]
    async fn test_reply_method_answers_ok_and_err() {
        let transport = Arc::new(RecordingTransport::default());
        let divide = reply_method(|args: Vec<Value>| async move {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            if b == 0 {
                Err(json!({"type": "DivideByZero", "message": "b is zero"}))
            } else {
                Ok(json!(a / b))
            }
        });

        let returned = divide(incoming(transport.clone(), vec![json!(9), json!(3)])).await;
        assert_eq!(returned, json!(3));
        divide(incoming(transport.clone(), vec![json!(1), json!(0)])).await;

        let responses = transport.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].1.data, json!(3));
        assert!(!responses[0].1.error);
        assert_eq!(responses[1].1.data["type"], "DivideByZero");
        assert!(responses[1].1.error);
    }

    #[tokio::test]
    async fn test_plain_method_does_not_reply() {
        let transport = Arc::new(RecordingTransport::default());
        let silent = method(|call: IncomingCall| async move { json!(call.args().len()) });

        let returned = silent(incoming(transport.clone(), vec![json!(1), json!(2)])).await;
        assert_eq!(returned, json!(2));
        assert!(transport.responses().is_empty());
    }

    #[tokio::test]
    async fn test_responder_respond() {
        let transport = Arc::new(RecordingTransport::default());
        let responder = Responder::new("me", transport.clone(), Arc::new(SeededIds::new(1)), 8);

        responder
            .respond("you", "req-XYZ", json!([1, 2]), true)
            .await
            .unwrap();

        let responses = transport.responses();
        let (to, msg) = &responses[0];
        assert_eq!(to, "you");
        assert_eq!(msg.sender, "me");
        assert_eq!(msg.response_to, "req-XYZ");
        assert!(msg.error);
        assert_eq!(msg.id.len(), 4 + 8);
    }
}
