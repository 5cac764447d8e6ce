//! The application side of a stack: request handlers and the proxy endpoint.

use crate::{
    config::StackConfig,
    layer::{Chain, FailureReason, Outcome, SendError},
    layers::ProxyStatistics,
    message::{Code, Message, MessageType, OptionNumber, Payload},
    shutdown::ExitStatus,
    stack::{Stack, StackError},
};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Handles the requests a stack receives.
///
/// Each request is handled in a task of its own, so a receiver may take its
/// time. The stack acknowledges a confirmable request on its own when no
/// response comes soon enough.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    async fn receive(&self, request: Message, responder: Responder);
}

/// Sends the response to one request.
pub struct Responder {
    request: Message,
    chain: Arc<Chain>,
}

impl Responder {
    pub(crate) fn new(request: &Message, chain: Arc<Chain>) -> Self {
        let mut request = request.clone();
        request.payload = Payload::empty();
        Self { request, chain }
    }

    /// The request being answered, without its payload.
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Answers with the code, options and payload of `response`. Its type,
    /// message id, token and peer are replaced by those the request calls for.
    pub fn respond(self, response: Message) -> Result<(), SendError> {
        let mut reply = Message::response_to(&self.request, response.code);
        reply.options = response.options;
        reply.payload = response.payload;
        self.chain.send(reply)
    }

    pub fn respond_with(self, code: Code, payload: impl Into<Payload>) -> Result<(), SendError> {
        let reply = Message::response_to(&self.request, code).with_payload(payload);
        self.chain.send(reply)
    }
}

struct FnReceiver<F>(F);

#[async_trait]
impl<F> Receiver for FnReceiver<F>
where
    F: Fn(&Message) -> (Code, Payload) + Send + Sync + 'static,
{
    async fn receive(&self, request: Message, responder: Responder) {
        let (code, payload) = (self.0)(&request);
        if let Err(e) = responder.respond_with(code, payload) {
            tracing::warn!(path = %request.uri_path(), "Failed to respond: {}", e);
        }
    }
}

/// Routes requests to receivers by their path. Requests for unknown paths
/// are answered with 4.04 Not Found.
#[derive(Default)]
pub struct Dispatcher {
    routes: FxHashMap<String, Arc<dyn Receiver>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn route(mut self, path: &str, receiver: Arc<dyn Receiver>) -> Self {
        self.routes.insert(normalize_path(path), receiver);
        self
    }

    /// Routes `path` to a function that computes the response code and
    /// payload from the request.
    pub fn route_fn<F>(self, path: &str, handler: F) -> Self
    where
        F: Fn(&Message) -> (Code, Payload) + Send + Sync + 'static,
    {
        self.route(path, Arc::new(FnReceiver(handler)))
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(&normalize_path(path))
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

#[async_trait]
impl Receiver for Dispatcher {
    async fn receive(&self, request: Message, responder: Responder) {
        let path = normalize_path(&request.uri_path());
        match self.routes.get(&path) {
            Some(receiver) => receiver.receive(request, responder).await,
            None => {
                tracing::debug!(%path, "No resource");
                if let Err(e) = responder.respond_with(Code::NOT_FOUND, "") {
                    tracing::warn!(%path, "Failed to respond: {}", e);
                }
            }
        }
    }
}

/// The path of the proxy's own resource, which reports its statistics.
pub const PROXY_PATH: &str = "/proxy";

/// A server that forwards requests carrying a Proxy-Uri.
///
/// Clients talk to the server stack. Requests with a Proxy-Uri are handed to
/// a separate proxy stack, which forwards them and caches the responses.
/// Requests without one go to the dispatcher, except those for
/// [`PROXY_PATH`].
pub struct ProxyEndpoint {
    server: Stack,
    proxy: Stack,
}

impl ProxyEndpoint {
    /// Binds the server stack on `config.port` and the proxy stack on
    /// `config.proxy_port`.
    pub async fn bind(config: StackConfig, dispatcher: Dispatcher) -> Result<Self, StackError> {
        let server = Stack::bind(config.clone()).await?;
        let proxy = Stack::bind_proxy(config.proxy()).await?;
        Ok(Self::new(server, proxy, dispatcher))
    }

    /// Pairs two running stacks. `proxy` should be a proxy stack.
    pub fn new(server: Stack, proxy: Stack, dispatcher: Dispatcher) -> Self {
        server.set_receiver(Arc::new(ProxyReceiver {
            proxy: proxy.clone(),
            dispatcher,
        }));
        Self { server, proxy }
    }

    pub fn server(&self) -> &Stack {
        &self.server
    }

    pub fn proxy(&self) -> &Stack {
        &self.proxy
    }

    pub fn statistics(&self) -> Option<Arc<ProxyStatistics>> {
        self.proxy.statistics()
    }

    /// Serves until the server stack shuts down, then stops the proxy stack.
    pub async fn serve(&self) -> ExitStatus {
        let status = self.server.serve().await;
        self.proxy.shutdown();
        status
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
        self.proxy.shutdown();
    }
}

struct ProxyReceiver {
    proxy: Stack,
    dispatcher: Dispatcher,
}

impl ProxyReceiver {
    async fn forward(&self, request: Message, responder: Responder) {
        let mut forwarded = request;
        forwarded.exchange = None;
        let result = match self.proxy.send_request(forwarded) {
            Ok(handle) => match handle.outcome().await {
                Outcome::Response(response) => responder.respond(response),
                Outcome::Failed(FailureReason::Timeout) => {
                    responder.respond_with(Code::GATEWAY_TIMEOUT, "")
                }
                Outcome::Failed(reason) => {
                    tracing::debug!(stack = self.proxy.name(), ?reason, "Forward failed");
                    responder.respond_with(Code::BAD_GATEWAY, "")
                }
            },
            Err(SendError::RateLimited) => responder.respond_with(Code::SERVICE_UNAVAILABLE, ""),
            Err(e) => {
                tracing::warn!(stack = self.proxy.name(), "Could not forward: {}", e);
                responder.respond_with(Code::BAD_GATEWAY, "")
            }
        };
        if let Err(e) = result {
            tracing::warn!(stack = self.proxy.name(), "Failed to answer proxied request: {}", e);
        }
    }

    fn report(&self, responder: Responder) -> Result<(), SendError> {
        if responder.request().method() != Some(crate::message::Method::Get) {
            return responder.respond_with(Code::METHOD_NOT_ALLOWED, "");
        }
        let report = self
            .proxy
            .statistics()
            .map(|statistics| statistics.report())
            .unwrap_or_default();
        let mut response = Message::new(MessageType::NonConfirmable, Code::CONTENT).with_payload(report);
        // text/plain
        response.options.set_uint(OptionNumber::CONTENT_FORMAT, 0);
        responder.respond(response)
    }
}

#[async_trait]
impl Receiver for ProxyReceiver {
    async fn receive(&self, request: Message, responder: Responder) {
        if request.proxy_uri().is_some() {
            self.forward(request, responder).await;
        } else if normalize_path(&request.uri_path()) == PROXY_PATH {
            if let Err(e) = self.report(responder) {
                tracing::warn!("Failed to answer statistics request: {}", e);
            }
        } else {
            self.dispatcher.receive(request, responder).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::testing::Probe,
        message::{Method, Token},
        Shutdown,
    };

    fn request(path: &str, method: Method) -> Message {
        let mut request = Message::request(MessageType::Confirmable, method);
        request.peer = "10.0.0.1:40000".parse().unwrap();
        request.mid = 7;
        request.token = Token::from_u32(9);
        request.set_uri(&format!("coap://10.0.0.2{path}")).unwrap();
        request.peer = "10.0.0.1:40000".parse().unwrap();
        request
    }

    fn chain() -> (Arc<Chain>, Arc<Probe>) {
        let bottom = Probe::new();
        let chain = Chain::new("test".into(), vec![bottom.clone()]);
        chain.start(&Shutdown::new());
        (chain, bottom)
    }

    #[tokio::test]
    async fn responder_answers_the_request() {
        let (chain, bottom) = chain();
        let request = request("/temp", Method::Get);
        let responder = Responder::new(&request.clone().with_payload("ignored"), chain);
        assert!(responder.request().payload.is_empty());
        responder
            .respond(Message::new(MessageType::Reset, Code::CONTENT).with_payload("22.5"))
            .unwrap();

        let sent = bottom.sent();
        assert_eq!(sent.len(), 1);
        let reply = &sent[0].0;
        assert_eq!(reply.code, Code::CONTENT);
        assert_eq!(reply.kind, MessageType::Confirmable);
        assert_eq!(reply.token, request.token);
        assert_eq!(reply.peer, request.peer);
        assert_eq!(reply.reply_to.map(|reply_to| reply_to.mid), Some(7));
        assert_eq!(reply.payload, "22.5".into());
    }

    #[tokio::test]
    async fn dispatcher_routes_by_path() {
        let dispatcher = Dispatcher::new()
            .route_fn("temp/", |_| (Code::CONTENT, "22.5".into()))
            .route_fn("/a/b", |request| {
                (Code::CHANGED, request.uri_path().into())
            });
        assert!(dispatcher.has_route("/temp"));

        let (chain, bottom) = chain();
        for path in ["/temp", "/a/b", "/missing"] {
            let request = request(path, Method::Get);
            let responder = Responder::new(&request, chain.clone());
            dispatcher.receive(request, responder).await;
        }
        let replies: Vec<_> = bottom
            .sent()
            .into_iter()
            .map(|(reply, _)| (reply.code, reply.payload.to_string_lossy()))
            .collect();
        assert_eq!(
            replies,
            vec![
                (Code::CONTENT, "22.5".to_string()),
                (Code::CHANGED, "/a/b".to_string()),
                (Code::NOT_FOUND, String::new()),
            ]
        );
    }
}
