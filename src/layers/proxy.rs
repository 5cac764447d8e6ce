//! Forwarding of proxied requests.
//!
//! A request carrying a Proxy-Uri option is not sent as is. Instead a new
//! request is built for the target the option names, with its own exchange,
//! token and message id, and sent in its place. The original request is
//! remembered under the new exchange. When the forwarded exchange ends, its
//! response or failure is translated back into one for the original request.
//!
//! The forwarded request copies the method, payload and every option except
//! those that address the proxy itself (Uri-Host, Uri-Port, Uri-Path,
//! Uri-Query, Proxy-Uri and Proxy-Scheme) and those that only concern one hop
//! (the block and size options). Its address options are regenerated from
//! the Proxy-Uri.

use crate::{
    config::StackConfig,
    id::ExchangeId,
    layer::{Cancellation, Context, Failure, Layer, ReceiveError, SendError},
    message::{Code, Message, ParsedUri, Payload, UriError},
    timer::every,
    FxDashMap, Shutdown,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

mod statistics;
pub use statistics::ProxyStatistics;

pub struct ProxyLayer {
    lifetime: Duration,
    /// Original requests, by the exchange that forwards them.
    forwards: FxDashMap<ExchangeId, Forward>,
    statistics: Arc<ProxyStatistics>,
}

struct Forward {
    /// The original request without its payload.
    origin: Message,
    target: SocketAddr,
    created: Instant,
}

impl ProxyLayer {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            lifetime: config.exchange_lifetime,
            forwards: Default::default(),
            statistics: Arc::new(ProxyStatistics::new()),
        }
    }

    pub fn statistics(&self) -> Arc<ProxyStatistics> {
        self.statistics.clone()
    }

    /// The number of forwarded exchanges that have not ended.
    pub fn in_flight(&self) -> usize {
        self.forwards.len()
    }

    /// Answers the original request from within the layer.
    fn answer(&self, request: &Message, code: Code, context: &Context) {
        let mut response = Message::new(request.kind, code);
        response.readdress(request);
        if let Err(e) = context.receive_up(response) {
            tracing::warn!(stack = context.name(), "Failed to answer proxied request: {}", e);
        }
    }

    fn forward(&self, request: Message, proxy_uri: &str, context: &Context) -> Result<(), SendError> {
        let target = match ParsedUri::parse(proxy_uri) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(stack = context.name(), proxy_uri, "Cannot forward: {}", e);
                let code = match e {
                    UriError::UnsupportedScheme(_) => Code::PROXYING_NOT_SUPPORTED,
                    _ => Code::BAD_OPTION,
                };
                self.answer(&request, code, context);
                return Ok(());
            }
        };

        let mut forwarded = Message::new(request.kind, request.code);
        forwarded.options = request
            .options
            .iter()
            .filter(|option| !option.number.is_routing() && !option.number.is_hop_by_hop())
            .cloned()
            .collect();
        forwarded.set_target(&target);
        forwarded.payload = request.payload.clone();
        let exchange = context.next_exchange();
        forwarded.exchange = Some(exchange);

        let resource = forwarded.uri();
        self.statistics.record(request.peer, &resource);
        tracing::debug!(
            stack = context.name(),
            client = %request.peer,
            %resource,
            forwarded = %exchange,
            "Forwarding request"
        );

        let mut origin = request;
        origin.payload = Payload::empty();
        self.forwards.insert(
            exchange,
            Forward {
                origin,
                target: target.peer,
                created: Instant::now(),
            },
        );
        if let Err(e) = context.send_down(forwarded) {
            tracing::debug!(stack = context.name(), forwarded = %exchange, "Forwarding failed: {}", e);
            if let Some((_, forward)) = self.forwards.remove(&exchange) {
                let code = match e {
                    SendError::RateLimited => Code::SERVICE_UNAVAILABLE,
                    _ => Code::BAD_GATEWAY,
                };
                self.answer(&forward.origin, code, context);
            }
        }
        Ok(())
    }

    fn sweep(&self) {
        let lifetime = self.lifetime;
        self.forwards
            .retain(|_, forward| forward.created.elapsed() < lifetime);
    }
}

impl Layer for ProxyLayer {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        if !message.is_request() {
            return context.send_down(message);
        }
        match message.proxy_uri().map(str::to_string) {
            Some(proxy_uri) => self.forward(message, &proxy_uri, &context),
            None => context.send_down(message),
        }
    }

    fn receive(self: Arc<Self>, mut message: Message, context: Context) -> Result<(), ReceiveError> {
        if message.is_response() {
            let forward = message
                .exchange
                .and_then(|exchange| self.forwards.remove(&exchange));
            if let Some((exchange, forward)) = forward {
                tracing::debug!(
                    stack = context.name(),
                    forwarded = %exchange,
                    code = %message.code,
                    client = %forward.origin.peer,
                    "Relaying forwarded response"
                );
                message.readdress(&forward.origin);
            }
        }
        context.receive_up(message)
    }

    fn fail(self: Arc<Self>, mut failure: Failure, context: Context) {
        let forward = failure
            .exchange
            .and_then(|exchange| self.forwards.remove(&exchange));
        if let Some((_, forward)) = forward {
            tracing::debug!(stack = context.name(), reason = ?failure.reason, "Forwarded exchange failed");
            failure.exchange = forward.origin.exchange;
            failure.peer = forward.origin.peer;
            failure.token = forward.origin.token;
        }
        context.fail_up(failure)
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        let forwarded: Vec<(ExchangeId, SocketAddr)> = self
            .forwards
            .iter()
            .filter(|forward| forward.origin.exchange == Some(cancellation.exchange))
            .map(|forward| (*forward.key(), forward.target))
            .collect();
        if forwarded.is_empty() {
            return context.cancel_down(cancellation);
        }
        for (exchange, target) in forwarded {
            self.forwards.remove(&exchange);
            context.cancel_down(Cancellation {
                exchange,
                peer: target,
                token: None,
            });
        }
    }

    fn start(self: Arc<Self>, _context: Context, shutdown: Shutdown) {
        let layer = self.clone();
        every(self.lifetime / 4, shutdown, move || layer.sweep());
    }
}
