//! Duplicate suppression and response correlation.
//!
//! Every confirmable or non-confirmable message received is remembered by
//! peer and message id for the exchange lifetime, and later copies are
//! dropped. When the application answers a remembered request, the answer
//! is kept too, so that a retransmitted request gets the same answer again.
//!
//! Responses are only let through when they belong to an exchange this
//! stack started and has not finished. The token layer below tags each
//! response with its exchange.

use crate::{
    config::StackConfig,
    id::ExchangeId,
    layer::{Cancellation, Context, Failure, FailureReason, Layer, ReceiveError, SendError},
    message::{Message, MessageType, Token},
    timer::every,
    FxDashMap, Shutdown,
};
use dashmap::mapref::entry::Entry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

pub struct MatchingLayer {
    lifetime: Duration,
    recent: FxDashMap<(SocketAddr, u16), Recent>,
    outstanding: FxDashMap<ExchangeId, Outstanding>,
}

struct Recent {
    received: Instant,
    response: Option<Message>,
}

struct Outstanding {
    peer: SocketAddr,
    token: Token,
    sent: Instant,
}

impl MatchingLayer {
    pub fn new(config: &StackConfig) -> Self {
        Self::with_lifetime(config.exchange_lifetime)
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime,
            recent: Default::default(),
            outstanding: Default::default(),
        }
    }

    /// Remembers `message`, returning false if it was seen before.
    fn first_sighting(&self, message: &Message, context: &Context) -> bool {
        match self.recent.entry((message.peer, message.mid)) {
            Entry::Occupied(entry) => {
                tracing::debug!(stack = context.name(), %message, "Dropping duplicate");
                let response = entry.get().response.clone();
                drop(entry);
                if let (MessageType::Confirmable, Some(response)) = (message.kind, response) {
                    if let Err(e) = context.send_down(response) {
                        tracing::warn!(stack = context.name(), "Failed to repeat response: {}", e);
                    }
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Recent {
                    received: Instant::now(),
                    response: None,
                });
                true
            }
        }
    }

    fn sweep(&self, context: &Context) {
        let lifetime = self.lifetime;
        self.recent
            .retain(|_, recent| recent.received.elapsed() < lifetime);
        // Exchanges end through a response or a failure from below. These
        // only linger when a lower layer lost track of one.
        let stale: Vec<ExchangeId> = self
            .outstanding
            .iter()
            .filter(|outstanding| outstanding.sent.elapsed() >= lifetime)
            .map(|outstanding| *outstanding.key())
            .collect();
        for exchange in stale {
            let Some((_, outstanding)) = self.outstanding.remove(&exchange) else {
                continue;
            };
            tracing::warn!(stack = context.name(), %exchange, peer = %outstanding.peer, "Exchange outlived its lifetime");
            context.cancel_down(Cancellation {
                exchange,
                peer: outstanding.peer,
                token: None,
            });
            context.fail_up(Failure {
                exchange: Some(exchange),
                peer: outstanding.peer,
                token: outstanding.token,
                reason: FailureReason::Timeout,
            });
        }
    }
}

impl Layer for MatchingLayer {
    fn name(&self) -> &'static str {
        "matching"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        if message.is_request() {
            if let Some(exchange) = message.exchange {
                self.outstanding.insert(
                    exchange,
                    Outstanding {
                        peer: message.peer,
                        token: message.token,
                        sent: Instant::now(),
                    },
                );
            }
        } else if let Some(reply_to) = message.reply_to {
            if let Some(mut recent) = self.recent.get_mut(&(message.peer, reply_to.mid)) {
                recent.response = Some(message.clone());
            }
        }
        context.send_down(message)
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        let tracked = matches!(
            message.kind,
            MessageType::Confirmable | MessageType::NonConfirmable
        );
        if tracked && !message.is_empty() && !self.first_sighting(&message, &context) {
            return Ok(());
        }

        if message.is_response() {
            let matched = message
                .exchange
                .and_then(|exchange| self.outstanding.remove(&exchange))
                .filter(|(_, outstanding)| outstanding.peer == message.peer);
            if matched.is_none() {
                tracing::warn!(stack = context.name(), %message, "Dropping unexpected response");
                return Err(ReceiveError::UnexpectedResponse);
            }
        }
        context.receive_up(message)
    }

    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        if let Some(exchange) = failure.exchange {
            self.outstanding.remove(&exchange);
        }
        context.fail_up(failure)
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        self.outstanding.remove(&cancellation.exchange);
        context.cancel_down(cancellation)
    }

    fn start(self: Arc<Self>, context: Context, shutdown: Shutdown) {
        let layer = self.clone();
        every(self.lifetime / 4, shutdown, move || layer.sweep(&context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::Chain,
        layers::testing::{Probe, Recorded},
        message::{Code, Method},
    };
    use tracing_test::traced_test;

    fn setup() -> (Arc<Chain>, Arc<Probe>, Arc<Probe>) {
        let top = Probe::new();
        let bottom = Probe::transparent();
        let chain = Chain::new(
            "test".into(),
            vec![
                top.clone(),
                Arc::new(MatchingLayer::with_lifetime(Duration::from_secs(247))),
                bottom.clone(),
            ],
        );
        chain.start(&Shutdown::new());
        (chain, top, bottom)
    }

    fn request(kind: MessageType, mid: u16) -> Message {
        let mut request = Message::request(kind, Method::Get);
        request.peer = "10.0.0.1:5683".parse().unwrap();
        request.mid = mid;
        request.token = Token::from_u32(mid as u32);
        request
    }

    #[traced_test]
    #[tokio::test]
    async fn duplicates_are_delivered_once() {
        let (chain, top, _bottom) = setup();
        for _ in 0..5 {
            chain.receive(request(MessageType::NonConfirmable, 3)).unwrap();
        }
        chain.receive(request(MessageType::NonConfirmable, 4)).unwrap();
        let mids: Vec<_> = top.received().iter().map(|(message, _)| message.mid).collect();
        assert_eq!(mids, vec![3, 4]);
        assert!(logs_contain("Dropping duplicate"));
    }

    #[tokio::test]
    async fn duplicate_confirmable_gets_same_response() {
        let (chain, top, bottom) = setup();
        let original = request(MessageType::Confirmable, 10);
        chain.receive(original.clone()).unwrap();
        let response = Message::response_to(&original, Code::CONTENT).with_payload("22.5");
        chain.send(response.clone()).unwrap();
        chain.receive(original).unwrap();

        assert_eq!(top.received().len(), 1);
        let sent = bottom.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, response);
        assert_eq!(sent[1].0, response);
    }

    #[tokio::test]
    async fn responses_match_outstanding_exchanges() {
        let (chain, top, _bottom) = setup();
        let mut outgoing = request(MessageType::Confirmable, 0);
        outgoing.exchange = Some(ExchangeId::new(8));
        chain.send(outgoing.clone()).unwrap();

        let mut response = Message::response_to(&outgoing, Code::CONTENT);
        response.kind = MessageType::Acknowledgement;
        response.mid = 1;
        chain.receive(response.clone()).unwrap();
        assert_eq!(top.received().len(), 1);

        // The exchange is finished, so another response is unexpected
        response.mid = 2;
        assert_eq!(
            chain.receive(response.clone()),
            Err(ReceiveError::UnexpectedResponse)
        );
        response.exchange = None;
        assert_eq!(
            chain.receive(response),
            Err(ReceiveError::UnexpectedResponse)
        );
        assert_eq!(top.received().len(), 1);
    }

    #[tokio::test]
    async fn failure_forgets_exchange() {
        let (chain, top, _bottom) = setup();
        let mut outgoing = request(MessageType::Confirmable, 0);
        outgoing.exchange = Some(ExchangeId::new(9));
        chain.send(outgoing.clone()).unwrap();
        chain.cancel(Cancellation {
            exchange: ExchangeId::new(9),
            peer: outgoing.peer,
            token: None,
        });
        let mut response = Message::response_to(&outgoing, Code::CONTENT);
        response.kind = MessageType::Acknowledgement;
        assert!(chain.receive(response).is_err());
        assert!(top.received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_exchange_fails_after_its_lifetime() {
        let top = Probe::new();
        let bottom = Probe::transparent();
        let chain = Chain::new(
            "test".into(),
            vec![
                top.clone(),
                Arc::new(MatchingLayer::with_lifetime(Duration::from_secs(8))),
                bottom.clone(),
            ],
        );
        chain.start(&Shutdown::new());
        let mut outgoing = request(MessageType::Confirmable, 0);
        outgoing.exchange = Some(ExchangeId::new(10));
        chain.send(outgoing.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(top.failures().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        let failures = top.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.exchange, Some(ExchangeId::new(10)));
        assert_eq!(failures[0].0.reason, FailureReason::Timeout);
        assert!(bottom.recorded().iter().any(|record| matches!(
            record,
            Recorded::Cancelled(cancellation) if cancellation.exchange == ExchangeId::new(10)
        )));

        let mut response = Message::response_to(&outgoing, Code::CONTENT);
        response.kind = MessageType::Acknowledgement;
        assert!(chain.receive(response).is_err());
    }
}
