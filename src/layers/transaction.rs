//! Reliable delivery of confirmable messages.
//!
//! Every confirmable message sent gets a fresh message id and is kept until
//! an acknowledgement or reset with that id arrives. Until then it is
//! retransmitted with exponential backoff, and once `max_retransmit`
//! retransmissions went unanswered the exchange fails with a timeout.
//!
//! Inbound confirmable requests are acknowledged. A response produced
//! within `ack_delay` rides in the acknowledgement itself; otherwise an
//! empty acknowledgement goes out and the response follows as a separate
//! confirmable message. The client side mirrors this: after an empty
//! acknowledgement the layer waits `response_timeout` for the separate
//! response.
//!
//! Messages carrying a critical option the stack does not recognize go no
//! further. A confirmable request is answered with 4.02 Bad Option, and
//! anything else is reset.

use crate::{
    config::StackConfig,
    id::ExchangeId,
    layer::{
        Cancellation, Context, Failure, FailureReason, Layer, ReceiveError, SendError,
    },
    message::{Code, Message, MessageType, OptionNumber, Token},
    timer::{every, Timers},
    FxDashMap, Shutdown,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;

pub type Epoch = u64;

/// The timing parameters of the layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reliability {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    pub ack_delay: Duration,
    pub response_timeout: Duration,
    pub exchange_lifetime: Duration,
}

impl From<&StackConfig> for Reliability {
    fn from(config: &StackConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout,
            ack_random_factor: config.ack_random_factor,
            max_retransmit: config.max_retransmit,
            ack_delay: config.ack_delay,
            response_timeout: config.response_timeout,
            exchange_lifetime: config.exchange_lifetime,
        }
    }
}

pub struct TransactionLayer {
    reliability: Reliability,
    next_mid: AtomicU16,
    epochs: AtomicU64,
    rng: Mutex<SmallRng>,
    /// Confirmable messages we sent that have not been acknowledged.
    active: FxDashMap<(SocketAddr, u16), Transaction>,
    /// Requests acknowledged without a response, waiting for a separate one.
    awaiting: FxDashMap<(SocketAddr, Token), Awaiting>,
    /// Confirmable messages we received, for acknowledgement and duplicate
    /// detection.
    inbound: FxDashMap<(SocketAddr, u16), Inbound>,
    timers: Timers<Timer>,
}

struct Transaction {
    message: Message,
    retransmissions: u32,
    timeout: Duration,
    epoch: Epoch,
}

struct Awaiting {
    exchange: Option<ExchangeId>,
    epoch: Epoch,
}

struct Inbound {
    state: InboundState,
    received: Instant,
}

enum InboundState {
    /// Passed up, no acknowledgement sent yet.
    Pending,
    /// Acknowledged with an empty message.
    Acknowledged,
    /// Answered with the given piggybacked response.
    Replied(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Retransmit {
        peer: SocketAddr,
        mid: u16,
        epoch: Epoch,
    },
    DelayedAck {
        peer: SocketAddr,
        mid: u16,
    },
    ResponseTimeout {
        peer: SocketAddr,
        token: Token,
        epoch: Epoch,
    },
}

impl TransactionLayer {
    pub fn new(reliability: Reliability) -> Self {
        Self {
            reliability,
            next_mid: AtomicU16::new(rand::random()),
            epochs: AtomicU64::new(0),
            rng: Mutex::new(SmallRng::from_entropy()),
            active: Default::default(),
            awaiting: Default::default(),
            inbound: Default::default(),
            timers: Timers::new(),
        }
    }

    fn next_epoch(&self) -> Epoch {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// A message id not used by any active transaction with `peer`.
    fn fresh_mid(&self, peer: SocketAddr) -> Result<u16, SendError> {
        for _ in 0..=u16::MAX as u32 {
            let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
            if !self.active.contains_key(&(peer, mid)) {
                return Ok(mid);
            }
        }
        Err(SendError::MessageIdsExhausted(peer))
    }

    /// The first retransmission timeout, drawn from
    /// [ack_timeout, ack_timeout * ack_random_factor].
    fn initial_timeout(&self) -> Duration {
        let factor = self.reliability.ack_random_factor;
        if factor <= 1.0 {
            return self.reliability.ack_timeout;
        }
        let scale = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(1.0..factor);
        self.reliability.ack_timeout.mul_f64(scale)
    }

    fn await_response(&self, message: &Message) {
        let epoch = self.next_epoch();
        self.awaiting.insert(
            (message.peer, message.token),
            Awaiting {
                exchange: message.exchange,
                epoch,
            },
        );
        self.timers.schedule(
            Timer::ResponseTimeout {
                peer: message.peer,
                token: message.token,
                epoch,
            },
            self.reliability.response_timeout,
        );
    }

    fn send_confirmable(&self, mut message: Message, context: &Context) -> Result<(), SendError> {
        let peer = message.peer;
        let mid = self.fresh_mid(peer)?;
        message.mid = mid;
        let timeout = self.initial_timeout();
        let epoch = self.next_epoch();
        self.active.insert(
            (peer, mid),
            Transaction {
                message: message.clone(),
                retransmissions: 0,
                timeout,
                epoch,
            },
        );
        tracing::trace!(stack = context.name(), %peer, mid, ?timeout, "Transaction started");
        if let Err(e) = context.send_down(message) {
            self.active.remove(&(peer, mid));
            return Err(e);
        }
        self.timers
            .schedule(Timer::Retransmit { peer, mid, epoch }, timeout);
        Ok(())
    }

    fn acknowledge(&self, peer: SocketAddr, mid: u16, context: &Context) {
        let ack = Message::empty(MessageType::Acknowledgement, mid, peer);
        if let Err(e) = context.send_down(ack) {
            tracing::warn!(stack = context.name(), %peer, mid, "Failed to acknowledge: {}", e);
        }
    }

    fn fire(&self, timer: Timer, context: &Context) {
        match timer {
            Timer::Retransmit { peer, mid, epoch } => self.retransmit(peer, mid, epoch, context),
            Timer::DelayedAck { peer, mid } => {
                let acknowledge = match self.inbound.get_mut(&(peer, mid)) {
                    Some(mut entry) if matches!(entry.state, InboundState::Pending) => {
                        entry.state = InboundState::Acknowledged;
                        true
                    }
                    _ => false,
                };
                if acknowledge {
                    tracing::debug!(stack = context.name(), %peer, mid, "Response is late, acknowledging on its own");
                    self.acknowledge(peer, mid, context);
                }
            }
            Timer::ResponseTimeout { peer, token, epoch } => {
                if let Some((_, awaiting)) = self
                    .awaiting
                    .remove_if(&(peer, token), |_, awaiting| awaiting.epoch == epoch)
                {
                    tracing::debug!(stack = context.name(), %peer, %token, "No separate response arrived");
                    context.fail_up(Failure {
                        exchange: awaiting.exchange,
                        peer,
                        token,
                        reason: FailureReason::Timeout,
                    });
                }
            }
        }
    }

    fn retransmit(&self, peer: SocketAddr, mid: u16, epoch: Epoch, context: &Context) {
        let key = (peer, mid);
        let resend = {
            let Some(mut transaction) = self.active.get_mut(&key) else {
                return;
            };
            if transaction.epoch != epoch {
                return;
            }
            if transaction.retransmissions < self.reliability.max_retransmit {
                transaction.retransmissions += 1;
                transaction.timeout *= 2;
                transaction.epoch = self.next_epoch();
                self.timers.schedule(
                    Timer::Retransmit {
                        peer,
                        mid,
                        epoch: transaction.epoch,
                    },
                    transaction.timeout,
                );
                tracing::debug!(
                    stack = context.name(),
                    %peer,
                    mid,
                    attempt = transaction.retransmissions,
                    "Retransmitting"
                );
                Some(transaction.message.clone())
            } else {
                None
            }
        };
        match resend {
            Some(message) => {
                if let Err(e) = context.send_down(message) {
                    tracing::warn!(stack = context.name(), %peer, mid, "Retransmission failed: {}", e);
                }
            }
            None => {
                if let Some((_, transaction)) = self.active.remove(&key) {
                    tracing::info!(stack = context.name(), %peer, mid, "Transmission timed out");
                    context.fail_up(Failure::of(&transaction.message, FailureReason::Timeout));
                }
            }
        }
    }

    fn receive_ack(&self, message: Message, context: &Context) -> Result<(), ReceiveError> {
        let Some((_, transaction)) = self.active.remove(&(message.peer, message.mid)) else {
            tracing::debug!(stack = context.name(), %message, "Acknowledgement for unknown message id");
            return Ok(());
        };
        if !message.is_empty() {
            // A piggybacked response
            return context.receive_up(message);
        }
        if transaction.message.is_request() {
            tracing::trace!(stack = context.name(), %message, "Request acknowledged, awaiting separate response");
            self.await_response(&transaction.message);
        }
        Ok(())
    }

    fn receive_confirmable(&self, message: Message, context: &Context) -> Result<(), ReceiveError> {
        let key = (message.peer, message.mid);
        if message.is_empty() {
            tracing::debug!(stack = context.name(), %message, "Answering ping with reset");
            context.send_down(Message::empty(MessageType::Reset, message.mid, message.peer))?;
            return Ok(());
        }

        let duplicate = self.inbound.get(&key).map(|entry| match &entry.state {
            InboundState::Pending => None,
            InboundState::Acknowledged => Some(Message::empty(
                MessageType::Acknowledgement,
                message.mid,
                message.peer,
            )),
            InboundState::Replied(reply) => Some(reply.clone()),
        });
        if let Some(answer) = duplicate {
            tracing::debug!(stack = context.name(), %message, "Duplicate confirmable message");
            if let Some(answer) = answer {
                context.send_down(answer)?;
            }
            return Ok(());
        }

        if let Some(number) = message.options.unrecognized_critical() {
            return self.reject_bad_option(message, number, context);
        }

        if message.is_response() {
            self.awaiting.remove(&(message.peer, message.token));
            self.inbound.insert(
                key,
                Inbound {
                    state: InboundState::Acknowledged,
                    received: Instant::now(),
                },
            );
            self.acknowledge(message.peer, message.mid, context);
        } else {
            self.inbound.insert(
                key,
                Inbound {
                    state: InboundState::Pending,
                    received: Instant::now(),
                },
            );
            self.timers.schedule(
                Timer::DelayedAck {
                    peer: message.peer,
                    mid: message.mid,
                },
                self.reliability.ack_delay,
            );
        }
        context.receive_up(message)
    }

    /// Refuses a message carrying a critical option we do not understand. A
    /// confirmable request gets 4.02 Bad Option in its acknowledgement, which
    /// is repeated for duplicates. Anything else is reset.
    fn reject_bad_option(
        &self,
        message: Message,
        number: OptionNumber,
        context: &Context,
    ) -> Result<(), ReceiveError> {
        tracing::debug!(stack = context.name(), %message, option = %number, "Unrecognized critical option");
        if message.kind == MessageType::Confirmable && message.is_request() {
            let mut reply = Message::response_to(&message, Code::BAD_OPTION);
            reply.kind = MessageType::Acknowledgement;
            reply.mid = message.mid;
            self.inbound.insert(
                (message.peer, message.mid),
                Inbound {
                    state: InboundState::Replied(reply.clone()),
                    received: Instant::now(),
                },
            );
            context.send_down(reply)?;
        } else {
            context.send_down(Message::empty(MessageType::Reset, message.mid, message.peer))?;
        }
        Ok(())
    }

    /// Sends a response to a confirmable request, in the acknowledgement if
    /// it has not been sent yet.
    fn send_reply(&self, mut response: Message, request_mid: u16, context: &Context) -> Result<(), SendError> {
        let key = (response.peer, request_mid);
        let reply = match self.inbound.get_mut(&key) {
            Some(mut entry) => match entry.state {
                InboundState::Pending => {
                    response.kind = MessageType::Acknowledgement;
                    response.mid = request_mid;
                    entry.state = InboundState::Replied(response.clone());
                    Some(response.clone())
                }
                InboundState::Replied(ref reply) => Some(reply.clone()),
                InboundState::Acknowledged => None,
            },
            None => None,
        };
        if let Some(reply) = reply {
            return context.send_down(reply);
        }
        response.kind = MessageType::Confirmable;
        self.send_confirmable(response, context)
    }

    fn sweep(&self) {
        let lifetime = self.reliability.exchange_lifetime;
        self.inbound
            .retain(|_, entry| entry.received.elapsed() < lifetime);
    }
}

impl Layer for TransactionLayer {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn send(self: Arc<Self>, mut message: Message, context: Context) -> Result<(), SendError> {
        if !message.has_peer() {
            return Err(SendError::MissingPeer);
        }
        match (message.kind, message.reply_to) {
            (MessageType::Acknowledgement | MessageType::Reset, _) => context.send_down(message),
            (_, Some(reply_to)) if message.is_response() && reply_to.kind == MessageType::Confirmable => {
                self.send_reply(message, reply_to.mid, &context)
            }
            (MessageType::Confirmable, _) => self.send_confirmable(message, &context),
            (MessageType::NonConfirmable, _) => {
                message.mid = self.fresh_mid(message.peer)?;
                if message.is_request() {
                    self.await_response(&message);
                }
                context.send_down(message)
            }
        }
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        match message.kind {
            MessageType::Acknowledgement => self.receive_ack(message, &context),
            MessageType::Reset => {
                match self.active.remove(&(message.peer, message.mid)) {
                    Some((_, transaction)) => {
                        tracing::debug!(stack = context.name(), %message, "Message rejected by peer");
                        context.fail_up(Failure::of(&transaction.message, FailureReason::Reset));
                    }
                    None => {
                        tracing::debug!(stack = context.name(), %message, "Reset for unknown message id")
                    }
                }
                Ok(())
            }
            MessageType::Confirmable => self.receive_confirmable(message, &context),
            MessageType::NonConfirmable => {
                if let Some(number) = message.options.unrecognized_critical() {
                    return self.reject_bad_option(message, number, &context);
                }
                if message.is_response() {
                    self.awaiting.remove(&(message.peer, message.token));
                }
                context.receive_up(message)
            }
        }
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        let exchange = Some(cancellation.exchange);
        self.active
            .retain(|_, transaction| transaction.message.exchange != exchange);
        self.awaiting
            .retain(|_, awaiting| awaiting.exchange != exchange);
        context.cancel_down(cancellation)
    }

    fn start(self: Arc<Self>, context: Context, shutdown: Shutdown) {
        {
            let layer = self.clone();
            let context = context.clone();
            self.timers
                .run(shutdown.clone(), move |timer| layer.fire(timer, &context));
        }
        let layer = self.clone();
        every(self.reliability.exchange_lifetime / 4, shutdown, move || layer.sweep());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::Chain,
        layers::testing::{Probe, Recorded},
        message::Method,
    };

    fn reliability() -> Reliability {
        Reliability {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.0,
            max_retransmit: 4,
            ack_delay: Duration::from_secs(1),
            response_timeout: Duration::from_secs(30),
            exchange_lifetime: Duration::from_secs(247),
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.9:5683".parse().unwrap()
    }

    fn setup() -> (Arc<Chain>, Arc<Probe>, Arc<Probe>) {
        let top = Probe::new();
        let bottom = Probe::transparent();
        let chain = Chain::new(
            "test".into(),
            vec![
                top.clone(),
                Arc::new(TransactionLayer::new(reliability())),
                bottom.clone(),
            ],
        );
        chain.start(&Shutdown::new());
        (chain, top, bottom)
    }

    fn get_request() -> Message {
        let mut request = Message::request(MessageType::Confirmable, Method::Get);
        request.peer = peer();
        request.token = Token::from_u32(1);
        request.exchange = Some(ExchangeId::new(1));
        request
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_with_backoff_then_fails() {
        let (chain, top, bottom) = setup();
        let start = Instant::now();
        chain.send(get_request()).unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        let sent = bottom.sent();
        assert_eq!(sent.len(), 5);
        let mid = sent[0].0.mid;
        assert!(sent.iter().all(|(message, _)| message.mid == mid));
        let offsets: Vec<_> = sent.iter().map(|(_, at)| (*at - start).as_secs()).collect();
        assert_eq!(offsets, vec![0, 2, 6, 14, 30]);

        let failures = top.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.reason, FailureReason::Timeout);
        assert_eq!((failures[0].1 - start).as_secs(), 62);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_stops_retransmission() {
        let (chain, top, bottom) = setup();
        chain.send(get_request()).unwrap();
        let mid = bottom.sent()[0].0.mid;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(bottom.sent().len(), 2);

        let mut ack = Message::response_to(&get_request(), Code::CONTENT);
        ack.kind = MessageType::Acknowledgement;
        ack.mid = mid;
        ack.exchange = None;
        chain.receive(ack).unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(bottom.sent().len(), 2);
        assert_eq!(top.received().len(), 1);
        assert!(top.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ack_waits_for_separate_response() {
        let (chain, top, bottom) = setup();
        chain.send(get_request()).unwrap();
        let mid = bottom.sent()[0].0.mid;
        chain
            .receive(Message::empty(MessageType::Acknowledgement, mid, peer()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bottom.sent().len(), 1);
        assert!(top.received().is_empty());

        let mut separate = Message::response_to(&get_request(), Code::CONTENT);
        separate.exchange = None;
        separate.mid = 900;
        chain.receive(separate.clone()).unwrap();
        // Acknowledged at once, and duplicates are only acknowledged again
        chain.receive(separate).unwrap();
        let sent = bottom.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[1..].iter().all(|(message, _)| {
            message.kind == MessageType::Acknowledgement && message.mid == 900 && message.is_empty()
        }));
        assert_eq!(top.received().len(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(top.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_separate_response_times_out() {
        let (chain, top, bottom) = setup();
        chain.send(get_request()).unwrap();
        let mid = bottom.sent()[0].0.mid;
        chain
            .receive(Message::empty(MessageType::Acknowledgement, mid, peer()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        let failures = top.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.exchange, Some(ExchangeId::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_fails_exchange() {
        let (chain, top, bottom) = setup();
        chain.send(get_request()).unwrap();
        let mid = bottom.sent()[0].0.mid;
        chain
            .receive(Message::empty(MessageType::Reset, mid, peer()))
            .unwrap();
        assert_eq!(top.failures()[0].0.reason, FailureReason::Reset);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(bottom.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn piggybacks_prompt_response() {
        let (chain, top, bottom) = setup();
        let mut request = get_request();
        request.mid = 77;
        request.exchange = None;
        chain.receive(request.clone()).unwrap();
        assert_eq!(top.received().len(), 1);

        chain
            .send(Message::response_to(&request, Code::CONTENT).with_payload("hi"))
            .unwrap();
        let sent = bottom.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, MessageType::Acknowledgement);
        assert_eq!(sent[0].0.mid, 77);

        // A retransmitted request gets the same answer
        chain.receive(request).unwrap();
        assert_eq!(top.received().len(), 1);
        assert_eq!(bottom.sent().len(), 2);
        assert_eq!(bottom.sent()[1].0, sent[0].0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bottom.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_separate() {
        let (chain, _top, bottom) = setup();
        let mut request = get_request();
        request.mid = 78;
        request.exchange = None;
        chain.receive(request.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let sent = bottom.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.is_empty());
        assert_eq!(sent[0].0.kind, MessageType::Acknowledgement);

        chain
            .send(Message::response_to(&request, Code::CONTENT))
            .unwrap();
        let sent = bottom.sent();
        assert_eq!(sent[1].0.kind, MessageType::Confirmable);
        assert_eq!(sent[1].0.token, request.token);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_critical_option_is_refused() {
        let (chain, top, bottom) = setup();
        let mut request = get_request();
        request.mid = 79;
        request.exchange = None;
        request.options.push(OptionNumber(9), "");
        chain.receive(request.clone()).unwrap();
        chain.receive(request.clone()).unwrap();
        request.kind = MessageType::NonConfirmable;
        request.mid = 80;
        chain.receive(request).unwrap();

        assert!(top.received().is_empty());
        let sent = bottom.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0.kind, MessageType::Acknowledgement);
        assert_eq!(sent[0].0.mid, 79);
        assert_eq!(sent[0].0.code, Code::BAD_OPTION);
        assert_eq!(sent[0].0.token, Token::from_u32(1));
        assert_eq!(sent[1].0, sent[0].0);
        assert_eq!(sent[2].0.kind, MessageType::Reset);
        assert_eq!(sent[2].0.mid, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_gets_reset() {
        let (chain, top, bottom) = setup();
        chain
            .receive(Message::empty(MessageType::Confirmable, 5, peer()))
            .unwrap();
        assert!(top.received().is_empty());
        let sent = bottom.sent();
        assert_eq!(sent[0].0.kind, MessageType::Reset);
        assert_eq!(sent[0].0.mid, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_retransmission() {
        let (chain, top, bottom) = setup();
        chain.send(get_request()).unwrap();
        chain.cancel(Cancellation {
            exchange: ExchangeId::new(1),
            peer: peer(),
            token: None,
        });
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(bottom.sent().len(), 1);
        assert!(top.failures().is_empty());
        assert!(matches!(bottom.recorded()[1], Recorded::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn message_ids_are_distinct() {
        let (chain, _top, bottom) = setup();
        for token in 0..10 {
            let mut request = get_request();
            request.token = Token::from_u32(token);
            chain.send(request).unwrap();
        }
        let mut mids: Vec<_> = bottom.sent().iter().map(|(message, _)| message.mid).collect();
        mids.sort();
        mids.dedup();
        assert_eq!(mids.len(), 10);
    }
}
