//! A ceiling on the number of requests sent per second.
//!
//! Time is cut into fixed one second windows. Requests sent while the
//! current window still has room go straight down. The rest are queued for
//! later windows in the order they were sent, or refused, depending on the
//! [`RatePolicy`]. Only requests count; responses and empty messages always
//! pass.

use crate::{
    config::{RatePolicy, StackConfig},
    layer::{Cancellation, Context, Failure, FailureReason, Layer, ReceiveError, SendError},
    message::Message,
    Shutdown,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

const WINDOW: Duration = Duration::from_secs(1);

pub struct RateControlLayer {
    /// Requests allowed per window. Zero means no limit.
    limit: u32,
    policy: RatePolicy,
    window: Mutex<Window>,
    queued: Notify,
}

struct Window {
    started: Instant,
    sent: u32,
    queue: VecDeque<Message>,
}

impl Window {
    /// Moves on to a new window if the current one is over.
    fn roll(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.started) >= WINDOW {
            self.started = now;
            self.sent = 0;
        }
    }
}

impl RateControlLayer {
    pub fn new(limit: u32, policy: RatePolicy) -> Self {
        Self {
            limit,
            policy,
            window: Mutex::new(Window {
                started: Instant::now(),
                sent: 0,
                queue: VecDeque::new(),
            }),
            queued: Notify::new(),
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(config.requests_per_second, config.rate_policy)
    }

    /// When the queue should next be served, if anything is queued.
    fn next_release(&self) -> Option<Instant> {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.queue.is_empty() {
            None
        } else {
            Some(window.started + WINDOW)
        }
    }

    /// Sends as many queued requests as the current window has room for.
    fn release(&self, context: &Context) {
        let ready: Vec<Message> = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.roll();
            let room = self.limit.saturating_sub(window.sent) as usize;
            let count = room.min(window.queue.len());
            window.sent += count as u32;
            window.queue.drain(..count).collect()
        };
        if !ready.is_empty() {
            tracing::trace!(stack = context.name(), count = ready.len(), "Releasing queued requests");
        }
        for message in ready {
            let failure = Failure::of(&message, FailureReason::Undeliverable);
            if let Err(e) = context.send_down(message) {
                tracing::warn!(stack = context.name(), "Failed to send queued request: {}", e);
                context.fail_up(failure);
            }
        }
    }
}

impl Layer for RateControlLayer {
    fn name(&self) -> &'static str {
        "rate control"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        if self.limit == 0 || !message.is_request() {
            return context.send_down(message);
        }
        {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.roll();
            if !window.queue.is_empty() || window.sent >= self.limit {
                return match self.policy {
                    RatePolicy::Reject => {
                        tracing::debug!(stack = context.name(), %message, "Request rate limit reached");
                        Err(SendError::RateLimited)
                    }
                    RatePolicy::Queue => {
                        tracing::trace!(stack = context.name(), %message, queued = window.queue.len() + 1, "Request queued");
                        window.queue.push_back(message);
                        self.queued.notify_one();
                        Ok(())
                    }
                };
            }
            window.sent += 1;
        }
        context.send_down(message)
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        context.receive_up(message)
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .retain(|message| message.exchange != Some(cancellation.exchange));
        context.cancel_down(cancellation)
    }

    fn start(self: Arc<Self>, context: Context, mut shutdown: Shutdown) {
        if self.limit == 0 || self.policy == RatePolicy::Reject {
            return;
        }
        tokio::spawn(async move {
            loop {
                let release = self.next_release();
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = self.queued.notified(), if release.is_none() => {}
                    _ = tokio::time::sleep_until(release.unwrap_or_else(Instant::now)), if release.is_some() => {
                        self.release(&context);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::ExchangeId,
        layer::Chain,
        layers::testing::Probe,
        message::{Code, MessageType, Method},
    };
    use std::net::SocketAddr;

    fn setup(limit: u32, policy: RatePolicy) -> (Arc<Chain>, Arc<Probe>) {
        let bottom = Probe::transparent();
        let chain = Chain::new(
            "test".into(),
            vec![
                Probe::new(),
                Arc::new(RateControlLayer::new(limit, policy)),
                bottom.clone(),
            ],
        );
        chain.start(&Shutdown::new());
        (chain, bottom)
    }

    fn request(exchange: u64) -> Message {
        let mut request = Message::request(MessageType::NonConfirmable, Method::Get);
        request.peer = "10.0.0.3:5683".parse::<SocketAddr>().unwrap();
        request.exchange = Some(ExchangeId::new(exchange));
        request
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_spread_over_windows() {
        let (chain, bottom) = setup(5, RatePolicy::Queue);
        let start = Instant::now();
        for exchange in 0..15 {
            chain.send(request(exchange)).unwrap();
        }
        assert_eq!(bottom.sent().len(), 5);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let sent = bottom.sent();
        assert_eq!(sent.len(), 15);
        for window in 0..3 {
            let count = sent
                .iter()
                .filter(|(_, at)| (*at - start).as_secs() == window)
                .count();
            assert_eq!(count, 5);
        }
        // Order is kept
        let exchanges: Vec<_> = sent.iter().map(|(m, _)| m.exchange.unwrap().into_inner()).collect();
        assert_eq!(exchanges, (0..15).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn excess_requests_are_rejected() {
        let (chain, bottom) = setup(5, RatePolicy::Reject);
        let results: Vec<_> = (0..15).map(|exchange| chain.send(request(exchange))).collect();
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 5);
        assert!(results[5..]
            .iter()
            .all(|result| *result == Err(SendError::RateLimited)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        chain.send(request(20)).unwrap();
        assert_eq!(bottom.sent().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_are_not_limited() {
        let (chain, bottom) = setup(1, RatePolicy::Reject);
        let incoming = request(0);
        for _ in 0..10 {
            chain
                .send(Message::response_to(&incoming, Code::CONTENT))
                .unwrap();
        }
        assert_eq!(bottom.sent().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_means_unlimited() {
        let (chain, bottom) = setup(0, RatePolicy::Reject);
        for exchange in 0..100 {
            chain.send(request(exchange)).unwrap();
        }
        assert_eq!(bottom.sent().len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_leave_the_queue() {
        let (chain, bottom) = setup(1, RatePolicy::Queue);
        chain.send(request(1)).unwrap();
        chain.send(request(2)).unwrap();
        chain.cancel(Cancellation {
            exchange: ExchangeId::new(2),
            peer: request(2).peer,
            token: None,
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bottom.sent().len(), 1);
    }
}
