//! A response cache for forwarded requests.
//!
//! Sits at the top of the proxy stack. A GET whose target has a fresh
//! cached response is answered from the cache and never reaches the
//! network. Successful responses to GET requests are stored for the
//! lifetime their Max-Age option declares, or a default. Requests with
//! other methods invalidate what is cached for their target.

use crate::{
    config::StackConfig,
    id::ExchangeId,
    layer::{Cancellation, Context, Failure, Layer, ReceiveError, SendError},
    message::{normalize_uri, Message, Method, OptionNumber},
    timer::every,
    FxDashMap, Shutdown,
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// What makes two requests interchangeable for the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub uri: String,
    pub method: Method,
    pub accept: Option<u32>,
}

impl CacheKey {
    /// The key of `request`, if it has a valid target. The target is the
    /// Proxy-Uri when present.
    pub fn of(request: &Message) -> Option<Self> {
        let method = request.method()?;
        let uri = match request.proxy_uri() {
            Some(uri) => normalize_uri(uri),
            None => normalize_uri(&request.uri()),
        }
        .ok()?;
        Some(Self {
            uri,
            method,
            accept: request.options.get_uint(OptionNumber::ACCEPT),
        })
    }
}

struct CacheEntry {
    response: Message,
    expires: Instant,
}

pub struct CachingLayer {
    capacity: usize,
    default_max_age: Duration,
    entries: FxDashMap<CacheKey, CacheEntry>,
    /// Requests on their way to the network whose responses may be cached.
    pending: FxDashMap<ExchangeId, CacheKey>,
}

impl CachingLayer {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            capacity: config.cache_capacity,
            default_max_age: config.default_max_age,
            entries: Default::default(),
            pending: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A fresh cached response for `key`, with its remaining lifetime.
    fn lookup(&self, key: &CacheKey) -> Option<(Message, Duration)> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.expires <= now {
            return None;
        }
        Some((entry.response.clone(), entry.expires - now))
    }

    fn store(&self, key: CacheKey, response: Message, context: &Context) {
        if self.capacity == 0 {
            return;
        }
        let max_age = response
            .max_age()
            .map(|seconds| Duration::from_secs(seconds as u64))
            .unwrap_or(self.default_max_age);
        if max_age.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let soonest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.expires)
                .map(|entry| entry.key().clone());
            if let Some(soonest) = soonest {
                tracing::trace!(stack = context.name(), uri = %soonest.uri, "Evicting cached response");
                self.entries.remove(&soonest);
            }
        }
        tracing::debug!(stack = context.name(), uri = %key.uri, ?max_age, "Caching response");
        self.entries.insert(
            key,
            CacheEntry {
                response,
                expires: Instant::now() + max_age,
            },
        );
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires > now);
    }
}

impl Layer for CachingLayer {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn send(self: Arc<Self>, request: Message, context: Context) -> Result<(), SendError> {
        let key = match request.is_request() {
            true => CacheKey::of(&request),
            false => None,
        };
        let Some(key) = key else {
            return context.send_down(request);
        };
        if !key.method.is_safe() {
            self.entries.retain(|cached, _| cached.uri != key.uri);
            return context.send_down(request);
        }

        if let Some((mut response, remaining)) = self.lookup(&key) {
            tracing::debug!(stack = context.name(), uri = %key.uri, "Serving cached response");
            response.readdress(&request);
            // Round up so a fresh response never claims to be stale
            let seconds = remaining.as_secs() + (remaining.subsec_nanos() > 0) as u64;
            response
                .options
                .set_uint(OptionNumber::MAX_AGE, seconds.min(u32::MAX as u64) as u32);
            if let Err(e) = context.receive_up(response) {
                tracing::warn!(stack = context.name(), "Failed to deliver cached response: {}", e);
            }
            return Ok(());
        }

        let exchange = request.exchange;
        if let Some(exchange) = exchange {
            self.pending.insert(exchange, key);
        }
        context.send_down(request).map_err(|e| {
            if let Some(exchange) = exchange {
                self.pending.remove(&exchange);
            }
            e
        })
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        if message.is_response() {
            let key = message
                .exchange
                .and_then(|exchange| self.pending.remove(&exchange))
                .map(|(_, key)| key);
            if let Some(key) = key {
                if message.code.is_success() && key.method == Method::Get {
                    self.store(key, message.clone(), &context);
                }
            }
        }
        context.receive_up(message)
    }

    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        if let Some(exchange) = failure.exchange {
            self.pending.remove(&exchange);
        }
        context.fail_up(failure)
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        self.pending.remove(&cancellation.exchange);
        context.cancel_down(cancellation)
    }

    fn start(self: Arc<Self>, _context: Context, shutdown: Shutdown) {
        let layer = self.clone();
        let period = self.default_max_age.max(Duration::from_secs(1));
        every(period, shutdown, move || layer.sweep());
    }
}
