//! Token allocation.
//!
//! Every request leaving the stack gets a token that no other pending
//! exchange with the same peer holds. Tokens come from a wrapping counter,
//! skipping values still in use. A token is released when the final response
//! arrives or the exchange fails or is cancelled.
//!
//! Incoming responses are tagged with the exchange their token belongs to,
//! which is how the layers above recognise them.

use crate::{
    id::ExchangeId,
    layer::{Cancellation, Context, Failure, Layer, ReceiveError, SendError},
    message::{Message, Token},
    FxDashMap,
};
use dashmap::mapref::entry::Entry;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub struct TokenLayer {
    counter: AtomicU32,
    in_use: FxDashMap<(SocketAddr, Token), ExchangeId>,
    by_exchange: FxDashMap<ExchangeId, (SocketAddr, Token)>,
}

impl TokenLayer {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(rand::random()),
            in_use: Default::default(),
            by_exchange: Default::default(),
        }
    }

    fn next_token(&self) -> Token {
        Token::from_u32(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Binds a token to the exchange of `message`, choosing one if the
    /// message has none.
    fn claim(&self, message: &mut Message, exchange: ExchangeId) -> Result<(), SendError> {
        if let Some(claimed) = self.by_exchange.get(&exchange) {
            // A later message of an exchange that already holds a token
            message.token = claimed.1;
            return Ok(());
        }
        if !message.token.is_empty() {
            match self.in_use.entry((message.peer, message.token)) {
                Entry::Occupied(holder) if *holder.get() != exchange => {
                    return Err(SendError::TokenInUse(message.token));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(exchange);
                }
            }
        } else {
            loop {
                let token = self.next_token();
                if let Entry::Vacant(entry) = self.in_use.entry((message.peer, token)) {
                    entry.insert(exchange);
                    message.token = token;
                    break;
                }
            }
        }
        self.by_exchange
            .insert(exchange, (message.peer, message.token));
        Ok(())
    }

    fn release(&self, exchange: ExchangeId) -> Option<Token> {
        let (_, key) = self.by_exchange.remove(&exchange)?;
        self.in_use.remove_if(&key, |_, holder| *holder == exchange);
        Some(key.1)
    }
}

impl Default for TokenLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for TokenLayer {
    fn name(&self) -> &'static str {
        "token"
    }

    fn send(self: Arc<Self>, mut message: Message, context: Context) -> Result<(), SendError> {
        if !message.is_request() {
            return context.send_down(message);
        }
        let Some(exchange) = message.exchange else {
            if message.token.is_empty() {
                message.token = self.next_token();
            }
            return context.send_down(message);
        };
        self.claim(&mut message, exchange)?;
        tracing::trace!(stack = context.name(), %exchange, token = %message.token, "Token assigned");
        context.send_down(message).map_err(|e| {
            self.release(exchange);
            e
        })
    }

    fn receive(self: Arc<Self>, mut message: Message, context: Context) -> Result<(), ReceiveError> {
        if message.is_response() {
            message.exchange = self
                .in_use
                .remove(&(message.peer, message.token))
                .map(|(_, exchange)| exchange);
            if let Some(exchange) = message.exchange {
                self.by_exchange.remove(&exchange);
            }
        }
        context.receive_up(message)
    }

    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        // Every message of an exchange holding a token names the exchange.
        // A failure without one is about a message we answered, whose token
        // is the peer's and may equal one of ours.
        if let Some(exchange) = failure.exchange {
            self.release(exchange);
        }
        context.fail_up(failure)
    }

    fn cancel(self: Arc<Self>, mut cancellation: Cancellation, context: Context) {
        cancellation.token = self.release(cancellation.exchange).or(cancellation.token);
        context.cancel_down(cancellation)
    }
}
