//! The [`Layer`] trait and supporting types.
//!
//! A stack is an ordered list of layers. Outgoing messages enter at the top
//! and travel down to the transport; incoming datagrams enter at the bottom
//! and travel up to the application. Each layer sees every message that is
//! not consumed by a layer before it and forwards what it does not consume
//! to its neighbour through the [`Context`] it was handed. Layers never hold
//! references to each other, so any layer can be composed with any other.
//!
//! Besides messages, two kinds of notices travel through the stack:
//!
//! - A [`Failure`] travels up when an exchange ends without a response, for
//!   example when the transaction layer runs out of retransmissions.
//! - A [`Cancellation`] travels down when the application gives up on an
//!   exchange, so that each layer can drop whatever state it keeps for it.
//!
//! Both have default implementations that simply forward the notice, so a
//! layer without per-exchange state need not think about them.

use crate::{
    id::ExchangeId,
    message::{Message, Token, UriError},
    wire::BuildError,
    Shutdown,
};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error as ThisError;

mod context;
pub use context::Context;
pub(crate) use context::Chain;

/// A processing stage in a [`Stack`](crate::Stack).
pub trait Layer: Send + Sync + 'static {
    /// A short name used in logs.
    fn name(&self) -> &'static str;

    /// Processes a message travelling towards the transport.
    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError>;

    /// Processes a message travelling towards the application.
    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError>;

    /// Handles an exchange that ended without a response.
    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        context.fail_up(failure)
    }

    /// Handles an exchange the application gave up on.
    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        context.cancel_down(cancellation)
    }

    /// Starts any background work the layer needs, such as timers or expiry
    /// sweeps. Spawned tasks should end when `shutdown` fires.
    fn start(self: Arc<Self>, _context: Context, _shutdown: Shutdown) {}
}

/// A layer shared between the stack and its tasks.
pub type SharedLayer = Arc<dyn Layer>;

/// Why an exchange ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// No acknowledgement or response arrived in time.
    Timeout,
    /// The peer rejected the message with a Reset.
    Reset,
    /// A blockwise transfer could not be completed.
    TransferAborted,
    /// The application cancelled the exchange.
    Cancelled,
    /// The message was accepted but could never be handed to the transport.
    Undeliverable,
}

/// Notice that an exchange failed, travelling up the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    /// The exchange, once a layer knows it. Failures raised low in the stack
    /// may only know the peer and token.
    pub exchange: Option<ExchangeId>,
    pub peer: SocketAddr,
    pub token: Token,
    pub reason: FailureReason,
}

impl Failure {
    /// A failure of the exchange `message` belongs to.
    pub fn of(message: &Message, reason: FailureReason) -> Self {
        Self {
            exchange: message.exchange,
            peer: message.peer,
            token: message.token,
            reason,
        }
    }
}

/// Notice that an exchange was abandoned, travelling down the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    pub exchange: ExchangeId,
    pub peer: SocketAddr,
    /// Filled in by the token layer for the layers below it.
    pub token: Option<Token>,
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response(Message),
    Failed(FailureReason),
}

impl Outcome {
    pub fn into_response(self) -> Option<Message> {
        match self {
            Outcome::Response(response) => Some(response),
            Outcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("The message has no destination")]
    MissingPeer,
    #[error("Token {0} is still in use by another exchange")]
    TokenInUse(Token),
    #[error("No message id is free for {0}")]
    MessageIdsExhausted(SocketAddr),
    #[error("The request rate limit was reached")]
    RateLimited,
    #[error("The request target is invalid: {0}")]
    Uri(#[from] UriError),
    #[error("The message could not be serialized: {0}")]
    Build(#[from] BuildError),
    #[error("The transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("No layer below to send to")]
    Unwired,
    #[error("The stack has shut down")]
    ShutDown,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("A response matched no outstanding request")]
    UnexpectedResponse,
    #[error("Answering the message failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No endpoint is listening at {0}")]
    Unreachable(SocketAddr),
    #[error("Socket error: {0}")]
    Io(String),
    #[error("The transport is closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
