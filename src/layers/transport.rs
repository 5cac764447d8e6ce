//! The bottom of every stack: serializes messages onto a [`Transport`] and
//! parses the datagrams it receives.

use crate::{
    layer::{Context, Layer, ReceiveError, SendError, TransportError},
    logging::{message_event, Direction},
    message::{Message, MessageType},
    wire::{self, ParseError},
    Shutdown,
};
use std::{net::SocketAddr, sync::Arc};

mod memory;
pub use memory::{Datagram, MemoryNetwork, MemoryTransport};

mod udp;
pub use udp::UdpTransport;

/// Moves raw datagrams between this process and its peers.
pub trait Transport: Send + Sync + 'static {
    /// Sends one datagram. Concurrent calls must not interleave.
    fn send(&self, datagram: &[u8], peer: SocketAddr) -> Result<(), TransportError>;

    /// The address peers reach this transport at.
    fn local_addr(&self) -> SocketAddr;

    /// Starts delivering received datagrams to `inbound` until `shutdown`
    /// fires.
    fn start(self: Arc<Self>, inbound: Inbound, shutdown: Shutdown);
}

pub type SharedTransport = Arc<dyn Transport>;

/// Where a transport hands the datagrams it receives.
#[derive(Clone)]
pub struct Inbound {
    layer: Arc<TransportLayer>,
    context: Context,
}

impl Inbound {
    pub(crate) fn new(layer: Arc<TransportLayer>, context: Context) -> Self {
        Self { layer, context }
    }

    /// Parses a datagram from `peer` and passes it up the stack.
    pub fn datagram(&self, bytes: &[u8], peer: SocketAddr) {
        self.layer.datagram(bytes, peer, &self.context)
    }
}

/// The layer that owns the transport. Only this layer performs I/O.
pub struct TransportLayer {
    transport: SharedTransport,
}

impl TransportLayer {
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn datagram(&self, bytes: &[u8], peer: SocketAddr, context: &Context) {
        match wire::decode(bytes, peer) {
            Ok(message) => {
                message_event(context.name(), Direction::Received, &message);
                if let Err(e) = context.receive_up(message) {
                    tracing::debug!(stack = context.name(), %peer, "Inbound message dropped: {}", e);
                }
            }
            Err(ParseError::MalformedOptions {
                kind: MessageType::Confirmable,
                mid,
                problem,
            }) => {
                tracing::warn!(stack = context.name(), %peer, mid, "Rejecting message with malformed options: {}", problem);
                let reset = Message::empty(MessageType::Reset, mid, peer);
                if let Err(e) = self.write(&reset, context) {
                    tracing::error!(stack = context.name(), %peer, "Failed to send reset: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(stack = context.name(), %peer, "Dropping undecodable datagram: {}", e);
            }
        }
    }

    fn write(&self, message: &Message, context: &Context) -> Result<(), SendError> {
        if !message.has_peer() {
            return Err(SendError::MissingPeer);
        }
        let bytes = wire::encode(message)?;
        self.transport.send(&bytes, message.peer).map_err(|e| {
            tracing::error!(stack = context.name(), peer = %message.peer, "Transport send failed: {}", e);
            e
        })?;
        message_event(context.name(), Direction::Sent, message);
        Ok(())
    }
}

impl Layer for TransportLayer {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        self.write(&message, &context)
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        context.receive_up(message)
    }

    fn start(self: Arc<Self>, context: Context, shutdown: Shutdown) {
        let inbound = Inbound::new(self.clone(), context);
        self.transport.clone().start(inbound, shutdown);
    }
}
