use super::{Cancellation, Failure, Outcome, ReceiveError, SendError, SharedLayer};
use crate::{
    endpoint::{Receiver, Responder},
    id::{ExchangeId, ExchangeIds},
    message::{Code, Message},
    FxDashMap, Shutdown,
};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::oneshot;

/// Provides a [`Layer`](super::Layer) with access to its neighbours.
///
/// A context is cheap to clone and may be moved into spawned tasks, which is
/// how layers inject messages of their own, such as retransmissions.
#[derive(Clone)]
pub struct Context {
    chain: Arc<Chain>,
    position: usize,
}

impl Context {
    /// The name of the stack, for logging.
    pub fn name(&self) -> &str {
        &self.chain.name
    }

    /// Passes a message to the layer below.
    pub fn send_down(&self, message: Message) -> Result<(), SendError> {
        let below = self.position + 1;
        match self.chain.layers.get(below) {
            Some(layer) => layer.clone().send(message, self.chain.context(below)),
            None => Err(SendError::Unwired),
        }
    }

    /// Passes a message to the layer above, or to the application when
    /// called from the top layer.
    pub fn receive_up(&self, message: Message) -> Result<(), ReceiveError> {
        match self.position.checked_sub(1) {
            Some(above) => {
                self.chain.layers[above]
                    .clone()
                    .receive(message, self.chain.context(above))
            }
            None => {
                self.chain.deliver(message);
                Ok(())
            }
        }
    }

    /// Reports a failed exchange to the layer above.
    pub fn fail_up(&self, failure: Failure) {
        match self.position.checked_sub(1) {
            Some(above) => self.chain.layers[above]
                .clone()
                .fail(failure, self.chain.context(above)),
            None => self.chain.failed(failure),
        }
    }

    /// Reports a cancelled exchange to the layer below.
    pub fn cancel_down(&self, cancellation: Cancellation) {
        let below = self.position + 1;
        if let Some(layer) = self.chain.layers.get(below) {
            layer
                .clone()
                .cancel(cancellation, self.chain.context(below))
        }
    }

    /// Allocates an exchange id for a message that a layer originates.
    pub fn next_exchange(&self) -> ExchangeId {
        self.chain.ids.next()
    }
}

/// The wiring behind every [`Context`] of one stack: its layers, the
/// application waiting on its exchanges, and the receiver of its requests.
pub(crate) struct Chain {
    pub(crate) name: String,
    layers: Vec<SharedLayer>,
    exchanges: FxDashMap<ExchangeId, oneshot::Sender<Outcome>>,
    receiver: RwLock<Option<Arc<dyn Receiver>>>,
    ids: ExchangeIds,
}

impl Chain {
    pub(crate) fn new(name: String, layers: Vec<SharedLayer>) -> Arc<Self> {
        Arc::new(Self {
            name,
            layers,
            exchanges: Default::default(),
            receiver: RwLock::new(None),
            ids: ExchangeIds::new(),
        })
    }

    pub(crate) fn context(self: &Arc<Self>, position: usize) -> Context {
        Context {
            chain: self.clone(),
            position,
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Starts every layer, top first.
    pub(crate) fn start(self: &Arc<Self>, shutdown: &Shutdown) {
        for (position, layer) in self.layers.iter().enumerate() {
            layer.clone().start(self.context(position), shutdown.clone());
        }
    }

    /// Sends a message from the application into the top layer.
    pub(crate) fn send(self: &Arc<Self>, message: Message) -> Result<(), SendError> {
        match self.layers.first() {
            Some(layer) => layer.clone().send(message, self.context(0)),
            None => Err(SendError::Unwired),
        }
    }

    /// Hands a message from the transport to the bottom layer.
    pub(crate) fn receive(self: &Arc<Self>, message: Message) -> Result<(), ReceiveError> {
        match self.layers.len().checked_sub(1) {
            Some(bottom) => self.layers[bottom]
                .clone()
                .receive(message, self.context(bottom)),
            None => {
                self.deliver(message);
                Ok(())
            }
        }
    }

    /// Raises a failure at the bottom layer, as if the transport had.
    #[cfg(test)]
    pub(crate) fn fail(self: &Arc<Self>, failure: Failure) {
        if let Some(bottom) = self.layers.len().checked_sub(1) {
            self.layers[bottom]
                .clone()
                .fail(failure, self.context(bottom))
        }
    }

    /// Cancels an exchange from the top of the stack.
    pub(crate) fn cancel(self: &Arc<Self>, cancellation: Cancellation) {
        if let Some((_, waiter)) = self.exchanges.remove(&cancellation.exchange) {
            let _ = waiter.send(Outcome::Failed(super::FailureReason::Cancelled));
        }
        if let Some(layer) = self.layers.first() {
            layer.clone().cancel(cancellation, self.context(0));
        }
    }

    /// Creates a new exchange whose outcome will be sent to the returned
    /// receiver.
    pub(crate) fn register(&self) -> (ExchangeId, oneshot::Receiver<Outcome>) {
        let exchange = self.ids.next();
        let (sender, receiver) = oneshot::channel();
        self.exchanges.insert(exchange, sender);
        (exchange, receiver)
    }

    /// Forgets an exchange that never made it into the stack.
    pub(crate) fn unregister(&self, exchange: ExchangeId) {
        self.exchanges.remove(&exchange);
    }

    pub(crate) fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *self
            .receiver
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.receiver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(self: &Arc<Self>, message: Message) {
        if message.is_response() {
            let waiter = message
                .exchange
                .and_then(|exchange| self.exchanges.remove(&exchange));
            match waiter {
                Some((_, waiter)) => {
                    if waiter.send(Outcome::Response(message)).is_err() {
                        tracing::debug!(stack = %self.name, "Response arrived after its handle was dropped");
                    }
                }
                None => tracing::warn!(stack = %self.name, %message, "Dropping response nobody is waiting for"),
            }
        } else if message.is_request() {
            let responder = Responder::new(&message, self.clone());
            match self.receiver() {
                Some(receiver) => {
                    tokio::spawn(async move { receiver.receive(message, responder).await });
                }
                None => {
                    tracing::debug!(stack = %self.name, %message, "No receiver for request");
                    if let Err(e) = responder.respond_with(Code::NOT_FOUND, "") {
                        tracing::warn!(stack = %self.name, "Failed to reject request: {}", e);
                    }
                }
            }
        } else {
            tracing::debug!(stack = %self.name, %message, "Dropping empty message at the top of the stack");
        }
    }

    fn failed(&self, failure: Failure) {
        match failure
            .exchange
            .and_then(|exchange| self.exchanges.remove(&exchange))
        {
            Some((_, waiter)) => {
                let _ = waiter.send(Outcome::Failed(failure.reason));
            }
            None => tracing::debug!(
                stack = %self.name,
                peer = %failure.peer,
                token = %failure.token,
                reason = ?failure.reason,
                "Exchange failed"
            ),
        }
    }
}
