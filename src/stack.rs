//! Assembles layers into a working stack and exposes it to the application.

use crate::{
    config::{ConfigError, StackConfig},
    endpoint::Receiver,
    id::ExchangeId,
    layer::{Cancellation, Chain, FailureReason, Outcome, SendError, SharedLayer, TransportError},
    layers::{
        transport::Inbound, CachingLayer, MatchingLayer, ProxyLayer, ProxyStatistics,
        RateControlLayer, SharedTransport, TokenLayer, TransactionLayer, TransferLayer,
        TransportLayer, UdpTransport,
    },
    message::Message,
    shutdown::ExitStatus,
    Shutdown,
};
use std::{fmt, net::SocketAddr, sync::Arc};
use thiserror::Error as ThisError;
use tokio::{sync::oneshot, task::JoinHandle};

/// Which layers a stack is built from.
///
/// A default stack, from the top:
///
/// | Layer        | Role                                               |
/// |--------------|----------------------------------------------------|
/// | Matching     | duplicate suppression and response correlation     |
/// | Token        | token assignment                                   |
/// | Transfer     | blockwise transfer of large bodies                 |
/// | RateControl  | outbound request ceiling                           |
/// | Transaction  | acknowledgements and retransmission                |
/// | Transport    | encoding and raw I/O                               |
///
/// A proxy stack puts Caching and the proxy translator on top of those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackKind {
    #[default]
    Default,
    Proxy,
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackKind::Default => f.write_str("default"),
            StackKind::Proxy => f.write_str("proxy"),
        }
    }
}

/// A running CoAP stack bound to one transport.
///
/// Stacks are cheap to clone. Every clone refers to the same layers, and the
/// stack shuts down when the last clone is dropped or
/// [`Stack::shutdown`] is called.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

struct StackInner {
    chain: Arc<Chain>,
    config: StackConfig,
    kind: StackKind,
    shutdown: Shutdown,
    inbound: Inbound,
    local_addr: SocketAddr,
    statistics: Option<Arc<ProxyStatistics>>,
}

impl Drop for StackInner {
    fn drop(&mut self) {
        self.shutdown.shut_down();
    }
}

impl Stack {
    /// Binds a default stack to a UDP socket on `config.port`.
    pub async fn bind(config: StackConfig) -> Result<Self, StackError> {
        Self::bind_kind(StackKind::Default, config).await
    }

    /// Binds a proxy stack to a UDP socket on `config.port`.
    pub async fn bind_proxy(config: StackConfig) -> Result<Self, StackError> {
        Self::bind_kind(StackKind::Proxy, config).await
    }

    async fn bind_kind(kind: StackKind, config: StackConfig) -> Result<Self, StackError> {
        config.validate()?;
        let transport = UdpTransport::bind(config.port).await?;
        Self::with_transport(kind, config, Arc::new(transport))
    }

    /// Builds a stack over an existing transport and starts it. Must be
    /// called from within a tokio runtime.
    pub fn with_transport(
        kind: StackKind,
        config: StackConfig,
        transport: SharedTransport,
    ) -> Result<Self, StackError> {
        config.validate()?;
        let transport = Arc::new(TransportLayer::new(transport));
        let local_addr = transport.local_addr();

        let mut layers: Vec<SharedLayer> = Vec::with_capacity(8);
        let mut statistics = None;
        if kind == StackKind::Proxy {
            let proxy = Arc::new(ProxyLayer::new(&config));
            statistics = Some(proxy.statistics());
            layers.push(Arc::new(CachingLayer::new(&config)));
            layers.push(proxy);
        }
        layers.push(Arc::new(MatchingLayer::new(&config)));
        layers.push(Arc::new(TokenLayer::new()));
        layers.push(Arc::new(TransferLayer::new(&config)));
        layers.push(Arc::new(RateControlLayer::from_config(&config)));
        layers.push(Arc::new(TransactionLayer::new((&config).into())));
        layers.push(transport.clone());

        let chain = Chain::new(config.name.clone(), layers);
        let inbound = Inbound::new(transport, chain.context(chain.depth() - 1));
        let shutdown = Shutdown::new();
        chain.start(&shutdown);
        tracing::info!(stack = %config.name, %kind, %local_addr, "Stack started");

        Ok(Self {
            inner: Arc::new(StackInner {
                chain,
                config,
                kind,
                shutdown,
                inbound,
                local_addr,
                statistics,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn kind(&self) -> StackKind {
        self.inner.kind
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Forwarding counts, for proxy stacks.
    pub fn statistics(&self) -> Option<Arc<ProxyStatistics>> {
        self.inner.statistics.clone()
    }

    /// Sets who handles the requests this stack receives. Without a
    /// receiver every request is answered with 4.04 Not Found.
    pub fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.inner.chain.set_receiver(receiver);
    }

    /// Sends a request and returns a handle to its outcome.
    pub fn send_request(&self, mut request: Message) -> Result<ResponseHandle, SendError> {
        if self.inner.shutdown.is_shut_down() {
            return Err(SendError::ShutDown);
        }
        let (exchange, outcome) = self.inner.chain.register();
        request.exchange = Some(exchange);
        let peer = request.peer;
        tracing::trace!(stack = self.name(), %exchange, %request, "Sending request");
        if let Err(e) = self.inner.chain.send(request) {
            self.inner.chain.unregister(exchange);
            return Err(e);
        }
        Ok(ResponseHandle {
            exchange,
            peer,
            outcome,
            chain: self.inner.chain.clone(),
            shutdown: self.inner.shutdown.clone(),
        })
    }

    /// Sends a message without following up on it.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if self.inner.shutdown.is_shut_down() {
            return Err(SendError::ShutDown);
        }
        self.inner.chain.send(message)
    }

    /// Processes a datagram from `peer` as if the transport had received it.
    pub fn receive_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        self.inner.inbound.datagram(bytes, peer)
    }

    /// Stops every task of the stack.
    pub fn shutdown(&self) {
        tracing::info!(stack = self.name(), "Shutting down");
        self.inner.shutdown.shut_down();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_shut_down()
    }

    /// Runs until the stack is shut down. Unless the stack is configured as
    /// a daemon, Ctrl-C shuts it down as well.
    pub async fn serve(&self) -> ExitStatus {
        let mut shutdown = self.inner.shutdown.clone();
        if self.inner.config.daemon {
            return shutdown.wait_for_shutdown().await;
        }
        let mut interrupted = shutdown.clone();
        tokio::select! {
            status = shutdown.wait_for_shutdown() => status,
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    self.shutdown();
                    ExitStatus::Exited
                }
                Err(e) => {
                    tracing::warn!(stack = self.name(), "Cannot listen for Ctrl-C: {}", e);
                    interrupted.wait_for_shutdown().await
                }
            },
        }
    }
}

/// The pending outcome of a request sent with [`Stack::send_request`].
pub struct ResponseHandle {
    exchange: ExchangeId,
    peer: SocketAddr,
    outcome: oneshot::Receiver<Outcome>,
    chain: Arc<Chain>,
    shutdown: Shutdown,
}

impl ResponseHandle {
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Waits for the exchange to end.
    pub async fn outcome(mut self) -> Outcome {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            outcome = &mut self.outcome => {
                outcome.unwrap_or(Outcome::Failed(FailureReason::Cancelled))
            }
            _ = shutdown.wait_for_shutdown() => Outcome::Failed(FailureReason::Cancelled),
        }
    }

    /// Waits for the response. None when the exchange failed.
    pub async fn response(self) -> Option<Message> {
        self.outcome().await.into_response()
    }

    /// Blocks the current thread until the response arrives. Must not be
    /// called from within an async context.
    pub fn blocking_response(self) -> Option<Message> {
        self.outcome
            .blocking_recv()
            .ok()
            .and_then(Outcome::into_response)
    }

    /// Calls `callback` with the outcome once the exchange ends, from a task
    /// of its own.
    pub fn on_response<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.outcome().await) })
    }

    /// Abandons the exchange. Every layer drops what it keeps for it and the
    /// outcome becomes [`FailureReason::Cancelled`].
    pub fn cancel(&self) {
        self.chain.cancel(Cancellation {
            exchange: self.exchange,
            peer: self.peer,
            token: None,
        });
    }
}

#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum StackError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Could not open the transport: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layers::MemoryNetwork, message::Code};

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let network = MemoryNetwork::new();
        let config = StackConfig {
            block_size: 100,
            ..Default::default()
        };
        let result = Stack::with_transport(
            StackKind::Default,
            config,
            network.attach("10.0.0.1:5683".parse().unwrap()),
        );
        assert!(matches!(
            result,
            Err(StackError::Config(ConfigError::BlockSize(100)))
        ));
    }

    #[tokio::test]
    async fn only_proxy_stacks_keep_statistics() {
        let network = MemoryNetwork::new();
        let server = Stack::with_transport(
            StackKind::Default,
            Default::default(),
            network.attach("10.0.0.1:5683".parse().unwrap()),
        )
        .unwrap();
        let proxy = Stack::with_transport(
            StackKind::Proxy,
            Default::default(),
            network.attach("10.0.0.2:5683".parse().unwrap()),
        )
        .unwrap();
        assert!(server.statistics().is_none());
        assert_eq!(proxy.statistics().unwrap().total(), 0);
        assert_eq!(proxy.kind(), StackKind::Proxy);
    }

    #[tokio::test]
    async fn no_sends_after_shutdown() {
        let network = MemoryNetwork::new();
        let stack = Stack::with_transport(
            StackKind::Default,
            Default::default(),
            network.attach("10.0.0.1:5683".parse().unwrap()),
        )
        .unwrap();
        stack.shutdown();
        let mut request = Message::request(
            crate::message::MessageType::Confirmable,
            crate::message::Method::Get,
        );
        request.peer = "10.0.0.2:5683".parse().unwrap();
        assert!(matches!(
            stack.send_request(request.clone()),
            Err(SendError::ShutDown)
        ));
        assert_eq!(
            stack.send(Message::response_to(&request, Code::CONTENT)),
            Err(SendError::ShutDown)
        );
    }

    #[tokio::test]
    async fn daemon_serves_until_shut_down() {
        let network = MemoryNetwork::new();
        let config = StackConfig {
            daemon: true,
            ..Default::default()
        };
        let stack = Stack::with_transport(
            StackKind::Default,
            config,
            network.attach("10.0.0.1:5683".parse().unwrap()),
        )
        .unwrap();
        let serving = stack.clone();
        let served = tokio::spawn(async move { serving.serve().await });
        tokio::task::yield_now().await;
        assert!(!served.is_finished());
        stack.shutdown();
        assert_eq!(served.await.unwrap(), ExitStatus::Exited);
    }
}
