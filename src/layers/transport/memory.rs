use super::{Inbound, Transport};
use crate::{layer::TransportError, FxDashMap, Shutdown};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};

type Mailbox = UnboundedSender<(Vec<u8>, SocketAddr)>;

/// An in-process datagram network.
///
/// Every datagram handed to the network is recorded, which lets tests see
/// exactly what crossed the wire and when. Delivery can be made unreliable
/// with a success rate; the random source is seeded so that runs repeat.
pub struct MemoryNetwork {
    endpoints: FxDashMap<SocketAddr, Mailbox>,
    /// A random number generator to determine delivery success
    rng: Mutex<SmallRng>,
    /// A number in the range [0, 1] to determine the frequency of successful
    /// delivery
    success_rate: f64,
    history: Mutex<Vec<Datagram>>,
}

/// A datagram seen by a [`MemoryNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
    pub at: Instant,
    /// False when the network dropped the datagram.
    pub delivered: bool,
}

impl MemoryNetwork {
    /// Creates a network that delivers every datagram.
    pub fn new() -> Arc<Self> {
        Self::unreliable(1.0)
    }

    /// Creates a network with the given delivery success rate in the range
    /// [0, 1].
    pub fn unreliable(success_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Default::default(),
            rng: Mutex::new(SmallRng::seed_from_u64(0xBAD5EED)),
            success_rate: success_rate.clamp(0.0, 1.0),
            history: Mutex::new(vec![]),
        })
    }

    /// Attaches a transport at `address`. Datagrams sent to it are buffered
    /// until a stack starts it, so an unstarted transport is a peer that
    /// never answers.
    pub fn attach(self: &Arc<Self>, address: SocketAddr) -> Arc<MemoryTransport> {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        self.endpoints.insert(address, mailbox);
        Arc::new(MemoryTransport {
            network: self.clone(),
            address,
            inbox: Mutex::new(Some(inbox)),
        })
    }

    /// Every datagram sent so far, in order.
    pub fn history(&self) -> Vec<Datagram> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Datagrams sent to `address`.
    pub fn sent_to(&self, address: SocketAddr) -> Vec<Datagram> {
        self.history()
            .into_iter()
            .filter(|datagram| datagram.to == address)
            .collect()
    }

    /// Datagrams sent from `address`.
    pub fn sent_from(&self, address: SocketAddr) -> Vec<Datagram> {
        self.history()
            .into_iter()
            .filter(|datagram| datagram.from == address)
            .collect()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        let mailbox = self
            .endpoints
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(to))?;
        let delivered = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.success_rate);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Datagram {
                from,
                to,
                bytes: bytes.to_vec(),
                at: Instant::now(),
                delivered,
            });
        if delivered && mailbox.send((bytes.to_vec(), from)).is_err() {
            // The receiving transport is gone, which on a real network looks
            // the same as a lost datagram.
            tracing::trace!(%from, %to, "Datagram sent to a closed endpoint");
        }
        Ok(())
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    address: SocketAddr,
    inbox: Mutex<Option<UnboundedReceiver<(Vec<u8>, SocketAddr)>>>,
}

impl Transport for MemoryTransport {
    fn send(&self, datagram: &[u8], peer: SocketAddr) -> Result<(), TransportError> {
        self.network.deliver(self.address, peer, datagram)
    }

    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn start(self: Arc<Self>, inbound: Inbound, mut shutdown: Shutdown) {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut inbox) = inbox else {
            tracing::error!(address = %self.address, "Memory transport started twice");
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    datagram = inbox.recv() => match datagram {
                        Some((bytes, peer)) => inbound.datagram(&bytes, peer),
                        None => break,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_drops() {
        let network = MemoryNetwork::new();
        let a: SocketAddr = "10.0.0.1:5683".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5683".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:5683".parse().unwrap();
        let transport = network.attach(a);
        let _sink = network.attach(b);
        transport.send(&[1, 2, 3], b).unwrap();
        assert_eq!(
            transport.send(&[4], c),
            Err(TransportError::Unreachable(c))
        );
        let history = network.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].bytes, vec![1, 2, 3]);
        assert!(history[0].delivered);
        assert_eq!(network.sent_to(b).len(), 1);
        assert_eq!(network.sent_from(b).len(), 0);
    }

    #[tokio::test]
    async fn lossy_delivery_is_repeatable() {
        let run = || {
            let network = MemoryNetwork::unreliable(0.5);
            let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
            let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
            let transport = network.attach(a);
            let _sink = network.attach(b);
            for _ in 0..32 {
                transport.send(&[0], b).unwrap();
            }
            network
                .history()
                .iter()
                .map(|datagram| datagram.delivered)
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|delivered| *delivered));
        assert!(first.iter().any(|delivered| !*delivered));
    }
}
