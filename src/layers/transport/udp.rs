use super::{Inbound, Transport};
use crate::{layer::TransportError, Shutdown};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

/// The largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65_535;

type Outbox = UnboundedSender<(Vec<u8>, SocketAddr)>;

/// A transport over a UDP socket.
///
/// Sends are queued and written by a task of their own, which waits for the
/// socket to become writable. A full socket buffer therefore delays a
/// datagram instead of failing its exchange.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    outbox: Outbox,
}

impl UdpTransport {
    /// Binds a socket on every interface. Port zero picks a free port.
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        Self::bind_to(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)).await
    }

    pub async fn bind_to(address: SocketAddr) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(address).await?);
        let local = socket.local_addr()?;
        tracing::info!(%local, "Bound UDP socket");
        let (outbox, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(socket.clone(), local, queued));
        Ok(Self {
            socket,
            local,
            outbox,
        })
    }
}

/// Writes queued datagrams until the transport is dropped.
async fn write_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    mut queued: UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((bytes, peer)) = queued.recv().await {
        match socket.send_to(&bytes, peer).await {
            Ok(sent) if sent == bytes.len() => {}
            Ok(sent) => {
                tracing::warn!(%local, %peer, "Only {sent} of {} bytes were sent", bytes.len())
            }
            // Lost like any other datagram; retransmission recovers
            Err(e) => tracing::warn!(%local, %peer, "UDP send failed: {}", e),
        }
    }
    tracing::debug!(%local, "UDP write loop stopped");
}

impl Transport for UdpTransport {
    fn send(&self, datagram: &[u8], peer: SocketAddr) -> Result<(), TransportError> {
        self.outbox
            .send((datagram.to_vec(), peer))
            .map_err(|_| TransportError::Closed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn start(self: Arc<Self>, inbound: Inbound, mut shutdown: Shutdown) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, peer)) => inbound.datagram(&buffer[..len], peer),
                        Err(e) => {
                            // Some platforms report ICMP errors from earlier
                            // sends here; the socket stays usable.
                            tracing::warn!(local = %self.local, "UDP receive failed: {}", e);
                        }
                    },
                }
            }
            tracing::debug!(local = %self.local, "UDP receive loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_datagrams_are_written_in_order() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();
        let transport = UdpTransport::bind_to("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // Queued faster than the writer drains them, none of them fail
        for i in 0..100u8 {
            transport.send(&[i; 16], to).unwrap();
        }

        let mut buffer = [0u8; 64];
        for i in 0..100u8 {
            let (len, from) = peer.recv_from(&mut buffer).await.unwrap();
            assert_eq!(from, transport.local_addr());
            assert_eq!(&buffer[..len], &[i; 16]);
        }
    }
}
