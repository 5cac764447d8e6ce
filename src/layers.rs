//! The layers a [`Stack`](crate::Stack) is assembled from, listed here from
//! the top of a proxy stack to the bottom.

pub mod caching;
pub use caching::CachingLayer;

pub mod proxy;
pub use proxy::{ProxyLayer, ProxyStatistics};

pub mod matching;
pub use matching::MatchingLayer;

pub mod token;
pub use token::TokenLayer;

pub mod transfer;
pub use transfer::TransferLayer;

pub mod rate_control;
pub use rate_control::RateControlLayer;

pub mod transaction;
pub use transaction::{Reliability, TransactionLayer};

pub mod transport;
pub use transport::{
    Datagram, MemoryNetwork, MemoryTransport, SharedTransport, Transport, TransportLayer,
    UdpTransport,
};

#[cfg(test)]
pub(crate) mod testing;
