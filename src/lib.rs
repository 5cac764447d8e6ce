//! A layered CoAP stack with a forwarding proxy.
//!
//! Every message a [`Stack`] sends or receives passes through an ordered
//! list of [`Layer`](layer::Layer)s. Outgoing messages enter at the top and
//! leave through the transport at the bottom; incoming datagrams take the
//! opposite way. Each layer owns one concern:
//!
//! - [`MatchingLayer`](layers::MatchingLayer) drops duplicates and lets
//!   through only responses to exchanges still outstanding
//! - [`TokenLayer`](layers::TokenLayer) gives each request a token no other
//!   outstanding request uses
//! - [`TransferLayer`](layers::TransferLayer) splits and reassembles large
//!   bodies block by block
//! - [`RateControlLayer`](layers::RateControlLayer) caps the outbound request
//!   rate
//! - [`TransactionLayer`](layers::TransactionLayer) acknowledges and
//!   retransmits confirmable messages
//! - [`TransportLayer`](layers::TransportLayer) encodes messages and performs
//!   the I/O
//!
//! A proxy stack adds a [`CachingLayer`](layers::CachingLayer) and a
//! [`ProxyLayer`](layers::ProxyLayer) on top, which forward requests carrying
//! a Proxy-Uri option and translate the responses back. A
//! [`ProxyEndpoint`] pairs such a stack with a server stack that clients
//! talk to.
//!
//! Requests are sent with [`Stack::send_request`], which returns a
//! [`ResponseHandle`] to await or subscribe to. Received requests go to the
//! stack's [`Receiver`].

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub mod config;
pub use config::{ConfigError, RatePolicy, StackConfig};

pub mod endpoint;
pub use endpoint::{Dispatcher, ProxyEndpoint, Receiver, Responder};

mod id;
pub use id::ExchangeId;

pub mod layer;
pub use layer::{FailureReason, Outcome, ReceiveError, SendError, TransportError};

pub mod layers;

pub mod logging;

pub mod message;
pub use message::{Code, Message, MessageType, Method, Payload, Token};

pub mod shutdown;
pub use shutdown::{ExitStatus, Shutdown};

mod stack;
pub use stack::{ResponseHandle, Stack, StackError, StackKind};

mod timer;

pub mod wire;

pub(crate) type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;
