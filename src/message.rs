//! The messages that travel through a [`Stack`](crate::Stack).
//!
//! A [`Message`] is a plain value. Whichever layer currently holds one may
//! change it before passing it on, and a layer that needs to remember a
//! message (for retransmission, deduplication, or caching) keeps a clone.
//! Payloads are shared rather than copied, so those clones stay cheap.

use crate::id::ExchangeId;
use std::{
    fmt::{self, Display, Formatter},
    net::{Ipv4Addr, SocketAddr},
};

mod chunk;
pub use chunk::Chunk;

mod payload;
pub use payload::{Payload, PayloadBytes};

mod code;
pub use code::{Code, CodeError, Method};

mod options;
pub use options::{CoapOption, OptionNumber, Options};

mod token;
pub use token::{Token, TokenError, MAX_TOKEN_LEN};

mod uri;
pub use uri::{normalize_uri, ParsedUri, UriError, COAP_SCHEME, DEFAULT_PORT};

/// The address used by messages that have not been given a peer yet.
pub const NO_PEER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Whether a message must be acknowledged and how it relates to others.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    pub fn to_bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        };
        f.write_str(name)
    }
}

/// Identifies the request a response answers, so that the transaction
/// layer can decide between piggybacking and a separate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    pub mid: u16,
    pub kind: MessageType,
}

/// A single CoAP message along with the bookkeeping the stack attaches to it.
///
/// `exchange` and `reply_to` never go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub code: Code,
    pub mid: u16,
    pub token: Token,
    pub options: Options,
    pub payload: Payload,
    /// The remote endpoint: the destination of an outgoing message or the
    /// source of an incoming one.
    pub peer: SocketAddr,
    /// The local exchange this message belongs to, if any.
    pub exchange: Option<ExchangeId>,
    pub reply_to: Option<ReplyTo>,
}

impl Message {
    pub fn new(kind: MessageType, code: Code) -> Self {
        Self {
            kind,
            code,
            mid: 0,
            token: Token::EMPTY,
            options: Options::new(),
            payload: Payload::empty(),
            peer: NO_PEER,
            exchange: None,
            reply_to: None,
        }
    }

    /// Creates a request without a target. Use [`Message::set_uri`] or set
    /// the peer and options directly before sending it.
    pub fn request(kind: MessageType, method: Method) -> Self {
        Self::new(kind, method.into())
    }

    /// Creates an empty message, as used for acknowledgements, resets and
    /// pings.
    pub fn empty(kind: MessageType, mid: u16, peer: SocketAddr) -> Self {
        let mut message = Self::new(kind, Code::EMPTY);
        message.mid = mid;
        message.peer = peer;
        message
    }

    /// Creates a response addressed to the sender of `request`.
    pub fn response_to(request: &Message, code: Code) -> Self {
        let kind = match request.kind {
            MessageType::NonConfirmable => MessageType::NonConfirmable,
            _ => MessageType::Confirmable,
        };
        let mut response = Self::new(kind, code);
        response.token = request.token;
        response.peer = request.peer;
        response.exchange = request.exchange;
        response.reply_to = Some(ReplyTo {
            mid: request.mid,
            kind: request.kind,
        });
        response
    }

    /// Turns this response into the answer to `request`, as if it had come
    /// back in the acknowledgement of a confirmable request.
    pub fn readdress(&mut self, request: &Message) {
        self.kind = match request.kind {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        self.mid = request.mid;
        self.token = request.token;
        self.peer = request.peer;
        self.exchange = request.exchange;
        self.reply_to = Some(ReplyTo {
            mid: request.mid,
            kind: request.kind,
        });
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn is_confirmable(&self) -> bool {
        self.kind == MessageType::Confirmable
    }

    pub fn method(&self) -> Option<Method> {
        Method::try_from(self.code).ok()
    }

    pub fn has_peer(&self) -> bool {
        self.peer != NO_PEER
    }

    /// Points this request at `uri`, replacing its peer and every option
    /// that addressed the previous target.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), UriError> {
        let parsed = ParsedUri::parse(uri)?;
        self.set_target(&parsed);
        Ok(())
    }

    /// Like [`Message::set_uri`] with a URI that was already parsed.
    pub fn set_target(&mut self, uri: &ParsedUri) {
        for number in [
            OptionNumber::URI_HOST,
            OptionNumber::URI_PORT,
            OptionNumber::URI_PATH,
            OptionNumber::URI_QUERY,
        ] {
            self.options.remove(number);
        }
        self.peer = uri.peer;
        if let Some(host) = &uri.host {
            self.options.set(OptionNumber::URI_HOST, host.as_bytes());
        }
        if let Some(port) = uri.port {
            self.options.set_uint(OptionNumber::URI_PORT, port as u32);
        }
        for segment in uri.path.iter() {
            self.options.push(OptionNumber::URI_PATH, segment.as_bytes());
        }
        for item in uri.query.iter() {
            self.options.push(OptionNumber::URI_QUERY, item.as_bytes());
        }
    }

    /// The request path, starting with a slash.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.options.get_all(OptionNumber::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Reassembles the full target of this request from its peer and options.
    pub fn uri(&self) -> String {
        let host = match self.options.get_str(OptionNumber::URI_HOST) {
            Some(host) => host.to_string(),
            None => match self.peer.ip() {
                std::net::IpAddr::V4(address) => address.to_string(),
                std::net::IpAddr::V6(address) => format!("[{address}]"),
            },
        };
        let port = self
            .options
            .get_uint(OptionNumber::URI_PORT)
            .map(|port| port as u16)
            .unwrap_or(self.peer.port());
        let mut uri = format!("{COAP_SCHEME}://{host}");
        if port != DEFAULT_PORT {
            uri.push_str(&format!(":{port}"));
        }
        uri.push_str(&self.uri_path());
        let query: Vec<_> = self
            .options
            .get_all(OptionNumber::URI_QUERY)
            .map(String::from_utf8_lossy)
            .collect();
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.join("&"));
        }
        uri
    }

    pub fn proxy_uri(&self) -> Option<&str> {
        self.options.get_str(OptionNumber::PROXY_URI)
    }

    pub fn set_proxy_uri(&mut self, uri: &str) {
        self.options.set(OptionNumber::PROXY_URI, uri.as_bytes());
    }

    /// The freshness lifetime in seconds a response declares, if any.
    pub fn max_age(&self) -> Option<u32> {
        self.options.get_uint(OptionNumber::MAX_AGE)
    }

    pub fn set_token(&mut self, token: &[u8]) -> Result<(), TokenError> {
        self.token = Token::new(token)?;
        Ok(())
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mid={} token={} peer={} len={}",
            self.kind,
            self.code,
            self.mid,
            self.token,
            self.peer,
            self.payload.len()
        )
    }
}
