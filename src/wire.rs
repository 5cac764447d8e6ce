//! Serialization of messages to and from datagrams, following the layout in
//! RFC 7252, section 3.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::message::{
    Code, Message, MessageType, OptionNumber, Options, Payload, Token, MAX_TOKEN_LEN,
};
use std::net::SocketAddr;
use thiserror::Error as ThisError;

const VERSION: u8 = 1;
const HEADER_OCTETS: usize = 4;
const PAYLOAD_MARKER: u8 = 0xff;

/// Nibble values announcing an extended option delta or length.
const EXTEND_BYTE: u8 = 13;
const EXTEND_WORD: u8 = 14;
const RESERVED: u8 = 15;

const BYTE_OFFSET: usize = 13;
const WORD_OFFSET: usize = 269;
const MAX_EXTENDED: usize = WORD_OFFSET + u16::MAX as usize;

/// Serializes a message into a datagram.
pub fn encode(message: &Message) -> Result<Vec<u8>, BuildError> {
    let mut out = Vec::with_capacity(HEADER_OCTETS + message.token.len() + message.payload.len() + 16);
    out.push(VERSION << 6 | message.kind.to_bits() << 4 | message.token.len() as u8);
    out.push(message.code.to_byte());
    out.extend_from_slice(&message.mid.to_be_bytes());
    out.extend_from_slice(message.token.as_slice());

    let mut previous = 0usize;
    for option in message.options.iter() {
        let delta = option.number.0 as usize - previous;
        let len = option.value.len();
        if len > MAX_EXTENDED {
            return Err(BuildError::OptionTooLong(option.number));
        }
        let (delta_nibble, delta_ext) = split_extended(delta);
        let (len_nibble, len_ext) = split_extended(len);
        out.push(delta_nibble << 4 | len_nibble);
        out.extend_from_slice(&delta_ext);
        out.extend_from_slice(&len_ext);
        out.extend_from_slice(&option.value);
        previous = option.number.0 as usize;
    }

    if !message.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend(message.payload.iter());
    }
    Ok(out)
}

/// Splits an option delta or length into its nibble and extended bytes.
fn split_extended(value: usize) -> (u8, Vec<u8>) {
    if value < BYTE_OFFSET {
        (value as u8, vec![])
    } else if value < WORD_OFFSET {
        (EXTEND_BYTE, vec![(value - BYTE_OFFSET) as u8])
    } else {
        let extended = (value - WORD_OFFSET) as u16;
        (EXTEND_WORD, extended.to_be_bytes().to_vec())
    }
}

/// Parses a datagram received from `peer`.
pub fn decode(datagram: &[u8], peer: SocketAddr) -> Result<Message, ParseError> {
    const TS: ParseError = ParseError::TooShort;

    let mut bytes = datagram.iter().cloned();
    let first = bytes.next_u8().ok_or(TS)?;
    let version = first >> 6;
    if version != VERSION {
        Err(ParseError::BadVersion(version))?
    }
    let kind = MessageType::from_bits(first >> 4);
    let token_len = (first & 0x0f) as usize;
    let code = Code::from_byte(bytes.next_u8().ok_or(TS)?);
    let mid = bytes.next_u16_be().ok_or(TS)?;
    if token_len > MAX_TOKEN_LEN {
        Err(ParseError::TokenTooLong(token_len as u8))?
    }
    let token_bytes = bytes.next_vec(token_len).ok_or(ParseError::TruncatedToken)?;
    let token = Token::new(&token_bytes).map_err(|_| ParseError::TokenTooLong(token_len as u8))?;

    let malformed = |problem| ParseError::MalformedOptions { kind, mid, problem };

    let mut options = Options::new();
    let mut number = 0usize;
    let mut payload = Payload::empty();
    while let Some(byte) = bytes.next_u8() {
        if byte == PAYLOAD_MARKER {
            let rest: Vec<u8> = bytes.by_ref().collect();
            if rest.is_empty() {
                Err(malformed(OptionProblem::EmptyPayload))?
            }
            payload = Payload::new(rest);
            break;
        }
        let delta = read_extended(byte >> 4, &mut bytes).map_err(malformed)?;
        let len = read_extended(byte & 0x0f, &mut bytes).map_err(malformed)?;
        number += delta;
        let number = u16::try_from(number).map_err(|_| malformed(OptionProblem::NumberTooLarge))?;
        let value = bytes
            .next_vec(len)
            .ok_or_else(|| malformed(OptionProblem::Truncated))?;
        options.push(OptionNumber(number), value);
    }

    let mut message = Message::new(kind, code);
    message.mid = mid;
    message.token = token;
    message.options = options;
    message.payload = payload;
    message.peer = peer;
    Ok(message)
}

fn read_extended(
    nibble: u8,
    bytes: &mut impl Iterator<Item = u8>,
) -> Result<usize, OptionProblem> {
    match nibble {
        EXTEND_BYTE => Ok(bytes.next_u8().ok_or(OptionProblem::Truncated)? as usize + BYTE_OFFSET),
        EXTEND_WORD => {
            Ok(bytes.next_u16_be().ok_or(OptionProblem::Truncated)? as usize + WORD_OFFSET)
        }
        RESERVED => Err(OptionProblem::ReservedNibble),
        small => Ok(small as usize),
    }
}

/// Reads big-endian values from a byte iterator.
pub(crate) trait BytesExt: Iterator<Item = u8> {
    /// Advances the iterator and returns the next value.
    fn next_u8(&mut self) -> Option<u8> {
        self.next()
    }

    /// Advances the iterator by 2 bytes.
    /// Combines these 2 bytes in big-endian order into a u16.
    /// Returns None if there were fewer than 2 bytes left in the iterator.
    fn next_u16_be(&mut self) -> Option<u16> {
        let arr = [self.next()?, self.next()?];
        Some(u16::from_be_bytes(arr))
    }

    /// Collects the next `n` bytes. Returns `None` if there were fewer than
    /// `n` bytes left in the iterator.
    fn next_vec(&mut self, n: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next()?);
        }
        Some(out)
    }
}

impl<T: Iterator<Item = u8>> BytesExt for T {}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute a message header")]
    TooShort,
    #[error("Unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("Token length {0} exceeds the maximum of 8")]
    TokenTooLong(u8),
    #[error("The datagram ended inside the token")]
    TruncatedToken,
    /// The header parsed but the options did not. The type and message id are
    /// kept so that the sender can be told with a Reset.
    #[error("Malformed options in {kind} message {mid}: {problem}")]
    MalformedOptions {
        kind: MessageType,
        mid: u16,
        problem: OptionProblem,
    },
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum OptionProblem {
    #[error("reserved nibble 15 used")]
    ReservedNibble,
    #[error("option truncated")]
    Truncated,
    #[error("option number out of range")]
    NumberTooLarge,
    #[error("payload marker without payload")]
    EmptyPayload,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("Option {0} has a value longer than can be encoded")]
    OptionTooLong(OptionNumber),
}
