use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error as ThisError;

/// The longest token the protocol allows.
pub const MAX_TOKEN_LEN: usize = 8;

/// An opaque identifier that correlates a response with its request,
/// independent of the message id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    bytes: [u8; MAX_TOKEN_LEN],
    len: u8,
}

impl Token {
    pub const EMPTY: Token = Token {
        bytes: [0; MAX_TOKEN_LEN],
        len: 0,
    };

    pub fn new(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(TokenError::TooLong(bytes.len()));
        }
        let mut token = Self::EMPTY;
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        token.len = bytes.len() as u8;
        Ok(token)
    }

    /// A four byte token holding `value` in big-endian order.
    pub fn from_u32(value: u32) -> Self {
        let mut token = Self::EMPTY;
        token.bytes[..4].copy_from_slice(&value.to_be_bytes());
        token.len = 4;
        token
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("--");
        }
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("Tokens are at most 8 bytes long, got {0}")]
    TooLong(usize),
}
