use std::fmt::{self, Display, Formatter};
use thiserror::Error as ThisError;

/// The code of a message, written as `class.detail` (for example 2.05).
///
/// Class 0 holds the request methods and the empty message; classes 2, 4,
/// and 5 hold response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
    pub const GATEWAY_TIMEOUT: Code = Code::new(5, 4);
    pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 5);

    /// Creates a code from its class (0-7) and detail (0-31).
    pub const fn new(class: u8, detail: u8) -> Self {
        Self((class << 5) | (detail & 0x1f))
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn to_byte(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub const fn is_response(self) -> bool {
        matches!(self.class(), 2..=5)
    }

    /// Whether this is a 2.xx code.
    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A request method.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

impl Method {
    /// Whether responses to this method may be served from a cache.
    pub fn is_safe(self) -> bool {
        self == Method::Get
    }
}

impl From<Method> for Code {
    fn from(method: Method) -> Self {
        Code::new(0, method as u8)
    }
}

impl TryFrom<Code> for Method {
    type Error = CodeError;

    fn try_from(code: Code) -> Result<Self, Self::Error> {
        match (code.class(), code.detail()) {
            (0, 1) => Ok(Self::Get),
            (0, 2) => Ok(Self::Post),
            (0, 3) => Ok(Self::Put),
            (0, 4) => Ok(Self::Delete),
            _ => Err(CodeError::NotAMethod(code)),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum CodeError {
    #[error("The code {0} is not a request method")]
    NotAMethod(Code),
}
