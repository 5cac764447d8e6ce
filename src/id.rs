use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifies one logical request/response interaction within a stack.
///
/// Exchange ids never leave the process. They tie together the state that
/// different layers keep for the same exchange, even when its token or
/// message ids change along the way (as they do when a proxy forwards it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Creates an exchange ID with the given number.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for ExchangeId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl From<ExchangeId> for u64 {
    fn from(id: ExchangeId) -> Self {
        id.0
    }
}

impl Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out exchange ids that are unique for the lifetime of a stack.
#[derive(Debug, Default)]
pub struct ExchangeIds(AtomicU64);

impl ExchangeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ExchangeId {
        ExchangeId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
