//! Construction-time settings for a [`Stack`](crate::Stack).

use std::time::Duration;
use thiserror::Error as ThisError;

/// What the rate control layer does with requests over the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RatePolicy {
    /// Hold excess requests until a later window has room.
    #[default]
    Queue,
    /// Fail excess requests with [`SendError::RateLimited`](crate::SendError::RateLimited).
    Reject,
}

/// Settings consumed by a stack and its layers.
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    /// Names the stack in logs.
    pub name: String,
    /// The UDP port to listen on. Zero picks a free port.
    pub port: u16,
    /// The largest payload sent in a single message. Larger payloads are
    /// split into blocks. Zero turns outbound splitting off.
    pub block_size: usize,
    /// Whether [`Stack::serve`](crate::Stack::serve) ignores Ctrl-C and runs
    /// until the stack is shut down explicitly.
    pub daemon: bool,
    /// The most requests sent per second. Zero turns throttling off.
    pub requests_per_second: u32,
    pub rate_policy: RatePolicy,
    /// The port the forwarding stack of a proxy listens on.
    pub proxy_port: u16,
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// How long a confirmable request may wait for its response before it
    /// is acknowledged on its own.
    pub ack_delay: Duration,
    /// How long to wait for a response after an empty acknowledgement, or
    /// after sending a non-confirmable request.
    pub response_timeout: Duration,
    /// How long message ids and partial transfers are remembered.
    pub exchange_lifetime: Duration,
    pub max_block_retries: u32,
    pub cache_capacity: usize,
    /// Freshness of a cached response that carries no Max-Age.
    pub default_max_age: Duration,
}

pub const DEFAULT_PORT: u16 = 5683;
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const ACK_RANDOM_FACTOR: f64 = 1.5;
pub const MAX_RETRANSMIT: u32 = 4;
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);
pub const NON_LIFETIME: Duration = Duration::from_secs(145);
/// The most retransmissions a stack can be configured to make.
pub const MAX_RETRANSMIT_LIMIT: u32 = 16;
/// The longest any single timer of a stack may run.
pub const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "coap".into(),
            port: DEFAULT_PORT,
            block_size: 0,
            daemon: false,
            requests_per_second: 0,
            rate_policy: RatePolicy::Queue,
            proxy_port: 0,
            ack_timeout: ACK_TIMEOUT,
            ack_random_factor: ACK_RANDOM_FACTOR,
            max_retransmit: MAX_RETRANSMIT,
            ack_delay: Duration::from_secs(1),
            response_timeout: NON_LIFETIME,
            exchange_lifetime: EXCHANGE_LIFETIME,
            max_block_retries: 3,
            cache_capacity: 256,
            default_max_age: Duration::from_secs(60),
        }
    }
}

impl StackConfig {
    /// The configuration of the forwarding stack paired with this one in a
    /// proxy: the same settings, listening on `proxy_port`.
    pub fn proxy(&self) -> Self {
        Self {
            name: format!("{}-proxy", self.name),
            port: self.proxy_port,
            ..self.clone()
        }
    }

    /// Checks that the settings can be used to build a stack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size != 0 && !(16..=1024).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.block_size != 0 && !self.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if !(self.ack_random_factor.is_finite() && self.ack_random_factor >= 1.0) {
            return Err(ConfigError::RandomFactor(self.ack_random_factor));
        }
        if self.max_retransmit > MAX_RETRANSMIT_LIMIT {
            return Err(ConfigError::MaxRetransmit(self.max_retransmit));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("ack_timeout"));
        }
        if self.exchange_lifetime.is_zero() {
            return Err(ConfigError::ZeroTimeout("exchange_lifetime"));
        }
        // The last retransmission waits the longest
        let last_wait = self
            .ack_timeout
            .checked_mul(1 << self.max_retransmit)
            .and_then(|wait| Duration::try_from_secs_f64(wait.as_secs_f64() * self.ack_random_factor).ok());
        if !last_wait.is_some_and(|wait| wait <= MAX_TIMER) {
            return Err(ConfigError::TooLong("retransmission backoff"));
        }
        for (name, timeout) in [
            ("ack_delay", self.ack_delay),
            ("response_timeout", self.response_timeout),
            ("exchange_lifetime", self.exchange_lifetime),
            ("default_max_age", self.default_max_age),
        ] {
            if timeout > MAX_TIMER {
                return Err(ConfigError::TooLong(name));
            }
        }
        Ok(())
    }

    /// The largest time from the first transmission of a confirmable message
    /// to its last retransmission.
    pub fn max_transmit_span(&self) -> Duration {
        self.ack_timeout
            .mul_f64(((1u64 << self.max_retransmit) - 1) as f64 * self.ack_random_factor)
    }
}

#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Block size {0} is not a power of two between 16 and 1024")]
    BlockSize(usize),
    #[error("ACK random factor {0} is below 1")]
    RandomFactor(f64),
    #[error("At most {MAX_RETRANSMIT_LIMIT} retransmissions are supported, not {0}")]
    MaxRetransmit(u32),
    #[error("{0} must not be zero")]
    ZeroTimeout(&'static str),
    #[error("{0} may not exceed a day")]
    TooLong(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StackConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.max_transmit_span(), Duration::from_secs(45));
    }

    #[test]
    fn proxy_config() {
        let config = StackConfig {
            proxy_port: 6000,
            ..Default::default()
        };
        let proxy = config.proxy();
        assert_eq!(proxy.port, 6000);
        assert_eq!(proxy.name, "coap-proxy");
        assert_eq!(proxy.requests_per_second, config.requests_per_second);
    }

    #[test]
    fn throttling_is_off_by_default() {
        assert_eq!(StackConfig::default().requests_per_second, 0);
    }

    #[test]
    fn rejects_bad_values() {
        let bad_block = StackConfig {
            block_size: 100,
            ..Default::default()
        };
        assert_eq!(bad_block.validate(), Err(ConfigError::BlockSize(100)));
        let bad_factor = StackConfig {
            ack_random_factor: 0.5,
            ..Default::default()
        };
        assert_eq!(bad_factor.validate(), Err(ConfigError::RandomFactor(0.5)));
        let infinite_factor = StackConfig {
            ack_random_factor: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(
            infinite_factor.validate(),
            Err(ConfigError::RandomFactor(_))
        ));
        let nan_factor = StackConfig {
            ack_random_factor: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(nan_factor.validate(), Err(ConfigError::RandomFactor(_))));
    }

    #[test]
    fn rejects_unbounded_timers() {
        let retries = StackConfig {
            max_retransmit: 64,
            ..Default::default()
        };
        assert_eq!(retries.validate(), Err(ConfigError::MaxRetransmit(64)));
        let backoff = StackConfig {
            ack_timeout: Duration::from_secs(3600),
            max_retransmit: 16,
            ..Default::default()
        };
        assert_eq!(
            backoff.validate(),
            Err(ConfigError::TooLong("retransmission backoff"))
        );
        let huge_factor = StackConfig {
            ack_random_factor: 1e300,
            ..Default::default()
        };
        assert_eq!(
            huge_factor.validate(),
            Err(ConfigError::TooLong("retransmission backoff"))
        );
        let lifetime = StackConfig {
            exchange_lifetime: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(
            lifetime.validate(),
            Err(ConfigError::TooLong("exchange_lifetime"))
        );
        let most = StackConfig {
            max_retransmit: MAX_RETRANSMIT_LIMIT,
            ack_timeout: Duration::from_secs(1),
            ack_random_factor: 1.0,
            ..Default::default()
        };
        assert_eq!(most.validate(), Ok(()));
    }
}
