//! Runtime configuration for the router and its connections.
//!
//! Every value has a default suitable for a single-node deployment, and each
//! can be overridden from the environment with [`HubConfig::from_env`].

use std::time::Duration;
use thiserror::Error;

/// Default Redis URL used when `REDIS_URL` is not set.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";

/// Error raised when an environment variable holds a value that cannot be parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("{key} must be at most {max}")]
    TooLarge { key: &'static str, max: u64 },
}

/// Upper bound for every timing knob, in seconds (one day).
const MAX_WAIT_SECS: u64 = 24 * 60 * 60;
/// Upper bound for queue capacities and the inbound message size.
const MAX_SIZE: u64 = 1 << 30;

/// Tunables shared by the router, its connections and the presence store.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connection string for the Redis presence store.
    pub redis_url: String,
    /// Deadline for a single socket write (data frame, ping or close).
    pub write_wait: Duration,
    /// How long a connection may stay silent before its next read times out.
    /// Only a pong from the peer extends this window.
    pub pong_wait: Duration,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// Capacity of the router's inbound command channel.
    pub inbound_capacity: usize,
    /// Lifetime of a typing marker.
    pub typing_ttl: Duration,
    /// How long a relayed message may wait for room in a full outbound queue.
    pub relay_enqueue_wait: Duration,
    /// Interval of the expired typing marker sweep.
    pub typing_sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            max_message_bytes: 512 * 1024,
            send_queue_capacity: 256,
            inbound_capacity: 256,
            typing_ttl: Duration::from_secs(10),
            relay_enqueue_wait: Duration::from_millis(1000),
            typing_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl HubConfig {
    /// Builds a config from process environment variables, falling back to
    /// [`HubConfig::default`] for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &'static str, fallback: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_bounded(&lookup, key, MAX_WAIT_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(fallback))
        };
        let size = |key: &'static str, fallback: usize| -> Result<usize, ConfigError> {
            Ok(parse_bounded(&lookup, key, MAX_SIZE)?
                .map(|v| v as usize)
                .unwrap_or(fallback))
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            write_wait: secs("WS_WRITE_WAIT_SECS", defaults.write_wait)?,
            pong_wait: secs("WS_PONG_WAIT_SECS", defaults.pong_wait)?,
            max_message_bytes: size("WS_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
            send_queue_capacity: size("WS_SEND_QUEUE_CAPACITY", defaults.send_queue_capacity)?,
            inbound_capacity: size("HUB_INBOUND_CAPACITY", defaults.inbound_capacity)?,
            typing_ttl: secs("TYPING_TTL_SECS", defaults.typing_ttl)?,
            relay_enqueue_wait: parse_bounded(&lookup, "RELAY_ENQUEUE_WAIT_MS", MAX_WAIT_SECS * 1000)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.relay_enqueue_wait),
            typing_sweep_interval: secs("TYPING_SWEEP_SECS", defaults.typing_sweep_interval)?,
        })
    }

    /// Interval between keepalive pings. Always shorter than `pong_wait` so the
    /// peer's pong can land before the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

fn parse_bounded<F>(lookup: &F, key: &'static str, max: u64) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.clone(),
    })?;
    if value == 0 {
        return Err(ConfigError::Zero { key });
    }
    if value > max {
        return Err(ConfigError::TooLarge { key, max });
    }
    Ok(Some(value))
}
