//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PublicKey;

/// Time allowed for the session-level Noise handshake over a fresh TCP connection.
pub const SESSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of a listener's accept queue.
pub const ACCEPT_BUFFER_SIZE: usize = 20;

/// First port handed out by ephemeral reservation.
pub const PORTER_MIN_EPHEMERAL: u16 = 49152;

/// Number of recent nonces remembered by a session decryptor.
pub const NONCE_WINDOW: u64 = 1024;

/// How a responder (or relay) treats stream request timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayProtection {
    /// Reject exact replays and requests older than the replay window behind
    /// the newest accepted request from the same source key. Requests within
    /// the window may arrive in any order.
    #[default]
    Window,
    /// Reject requests whose timestamp is not strictly newer than the last
    /// accepted request from the same source key.
    Strict,
    /// Only require a positive timestamp.
    Disabled,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "millis")]
    pub initial: Duration,
    /// Zero means no upper bound.
    #[serde(with = "millis")]
    pub max: Duration,
    pub factor: f64,
}

impl BackoffConfig {
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60), 1.3)
    }
}

/// Retry policy for discovery calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(flatten)]
    pub backoff: BackoffConfig,
    /// Zero means retry until cancelled.
    #[serde(default)]
    pub tries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(20), 1.3),
            tries: 0,
        }
    }
}

/// Client entity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sessions to keep open with relays. Zero means "every available relay".
    pub min_sessions: usize,

    /// How often discovery is consulted again when no session was lost
    #[serde(with = "millis")]
    pub update_interval: Duration,

    /// Delay between failed attempts to establish relay sessions
    pub backoff: BackoffConfig,

    /// Deadline for the stream handshake
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,

    pub replay_protection: ReplayProtection,

    /// Only ever connect to this relay
    pub preferred_server: Option<PublicKey>,

    /// Retry policy for discovery lookups
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            update_interval: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
            handshake_timeout: Duration::from_secs(20),
            replay_protection: ReplayProtection::default(),
            preferred_server: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised session capacity
    pub max_sessions: usize,

    #[serde(with = "millis")]
    pub update_interval: Duration,

    /// Deadline for reading a stream request and forwarding its response
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,

    pub replay_protection: ReplayProtection,

    /// Concurrent relayed streams allowed per session. Zero means unlimited.
    pub max_streams_per_session: usize,

    pub retry: RetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            update_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(20),
            replay_protection: ReplayProtection::default(),
            max_streams_per_session: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
