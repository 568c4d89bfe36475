//! Channel configuration.
//!
//! Provides [`ChannelConfig`] for the notification channel: endpoint,
//! credential placement in the handshake, reconnection policy, and frame
//! limits. All durations serialize as millisecond counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pulsegate_core::ChannelError;

// ---------------------------------------------------------------------------
// Serde helper: Duration as milliseconds
// ---------------------------------------------------------------------------

/// Serde helper that encodes a [`Duration`] as a `u64` millisecond count.
mod duration_millis {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Default helpers
// ---------------------------------------------------------------------------

/// Default handshake timeout: 10 seconds.
const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Default maximum inbound frame size: 1 MiB.
const fn default_max_message_size() -> usize {
    1024 * 1024
}

/// Default reconnect initial delay: 250 ms.
const fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

/// Default reconnect maximum delay: 30 seconds.
const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

/// Default exponential backoff multiplier.
const fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Default reconnect budget before entering `Failed`.
const fn default_max_retries() -> u32 {
    6
}

/// Returns `true` (used for `#[serde(default)]` on boolean fields).
const fn default_true() -> bool {
    true
}

/// Default query parameter name for the session credential.
fn default_credential_param() -> String {
    "token".to_string()
}

// ---------------------------------------------------------------------------
// Credential placement
// ---------------------------------------------------------------------------

/// Where the session credential is attached during the handshake.
///
/// The exact placement is an external-API contract; all three common shapes
/// are supported. The default is a query parameter, since the original
/// front end runs where websocket handshakes cannot carry custom headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CredentialPlacement {
    /// Append `?<name>=<token>` to the endpoint URL.
    QueryParam {
        /// Query parameter name.
        #[serde(default = "default_credential_param")]
        name: String,
    },
    /// Send the token in a request header.
    Header {
        /// Header name (e.g. `authorization`).
        name: String,
        /// Optional value prefix (e.g. `Bearer `).
        #[serde(default)]
        prefix: String,
    },
    /// Send a JSON auth message as the first frame after the handshake:
    /// `{"type": "auth", "token": "..."}`.
    FirstFrame,
}

impl Default for CredentialPlacement {
    fn default() -> Self {
        Self::QueryParam {
            name: default_credential_param(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect configuration
// ---------------------------------------------------------------------------

/// Reconnection settings for the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether automatic reconnection is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first reconnect attempt.
    #[serde(with = "duration_millis", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the computed delay.
    #[serde(with = "duration_millis", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Number of consecutive failed attempts before entering `Failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether to add deterministic jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: default_max_retries(),
            jitter: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Websocket endpoint (`ws://` or `wss://`).
    pub endpoint: String,

    /// Credential placement in the handshake.
    #[serde(default)]
    pub credential: CredentialPlacement,

    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Timeout for a single handshake attempt.
    #[serde(with = "duration_millis", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Maximum accepted inbound frame size in bytes. Larger frames are
    /// dropped with a warning.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl ChannelConfig {
    /// Creates a config for the given endpoint with default policies.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential: CredentialPlacement::default(),
            reconnect: ReconnectConfig::default(),
            handshake_timeout: default_handshake_timeout(),
            max_message_size: default_max_message_size(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the endpoint is empty or
    /// does not use a websocket scheme, or if the backoff multiplier is not
    /// greater than 1.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.endpoint.is_empty() {
            return Err(ChannelError::Configuration(
                "endpoint is required (ws:// or wss://)".into(),
            ));
        }
        if !is_websocket_url(&self.endpoint) {
            return Err(ChannelError::Configuration(format!(
                "endpoint '{}' must use a ws:// or wss:// scheme",
                self.endpoint
            )));
        }
        if self.reconnect.backoff_multiplier <= 1.0 {
            return Err(ChannelError::Configuration(
                "backoff_multiplier must be greater than 1".into(),
            ));
        }
        Ok(())
    }
}

/// Returns whether a URL uses a websocket scheme.
#[must_use]
pub fn is_websocket_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}
