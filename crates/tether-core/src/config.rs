//! Centralized configuration for the tether crates
//!
//! The embedding application supplies these values once at startup. Defaults
//! carry the production constants; `testing()` presets shrink every timer to
//! milliseconds so integration tests run quickly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::envelope::MAX_FRAME_SIZE;
use crate::errors::{Result, TetherError};

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Reconnect delay schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay used after foreground transitions and network-transition errors
    pub immediate_delay: Duration,
    /// First backoff step
    pub base_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Upper bound on any backoff delay, jitter included
    pub max_delay: Duration,
    /// Random jitter added on top of the exponential step
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            immediate_delay: Duration::from_millis(250),
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(24),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// Socket and liveness settings for the client transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Server websocket URL
    pub url: String,
    /// Connection timeout on a normal network
    pub connect_timeout: Duration,
    /// Connection timeout when the attempt was triggered by foregrounding
    pub foreground_connect_timeout: Duration,
    /// Connection timeout on a constrained network
    pub constrained_connect_timeout: Duration,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Pong deadline for a liveness ping
    pub pong_timeout: Duration,
    /// Pong deadline when verifying a connection after foregrounding
    pub fast_ping_timeout: Duration,
    /// Consecutive missed pongs before the socket is torn down
    pub max_ping_failures: u32,
    /// How long a backgrounded app keeps its socket
    pub background_grace: Duration,
    /// Deadline for a single socket write before the socket is treated as dead
    pub send_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl TransportConfig {
    pub fn new<T: Into<String>>(url: T) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            foreground_connect_timeout: Duration::from_secs(5),
            constrained_connect_timeout: Duration::from_secs(20),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
            fast_ping_timeout: Duration::from_secs(2),
            max_ping_failures: 3,
            background_grace: Duration::from_secs(25),
            send_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Millisecond-scale timings for tests
    pub fn testing<T: Into<String>>(url: T) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_millis(500),
            foreground_connect_timeout: Duration::from_millis(300),
            constrained_connect_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(100),
            fast_ping_timeout: Duration::from_millis(50),
            max_ping_failures: 3,
            background_grace: Duration::from_millis(100),
            send_timeout: Duration::from_millis(200),
            reconnect: ReconnectConfig {
                immediate_delay: Duration::from_millis(10),
                base_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_delay: Duration::from_millis(200),
                max_jitter: Duration::from_millis(5),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url)
            .map_err(|e| TetherError::config_error(format!("invalid url {}: {}", self.url, e)))?;
        if self.pong_timeout >= self.ping_interval {
            return Err(TetherError::config_error(
                "pong_timeout must be shorter than ping_interval",
            ));
        }
        if self.max_ping_failures == 0 {
            return Err(TetherError::config_error("max_ping_failures must be at least 1"));
        }
        if self.send_timeout.is_zero() {
            return Err(TetherError::config_error("send_timeout must be non-zero"));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(TetherError::config_error(
                "reconnect.max_delay must not be below reconnect.base_delay",
            ));
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(TetherError::config_error(
                "reconnect.multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

/// RPC runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Optional per-call deadline; calls wait indefinitely when unset
    pub rpc_timeout: Option<Duration>,
}

/// Everything a client needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub runtime: RuntimeConfig,
}

impl ClientConfig {
    pub fn new<T: Into<String>>(url: T) -> Self {
        Self {
            transport: TransportConfig::new(url),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn testing<T: Into<String>>(url: T) -> Self {
        Self {
            transport: TransportConfig::testing(url),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.runtime.rpc_timeout == Some(Duration::ZERO) {
            return Err(TetherError::config_error("rpc_timeout must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Connection registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Sockets that have not authenticated within this window are closed
    pub auth_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(20),
        }
    }
}

/// Presence tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A session counts as recently active within this window
    pub session_active_timeout: Duration,
    /// How often open sessions are re-marked active in storage
    pub heartbeat_interval: Duration,
    /// Delay before re-evaluating a user after a socket closes
    pub offline_debounce: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            session_active_timeout: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(9 * 60), // inside the activity window
            offline_debounce: Duration::from_secs(10),
        }
    }
}

/// Everything a server needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub registry: RegistryConfig,
    pub presence: PresenceConfig,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            presence: PresenceConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Millisecond-scale timings for tests
    pub fn testing() -> Self {
        Self {
            registry: RegistryConfig {
                auth_timeout: Duration::from_millis(150),
            },
            presence: PresenceConfig {
                session_active_timeout: Duration::from_secs(600),
                heartbeat_interval: Duration::from_millis(100),
                offline_debounce: Duration::from_millis(80),
            },
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.presence.heartbeat_interval >= self.presence.session_active_timeout {
            return Err(TetherError::config_error(
                "heartbeat_interval must be shorter than session_active_timeout",
            ));
        }
        if self.registry.auth_timeout.is_zero() {
            return Err(TetherError::config_error("auth_timeout must be non-zero"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(TetherError::config_error(format!(
                "max_frame_size must be between 1 and {}",
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ClientConfig::new("wss://api.example.com/realtime")
            .validate()
            .is_ok());
        assert!(ClientConfig::testing("memory://test").validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ServerConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = ClientConfig::new("not a url");
        assert!(matches!(
            config.validate(),
            Err(TetherError::Configuration { .. })
        ));
    }

    #[test]
    fn test_pong_timeout_must_be_shorter_than_interval() {
        let mut config = TransportConfig::new("ws://localhost:8000");
        config.pong_timeout = config.ping_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_send_timeout_rejected() {
        let mut config = TransportConfig::testing("ws://localhost:8000");
        assert!(config.validate().is_ok());
        config.send_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_inside_activity_window() {
        let mut config = ServerConfig::default();
        config.presence.heartbeat_interval = Duration::from_secs(11 * 60);
        assert!(config.validate().is_err());
    }
}
