//! Connection status, error taxonomy and registry configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Created, no socket yet.
    Idle,
    /// Socket opening.
    Connecting,
    /// Socket open; frames may flow.
    Ready,
    /// Close requested, socket draining.
    Closing,
    /// Socket gone.
    Closed,
}

impl ConnectionStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionStatus::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Closed)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay disabled: {0}")]
    DisabledRelay(String),

    #[error("relay cooling down: {0}")]
    CoolingDown(String),

    #[error("connection not ready")]
    NotReady,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("connection timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

impl From<gloo_net::websocket::WebSocketError> for RelayError {
    fn from(err: gloo_net::websocket::WebSocketError) -> Self {
        RelayError::WebSocketError(err.to_string())
    }
}

/// Reconnect backoff: exponential with decorrelated jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: f64,
    pub max_ms: f64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 300.0,
            max_ms: 10_000.0,
            multiplier: 1.6,
            jitter: 0.1,
        }
    }
}

/// Registry-wide policy knobs. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upper bound for a readiness wait.
    pub connect_timeout_ms: u32,
    /// Idle age after which an operation-free connection is swept.
    pub idle_timeout_ms: u32,
    /// Cooldown after a connection gives up.
    pub cooldown_ms: u32,
    /// Cooldown after a transient failure.
    pub transient_cooldown_ms: u32,
    /// Grace between the last CLOSE and the actual disconnect.
    pub close_delay_ms: u32,
    /// Consecutive failures before a connection gives up.
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            cooldown_ms: 60_000,
            transient_cooldown_ms: 10_000,
            close_delay_ms: 1_000,
            max_reconnect_attempts: 2,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than 0".to_string());
        }
        if self.backoff.multiplier < 1.0 {
            return Err("backoff multiplier must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err("backoff jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Per-connection counters for the status surface.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub connected_at: Option<u64>,
    pub reconnect_attempts: u32,
    pub frames_sent: u64,
    pub frames_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_the_contract() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.connect_timeout_ms, 5_000);
        assert_eq!(cfg.idle_timeout_ms, 300_000);
        assert_eq!(cfg.cooldown_ms, 60_000);
        assert_eq!(cfg.close_delay_ms, 1_000);
        assert_eq!(cfg.max_reconnect_attempts, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_jitter() {
        let mut cfg = RelayConfig::default();
        cfg.backoff.jitter = 1.5;
        assert!(cfg.validate().is_err());
    }
}
