//! Configuration and endpoint types
//!
//! Plain config structs with sensible defaults. The default NetApp port can
//! be overridden with the `NETAPP_PORT` environment variable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port of the NetApp realtime interface
pub const DEFAULT_NETAPP_PORT: u16 = 5896;

/// Resolve the NetApp port from the environment, falling back to the default
pub fn netapp_port_from_env() -> u16 {
    std::env::var("NETAPP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_NETAPP_PORT)
}

// =============================================================================
// Middleware
// =============================================================================

/// Location and credentials of the fleet-management middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// IP address or hostname (with optional port) of the middleware gateway
    pub address: String,
    /// GUID of the middleware user
    pub user_id: String,
    /// Password of the middleware user
    pub password: String,
}

impl MiddlewareConfig {
    /// Builds a complete URI for an endpoint on the middleware gateway
    pub fn build_api_endpoint(&self, path: &str) -> String {
        format!("http://{}/{}", self.address.trim_end_matches('/'), path)
    }
}

// =============================================================================
// Runtime Endpoint
// =============================================================================

/// Address and port of a deployed NetApp's realtime interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEndpoint {
    pub host: String,
    pub port: u16,
}

impl RuntimeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a middleware-reported service URL (`[scheme://]host[:port]`).
    /// A missing port falls back to `default_port`.
    pub fn from_service_url(url: &str, default_port: u16) -> Option<Self> {
        let stripped = url
            .trim()
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_start_matches("ws://")
            .trim_end_matches('/');
        if stripped.is_empty() {
            return None;
        }
        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().ok()?;
                if host.is_empty() {
                    return None;
                }
                Some(Self::new(host, port))
            }
            None => Some(Self::new(stripped, default_port)),
        }
    }

    /// Builds the websocket URI of one of the NetApp's channels
    pub fn build_channel_uri(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

impl std::fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Monitor Configuration
// =============================================================================

/// Configuration for the resource readiness monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between plan status polls
    pub poll_interval: Duration,
    /// Consecutive transport failures tolerated before the plan is treated
    /// as failed. `None` retries indefinitely.
    pub max_transient_failures: Option<u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_transient_failures: None,
        }
    }
}

// =============================================================================
// Connection Configuration
// =============================================================================

/// Policy applied when the outbound data queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the caller until the queue has capacity
    Block,
    /// Fail the send immediately
    Drop,
}

/// Configuration for the NetApp connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout of a single physical connect attempt
    pub attempt_timeout: Duration,
    /// Maximum time to wait for a correlated control command result
    pub command_timeout: Duration,
    /// Capacity of the outbound data queue
    pub data_queue_capacity: usize,
    /// What to do when the outbound data queue is full
    pub backpressure: BackpressurePolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            data_queue_capacity: 64,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Top-level configuration for the orchestration facade
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port of the NetApp realtime interface
    pub netapp_port: u16,
    /// Maximum time `run_task` waits for the plan to become ready.
    /// `None` waits indefinitely.
    pub ready_timeout: Option<Duration>,
    /// Maximum time `run_task` retries connecting to the NetApp.
    /// `None` retries indefinitely.
    pub connect_timeout: Option<Duration>,
    pub monitor: MonitorConfig,
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            netapp_port: netapp_port_from_env(),
            ready_timeout: None,
            connect_timeout: None,
            monitor: MonitorConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_api_endpoint_strips_trailing_slash() {
        let config = MiddlewareConfig {
            address: "10.0.0.1:8080/".into(),
            user_id: "user".into(),
            password: "pass".into(),
        };
        assert_eq!(
            config.build_api_endpoint("Login"),
            "http://10.0.0.1:8080/Login"
        );
    }

    #[test]
    fn test_endpoint_from_service_url() {
        let ep = RuntimeEndpoint::from_service_url("http://localhost:5800", 5896).unwrap();
        assert_eq!(ep, RuntimeEndpoint::new("localhost", 5800));

        let ep = RuntimeEndpoint::from_service_url("netapp.example.org", 5896).unwrap();
        assert_eq!(ep, RuntimeEndpoint::new("netapp.example.org", 5896));

        let ep = RuntimeEndpoint::from_service_url("https://10.0.0.2:7000/", 5896).unwrap();
        assert_eq!(ep, RuntimeEndpoint::new("10.0.0.2", 7000));

        assert!(RuntimeEndpoint::from_service_url("", 5896).is_none());
        assert!(RuntimeEndpoint::from_service_url("host:notaport", 5896).is_none());
    }

    #[test]
    fn test_channel_uri() {
        let ep = RuntimeEndpoint::new("localhost", 5896);
        assert_eq!(ep.build_channel_uri("/control"), "ws://localhost:5896/control");
    }
}
