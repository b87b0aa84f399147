//! Client configuration and broker credentials.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default broker port for plain connections.
pub const DEFAULT_PORT: u16 = 1883;

/// Default broker port for TLS websocket URLs.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Tunables for one client instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Keep-alive interval in milliseconds. Zero disables pings.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_ms: u64,

    /// Time allowed for connect plus handshake, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Fixed delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Consecutive failed attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Ask the broker to discard prior session state.
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Receipt uids remembered per receipt kind.
    #[serde(default = "default_receipt_capacity")]
    pub receipt_capacity: usize,

    /// Events buffered per subscriber before slow receivers lag.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_keep_alive() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_reconnect_interval() -> u64 {
    3_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_receipt_capacity() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_ms: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            clean_session: true,
            receipt_capacity: default_receipt_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ClientConfig {
    /// Keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Keep-alive announced in the Connect frame, in whole seconds.
    #[must_use]
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive_ms / 1000).unwrap_or(u16::MAX)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect delay.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Errors parsing a broker URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// No host in the URL.
    #[error("Broker URL has no host: {0}")]
    MissingHost(String),

    /// Port is not a valid u16.
    #[error("Invalid broker port: {0}")]
    InvalidPort(String),

    /// Scheme other than tcp, mqtt, ws or wss.
    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Host and port of a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl BrokerEndpoint {
    /// Parse `scheme://host[:port][/path]` or a bare `host[:port]`.
    ///
    /// Paths are ignored. The port defaults to 1883, or 443 for `wss`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown scheme, a missing host, or a bad port.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let url = url.trim();
        let (secure, rest) = match url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" | "ws" => (false, rest),
                "wss" | "mqtts" | "ssl" => (true, rest),
                other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
            },
            None => (false, url),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None if secure => (authority, DEFAULT_TLS_PORT),
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(EndpointError::MissingHost(url.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// What the client presents to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User name, usually the user uid.
    pub username: Option<String>,
    /// Password, usually an access token.
    pub password: Option<String>,
    /// Client identifier.
    pub client_id: String,
}

impl Credentials {
    /// Anonymous credentials for `endpoint`.
    #[must_use]
    pub fn new(endpoint: BrokerEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            host: endpoint.host,
            port: endpoint.port,
            username: None,
            password: None,
            client_id: client_id.into(),
        }
    }

    /// Attach a user name and password.
    #[must_use]
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Build the client id a chat user presents: `<user>/HTTP/<device>`.
    ///
    /// A random device id is generated when `device_uid` is empty.
    #[must_use]
    pub fn client_id_for(user_uid: &str, device_uid: &str) -> String {
        if device_uid.is_empty() {
            format!("{}/HTTP/{}", user_uid, uuid::Uuid::new_v4())
        } else {
            format!("{}/HTTP/{}", user_uid, device_uid)
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.keep_alive_secs(), 30);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.clean_session);
        assert_eq!(config.receipt_capacity, 1000);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"keep_alive_ms": 10000, "max_reconnect_attempts": 2}"#)
                .unwrap();
        assert_eq!(config.keep_alive_secs(), 10);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.reconnect_interval_ms, 3_000);
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            BrokerEndpoint::parse("tcp://broker.test:1884").unwrap(),
            BrokerEndpoint {
                host: "broker.test".to_string(),
                port: 1884
            }
        );
        assert_eq!(BrokerEndpoint::parse("ws://broker.test/mqtt").unwrap().port, 1883);
        assert_eq!(BrokerEndpoint::parse("wss://broker.test/mqtt").unwrap().port, 443);
        assert_eq!(
            BrokerEndpoint::parse("broker.test").unwrap().host,
            "broker.test"
        );
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!(matches!(
            BrokerEndpoint::parse("http://broker.test"),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("tcp://broker.test:99999"),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("tcp://:1883"),
            Err(EndpointError::MissingHost(_))
        ));
    }

    #[test]
    fn test_client_id_for() {
        assert_eq!(Credentials::client_id_for("u1", "abc"), "u1/HTTP/abc");

        let generated = Credentials::client_id_for("u1", "");
        let device = generated.strip_prefix("u1/HTTP/").unwrap();
        assert!(uuid::Uuid::parse_str(device).is_ok());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new(BrokerEndpoint::parse("broker.test").unwrap(), "c1")
            .with_login("u1", "secret-token");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("u1"));
    }
}
