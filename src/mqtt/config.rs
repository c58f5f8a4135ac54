use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Keep-alive interval every connection is opened with.
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Broker endpoint and credentials for one connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParameters {
    pub url: String,
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

// Keeps the password out of logs.
impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl ConnectionParameters {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// Per-connection options that do not belong to a saved context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    /// Capacity of the client's outgoing request queue
    pub request_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: KEEP_ALIVE,
            request_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    fn default_port(self) -> u16 {
        match self {
            TransportKind::Tcp => 1883,
            TransportKind::Tls => 8883,
            TransportKind::Ws => 80,
            TransportKind::Wss => 443,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, TransportKind::Ws | TransportKind::Wss)
    }
}

/// A broker URL split into the parts the MQTT client needs.
///
/// Accepted schemes: `mqtt`/`tcp`, `mqtts`/`ssl`, `ws` and `wss`. Websocket
/// endpoints keep their full URL because the client dials the URL itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub url: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidEndpoint {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        let transport = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => TransportKind::Tcp,
            "mqtts" | "ssl" | "tls" => TransportKind::Tls,
            "ws" => TransportKind::Ws,
            "wss" => TransportKind::Wss,
            _ => return Err(invalid("unsupported scheme")),
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        // credentials in the url are not used, the context carries them
        let authority = authority.rsplit('@').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        let parse_port = |raw: &str| raw.parse::<u16>().map_err(|_| invalid("invalid port"));
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated ipv6 host"))?;
            match after.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None if after.is_empty() => (host, transport.default_port()),
                None => return Err(invalid("unexpected characters after host")),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, transport.default_port()),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            transport,
            host: host.to_string(),
            port,
            url: trimmed.to_string(),
        })
    }
}
