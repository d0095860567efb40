//! Connection options and broker address parsing

use crate::config::SamplerConfig;
use crate::error::LoadTestError;
use std::fmt;
use std::time::Duration;

/// Capacity of the request channel between a client handle and its event loop
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Transport scheme named by the broker URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

/// Parsed form of `HOST`, e.g. `tcp://broker:1883` or `ws://broker:8080/mqtt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BrokerAddress {
    pub fn parse(uri: &str) -> Result<Self, LoadTestError> {
        let uri = uri.trim();
        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "tcp" | "mqtt" => Scheme::Tcp,
                    "ssl" | "tls" | "mqtts" => Scheme::Tls,
                    "ws" => Scheme::Ws,
                    "wss" => Scheme::Wss,
                    other => {
                        return Err(LoadTestError::Config(format!(
                            "unsupported broker scheme: {}",
                            other
                        )))
                    }
                };
                (scheme, rest)
            }
            None => (Scheme::Tcp, uri),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = split_host_port(authority)?;
        if host.is_empty() {
            return Err(LoadTestError::Config(format!("missing host in {}", uri)));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            path,
        })
    }

    /// Full URL in the form websocket transports expect
    pub fn websocket_url(&self) -> String {
        let scheme = if self.scheme == Scheme::Wss { "wss" } else { "ws" };
        let path = if self.path.is_empty() { "/mqtt" } else { &self.path };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), LoadTestError> {
    // bracketed IPv6 literal
    if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| LoadTestError::Config(format!("invalid host: {}", authority)))?;
        let host = &stripped[..end];
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((authority, None)),
    }
}

fn parse_port(port: &str) -> Result<u16, LoadTestError> {
    port.parse()
        .map_err(|_| LoadTestError::Config(format!("invalid port: {}", port)))
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "ssl",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// Everything needed to open one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub broker_uri: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<(String, String)>,
    pub channel_capacity: usize,
    /// How long a SUBSCRIBE may wait for its SUBACK
    pub ack_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &SamplerConfig, client_id: &str) -> Self {
        let credentials = config
            .user
            .clone()
            .filter(|_| config.auth)
            .map(|user| (user, config.password.clone().unwrap_or_default()));

        Self {
            client_id: client_id.to_string(),
            broker_uri: config.host.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            clean_session: config.clean_session,
            credentials,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ack_timeout: config.connection_timeout(),
        }
    }

    pub fn address(&self) -> Result<BrokerAddress, LoadTestError> {
        BrokerAddress::parse(&self.broker_uri)
    }
}
