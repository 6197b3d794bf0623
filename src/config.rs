//! Session configuration.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_BIND_FALLBACK_RANGE: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Whether to bind a local listener for every port the host advertises.
    pub auto_bind: bool,

    /// The local addresses automatic forwarders listen at. The first one decides the port, the
    /// rest try to bind that same port.
    pub bind_addresses: Vec<IpAddr>,

    /// How many ports after an unavailable one to try before falling back to an ephemeral port.
    pub bind_fallback_range: u16,

    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_bind: true,
            bind_addresses: vec![DEFAULT_BIND_ADDRESS],
            bind_fallback_range: DEFAULT_BIND_FALLBACK_RANGE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_CLIENT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// The tunnel's ports. Frozen into a snapshot when the session is created.
    pub ports: Vec<HostPort>,

    pub connect_timeout: Duration,

    /// `None` waits for the client indefinitely, since the relay may hold the host's connection
    /// until a client shows up.
    pub handshake_timeout: Option<Duration>,
}

impl HostConfig {
    pub fn new(ports: Vec<HostPort>) -> Self {
        Self {
            ports,
            ..Default::default()
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: None,
        }
    }
}

/// A port the host forwards, and the local service connections to it are bridged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub port: u16,
    pub target: String,
}

impl HostPort {
    /// A port forwarded to the service listening on that same port on localhost.
    pub fn local(port: u16) -> Self {
        Self {
            port,
            target: format!("{}:{port}", Ipv4Addr::LOCALHOST),
        }
    }

    pub fn new(port: u16, target: impl Into<String>) -> Self {
        Self {
            port,
            target: target.into(),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.port, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPortParseError {
    InvalidPort(String),
    MissingTargetPort(String),
    InvalidTargetPort(String),
}

impl fmt::Display for HostPortParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort(s) => write!(f, "Invalid port number: {s}"),
            Self::MissingTargetPort(s) => write!(f, "Target has no port: {s}"),
            Self::InvalidTargetPort(s) => write!(f, "Invalid target port: {s}"),
        }
    }
}

impl std::error::Error for HostPortParseError {}

impl FromStr for HostPort {
    type Err = HostPortParseError;

    /// Parses `8001` or `8001=127.0.0.1:9000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port_str, target) = match s.split_once('=') {
            Some((port_str, target)) => (port_str.trim(), Some(target.trim())),
            None => (s.trim(), None),
        };

        let port = match port_str.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => return Err(HostPortParseError::InvalidPort(port_str.to_string())),
        };

        let Some(target) = target else {
            return Ok(Self::local(port));
        };

        let Some((_, target_port)) = target.rsplit_once(':') else {
            return Err(HostPortParseError::MissingTargetPort(target.to_string()));
        };

        if target_port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err(HostPortParseError::InvalidTargetPort(target.to_string()));
        }

        Ok(Self::new(port, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_targets_localhost() {
        assert_eq!("8001".parse::<HostPort>(), Ok(HostPort::new(8001, "127.0.0.1:8001")));
    }

    #[test]
    fn explicit_target() {
        assert_eq!(
            "8001=127.0.0.1:9000".parse::<HostPort>(),
            Ok(HostPort::new(8001, "127.0.0.1:9000"))
        );
        assert_eq!("22=[::1]:2222".parse::<HostPort>(), Ok(HostPort::new(22, "[::1]:2222")));
        assert_eq!("80=localhost:8080".parse::<HostPort>(), Ok(HostPort::new(80, "localhost:8080")));
    }

    #[test]
    fn bad_specs() {
        assert!(matches!("0".parse::<HostPort>(), Err(HostPortParseError::InvalidPort(_))));
        assert!(matches!("70000".parse::<HostPort>(), Err(HostPortParseError::InvalidPort(_))));
        assert!(matches!("8001=localhost".parse::<HostPort>(), Err(HostPortParseError::MissingTargetPort(_))));
        assert!(matches!("8001=localhost:x".parse::<HostPort>(), Err(HostPortParseError::InvalidTargetPort(_))));
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert!(config.auto_bind);
        assert_eq!(config.bind_addresses, vec![DEFAULT_BIND_ADDRESS]);
        assert_eq!(config.bind_fallback_range, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn host_waits_for_client_indefinitely_by_default() {
        assert_eq!(HostConfig::new(vec![]).handshake_timeout, None);
    }
}
