use std::{net::IpAddr, time::Duration};

use clap::{Args, Parser, Subcommand};
use relay_tunnel::{
    config::{ClientConfig, HostConfig, HostPort, DEFAULT_BIND_ADDRESS, DEFAULT_BIND_FALLBACK_RANGE},
    endpoint::RelayEndpoint,
};

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[derive(Parser, Debug)]
#[command(name = "relay-tunnel", version, about = "Expose local TCP services through a WebSocket relay")]
pub struct StartupArguments {
    /// Log level or filter directive. RUST_LOG takes precedence when set.
    #[arg(long, global = true, env = "RELAY_TUNNEL_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: StartupMode,
}

#[derive(Subcommand, Debug)]
pub enum StartupMode {
    /// Advertise local ports through the relay and serve the connections a client opens to them.
    Host(HostArguments),

    /// Connect to a host through the relay and listen locally for the ports it advertises.
    Client(ClientArguments),
}

#[derive(Args, Debug)]
pub struct HostArguments {
    /// The relay's WebSocket URI for the host role.
    #[arg(long, env = "RELAY_TUNNEL_URI")]
    pub relay_uri: String,

    /// Access token sent in the Authorization header.
    #[arg(long, env = "RELAY_TUNNEL_TOKEN", hide_env_values = true)]
    pub token: String,

    /// A port to forward, as PORT or PORT=HOST:TARGET_PORT. May be repeated.
    #[arg(long = "port", value_name = "SPEC", required = true)]
    pub ports: Vec<HostPort>,

    /// Seconds to wait for the relay connection to be established.
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,
}

impl HostArguments {
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::host(self.relay_uri.clone(), self.token.clone())
    }

    pub fn config(&self) -> HostConfig {
        let mut config = HostConfig::new(self.ports.clone());
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }

        config
    }
}

#[derive(Args, Debug)]
pub struct ClientArguments {
    /// The relay's WebSocket URI for the client role.
    #[arg(long, env = "RELAY_TUNNEL_URI")]
    pub relay_uri: String,

    /// Access token offered during the WebSocket handshake.
    #[arg(long, env = "RELAY_TUNNEL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Don't listen locally for advertised ports.
    #[arg(long)]
    pub no_auto_bind: bool,

    /// A local address to listen at for advertised ports. May be repeated.
    #[arg(long = "bind-address", value_name = "IP", default_values_t = [DEFAULT_BIND_ADDRESS])]
    pub bind_addresses: Vec<IpAddr>,

    /// How many ports after a taken one to try before using any free port.
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_BIND_FALLBACK_RANGE)]
    pub bind_fallback_range: u16,

    /// Wait until these ports are forwarded before reporting the client ready. May be repeated.
    #[arg(long = "wait-for", value_name = "PORT")]
    pub wait_for: Vec<u16>,

    /// Seconds to wait for the ports given with --wait-for.
    #[arg(long, value_name = "SECS", requires = "wait_for")]
    pub wait_timeout: Option<u64>,

    /// Seconds to wait for the relay connection to be established.
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,
}

impl ClientArguments {
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::client(self.relay_uri.clone(), self.token.clone())
    }

    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            auto_bind: !self.no_auto_bind,
            bind_addresses: self.bind_addresses.clone(),
            bind_fallback_range: self.bind_fallback_range,
            ..Default::default()
        };

        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> StartupArguments {
        StartupArguments::try_parse_from(args).unwrap()
    }

    #[test]
    fn command_is_well_formed() {
        StartupArguments::command().debug_assert();
    }

    #[test]
    fn parses_host_ports() {
        let args = parse(&[
            "relay-tunnel",
            "host",
            "--relay-uri",
            "wss://relay.example/host",
            "--token",
            "secret",
            "--port",
            "8001",
            "--port",
            "8002=10.0.0.5:80",
        ]);

        let StartupMode::Host(host) = args.mode else {
            panic!("expected host mode");
        };

        assert_eq!(host.ports, vec![HostPort::local(8001), HostPort::new(8002, "10.0.0.5:80")]);
        assert_eq!(host.config().ports.len(), 2);
    }

    #[test]
    fn host_needs_a_port() {
        let result = StartupArguments::try_parse_from(["relay-tunnel", "host", "--relay-uri", "wss://r/", "--token", "t"]);
        assert!(result.is_err());
    }

    #[test]
    fn client_defaults() {
        let args = parse(&["relay-tunnel", "--log-level", "debug", "client", "--relay-uri", "wss://relay.example/client"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));

        let StartupMode::Client(client) = args.mode else {
            panic!("expected client mode");
        };

        assert_eq!(client.config(), ClientConfig::default());
        assert!(client.wait_for.is_empty());
        assert_eq!(client.wait_timeout(), None);
    }

    #[test]
    fn client_options() {
        let args = parse(&[
            "relay-tunnel",
            "client",
            "--relay-uri",
            "wss://relay.example/client",
            "--no-auto-bind",
            "--bind-address",
            "0.0.0.0",
            "--wait-for",
            "8001",
            "--wait-timeout",
            "5",
        ]);

        let StartupMode::Client(client) = args.mode else {
            panic!("expected client mode");
        };

        let config = client.config();
        assert!(!config.auto_bind);
        assert_eq!(config.bind_addresses, vec!["0.0.0.0".parse::<IpAddr>().unwrap()]);
        assert_eq!(client.wait_for, vec![8001]);
        assert_eq!(client.wait_timeout(), Some(Duration::from_secs(5)));
    }
}
