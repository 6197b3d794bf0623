//! Exposes local TCP services through a WebSocket relay.
//!
//! A host and a client each dial the relay, which pairs their connections. A [`RelaySession`]
//! runs over each one, multiplexing any number of channels. The host advertises the tunnel's
//! ports with `tcpip-forward` requests and serves the `direct-tcpip` channels the client opens to
//! them by connecting to the matching local service. The client records the advertised ports in
//! a [`ForwardedPortSet`] and, for each one, can listen locally and carry every accepted
//! connection across the relay.
//!
//! - [`ClientSession`] and [`HostSession`] are the entry points for either role.
//! - [`transport`] adapts the relay's WebSocket connection into a byte stream.
//! - [`bridge`] copies bytes between a local connection and a channel.

pub mod bridge;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod logging;
pub mod registry;
pub mod session;
pub mod transport;
pub mod utils;

pub use bridge::{bridge, BridgeStats};
pub use client::{ClientSession, LocalForwarder};
pub use config::{ClientConfig, HostConfig, HostPort};
pub use endpoint::RelayEndpoint;
pub use error::{ConnectError, RelayError};
pub use host::{HostSession, TunnelPorts};
pub use registry::{ForwardedPortSet, PortEvent, PortEventKind};
pub use session::{Channel, ChannelOffer, RelaySession, SessionState};
