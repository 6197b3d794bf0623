use std::fmt;

use relay_tunnel_proto::messages::SessionRole;

/// The sub-protocol a host negotiates with the relay.
pub const HOST_SUBPROTOCOL: &str = "tunnel-relay-host";

/// The sub-protocol a client negotiates with the relay.
pub const CLIENT_SUBPROTOCOL: &str = "tunnel-relay-client";

/// The scheme of the `Authorization` header a host dials with.
pub const AUTHORIZATION_SCHEME: &str = "tunnel";

/// Where and how to reach the relay, as handed over by whatever manages the tunnel.
///
/// Immutable once a session starts.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub uri: String,
    pub role: SessionRole,
    pub access_token: Option<String>,
}

impl RelayEndpoint {
    pub fn host(uri: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            role: SessionRole::Host,
            access_token: Some(access_token.into()),
        }
    }

    pub fn client(uri: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            role: SessionRole::Client,
            access_token,
        }
    }

    pub fn subprotocol(&self) -> &'static str {
        subprotocol_for(self.role)
    }
}

pub const fn subprotocol_for(role: SessionRole) -> &'static str {
    match role {
        SessionRole::Host => HOST_SUBPROTOCOL,
        SessionRole::Client => CLIENT_SUBPROTOCOL,
    }
}

impl fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("uri", &self.uri)
            .field("role", &self.role)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_the_token() {
        let endpoint = RelayEndpoint::host("wss://relay.example/tunnel", "s3cr3t");
        let printed = format!("{endpoint:?}");
        assert!(!printed.contains("s3cr3t"));
        assert!(printed.contains("<redacted>"));
        assert_eq!(endpoint.subprotocol(), "tunnel-relay-host");
    }

    #[test]
    fn client_token_is_optional() {
        let endpoint = RelayEndpoint::client("ws://127.0.0.1:1/", None);
        assert_eq!(endpoint.subprotocol(), "tunnel-relay-client");
        assert!(format!("{endpoint:?}").contains("access_token: None"));
    }
}
