use std::sync::Arc;

use relay_tunnel_proto::{
    messages::{ChannelKind, GlobalRequest, OpenFailureReason, PortForwardRequest},
    serialize::to_bytes,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::ClientShared;
use crate::{
    session::{ChannelOffer, IncomingGlobalRequest, RelaySession},
    utils::wire_port,
};

/// Handles the host's global requests one at a time, in the order they arrived, until the
/// session closes.
pub(super) async fn handle_global_requests(
    client: Arc<ClientShared>,
    session: RelaySession,
    mut requests: UnboundedReceiver<IncomingGlobalRequest>,
) {
    while let Some(request) = requests.recv().await {
        handle_global_request(&client, &session, request).await;
    }

    debug!("Global request loop finished");
}

async fn handle_global_request(client: &ClientShared, session: &RelaySession, request: IncomingGlobalRequest) {
    let parsed = match request.parse().await {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(name = request.name(), "Malformed global request: {error}");
            request.reply_failure();
            return;
        }
    };

    match parsed {
        GlobalRequest::PortForward(PortForwardRequest { port: requested }) => {
            let Some(port) = wire_port(requested) else {
                warn!(port = requested, "Host advertised an invalid port");
                request.reply_failure();
                return;
            };

            // Bound before it's recorded, so whoever sees the port can connect right away.
            if client.config.auto_bind {
                if let Err(error) = client.start_forwarder(session, port).await {
                    warn!(port, "Automatic forwarding failed: {error}");
                }
            }

            if client.registry.add(port) {
                info!(port, "Host is forwarding port");
            }

            reply_with_echo(request, requested).await;
        }
        GlobalRequest::CancelPortForward(PortForwardRequest { port: requested }) => {
            let Some(port) = wire_port(requested) else {
                warn!(port = requested, "Host retracted an invalid port");
                request.reply_failure();
                return;
            };

            client.stop_forwarder(port);
            if client.registry.remove(port) {
                info!(port, "Host stopped forwarding port");
            }

            reply_with_echo(request, requested).await;
        }
        GlobalRequest::Unknown(name) => {
            debug!(%name, "Refusing unknown global request");
            request.reply_failure();
        }
    }
}

async fn reply_with_echo(request: IncomingGlobalRequest, port: u32) {
    match to_bytes(&PortForwardRequest::new(port)).await {
        Ok(payload) => request.reply_success(payload),
        Err(error) => {
            warn!(port, "Failed to encode port forward reply: {error}");
            request.reply_failure();
        }
    }
}

/// Rejects every channel the host tries to open, until the session closes.
pub(super) async fn reject_channel_offers(mut offers: UnboundedReceiver<ChannelOffer>) {
    while let Some(offer) = offers.recv().await {
        let (reason, description) = match offer.kind() {
            ChannelKind::ForwardedTcpip => (OpenFailureReason::UnknownChannelType, "not implemented"),
            ChannelKind::DirectTcpip => (OpenFailureReason::AdministrativelyProhibited, "client does not accept connections"),
            ChannelKind::Unknown(_) => (OpenFailureReason::UnknownChannelType, "unknown channel type"),
        };

        warn!(channel_id = %offer.channel_id(), kind = %offer.kind(), "Rejecting channel opened by host");
        offer.reject(reason, description);
    }
}
