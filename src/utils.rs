use std::io::{self, ErrorKind};

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Sleeps until the provided instant if `Some`, or never finishes if `None`.
pub async fn sleep_until_if_some(until: Option<Instant>) {
    match until {
        Some(v) => tokio::time::sleep_until(v).await,
        None => std::future::pending().await,
    }
}

/// Returns whether an error from closing or shutting down a stream only says the stream was
/// already gone, which is expected when the peer finished first.
pub fn is_trivial_close_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
    )
}

/// Converts a port as carried on the wire into a TCP port, if it is one.
pub fn wire_port(port: u32) -> Option<u16> {
    u16::try_from(port).ok().filter(|p| *p != 0)
}

/// Creates a child of `parent` that is also cancelled when `other` is.
///
/// Watching `other` takes a task, which ends once the returned guard is dropped.
pub fn linked_token(parent: &CancellationToken, other: &CancellationToken) -> (CancellationToken, DropGuard) {
    let token = parent.child_token();
    let watched = token.clone();
    let other = other.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = other.cancelled() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });

    let guard = token.clone().drop_guard();
    (token, guard)
}
