//! Bidirectional byte copying between a local connection and a channel.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::RelayError, utils::is_trivial_close_error};

/// How many bytes crossed a bridge in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// From the local connection into the channel.
    pub sent: u64,

    /// From the channel into the local connection.
    pub received: u64,
}

/// Copies bytes both ways between `local` and `channel` until both directions reach EOF, or
/// until `cancel` fires.
///
/// A direction that reaches EOF shuts down the writer it was copying into, so the half-close is
/// passed on while the other direction keeps going. An error in one direction doesn't stop the
/// other one. Once both have stopped (or on cancellation) the local connection is closed first,
/// then the channel.
///
/// Returns the first error that isn't just the other end having already gone away, or
/// [`RelayError::Cancelled`] if cancelled.
pub async fn bridge<L, C>(local: L, channel: C, cancel: &CancellationToken) -> Result<BridgeStats, RelayError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel);

    let copies = async {
        tokio::join!(
            copy_then_shutdown(&mut local_read, &mut channel_write),
            copy_then_shutdown(&mut channel_read, &mut local_write),
        )
    };

    let outcome = tokio::select! {
        results = copies => Some(results),
        _ = cancel.cancelled() => None,
    };

    let mut first_error = None;
    let mut stats = BridgeStats::default();

    match outcome {
        Some((sent, received)) => {
            stats.sent = record(&mut first_error, sent);
            stats.received = record(&mut first_error, received);
            drop(local_read);
            drop(local_write);
            drop(channel_read);
            drop(channel_write);
        }
        None => {
            debug!("Bridge cancelled, closing both ends");
            keep_first(&mut first_error, local_write.shutdown().await);
            drop(local_read);
            drop(local_write);
            keep_first(&mut first_error, channel_write.shutdown().await);
            drop(channel_read);
            drop(channel_write);
            return Err(RelayError::Cancelled);
        }
    }

    match first_error {
        Some(error) => Err(RelayError::Io(error)),
        None => Ok(stats),
    }
}

struct DirectionResult {
    copied: io::Result<u64>,
    shutdown: io::Result<()>,
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> DirectionResult
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await;
    let shutdown = writer.shutdown().await;
    DirectionResult { copied, shutdown }
}

fn record(first_error: &mut Option<io::Error>, result: DirectionResult) -> u64 {
    let copied = match result.copied {
        Ok(copied) => copied,
        Err(error) => {
            keep_first(first_error, Err(error));
            0
        }
    };

    keep_first(first_error, result.shutdown);
    copied
}

fn keep_first(first_error: &mut Option<io::Error>, result: io::Result<()>) {
    if let Err(error) = result {
        if first_error.is_none() && !is_trivial_close_error(&error) {
            *first_error = Some(error);
        }
    }
}
