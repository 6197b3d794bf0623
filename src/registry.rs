//! The set of remote ports the host has advertised, with a feed of changes to it.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{error::RelayError, utils::sleep_until_if_some};

/// How many events a slow subscriber may fall behind by before it starts missing them. A
/// subscriber that falls behind rechecks the set instead.
const EVENT_FEED_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEvent {
    pub port: u16,
    pub kind: PortEventKind,
}

/// The ports known to be forwardable through a client session.
///
/// A port is in the set if the host advertised it and hasn't retracted it. A port not in the set
/// is unknown, which doesn't mean the host would refuse it.
///
/// Changes are published on a broadcast feed. Publishing never blocks: if nobody is listening
/// the event is dropped, since anyone who starts waiting later checks the set first.
pub struct ForwardedPortSet {
    ports: Mutex<HashMap<u16, bool>>,
    events: broadcast::Sender<PortEvent>,
    closed: CancellationToken,
}

impl ForwardedPortSet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        Self {
            ports: Mutex::new(HashMap::new()),
            events,
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, bool>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a port as forwarded. Returns false if it already was.
    pub fn add(&self, port: u16) -> bool {
        let mut ports = self.lock();
        let newly_added = ports.insert(port, true) != Some(true);
        if newly_added {
            let _ = self.events.send(PortEvent {
                port,
                kind: PortEventKind::Added,
            });
        }

        trace!(port, newly_added, "Port marked as forwarded");
        newly_added
    }

    /// Removes a port from the set. Returns false if it wasn't forwarded.
    pub fn remove(&self, port: u16) -> bool {
        let mut ports = self.lock();
        let was_forwarded = ports.remove(&port) == Some(true);
        if was_forwarded {
            let _ = self.events.send(PortEvent {
                port,
                kind: PortEventKind::Removed,
            });
        }

        was_forwarded
    }

    pub fn is_forwarded(&self, port: u16) -> bool {
        self.lock().get(&port).copied().unwrap_or(false)
    }

    /// Gets the forwarded ports, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().iter().filter(|(_, forwarded)| **forwarded).map(|(port, _)| *port).collect();
        ports.sort_unstable();
        ports
    }

    /// Subscribes to the feed of changes. Events published before subscribing are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    /// Marks the owning session as gone. Current and future waits fail with
    /// [`RelayError::SessionClosed`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits until the port is forwarded.
    ///
    /// Fails with [`RelayError::Cancelled`] if `cancel` fires, with [`RelayError::Timeout`] if
    /// `timeout` elapses first, or with [`RelayError::SessionClosed`] if the set is closed. The
    /// set itself is left untouched either way.
    pub async fn wait_for_port(&self, port: u16, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<(), RelayError> {
        // Subscribing while holding the lock means an add can't slip in between the check and
        // the subscription.
        let mut events = {
            let ports = self.lock();
            if ports.get(&port).copied().unwrap_or(false) {
                return Ok(());
            }
            self.events.subscribe()
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let sleep = sleep_until_if_some(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = self.closed.cancelled() => return Err(RelayError::SessionClosed),
                _ = &mut sleep => return Err(RelayError::Timeout),
                event = events.recv() => match event {
                    Ok(PortEvent { port: p, kind: PortEventKind::Added }) if p == port => return Ok(()),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(port, skipped, "Port waiter fell behind, rechecking");
                        if self.is_forwarded(port) {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => return Err(RelayError::SessionClosed),
                },
            }
        }
    }
}

impl Default for ForwardedPortSet {
    fn default() -> Self {
        Self::new()
    }
}
