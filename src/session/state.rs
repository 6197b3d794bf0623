use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Dialing the relay or running the session handshake.
    Connecting,
    Established,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Established => write!(f, "established"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Tracks a session through `Disconnected -> Connecting -> Established -> Closed`.
///
/// Cloning yields another handle to the same lifecycle. Once closed, the state never changes
/// again.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<String>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(LifecycleInner {
                state,
                close_reason: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Moves from `Disconnected` to `Connecting`. Returns false, changing nothing, from any other
    /// state.
    pub fn begin_connecting(&self) -> bool {
        self.inner.state.send_if_modified(|state| match state {
            SessionState::Disconnected => {
                *state = SessionState::Connecting;
                true
            }
            _ => false,
        })
    }

    /// Moves from `Connecting` to `Established`. Returns false, changing nothing, from any other
    /// state.
    pub fn set_established(&self) -> bool {
        self.inner.state.send_if_modified(|state| match state {
            SessionState::Connecting => {
                *state = SessionState::Established;
                true
            }
            _ => false,
        })
    }

    /// Moves to `Closed`, recording the reason if this is the first close and one is given.
    pub fn set_closed(&self, reason: Option<String>) {
        let mut close_reason = self.inner.close_reason.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.state.send_if_modified(|state| match state {
            SessionState::Closed => false,
            _ => {
                *state = SessionState::Closed;
                *close_reason = reason;
                true
            }
        });
    }

    /// The error that closed the session, if it didn't close cleanly.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        let mut receiver = self.inner.state.subscribe();
        let _ = receiver.wait_for(|state| *state == SessionState::Closed).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transitions_in_order() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
        assert!(!lifecycle.set_established());

        assert!(lifecycle.begin_connecting());
        assert!(!lifecycle.begin_connecting());
        assert!(lifecycle.set_established());
        assert_eq!(lifecycle.state(), SessionState::Established);

        lifecycle.set_closed(Some("boom".to_string()));
        lifecycle.set_closed(Some("second".to_string()));
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert_eq!(lifecycle.close_reason().as_deref(), Some("boom"));
        assert!(!lifecycle.begin_connecting());
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.set_closed(None);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
