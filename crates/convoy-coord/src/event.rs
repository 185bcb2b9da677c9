//! Watch events and the per-registration delivery stream.
//!
//! A watch is a one-shot registration: the service delivers at most one
//! change event per registration, after which the watch is spent and must be
//! re-installed. Session-state transitions are also delivered on the stream
//! but do **not** consume the registration; receivers skip them and keep
//! waiting. A stream that closes without delivering a change event means the
//! registration was lost (transport glitch, server restart) and the watched
//! state must be re-fetched.

use tokio::sync::mpsc;

/// The kind of change a watch event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The set of children under the watched path changed.
    ChildrenChanged,
    /// The data of the watched node changed.
    DataChanged,
    /// A node was created at the watched path.
    Created,
    /// The watched node was deleted.
    Deleted,
    /// Bare session-state transition; not a change event.
    Session,
}

/// The connection state of the session a watch event was delivered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is connected and healthy.
    Connected,
    /// The connection dropped; the session may still recover.
    Disconnected,
    /// The session is gone; ephemerals owned by it have been deleted.
    Expired,
}

/// A single watch callback delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What changed.
    pub kind: WatchEventKind,
    /// The path the change applies to (empty for bare session events).
    pub path: String,
    /// Session state at delivery time.
    pub session: SessionState,
}

impl WatchedEvent {
    /// Creates a change event for `path` under a connected session.
    #[must_use]
    pub fn change(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            session: SessionState::Connected,
        }
    }

    /// Creates a bare session-state event.
    #[must_use]
    pub fn session(state: SessionState) -> Self {
        Self {
            kind: WatchEventKind::Session,
            path: String::new(),
            session: state,
        }
    }

    /// Returns true if this is a bare session-state signal rather than a
    /// change event. Session signals never consume a watch registration.
    #[must_use]
    pub const fn is_session_only(&self) -> bool {
        matches!(self.kind, WatchEventKind::Session)
    }
}

/// Sender half used by [`Coordinator`] implementations to deliver events.
///
/// [`Coordinator`]: crate::client::Coordinator
pub type WatchSender = mpsc::UnboundedSender<WatchedEvent>;

/// Receiver side of one watch registration.
///
/// See the module docs for the delivery contract.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchedEvent>,
}

impl WatchStream {
    /// Creates a connected sender/stream pair.
    #[must_use]
    pub fn channel() -> (WatchSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Receives the next delivery, or `None` if the registration was lost.
    pub async fn recv(&mut self) -> Option<WatchedEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_delivers_in_order() {
        let (tx, mut stream) = WatchStream::channel();
        tx.send(WatchedEvent::session(SessionState::Disconnected))
            .unwrap();
        tx.send(WatchedEvent::change(WatchEventKind::DataChanged, "/a"))
            .unwrap();

        let first = stream.recv().await.unwrap();
        assert!(first.is_session_only());

        let second = stream.recv().await.unwrap();
        assert_eq!(second.kind, WatchEventKind::DataChanged);
        assert_eq!(second.path, "/a");
    }

    #[tokio::test]
    async fn dropped_sender_closes_stream() {
        let (tx, mut stream) = WatchStream::channel();
        drop(tx);
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn session_events_are_session_only() {
        assert!(WatchedEvent::session(SessionState::Expired).is_session_only());
        assert!(!WatchedEvent::change(WatchEventKind::Deleted, "/a").is_session_only());
    }
}
