//! Single-shot latch over a watch registration.

use std::time::{Duration, Instant};

use convoy_coord::{WatchEventKind, WatchStream, WatchedEvent};

/// Latches the first change event delivered on a watch registration.
///
/// Bare session-state signals are never counted, and an optional filter
/// restricts which event kinds fire the latch. Once fired,
/// [`await_fired`](Self::await_fired) returns the stored event immediately.
#[derive(Debug)]
pub struct EventLatch {
    stream: WatchStream,
    filter: Option<WatchEventKind>,
    fired: Option<WatchedEvent>,
}

impl EventLatch {
    /// Latches on any change event.
    #[must_use]
    pub fn new(stream: WatchStream) -> Self {
        Self {
            stream,
            filter: None,
            fired: None,
        }
    }

    /// Latches only on events of `kind`.
    #[must_use]
    pub fn filtered(stream: WatchStream, kind: WatchEventKind) -> Self {
        Self {
            stream,
            filter: Some(kind),
            fired: None,
        }
    }

    /// Waits up to `timeout` for a matching event. Returns the latched
    /// event, or `None` if the deadline passed or the registration was
    /// lost without one.
    pub async fn await_fired(&mut self, timeout: Duration) -> Option<&WatchedEvent> {
        if self.fired.is_some() {
            return self.fired.as_ref();
        }
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    match tokio::time::timeout(remaining, self.stream.recv()).await {
                        Ok(received) => received,
                        Err(_) => return None,
                    }
                }
                None => self.stream.recv().await,
            };
            match received {
                Some(event) if event.is_session_only() => {}
                Some(event) if self.filter.is_none() || self.filter == Some(event.kind) => {
                    self.fired = Some(event);
                    return self.fired.as_ref();
                }
                Some(_) => {}
                // Registration lost; nothing can arrive anymore.
                None => return None,
            }
        }
    }

    /// Returns the latched event, if any.
    #[must_use]
    pub fn watched_event(&self) -> Option<&WatchedEvent> {
        self.fired.as_ref()
    }

    /// Consumes the latch, yielding the latched event.
    #[must_use]
    pub fn into_event(self) -> Option<WatchedEvent> {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_coord::SessionState;

    #[tokio::test]
    async fn latches_first_change_event() {
        let (tx, stream) = WatchStream::channel();
        let mut latch = EventLatch::new(stream);

        tx.send(WatchedEvent::change(WatchEventKind::DataChanged, "/r"))
            .unwrap();
        let event = latch.await_fired(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.kind, WatchEventKind::DataChanged);

        // Subsequent awaits return the stored event without waiting.
        let event = latch.await_fired(Duration::from_millis(1)).await.unwrap();
        assert_eq!(event.path, "/r");
    }

    #[tokio::test]
    async fn session_signals_do_not_fire_the_latch() {
        let (tx, stream) = WatchStream::channel();
        let mut latch = EventLatch::new(stream);

        tx.send(WatchedEvent::session(SessionState::Disconnected))
            .unwrap();
        assert!(latch.await_fired(Duration::from_millis(50)).await.is_none());
        assert!(latch.watched_event().is_none());
    }

    #[tokio::test]
    async fn filter_skips_other_kinds() {
        let (tx, stream) = WatchStream::channel();
        let mut latch = EventLatch::filtered(stream, WatchEventKind::Deleted);

        tx.send(WatchedEvent::change(WatchEventKind::DataChanged, "/r"))
            .unwrap();
        tx.send(WatchedEvent::change(WatchEventKind::Deleted, "/r"))
            .unwrap();

        let event = latch.await_fired(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
    }

    #[tokio::test]
    async fn lost_registration_returns_none() {
        let (tx, stream) = WatchStream::channel();
        let mut latch = EventLatch::new(stream);
        drop(tx);
        assert!(latch.await_fired(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn times_out_with_no_event() {
        let (_tx, stream) = WatchStream::channel();
        let mut latch = EventLatch::new(stream);
        let started = Instant::now();
        assert!(latch.await_fired(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
