//! Request/response rendezvous over a distributed queue.
//!
//! [`TaskQueue`] couples each submission to an asynchronous response
//! channel. A submitter creates an ephemeral `qnr-<SEQ>` response node,
//! watches it, and only then creates the persistent `qn-<SEQ>` request with
//! the same suffix; the consumer publishes a reply by writing onto the
//! response node and deleting the request. The submitter's session owns the
//! response node, so a crashed submitter releases it automatically.
//!
//! The response-node-first order is load-bearing: created the other way
//! around, a fast consumer could reply before the submitter's watch exists,
//! and the reply would be lost.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use convoy_coord::{Coordinator, CreateMode, WatchedEvent};

use crate::error::{Error, Result};
use crate::latch::EventLatch;
use crate::paths::{self, RESPONSE_PREFIX};
use crate::queue::DistributedQueue;
use crate::stats::{op_key, wait_op_key, QueueStats};

/// Sleep slice for the shutdown drain's fallback wakeup.
const DRAIN_SLICE: Duration = Duration::from_millis(250);

/// A pulled queue element, or the outcome of an offer-and-wait exchange.
///
/// Identity is the node path: two events with the same `id` are the same
/// exchange regardless of payload.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    id: String,
    bytes: Bytes,
    watched_event: Option<WatchedEvent>,
}

impl QueueEvent {
    /// Creates an event for the node at `id`.
    #[must_use]
    pub fn new(id: String, bytes: Bytes, watched_event: Option<WatchedEvent>) -> Self {
        Self {
            id,
            bytes,
            watched_event,
        }
    }

    /// The full path of the node this event refers to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The payload (request bytes for pulled elements, reply bytes for
    /// offer-and-wait results; may be empty on timeout).
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The watch event that completed the exchange, if one fired.
    #[must_use]
    pub fn watched_event(&self) -> Option<&WatchedEvent> {
        self.watched_event.as_ref()
    }

    /// Consumes the event, yielding the payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl PartialEq for QueueEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueEvent {}

impl Hash for QueueEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Decrements the pending-responses counter on every exit path and wakes
/// the shutdown drain when it reaches zero.
struct PendingGuard<'a, C: Coordinator + 'static> {
    owner: &'a TaskQueue<C>,
}

impl<'a, C: Coordinator + 'static> PendingGuard<'a, C> {
    fn new(owner: &'a TaskQueue<C>) -> Self {
        owner.pending_responses.fetch_add(1, Ordering::SeqCst);
        Self { owner }
    }
}

impl<C: Coordinator + 'static> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if self.owner.pending_responses.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.responses_drained.notify_waiters();
        }
    }
}

/// A [`DistributedQueue`] augmented with a request/response rendezvous.
///
/// Methods specific to this type bypass the base queue's cache and hit the
/// service directly where the original protocol demands it; see each method.
#[derive(Debug)]
pub struct TaskQueue<C: Coordinator + 'static> {
    queue: Arc<DistributedQueue<C>>,
    /// In-flight offer-and-wait calls that have not observed or timed out
    /// on their reply. Lock-free; the drain path watches it reach zero.
    pending_responses: AtomicU64,
    responses_drained: Notify,
}

impl<C: Coordinator + 'static> TaskQueue<C> {
    /// Opens the task queue over `dir`. Task queues are unbounded; capacity
    /// enforcement belongs to plain work queues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] if `dir` does not exist or the
    /// initial child fetch fails.
    pub async fn new(
        client: Arc<C>,
        dir: impl Into<String>,
        stats: Arc<QueueStats>,
    ) -> Result<Self> {
        let queue = DistributedQueue::new(client, dir, stats, 0).await?;
        Ok(Self {
            queue,
            pending_responses: AtomicU64::new(0),
            responses_drained: Notify::new(),
        })
    }

    /// The underlying distributed queue (peek/poll/take/offer and friends).
    #[must_use]
    pub fn base(&self) -> &Arc<DistributedQueue<C>> {
        &self.queue
    }

    /// Inserts a request with no response channel. Plain producers use this
    /// when nobody waits on a reply.
    ///
    /// # Errors
    ///
    /// As [`DistributedQueue::offer`].
    pub async fn offer(&self, data: Bytes) -> Result<()> {
        self.queue.offer(data).await
    }

    /// Submits `data` and waits up to `timeout` for the consumer's reply.
    ///
    /// On timeout the returned event carries empty bytes and no watched
    /// event; the request stays queued and a later consumer may still
    /// process it (its reply would then go unobserved).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] if any node of the exchange cannot
    /// be created, read, or torn down.
    pub async fn offer_and_wait(&self, data: Bytes, timeout: Duration) -> Result<QueueEvent> {
        let timer = self
            .queue
            .stats()
            .time(op_key(self.queue.dir(), "offer_and_wait"));
        let result = self.offer_and_wait_inner(data, timeout).await;
        timer.finish(&result);
        result
    }

    async fn offer_and_wait_inner(&self, data: Bytes, timeout: Duration) -> Result<QueueEvent> {
        let client = self.queue.client();

        // Create and watch the response node before creating the request
        // node; otherwise we may miss the response.
        let response_path = client
            .create(
                &format!("{}/{RESPONSE_PREFIX}", self.queue.dir()),
                Bytes::new(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let (initial, watch) = client.get_data_watch(&response_path).await?;
        let mut latch = EventLatch::new(watch);

        let request_path = paths::request_path_for(&response_path)
            .ok_or_else(|| Error::payload(format!("malformed response path: {response_path}")))?;
        client
            .create(&request_path, data, CreateMode::Persistent)
            .await?;

        let _pending = PendingGuard::new(self);

        let mut bytes = initial;
        if bytes.is_empty() {
            latch.await_fired(timeout).await;
            bytes = client.get_data(&response_path).await?;
        }

        // Build the event before deleting the response node; the delete
        // would otherwise race our own watcher into the record.
        let event = QueueEvent::new(response_path.clone(), bytes, latch.into_event());
        match client.delete(&response_path).await {
            Ok(()) => {}
            Err(err) if err.is_no_node() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(event)
    }

    /// Publishes `response` for a pulled request and removes the request.
    ///
    /// The response node may be gone (the submitter timed out or its
    /// session ended) and the request may have been removed by a peer;
    /// both are tolerated silently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if the event id has no sequence suffix,
    /// or [`Error::Coordination`] on other service failures.
    pub async fn remove_with_response(&self, event: &QueueEvent, response: Bytes) -> Result<()> {
        let timer = self
            .queue
            .stats()
            .time(op_key(self.queue.dir(), "remove_event"));
        let result = self.remove_with_response_inner(event, response).await;
        timer.finish(&result);
        result
    }

    async fn remove_with_response_inner(
        &self,
        event: &QueueEvent,
        response: Bytes,
    ) -> Result<()> {
        let request_path = event.id();
        let response_path = paths::response_path_for(request_path)
            .ok_or_else(|| Error::payload(format!("malformed request path: {request_path}")))?;
        let client = self.queue.client();

        match client.set_data(&response_path, response).await {
            Ok(()) => {}
            Err(err) if err.is_no_node() => {
                debug!(node = %response_path, "response node missing; submitter gone");
            }
            Err(err) => return Err(err.into()),
        }
        match client.delete(request_path).await {
            Ok(()) => {}
            Err(err) if err.is_no_node() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Blocks until every in-flight [`offer_and_wait`](Self::offer_and_wait)
    /// has observed its reply or timed out. Hosts call this before session
    /// teardown so submitters are not cut off from replies already earned.
    pub async fn await_pending_responses(&self) {
        while self.pending_responses.load(Ordering::SeqCst) > 0 {
            let _ = tokio::time::timeout(DRAIN_SLICE, self.responses_drained.notified()).await;
        }
    }

    /// Number of in-flight offer-and-wait exchanges.
    #[must_use]
    pub fn pending_responses(&self) -> u64 {
        self.pending_responses.load(Ordering::SeqCst)
    }

    /// Returns true if any queued request's payload decodes to a JSON
    /// object whose `key` entry equals `id`.
    ///
    /// Bypasses the cache and reads every request node from the service.
    /// Explicitly inefficient; intended for duplicate-submission detection
    /// only. Nodes that vanish mid-scan are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if a request payload is not a JSON
    /// object, or [`Error::Coordination`] on service failures.
    pub async fn contains_request_with_id(&self, key: &str, id: &str) -> Result<bool> {
        let client = self.queue.client();
        let dir = self.queue.dir();

        let children = client.get_children(dir).await?;
        self.queue.stats().set_queue_length(dir, children.len());
        for child in children {
            if !paths::is_request(&child) {
                continue;
            }
            let path = paths::join(dir, &child);
            let data = match client.get_data(&path).await {
                Ok(data) => data,
                // Another client removed the node first; try the next.
                Err(err) if err.is_no_node() => continue,
                Err(err) => return Err(err.into()),
            };
            if data.is_empty() {
                continue;
            }
            let envelope: HashMap<String, serde_json::Value> = serde_json::from_slice(&data)
                .map_err(|err| Error::payload(format!("request envelope at {path}: {err}")))?;
            if let Some(value) = envelope.get(key) {
                debug!(%key, candidate = %value, looking_for = %id, "inspecting request id");
                if value.as_str() == Some(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Returns the full path of the last element of the queue without
    /// removing it, probing past cached names whose nodes a peer already
    /// consumed. `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than
    /// vanished candidates.
    pub async fn tail_id(&self) -> Result<Option<String>> {
        let snapshot = self.queue.cache_snapshot().await;
        let client = self.queue.client();
        for name in snapshot.iter().rev() {
            let path = paths::join(self.queue.dir(), name);
            match client.get_data(&path).await {
                Ok(_) => return Ok(Some(path)),
                // Another client removed the node first; try the next.
                Err(err) if err.is_no_node() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Returns up to `max` queue events whose full path is not excluded,
    /// waiting up to `wait` for at least one. Consumers feed each returned
    /// event to [`remove_with_response`](Self::remove_with_response).
    ///
    /// # Errors
    ///
    /// As [`DistributedQueue::peek_elements`].
    pub async fn peek_task_events(
        &self,
        max: usize,
        wait: Duration,
        exclude: impl Fn(&str) -> bool + Send + Sync,
    ) -> Result<Vec<QueueEvent>> {
        let timer = self
            .queue
            .stats()
            .time(wait_op_key(self.queue.dir(), "peek_task_events", wait));
        let result = self.peek_task_events_inner(max, wait, exclude).await;
        timer.finish(&result);
        result
    }

    async fn peek_task_events_inner(
        &self,
        max: usize,
        wait: Duration,
        exclude: impl Fn(&str) -> bool + Send + Sync,
    ) -> Result<Vec<QueueEvent>> {
        let dir = self.queue.dir().to_string();
        let elements = self
            .queue
            .peek_elements(max, wait, |child| !exclude(&paths::join(&dir, child)))
            .await?;
        Ok(elements
            .into_iter()
            .map(|(name, bytes)| QueueEvent::new(paths::join(&dir, &name), bytes, None))
            .collect())
    }
}
