//! A coordination-service-backed distributed FIFO queue.
//!
//! Optimized for single-consumer, multiple-producer use: with several
//! consumers on the same directory the results stay correct but lose
//! efficiency to head races.
//!
//! ## Theory of operation
//!
//! Elements live as `qn-<SEQ>` children of a directory node; the service's
//! zero-padded sequence suffix makes lexical order the consumption order.
//! The queue keeps an in-memory ordered set of known child names and at
//! most one outstanding child-list watch. When the watch fires, a delivery
//! task re-fetches the children with a fresh watch, **replaces** the cached
//! set, bumps the cache version, and wakes every waiter.
//!
//! The cache is advisory: a peer may have consumed a cached name already,
//! so every use double-checks the service and treats "no node" as
//! consumed-by-peer rather than as a failure. Blocking operations wait on
//! the change signal in bounded slices of [`WAIT_SLICE`] so a lost wakeup
//! can only ever cost one slice.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use convoy_coord::{Coordinator, CoordError, CreateMode, WatchStream};

use crate::error::{Error, Result};
use crate::paths::{self, REQUEST_PREFIX};
use crate::stats::{op_key, wait_op_key, QueueStats};

/// Bound on a single wait on the cache-change signal. Lost watch deliveries
/// cost at most this long before the waiter re-checks.
pub const WAIT_SLICE: Duration = Duration::from_millis(500);

/// Maximum sub-ops per atomic multi-delete chunk.
const REMOVE_BATCH_SIZE: usize = 1000;

/// Returns the instant `wait` from now, or `None` when `wait` is effectively
/// unbounded (`Duration::MAX` overflows the clock).
fn deadline_after(wait: Duration) -> Option<Instant> {
    Instant::now().checked_add(wait)
}

/// A distributed FIFO queue over a coordination service directory.
///
/// Constructed behind an `Arc` because the watch-delivery task holds a weak
/// reference back to the queue; dropping every strong reference retires the
/// task.
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use bytes::Bytes;
/// use convoy_coord::memory::MemoryCoordinator;
/// use convoy_queue::queue::DistributedQueue;
/// use convoy_queue::stats::QueueStats;
///
/// # async fn example() -> convoy_queue::Result<()> {
/// let coord = Arc::new(MemoryCoordinator::new());
/// coord.ensure_path("/work/queue")?;
///
/// let queue =
///     DistributedQueue::new(coord, "/work/queue", Arc::new(QueueStats::new()), 0).await?;
/// queue.offer(Bytes::from_static(b"job")).await?;
/// let head = queue.take().await?;
/// assert_eq!(&head[..], b"job");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DistributedQueue<C> {
    client: Arc<C>,
    dir: String,
    stats: Arc<QueueStats>,

    /// Last set of request-node names fetched from the service. Advisory:
    /// entries may name nodes a peer has already consumed.
    children: Mutex<BTreeSet<String>>,
    /// Bumped under the `children` lock on every cache replacement; waiters
    /// capture it and re-loop while it is unchanged.
    version: AtomicU64,
    changed: Notify,
    /// Number of armed child-list watches (0 or 1 in steady state).
    watcher_count: AtomicI64,

    /// Capacity bound; 0 means unbounded.
    max_queue_size: usize,
    /// Credits left before `offer` must recheck the server-side count.
    offer_permits: AtomicI64,
}

impl<C: Coordinator + 'static> DistributedQueue<C> {
    /// Opens the queue over `dir`, priming the children cache with a watch
    /// installed. `max_queue_size` of 0 disables the capacity bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] if `dir` does not exist or the
    /// initial child fetch fails.
    pub async fn new(
        client: Arc<C>,
        dir: impl Into<String>,
        stats: Arc<QueueStats>,
        max_queue_size: usize,
    ) -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            client,
            dir: dir.into(),
            stats,
            children: Mutex::new(BTreeSet::new()),
            version: AtomicU64::new(0),
            changed: Notify::new(),
            watcher_count: AtomicI64::new(0),
            max_queue_size,
            offer_permits: AtomicI64::new(0),
        });
        queue.refresh_children().await?;
        Ok(queue)
    }

    /// Returns the payload of the current head, or `None` if the queue is
    /// empty. Non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than a
    /// vanished head.
    pub async fn peek(&self) -> Result<Option<Bytes>> {
        let timer = self.stats.time(op_key(&self.dir, "peek"));
        let result = self.first_element().await;
        timer.finish(&result);
        result
    }

    /// Returns the payload of the head, waiting up to `wait` for one to
    /// appear. `Duration::MAX` waits forever; `wait` must be positive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than a
    /// vanished head.
    ///
    /// # Panics
    ///
    /// Panics if `wait` is zero; use [`peek`](Self::peek) for the
    /// non-blocking probe.
    pub async fn peek_for(&self, wait: Duration) -> Result<Option<Bytes>> {
        assert!(wait > Duration::ZERO, "wait must be positive");
        let timer = self.stats.time(wait_op_key(&self.dir, "peek", wait));
        let result = self.peek_for_inner(wait).await;
        timer.finish(&result);
        result
    }

    async fn peek_for_inner(&self, wait: Duration) -> Result<Option<Bytes>> {
        let deadline = deadline_after(wait);
        loop {
            let seen = self.version.load(Ordering::SeqCst);
            if let Some(data) = self.first_element().await? {
                return Ok(Some(data));
            }
            if !self.await_change(seen, deadline).await {
                return Ok(None);
            }
        }
    }

    /// Removes and returns the head, or `None` if the queue is empty.
    /// The delete on the service is the commit point, so an element is
    /// returned by exactly one caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than a
    /// lost head race.
    pub async fn poll(&self) -> Result<Option<Bytes>> {
        let timer = self.stats.time(op_key(&self.dir, "poll"));
        let result = self.remove_first().await;
        timer.finish(&result);
        result
    }

    /// Removes and returns the head, or fails with [`Error::Empty`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] when the queue has no elements, otherwise
    /// as [`poll`](Self::poll).
    pub async fn remove(&self) -> Result<Bytes> {
        let timer = self.stats.time(op_key(&self.dir, "remove"));
        let result = match self.remove_first().await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Error::Empty {
                dir: self.dir.clone(),
            }),
            Err(err) => Err(err),
        };
        timer.finish(&result);
        result
    }

    /// Removes and returns the head, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than a
    /// lost head race.
    pub async fn take(&self) -> Result<Bytes> {
        let timer = self.stats.time(op_key(&self.dir, "take"));
        let result = self.take_inner().await;
        timer.finish(&result);
        result
    }

    async fn take_inner(&self) -> Result<Bytes> {
        loop {
            let seen = self.version.load(Ordering::SeqCst);
            if let Some(data) = self.remove_first().await? {
                return Ok(data);
            }
            self.await_change(seen, None).await;
        }
    }

    /// Deletes the named children in atomic chunks of up to 1000. A chunk
    /// that fails because some child is already gone falls back to
    /// per-node deletes, tolerating the missing ones. Invoking it again
    /// with the same names is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than
    /// missing nodes.
    pub async fn remove_many(&self, names: &[String]) -> Result<()> {
        let timer = self.stats.time(op_key(&self.dir, "remove_many"));
        let result = self.remove_many_inner(names).await;
        timer.finish(&result);
        result
    }

    async fn remove_many_inner(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = names
            .iter()
            .map(|name| paths::join(&self.dir, name))
            .collect();
        for chunk in paths.chunks(REMOVE_BATCH_SIZE) {
            match self.client.multi_delete(chunk).await {
                Ok(()) => {}
                Err(err) if err.is_no_node() => {
                    // The service rejects a multi-op wholesale when any
                    // sub-op fails; salvage the chunk node by node.
                    for path in chunk {
                        match self.client.delete(path).await {
                            Ok(()) => {}
                            Err(err) if err.is_no_node() => {
                                debug!(node = %path, "cannot remove missing node");
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Inserts `data` at the tail. With no other consumers the element is
    /// visible once this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] when a capacity bound is configured and the
    ///   directory is full
    /// - [`Error::Coordination`] if the directory is missing or the service
    ///   fails
    pub async fn offer(&self, data: Bytes) -> Result<()> {
        let timer = self.stats.time(op_key(&self.dir, "offer"));
        let result = self.offer_inner(data).await;
        timer.finish(&result);
        result
    }

    async fn offer_inner(&self, data: Bytes) -> Result<()> {
        if self.max_queue_size > 0
            && (self.offer_permits.load(Ordering::SeqCst) <= 0
                || self.offer_permits.fetch_sub(1, Ordering::SeqCst) <= 0)
        {
            // Out of credits: consult the service for the actual count.
            let stat = self
                .client
                .stat(&self.dir)
                .await?
                .ok_or_else(|| Error::from(CoordError::no_node(self.dir.clone())))?;
            let children = stat.num_children as usize;
            if children >= self.max_queue_size {
                return Err(Error::QueueFull {
                    dir: self.dir.clone(),
                    max: self.max_queue_size,
                });
            }
            // Allow the next ~1% of the remaining capacity without
            // rechecking; this offer consumes one of those credits.
            let remaining = self.max_queue_size - children;
            self.offer_permits
                .store((remaining / 100) as i64 - 1, Ordering::SeqCst);
        }
        self.client
            .create(
                &format!("{}/{REQUEST_PREFIX}", self.dir),
                data,
                CreateMode::PersistentSequential,
            )
            .await?;
        Ok(())
    }

    /// Returns up to `max` `(short name, payload)` pairs whose short name
    /// passes `accept`, waiting up to `wait` for at least one match.
    /// Entries that vanish between selection and read are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on service failures other than
    /// vanished entries.
    pub async fn peek_elements(
        &self,
        max: usize,
        wait: Duration,
        accept: impl Fn(&str) -> bool + Send,
    ) -> Result<Vec<(String, Bytes)>> {
        let timer = self
            .stats
            .time(wait_op_key(&self.dir, "peek_elements", wait));
        let result = self.peek_elements_inner(max, wait, accept).await;
        timer.finish(&result);
        result
    }

    async fn peek_elements_inner(
        &self,
        max: usize,
        wait: Duration,
        accept: impl Fn(&str) -> bool + Send,
    ) -> Result<Vec<(String, Bytes)>> {
        let deadline = deadline_after(wait);
        let found = loop {
            let seen = self.version.load(Ordering::SeqCst);
            let matched: Vec<String> = {
                let children = self.children.lock().await;
                children
                    .iter()
                    .filter(|name| accept(name.as_str()))
                    .cloned()
                    .collect()
            };
            if !matched.is_empty() {
                break matched;
            }
            if !self.await_change(seen, deadline).await {
                return Ok(Vec::new());
            }
        };

        // Vanishing entries are rare enough that we do not restart the wait
        // when every match is gone by read time.
        let mut result = Vec::with_capacity(found.len().min(max));
        for child in found {
            if result.len() >= max {
                break;
            }
            let path = paths::join(&self.dir, &child);
            match self.client.get_data(&path).await {
                Ok(data) => result.push((child, data)),
                Err(err) if err.is_no_node() => {
                    debug!(node = %path, "element vanished before read");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(result)
    }

    /// The queue directory path.
    #[must_use]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// The statistics registry this queue records into.
    #[must_use]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// The coordination client this queue runs over.
    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Copies the cached request-node names in ascending order. Advisory,
    /// like every read of the cache.
    pub async fn cache_snapshot(&self) -> Vec<String> {
        let children = self.children.lock().await;
        children.iter().cloned().collect()
    }

    /// Number of elements in the local cache. An estimate: peers may have
    /// consumed some of them already.
    pub async fn len_estimate(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Returns true if the local cache is empty.
    pub async fn is_empty_estimate(&self) -> bool {
        self.children.lock().await.is_empty()
    }

    /// Number of armed child-list watches. Steady state is 1; 0 only in the
    /// window between a watch firing and the re-fetch re-arming it.
    #[must_use]
    pub fn watcher_count(&self) -> i64 {
        self.watcher_count.load(Ordering::SeqCst)
    }

    /// Pops (or copies) the smallest cached name. The caller must
    /// double-check the node still exists; the cache is inherently stale.
    async fn first_child(&self, remove: bool) -> Option<String> {
        let mut children = self.children.lock().await;
        if remove {
            children.pop_first()
        } else {
            children.first().cloned()
        }
    }

    /// Reads the head payload without consuming. A vanished head is dropped
    /// from the cache and selection retries with the next candidate.
    async fn first_element(&self) -> Result<Option<Bytes>> {
        loop {
            let Some(first) = self.first_child(false).await else {
                return Ok(None);
            };
            match self.client.get_data(&paths::join(&self.dir, &first)).await {
                Ok(data) => return Ok(Some(data)),
                Err(err) if err.is_no_node() => {
                    debug!(dir = %self.dir, child = %first, "cached head vanished");
                    self.children.lock().await.remove(&first);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Removes and returns the head. The remote delete is the commit point:
    /// losing it to a peer moves selection to the next candidate, so no
    /// payload is ever returned twice.
    async fn remove_first(&self) -> Result<Option<Bytes>> {
        loop {
            let Some(first) = self.first_child(true).await else {
                return Ok(None);
            };
            let path = paths::join(&self.dir, &first);
            let data = match self.client.get_data(&path).await {
                Ok(data) => data,
                Err(err) if err.is_no_node() => {
                    debug!(dir = %self.dir, child = %first, "cached head vanished");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match self.client.delete(&path).await {
                Ok(()) => return Ok(Some(data)),
                Err(err) if err.is_no_node() => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Waits until the cache version moves past `seen` or `deadline`
    /// arrives, whichever is first. Waits are sliced at [`WAIT_SLICE`] so a
    /// missed signal never wedges the caller. Returns false on deadline.
    async fn await_change(&self, seen: u64, deadline: Option<Instant>) -> bool {
        while self.version.load(Ordering::SeqCst) == seen {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    WAIT_SLICE.min(remaining)
                }
                None => WAIT_SLICE,
            };
            let _ = tokio::time::timeout(slice, self.changed.notified()).await;
        }
        true
    }

    /// Re-fetches the children with a fresh watch installed and replaces
    /// the cache. This is the only place the cache is ever repopulated.
    async fn refresh_children(self: &Arc<Self>) -> Result<()> {
        let mut children = self.children.lock().await;
        let (names, watch) = self.client.get_children_watch(&self.dir).await?;
        self.stats.set_queue_length(&self.dir, names.len());

        let mut set = BTreeSet::new();
        for name in names {
            if paths::is_request(&name) {
                set.insert(name);
            } else {
                // Responses share the directory under their own prefix.
                debug!(dir = %self.dir, child = %name, "ignoring non-request child");
            }
        }
        *children = set;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.arm_watch(watch);
        drop(children);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Spawns the delivery task for one watch registration. The task skips
    /// bare session signals (they do not consume the watch), then
    /// re-fetches on the first change event. A stream that closes without
    /// an event means the registration was lost; re-fetching re-arms it,
    /// which is what keeps blocked consumers live across watch loss.
    fn arm_watch(self: &Arc<Self>, mut watch: WatchStream) {
        let count = self.watcher_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.set_watcher_count(&self.dir, count);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let fired = loop {
                match watch.recv().await {
                    Some(event) if event.is_session_only() => continue,
                    other => break other,
                }
            };

            {
                let Some(queue) = weak.upgrade() else { return };
                let count = queue.watcher_count.fetch_sub(1, Ordering::SeqCst) - 1;
                queue.stats.set_watcher_count(&queue.dir, count);
                match &fired {
                    Some(event) => {
                        debug!(dir = %queue.dir, path = %event.path, kind = ?event.kind, "queue children changed");
                    }
                    None => debug!(dir = %queue.dir, "child watch lost; re-fetching"),
                }
            }

            loop {
                let Some(queue) = weak.upgrade() else { return };
                match queue.refresh_children().await {
                    Ok(()) => return,
                    Err(error) => {
                        warn!(dir = %queue.dir, %error, "failed to refresh queue children; retrying");
                        drop(queue);
                        tokio::time::sleep(WAIT_SLICE).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_coord::memory::MemoryCoordinator;

    async fn open_queue(max: usize) -> (Arc<MemoryCoordinator>, Arc<DistributedQueue<MemoryCoordinator>>) {
        let coord = Arc::new(MemoryCoordinator::new());
        coord.ensure_path("/work/queue").unwrap();
        let queue = DistributedQueue::new(
            Arc::clone(&coord),
            "/work/queue",
            Arc::new(QueueStats::new()),
            max,
        )
        .await
        .unwrap();
        (coord, queue)
    }

    #[tokio::test]
    async fn offer_then_poll_in_order() -> Result<()> {
        let (_coord, queue) = open_queue(0).await;

        queue.offer(Bytes::from_static(b"a")).await?;
        queue.offer(Bytes::from_static(b"b")).await?;
        queue.offer(Bytes::from_static(b"c")).await?;

        assert_eq!(queue.poll().await?.as_deref(), Some(b"a".as_ref()));
        assert_eq!(queue.poll().await?.as_deref(), Some(b"b".as_ref()));
        assert_eq!(queue.poll().await?.as_deref(), Some(b"c".as_ref()));
        assert_eq!(queue.poll().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn peek_does_not_consume() -> Result<()> {
        let (_coord, queue) = open_queue(0).await;
        queue.offer(Bytes::from_static(b"only")).await?;

        assert_eq!(queue.peek().await?.as_deref(), Some(b"only".as_ref()));
        assert_eq!(queue.peek().await?.as_deref(), Some(b"only".as_ref()));
        assert_eq!(queue.poll().await?.as_deref(), Some(b"only".as_ref()));
        Ok(())
    }

    #[tokio::test]
    async fn remove_on_empty_queue_errors() {
        let (_coord, queue) = open_queue(0).await;
        let err = queue.remove().await.unwrap_err();
        assert!(matches!(err, Error::Empty { .. }));
    }

    #[tokio::test]
    async fn capacity_bound_rejects_when_full() -> Result<()> {
        let (_coord, queue) = open_queue(10).await;

        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..20 {
            match queue.offer(Bytes::from_static(b"x")).await {
                Ok(()) => accepted += 1,
                Err(Error::QueueFull { .. }) => rejected += 1,
                Err(err) => return Err(err),
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(rejected, 10);
        Ok(())
    }

    #[tokio::test]
    async fn remove_many_is_idempotent() -> Result<()> {
        let (coord, queue) = open_queue(0).await;
        for _ in 0..5 {
            queue.offer(Bytes::from_static(b"x")).await?;
        }
        let names = coord.get_children("/work/queue").await?;
        assert_eq!(names.len(), 5);

        queue.remove_many(&names).await?;
        assert!(coord.get_children("/work/queue").await?.is_empty());

        // Second call sees only missing nodes and succeeds silently.
        queue.remove_many(&names).await?;
        Ok(())
    }

    #[tokio::test]
    async fn stale_cache_entries_are_skipped() -> Result<()> {
        let (coord, queue) = open_queue(0).await;
        queue.offer(Bytes::from_static(b"first")).await?;
        queue.offer(Bytes::from_static(b"second")).await?;

        // A peer consumes the head behind the cache's back.
        let names = coord.get_children("/work/queue").await?;
        coord.delete(&paths::join("/work/queue", &names[0])).await?;

        // Selection drops the stale head and lands on the survivor.
        assert_eq!(queue.poll().await?.as_deref(), Some(b"second".as_ref()));
        Ok(())
    }

    #[tokio::test]
    async fn one_watch_is_armed_after_construction() {
        let (_coord, queue) = open_queue(0).await;
        assert_eq!(queue.watcher_count(), 1);
    }

    #[tokio::test]
    async fn peek_for_times_out_on_empty_queue() -> Result<()> {
        let (_coord, queue) = open_queue(0).await;
        let started = Instant::now();
        let head = queue.peek_for(Duration::from_millis(100)).await?;
        assert!(head.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn deadline_after_saturates_to_forever() {
        assert!(deadline_after(Duration::MAX).is_none());
        assert!(deadline_after(Duration::from_secs(1)).is_some());
    }
}
