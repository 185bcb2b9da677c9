//! In-memory coordination service for testing and local development.
//!
//! [`MemoryCoordinator`] implements the full [`Coordinator`] contract against
//! a process-local node tree: sequential naming, ephemeral ownership,
//! one-shot watches, and atomic multi-deletes.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **Single-process only**: nodes are not visible across process boundaries
//!
//! ## Sessions
//!
//! Each handle carries a session identifier. [`MemoryCoordinator::new`]
//! opens a fresh tree with the first session; [`new_session`] opens another
//! session over the same tree, and [`expire_session`] kills one, deleting its
//! ephemeral nodes and firing their watches. Cloning a handle shares the
//! session.
//!
//! ## Test-harness hooks
//!
//! [`drop_watches`] forcibly discards the registrations on a path without
//! firing them (models watch transport loss), and [`emit_session_event`]
//! broadcasts a bare session-state signal to every live registration.
//!
//! [`new_session`]: MemoryCoordinator::new_session
//! [`expire_session`]: MemoryCoordinator::expire_session
//! [`drop_watches`]: MemoryCoordinator::drop_watches
//! [`emit_session_event`]: MemoryCoordinator::emit_session_event

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::Coordinator;
use crate::error::{CoordError, Result};
use crate::event::{
    SessionState, WatchEventKind, WatchSender, WatchStream, WatchedEvent,
};
use crate::node::{format_sequence, CreateMode, NodeStat, SessionId};

/// A node in the in-memory tree.
#[derive(Debug)]
struct ZNode {
    data: Bytes,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    /// Counter for sequential children; one per parent, shared across
    /// name prefixes, so suffixes are unique within the directory.
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Bytes, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    child_watches: HashMap<String, Vec<WatchSender>>,
    data_watches: HashMap<String, Vec<WatchSender>>,
    expired: HashSet<SessionId>,
}

impl Tree {
    /// Fires and consumes the one-shot registrations for `path` in `which`.
    fn fire(
        which: &mut HashMap<String, Vec<WatchSender>>,
        path: &str,
        kind: WatchEventKind,
    ) {
        if let Some(senders) = which.remove(path) {
            let event = WatchedEvent::change(kind, path);
            for tx in senders {
                // A closed stream just means the watcher went away.
                let _ = tx.send(event.clone());
            }
        }
    }

    fn fire_child_watches(&mut self, path: &str, kind: WatchEventKind) {
        Self::fire(&mut self.child_watches, path, kind);
    }

    fn fire_data_watches(&mut self, path: &str, kind: WatchEventKind) {
        Self::fire(&mut self.data_watches, path, kind);
    }

    fn has_children(&self, path: &str) -> bool {
        !self.children_of(path).is_empty()
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| &p[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect()
    }

    /// Removes `path` and fires deletion watches plus the parent's child
    /// watch. The caller has already validated existence and emptiness.
    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        self.fire_data_watches(path, WatchEventKind::Deleted);
        self.fire_child_watches(path, WatchEventKind::Deleted);
        let parent = parent_of(path).to_string();
        self.fire_child_watches(&parent, WatchEventKind::ChildrenChanged);
    }
}

/// Returns the parent path of `path` ("/" for top-level nodes).
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') && path.len() > 1 && !path.ends_with('/') && !path.contains("//") {
        Ok(())
    } else {
        Err(CoordError::connection_loss(format!(
            "invalid path: {path:?}"
        )))
    }
}

/// In-memory [`Coordinator`] implementation.
///
/// ## Example
///
/// ```rust
/// use bytes::Bytes;
/// use convoy_coord::memory::MemoryCoordinator;
/// use convoy_coord::{Coordinator, CreateMode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> convoy_coord::Result<()> {
/// let coord = MemoryCoordinator::new();
/// coord.ensure_path("/work/queue")?;
/// let path = coord
///     .create("/work/queue/qn-", Bytes::from_static(b"job"), CreateMode::PersistentSequential)
///     .await?;
/// assert_eq!(path, "/work/queue/qn-0000000000");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
    session: SessionId,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<Tree>,
    next_session: AtomicU64,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// Creates a fresh tree with a root node and the first session.
    #[must_use]
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes
            .insert("/".to_string(), ZNode::new(Bytes::new(), None));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(tree),
                next_session: AtomicU64::new(2),
            }),
            session: SessionId::new(1),
        }
    }

    /// Opens another session over the same tree.
    #[must_use]
    pub fn new_session(&self) -> Self {
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(&self.shared),
            session: SessionId::new(id),
        }
    }

    /// Returns this handle's session identifier.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// Creates `path` and any missing ancestors as persistent nodes.
    ///
    /// Intended for test setup; existing nodes are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state lock is poisoned.
    pub fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut tree = self.tree()?;
        let mut at = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            at.push('/');
            at.push_str(segment);
            if !tree.nodes.contains_key(&at) {
                tree.nodes
                    .insert(at.clone(), ZNode::new(Bytes::new(), None));
                let parent = parent_of(&at).to_string();
                tree.fire_child_watches(&parent, WatchEventKind::ChildrenChanged);
            }
        }
        Ok(())
    }

    /// Expires `session`: its ephemeral nodes are deleted (firing their
    /// watches) and every further operation through a handle bound to it
    /// fails with [`CoordError::SessionExpired`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the state lock is poisoned.
    pub fn expire_session(&self, session: SessionId) -> Result<()> {
        let mut tree = self.tree()?;
        tree.expired.insert(session);
        let doomed: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            tree.remove_node(&path);
        }
        Ok(())
    }

    /// Forcibly discards all watch registrations on `path` without firing
    /// them. The corresponding [`WatchStream`]s close with no event, which is
    /// how a lost watch manifests to the holder.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state lock is poisoned.
    pub fn drop_watches(&self, path: &str) -> Result<()> {
        let mut tree = self.tree()?;
        tree.child_watches.remove(path);
        tree.data_watches.remove(path);
        Ok(())
    }

    /// Broadcasts a bare session-state event to every live registration
    /// without consuming any of them.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state lock is poisoned.
    pub fn emit_session_event(&self, state: SessionState) -> Result<()> {
        let tree = self.tree()?;
        let event = WatchedEvent::session(state);
        for senders in tree.child_watches.values().chain(tree.data_watches.values()) {
            for tx in senders {
                let _ = tx.send(event.clone());
            }
        }
        Ok(())
    }

    fn tree(&self) -> Result<MutexGuard<'_, Tree>> {
        self.shared
            .state
            .lock()
            .map_err(|_| CoordError::connection_loss("coordinator state lock poisoned"))
    }

    fn live_tree(&self) -> Result<MutexGuard<'_, Tree>> {
        let tree = self.tree()?;
        if tree.expired.contains(&self.session) {
            return Err(CoordError::SessionExpired);
        }
        Ok(tree)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut tree = self.live_tree()?;
        let parent = parent_of(path).to_string();
        let actual = if mode.is_sequential() {
            let Some(parent_node) = tree.nodes.get_mut(&parent) else {
                return Err(CoordError::no_node(path));
            };
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{}", format_sequence(sequence))
        } else {
            if !tree.nodes.contains_key(&parent) {
                return Err(CoordError::no_node(path));
            }
            if tree.nodes.contains_key(path) {
                return Err(CoordError::node_exists(path));
            }
            path.to_string()
        };

        let owner = mode.is_ephemeral().then_some(self.session);
        tree.nodes.insert(actual.clone(), ZNode::new(data, owner));
        tree.fire_child_watches(&parent, WatchEventKind::ChildrenChanged);
        Ok(actual)
    }

    async fn get_data(&self, path: &str) -> Result<Bytes> {
        let tree = self.live_tree()?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordError::no_node(path))
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Bytes, WatchStream)> {
        let mut tree = self.live_tree()?;
        let Some(node) = tree.nodes.get(path) else {
            return Err(CoordError::no_node(path));
        };
        let data = node.data.clone();
        let (tx, stream) = WatchStream::channel();
        tree.data_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((data, stream))
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<()> {
        let mut tree = self.live_tree()?;
        let Some(node) = tree.nodes.get_mut(path) else {
            return Err(CoordError::no_node(path));
        };
        node.data = data;
        node.version += 1;
        tree.fire_data_watches(path, WatchEventKind::DataChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut tree = self.live_tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::no_node(path));
        }
        if tree.has_children(path) {
            return Err(CoordError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.remove_node(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.live_tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::no_node(path));
        }
        Ok(tree.children_of(path))
    }

    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, WatchStream)> {
        let mut tree = self.live_tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::no_node(path));
        }
        let children = tree.children_of(path);
        let (tx, stream) = WatchStream::channel();
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((children, stream))
    }

    async fn multi_delete(&self, paths: &[String]) -> Result<()> {
        let mut tree = self.live_tree()?;
        // All-or-nothing: validate every sub-op before mutating anything.
        for path in paths {
            if !tree.nodes.contains_key(path) {
                return Err(CoordError::no_node(path));
            }
            if tree.has_children(path) {
                return Err(CoordError::NotEmpty {
                    path: path.clone(),
                });
            }
        }
        for path in paths {
            tree.remove_node(path);
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>> {
        let tree = self.live_tree()?;
        let Some(node) = tree.nodes.get(path) else {
            return Ok(None);
        };
        let num_children = u32::try_from(tree.children_of(path).len()).unwrap_or(u32::MAX);
        Ok(Some(NodeStat {
            num_children,
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_counter_is_shared_across_prefixes() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;

        let a = coord
            .create("/q/qnr-", Bytes::new(), CreateMode::EphemeralSequential)
            .await?;
        let b = coord
            .create("/q/qn-", Bytes::from_static(b"x"), CreateMode::PersistentSequential)
            .await?;

        assert_eq!(a, "/q/qnr-0000000000");
        assert_eq!(b, "/q/qn-0000000001");
        Ok(())
    }

    #[tokio::test]
    async fn create_without_parent_fails() {
        let coord = MemoryCoordinator::new();
        let err = coord
            .create("/missing/child", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn duplicate_create_fails() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        coord
            .create("/q/node", Bytes::new(), CreateMode::Persistent)
            .await?;
        let err = coord
            .create("/q/node", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NodeExists { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn child_watch_fires_once_on_create() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;

        let (children, mut watch) = coord.get_children_watch("/q").await?;
        assert!(children.is_empty());

        coord
            .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
            .await?;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
        assert_eq!(event.path, "/q");

        // One-shot: a second create does not reach this registration.
        coord
            .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
            .await?;
        assert!(watch.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn data_watch_fires_on_set_and_on_delete() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        coord
            .create("/q/node", Bytes::new(), CreateMode::Persistent)
            .await?;

        let (data, mut watch) = coord.get_data_watch("/q/node").await?;
        assert!(data.is_empty());
        coord.set_data("/q/node", Bytes::from_static(b"hi")).await?;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::DataChanged);

        let (_, mut watch) = coord.get_data_watch("/q/node").await?;
        coord.delete("/q/node").await?;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
        Ok(())
    }

    #[tokio::test]
    async fn session_expiry_deletes_ephemerals_and_blocks_the_session() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;

        let submitter = coord.new_session();
        let path = submitter
            .create("/q/qnr-", Bytes::new(), CreateMode::EphemeralSequential)
            .await?;
        let (_, mut watch) = coord.get_data_watch(&path).await?;

        coord.expire_session(submitter.session_id())?;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
        assert!(coord.stat(&path).await?.is_none());

        let err = submitter.get_data("/q").await.unwrap_err();
        assert!(matches!(err, CoordError::SessionExpired));
        Ok(())
    }

    #[tokio::test]
    async fn multi_delete_is_atomic() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        let a = coord
            .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
            .await?;
        let b = coord
            .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
            .await?;

        let err = coord
            .multi_delete(&[a.clone(), "/q/qn-9999999999".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_no_node());
        // Nothing was deleted.
        assert_eq!(coord.get_children("/q").await?.len(), 2);

        coord.multi_delete(&[a, b]).await?;
        assert!(coord.get_children("/q").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stat_counts_children() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        for _ in 0..3 {
            coord
                .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
                .await?;
        }
        let stat = coord.stat("/q").await?.unwrap();
        assert_eq!(stat.num_children, 3);
        assert!(coord.stat("/nope").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_watches_close_without_firing() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        let (_, mut watch) = coord.get_children_watch("/q").await?;
        coord.drop_watches("/q")?;
        assert!(watch.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn session_events_do_not_consume_watches() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q")?;
        let (_, mut watch) = coord.get_children_watch("/q").await?;

        coord.emit_session_event(SessionState::Disconnected)?;
        let event = watch.recv().await.unwrap();
        assert!(event.is_session_only());

        // The registration is still live and fires on the next change.
        coord
            .create("/q/qn-", Bytes::new(), CreateMode::PersistentSequential)
            .await?;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
        Ok(())
    }

    #[tokio::test]
    async fn delete_rejects_non_empty_nodes() -> Result<()> {
        let coord = MemoryCoordinator::new();
        coord.ensure_path("/q/inner")?;
        let err = coord.delete("/q").await.unwrap_err();
        assert!(matches!(err, CoordError::NotEmpty { .. }));
        Ok(())
    }

    #[test]
    fn parent_of_handles_root_children() {
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
    }
}
