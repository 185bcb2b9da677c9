//! The coordination-service client contract.
//!
//! [`Coordinator`] is the seam between convoy and whatever hierarchical
//! coordination service backs it. Implementations may target:
//!
//! - A ZooKeeper-compatible ensemble
//! - An etcd cluster (sequential naming emulated over a revision counter)
//! - [`MemoryCoordinator`](crate::memory::MemoryCoordinator) for tests
//!
//! ## Contract highlights
//!
//! - Sequential create modes must produce strictly monotonic, zero-padded
//!   suffixes per parent so that lexical order equals numeric order.
//! - Watches are one-shot: a registration delivers at most one change event
//!   on its [`WatchStream`]; session-state signals do not consume it.
//! - `multi_delete` is all-or-nothing: if any path cannot be deleted, no
//!   path is deleted and the first failure is returned.
//!
//! ## Thread Safety
//!
//! All methods are `Send + Sync` to support concurrent access from async
//! tasks; the queue layer calls into one shared client from many producers
//! and a consumer at once.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::event::WatchStream;
use crate::node::{CreateMode, NodeStat};

/// Async client for a hierarchical coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Creates a node at `path` with `data`.
    ///
    /// For sequential modes the service appends a zero-padded counter to
    /// `path` and the actual path is returned; for plain modes the returned
    /// path equals `path`.
    ///
    /// # Errors
    ///
    /// - [`CoordError::NoNode`] if the parent does not exist
    /// - [`CoordError::NodeExists`] on a non-sequential collision
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    /// [`CoordError::NodeExists`]: crate::error::CoordError::NodeExists
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String>;

    /// Reads the data of the node at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn get_data(&self, path: &str) -> Result<Bytes>;

    /// Reads the data of the node at `path` and installs a one-shot watch
    /// that fires when the node's data changes or the node is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn get_data_watch(&self, path: &str) -> Result<(Bytes, WatchStream)>;

    /// Overwrites the data of the node at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn set_data(&self, path: &str, data: Bytes) -> Result<()>;

    /// Deletes the node at `path`, accepting any data version.
    ///
    /// # Errors
    ///
    /// - [`CoordError::NoNode`] if the node does not exist
    /// - [`CoordError::NotEmpty`] if the node still has children
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    /// [`CoordError::NotEmpty`]: crate::error::CoordError::NotEmpty
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists the short names of the direct children of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Lists children and installs a one-shot watch that fires on the next
    /// child creation or deletion under `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, WatchStream)>;

    /// Atomically deletes every path in `paths`, or none of them.
    ///
    /// # Errors
    ///
    /// Returns the first per-path failure (commonly [`CoordError::NoNode`]);
    /// on error nothing has been deleted.
    ///
    /// [`CoordError::NoNode`]: crate::error::CoordError::NoNode
    async fn multi_delete(&self, paths: &[String]) -> Result<()>;

    /// Returns node metadata, or `None` if the node does not exist.
    async fn stat(&self, path: &str) -> Result<Option<NodeStat>>;
}
