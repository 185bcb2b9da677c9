//! # convoy-coord
//!
//! The coordination-service contract for Convoy: an async client trait over
//! a ZooKeeper-like hierarchical service, plus the types it speaks.
//!
//! This crate defines:
//!
//! - **Client trait**: [`Coordinator`], the seam every backend implements
//! - **Node model**: [`CreateMode`], [`NodeStat`], [`SessionId`]
//! - **Watches**: [`WatchedEvent`], [`WatchStream`] one-shot registrations
//! - **Errors**: [`CoordError`] with the `NoNode` recovery branch point
//! - **Test backend**: [`memory::MemoryCoordinator`], a process-local tree
//!
//! ## Crate Boundary
//!
//! `convoy-coord` knows nothing about queues. Higher layers build ordered
//! work distribution out of the primitives here: sequential ephemeral
//! nodes, one-shot watches, and atomic multi-ops.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod event;
pub mod memory;
pub mod node;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use convoy_coord::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::Coordinator;
    pub use crate::error::{CoordError, Result};
    pub use crate::event::{SessionState, WatchEventKind, WatchStream, WatchedEvent};
    pub use crate::node::{CreateMode, NodeStat, SessionId};
}

// Re-export key types at crate root for ergonomics
pub use client::Coordinator;
pub use error::{CoordError, Result};
pub use event::{SessionState, WatchEventKind, WatchSender, WatchStream, WatchedEvent};
pub use node::{format_sequence, CreateMode, NodeStat, SessionId, SEQUENCE_WIDTH};
