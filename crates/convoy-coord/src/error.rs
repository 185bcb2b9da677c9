//! Error types and result alias for coordination-service operations.
//!
//! The variants mirror the failure classes a hierarchical coordination
//! service can report. Callers that implement local recovery (queues,
//! locks) branch on [`CoordError::is_no_node`]; everything else is an
//! infrastructure failure to be propagated.

/// The result type used throughout convoy-coord.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors reported by a coordination service.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The addressed node does not exist (or its parent is missing).
    #[error("no node: {path}")]
    NoNode {
        /// The path that was addressed.
        path: String,
    },

    /// A node already exists at the addressed path.
    #[error("node exists: {path}")]
    NodeExists {
        /// The path that was addressed.
        path: String,
    },

    /// The node still has children and cannot be deleted.
    #[error("node not empty: {path}")]
    NotEmpty {
        /// The path that was addressed.
        path: String,
    },

    /// A versioned write lost an optimistic-concurrency race.
    #[error("bad version for {path}: expected {expected}, actual {actual}")]
    BadVersion {
        /// The path that was addressed.
        path: String,
        /// The version the caller supplied.
        expected: i32,
        /// The version the service holds.
        actual: i32,
    },

    /// The client session has expired; ephemeral nodes owned by it are gone.
    #[error("session expired")]
    SessionExpired,

    /// The connection to the service was lost mid-operation.
    #[error("connection loss: {message}")]
    ConnectionLoss {
        /// Description of the transport failure.
        message: String,
    },
}

impl CoordError {
    /// Creates a new [`CoordError::NoNode`] for `path`.
    #[must_use]
    pub fn no_node(path: impl Into<String>) -> Self {
        Self::NoNode { path: path.into() }
    }

    /// Creates a new [`CoordError::NodeExists`] for `path`.
    #[must_use]
    pub fn node_exists(path: impl Into<String>) -> Self {
        Self::NodeExists { path: path.into() }
    }

    /// Creates a new [`CoordError::ConnectionLoss`] with the given message.
    #[must_use]
    pub fn connection_loss(message: impl Into<String>) -> Self {
        Self::ConnectionLoss {
            message: message.into(),
        }
    }

    /// Returns true if this error means the addressed node was missing.
    ///
    /// Queue consumers treat a missing node as "consumed by a peer" rather
    /// than as a failure, so this is the main recovery branch point.
    #[must_use]
    pub const fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_node_display_and_predicate() {
        let err = CoordError::no_node("/work/queue/qn-0000000001");
        assert!(err.is_no_node());
        assert!(err.to_string().contains("/work/queue/qn-0000000001"));
    }

    #[test]
    fn other_errors_are_not_no_node() {
        assert!(!CoordError::SessionExpired.is_no_node());
        assert!(!CoordError::node_exists("/a").is_no_node());
        assert!(!CoordError::connection_loss("socket closed").is_no_node());
    }

    #[test]
    fn bad_version_display() {
        let err = CoordError::BadVersion {
            path: "/a".into(),
            expected: 3,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("actual 5"));
    }
}
