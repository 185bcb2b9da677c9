//! Error types for the queue domain.

use convoy_coord::CoordError;

/// The result type used throughout convoy-queue.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required remove found the queue empty.
    #[error("queue is empty: {dir}")]
    Empty {
        /// The queue directory.
        dir: String,
    },

    /// An offer was rejected because the queue is at capacity.
    #[error("queue is full: {dir} holds {max} elements")]
    QueueFull {
        /// The queue directory.
        dir: String,
        /// The configured capacity bound.
        max: usize,
    },

    /// A queue payload or node name could not be interpreted.
    #[error("payload error: {message}")]
    Payload {
        /// Description of what could not be decoded.
        message: String,
    },

    /// The coordination service failed in a way the queue cannot recover
    /// from locally. The queue instance remains usable once the client
    /// reconnects and the watch re-installs.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),
}

impl Error {
    /// Creates a new payload error.
    #[must_use]
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    /// Returns true if this wraps a "no such node" coordination result.
    ///
    /// Consumers treat this as "consumed by a peer", not as a failure.
    #[must_use]
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::Coordination(err) if err.is_no_node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_display() {
        let err = Error::QueueFull {
            dir: "/work/queue".into(),
            max: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("/work/queue"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn no_node_predicate_follows_the_wrapped_error() {
        let err = Error::from(CoordError::no_node("/work/queue/qn-0000000000"));
        assert!(err.is_no_node());

        assert!(!Error::from(CoordError::SessionExpired).is_no_node());
        assert!(!Error::payload("bad envelope").is_no_node());
    }
}
