//! Node naming under a queue directory.
//!
//! A queue directory holds two kinds of children, told apart by prefix:
//! `qn-<SEQ>` persistent request nodes and `qnr-<SEQ>` ephemeral response
//! nodes. `<SEQ>` is the service-assigned zero-padded sequence suffix; a
//! request/response pair shares it.

/// Prefix of persistent request nodes.
pub const REQUEST_PREFIX: &str = "qn-";

/// Prefix of ephemeral response nodes.
pub const RESPONSE_PREFIX: &str = "qnr-";

/// Joins a queue directory and a child's short name.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    format!("{dir}/{name}")
}

/// Returns the short name of `path` (the component after the last `/`).
#[must_use]
pub fn short_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// Returns true if `name` is a request node's short name.
#[must_use]
pub fn is_request(name: &str) -> bool {
    name.starts_with(REQUEST_PREFIX)
}

/// Returns the sequence suffix of a node name or path (the part after the
/// last `-`), or `None` for names with no suffix.
#[must_use]
pub fn sequence_suffix(name: &str) -> Option<&str> {
    name.rsplit_once('-').map(|(_, suffix)| suffix)
}

/// Derives the paired response path `<dir>/qnr-<SEQ>` from a request path
/// `<dir>/qn-<SEQ>`. Returns `None` if `request_path` has no suffix.
#[must_use]
pub fn response_path_for(request_path: &str) -> Option<String> {
    let dir = request_path.rsplit_once('/')?.0;
    let suffix = sequence_suffix(request_path)?;
    Some(format!("{dir}/{RESPONSE_PREFIX}{suffix}"))
}

/// Derives the paired request path `<dir>/qn-<SEQ>` from a response path
/// `<dir>/qnr-<SEQ>`. Returns `None` if `response_path` has no suffix.
#[must_use]
pub fn request_path_for(response_path: &str) -> Option<String> {
    let dir = response_path.rsplit_once('/')?.0;
    let suffix = sequence_suffix(response_path)?;
    Some(format!("{dir}/{REQUEST_PREFIX}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_short_name_round_trip() {
        let path = join("/work/queue", "qn-0000000007");
        assert_eq!(path, "/work/queue/qn-0000000007");
        assert_eq!(short_name(&path), "qn-0000000007");
    }

    #[test]
    fn request_detection() {
        assert!(is_request("qn-0000000001"));
        assert!(!is_request("qnr-0000000001"));
        assert!(!is_request("lock-0000000001"));
    }

    #[test]
    fn suffix_extraction() {
        assert_eq!(sequence_suffix("qn-0000000042"), Some("0000000042"));
        assert_eq!(
            sequence_suffix("/work/queue/qnr-0000000042"),
            Some("0000000042")
        );
        assert_eq!(sequence_suffix("plain"), None);
    }

    #[test]
    fn pair_derivation() {
        assert_eq!(
            response_path_for("/q/qn-0000000003").as_deref(),
            Some("/q/qnr-0000000003")
        );
        assert_eq!(
            request_path_for("/q/qnr-0000000003").as_deref(),
            Some("/q/qn-0000000003")
        );
        assert_eq!(response_path_for("noslash"), None);
    }
}
