//! Shared argument validation for tool handlers.

use super::ToolFailure;

const MAX_NODE_NAME_LEN: usize = 253;

/// RFC 1123 DNS subdomain: dot-separated labels, each 1-63 chars, alphanumeric
/// with internal hyphens, total length <= 253.
pub fn validate_node_name(name: &str) -> Result<(), ToolFailure> {
    let invalid = || ToolFailure::Validation(format!("invalid node_name: {name:?}"));

    if name.is_empty() || name.len() > MAX_NODE_NAME_LEN {
        return Err(invalid());
    }

    let labels_ok = name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric())
            && label
                .chars()
                .last()
                .is_some_and(|c| c.is_ascii_alphanumeric())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    if labels_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_node_names() {
        assert!(validate_node_name("gpu-node-01").is_ok());
        assert!(validate_node_name("ip-10-0-1-2.us-west-2.compute.internal").is_ok());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_node_name("../etc/passwd").is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name(&"a".repeat(254)).is_err());
    }

    #[test]
    fn rejects_labels_with_bad_edges() {
        assert!(validate_node_name("-leading-hyphen").is_err());
        assert!(validate_node_name("trailing-hyphen-").is_err());
        assert!(validate_node_name("has a space").is_err());
    }
}
