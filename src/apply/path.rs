//! Path validator — allow-list enforcement for bundle-relative paths.
//!
//! Bundle paths are relative to the implicit `/etc/` root. Validation is a
//! pure function run once per bundle file before anything is decoded or
//! written. `..` is rejected on substring match: the applier treats paths
//! as relative, so any occurrence is suspicious, even inside a name.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains a parent-directory reference")]
    Traversal,
    #[error("path escapes the /etc/ root")]
    OutsideRoot,
    #[error("path is not under any allowed prefix")]
    NotAllowed,
}

/// Validate a bundle-relative path against the allow-list and return the
/// normalized absolute target (always under `/etc/`). The empty allow-list
/// rejects everything.
pub fn validate_path(allow_list: &[String], relative: &str) -> Result<String, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }
    if relative.contains("..") {
        return Err(PathError::Traversal);
    }

    let normalized = normalize(&format!("/etc/{}", relative));
    if !normalized.starts_with("/etc/") {
        return Err(PathError::OutsideRoot);
    }

    let candidate = format!("{}/", normalized);
    for entry in allow_list {
        let prefix = format!("{}/", entry.trim_end_matches('/'));
        if candidate.starts_with(&prefix) {
            return Ok(normalized);
        }
    }
    Err(PathError::NotAllowed)
}

/// Collapse duplicate separators and `.` segments. `..` never reaches this
/// point.
fn normalize(path: &str) -> String {
    let mut out = String::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> Vec<String> {
        vec!["/etc/systemd/".into(), "/etc/NetworkManager/".into()]
    }

    #[test]
    fn test_allowed_paths() {
        assert_eq!(
            validate_path(&allow(), "systemd/system/foo.conf").unwrap(),
            "/etc/systemd/system/foo.conf"
        );
        assert_eq!(
            validate_path(&allow(), "NetworkManager/conf.d/dns.conf").unwrap(),
            "/etc/NetworkManager/conf.d/dns.conf"
        );
    }

    #[test]
    fn test_path_equal_to_allow_entry() {
        // The entry itself, minus its trailing slash, is a valid target.
        assert_eq!(
            validate_path(&allow(), "systemd").unwrap(),
            "/etc/systemd"
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(
            validate_path(&allow(), "systemd//system/./unit.conf").unwrap(),
            "/etc/systemd/system/unit.conf"
        );
        assert_eq!(
            validate_path(&allow(), "./systemd/unit.conf").unwrap(),
            "/etc/systemd/unit.conf"
        );
    }

    #[test]
    fn test_traversal_rejected() {
        assert_eq!(
            validate_path(&allow(), "../../etc/passwd"),
            Err(PathError::Traversal)
        );
        assert_eq!(
            validate_path(&allow(), "systemd/../shadow"),
            Err(PathError::Traversal)
        );
        // Substring match: even inside a name.
        assert_eq!(
            validate_path(&allow(), "systemd/weird..name.conf"),
            Err(PathError::Traversal)
        );
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(validate_path(&allow(), ""), Err(PathError::Empty));
    }

    #[test]
    fn test_outside_allow_list_rejected() {
        assert_eq!(
            validate_path(&allow(), "passwd"),
            Err(PathError::NotAllowed)
        );
        assert_eq!(
            validate_path(&allow(), "ssh/sshd_config"),
            Err(PathError::NotAllowed)
        );
        // Sibling prefix must not match: /etc/systemd-private is not
        // /etc/systemd/.
        assert_eq!(
            validate_path(&allow(), "systemd-private/foo"),
            Err(PathError::NotAllowed)
        );
    }

    #[test]
    fn test_dot_only_path_escapes_root() {
        assert_eq!(validate_path(&allow(), "."), Err(PathError::OutsideRoot));
        assert_eq!(validate_path(&allow(), "/"), Err(PathError::OutsideRoot));
    }

    #[test]
    fn test_empty_allow_list_rejects_everything() {
        assert_eq!(
            validate_path(&[], "systemd/system/foo.conf"),
            Err(PathError::NotAllowed)
        );
    }
}
