//! Bundle validation and decoding.
//!
//! A bundle lives for one `/configure` call. Shape, mode, and path checks
//! run before any base64 is decoded; decoding then proceeds file by file
//! with a running size total so an oversized bundle is rejected without
//! buffering all of it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::path::{validate_path, PathError};

pub const MAX_FILE_COUNT: usize = 100;
pub const MAX_BUNDLE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub files: Vec<BundleFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    /// Base64-encoded file contents.
    pub content: String,
    /// Unix permission bits, 0..=0o777.
    pub mode: i64,
}

/// A validated, decoded bundle entry ready for staging.
#[derive(Debug, PartialEq)]
pub struct DecodedFile {
    /// Original bundle-relative path.
    pub relative: String,
    /// Normalized absolute target, before the chroot prefix.
    pub target: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("bundle contains no files")]
    Empty,
    #[error("bundle exceeds {MAX_FILE_COUNT} files")]
    TooManyFiles,
    #[error("file '{0}' has empty content")]
    EmptyContent(String),
    #[error("file '{0}' has mode outside [0, 0o777]")]
    InvalidMode(String),
    #[error("file '{path}': {source}")]
    Path {
        path: String,
        #[source]
        source: PathError,
    },
    #[error("file '{0}' is not valid base64")]
    Encoding(String),
    #[error("bundle exceeds {MAX_BUNDLE_SIZE} decoded bytes")]
    TooLarge,
}

/// Validate every file against the allow-list and decode the contents.
/// Paths are checked before any decoding happens.
pub fn validate_bundle(
    bundle: &ConfigBundle,
    allow_list: &[String],
) -> Result<Vec<DecodedFile>, BundleError> {
    if bundle.files.is_empty() {
        return Err(BundleError::Empty);
    }
    if bundle.files.len() > MAX_FILE_COUNT {
        return Err(BundleError::TooManyFiles);
    }

    let mut targets = Vec::with_capacity(bundle.files.len());
    for file in &bundle.files {
        if file.content.is_empty() {
            return Err(BundleError::EmptyContent(file.path.clone()));
        }
        if !(0..=0o777).contains(&file.mode) {
            return Err(BundleError::InvalidMode(file.path.clone()));
        }
        let target = validate_path(allow_list, &file.path).map_err(|source| BundleError::Path {
            path: file.path.clone(),
            source,
        })?;
        targets.push(target);
    }

    let mut decoded = Vec::with_capacity(bundle.files.len());
    let mut total = 0usize;
    for (file, target) in bundle.files.iter().zip(targets) {
        let content = STANDARD
            .decode(&file.content)
            .map_err(|_| BundleError::Encoding(file.path.clone()))?;
        total += content.len();
        if total > MAX_BUNDLE_SIZE {
            return Err(BundleError::TooLarge);
        }
        decoded.push(DecodedFile {
            relative: file.path.clone(),
            target,
            content,
            mode: file.mode as u32,
        });
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> Vec<String> {
        vec!["/etc/systemd/".into()]
    }

    fn file(path: &str, content: &[u8], mode: i64) -> BundleFile {
        BundleFile {
            path: path.into(),
            content: STANDARD.encode(content),
            mode,
        }
    }

    #[test]
    fn test_valid_bundle_decodes() {
        let bundle = ConfigBundle {
            files: vec![file("systemd/system/a.conf", b"hello", 0o644)],
        };
        let decoded = validate_bundle(&bundle, &allow()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].target, "/etc/systemd/system/a.conf");
        assert_eq!(decoded[0].content, b"hello");
        assert_eq!(decoded[0].mode, 0o644);
    }

    #[test]
    fn test_empty_bundle_rejected() {
        let bundle = ConfigBundle { files: vec![] };
        assert_eq!(validate_bundle(&bundle, &allow()), Err(BundleError::Empty));
    }

    #[test]
    fn test_file_count_boundary() {
        let mk = |n: usize| ConfigBundle {
            files: (0..n)
                .map(|i| file(&format!("systemd/f{}.conf", i), b"x", 0o644))
                .collect(),
        };
        assert!(validate_bundle(&mk(MAX_FILE_COUNT), &allow()).is_ok());
        assert_eq!(
            validate_bundle(&mk(MAX_FILE_COUNT + 1), &allow()),
            Err(BundleError::TooManyFiles)
        );
    }

    #[test]
    fn test_mode_boundaries() {
        for mode in [0, 0o777] {
            let bundle = ConfigBundle {
                files: vec![file("systemd/a.conf", b"x", mode)],
            };
            assert!(validate_bundle(&bundle, &allow()).is_ok());
        }
        for mode in [-1, 0o1000] {
            let bundle = ConfigBundle {
                files: vec![file("systemd/a.conf", b"x", mode)],
            };
            assert_eq!(
                validate_bundle(&bundle, &allow()),
                Err(BundleError::InvalidMode("systemd/a.conf".into()))
            );
        }
    }

    #[test]
    fn test_size_boundary() {
        let exact = ConfigBundle {
            files: vec![file("systemd/big.bin", &vec![0u8; MAX_BUNDLE_SIZE], 0o644)],
        };
        assert!(validate_bundle(&exact, &allow()).is_ok());

        let over = ConfigBundle {
            files: vec![
                file("systemd/big.bin", &vec![0u8; MAX_BUNDLE_SIZE], 0o644),
                file("systemd/one.bin", b"x", 0o644),
            ],
        };
        assert_eq!(validate_bundle(&over, &allow()), Err(BundleError::TooLarge));
    }

    #[test]
    fn test_bad_base64_rejected() {
        let bundle = ConfigBundle {
            files: vec![BundleFile {
                path: "systemd/a.conf".into(),
                content: "@@not-base64@@".into(),
                mode: 0o644,
            }],
        };
        assert_eq!(
            validate_bundle(&bundle, &allow()),
            Err(BundleError::Encoding("systemd/a.conf".into()))
        );
    }

    #[test]
    fn test_traversal_rejected_before_decode() {
        let bundle = ConfigBundle {
            files: vec![BundleFile {
                path: "../../etc/passwd".into(),
                // Deliberately invalid base64: path checks come first.
                content: "!!!".into(),
                mode: 0o644,
            }],
        };
        assert!(matches!(
            validate_bundle(&bundle, &allow()),
            Err(BundleError::Path {
                source: PathError::Traversal,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_content_rejected() {
        let bundle = ConfigBundle {
            files: vec![BundleFile {
                path: "systemd/a.conf".into(),
                content: String::new(),
                mode: 0o644,
            }],
        };
        assert_eq!(
            validate_bundle(&bundle, &allow()),
            Err(BundleError::EmptyContent("systemd/a.conf".into()))
        );
    }
}
