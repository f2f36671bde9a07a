//! Password-generator bridge — the device secret comes from an external
//! helper, never from disk.
//!
//! The configured helper is trusted to print the device-specific secret on
//! stdout. Running it on every handshake means the password can be rotated
//! out-of-band by changing what the helper returns; the daemon itself
//! never stores it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("password generator failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("password generator exceeded {0:?} timeout")]
    Timeout(Duration),
    #[error("password generator exited with status {0}")]
    NonZeroExit(i32),
    #[error("password generator produced no output")]
    Empty,
}

/// Invokes the external helper and captures its stdout as the secret.
#[derive(Debug, Clone)]
pub struct PasswordGenerator {
    path: PathBuf,
    timeout: Duration,
}

impl PasswordGenerator {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Run the helper to completion and return its stdout with a single
    /// trailing newline trimmed. The returned buffer is zeroized on drop.
    pub async fn generate(&self) -> Result<Zeroizing<Vec<u8>>, GeneratorError> {
        let child = Command::new(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GeneratorError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(GeneratorError::NonZeroExit(
                output.status.code().unwrap_or(-1),
            ));
        }

        let mut secret = Zeroizing::new(output.stdout);
        if secret.last() == Some(&b'\n') {
            secret.pop();
        }
        if secret.is_empty() {
            return Err(GeneratorError::Empty);
        }
        Ok(secret)
    }
}
