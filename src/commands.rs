//! Privileged command runner — exact-id allow-list, pre-identified argv.
//!
//! Clients name a command by id only; path and arguments come from the
//! configuration, never from the request. A non-zero exit code is a valid
//! outcome and is returned to the caller, not an error.

use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::CommandSpec;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command '{0}' is not in the allow-list")]
    NotAllowed(String),
    #[error("command '{id}' could not be executed: {source}")]
    Failed {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct CommandRunner {
    commands: HashMap<String, CommandSpec>,
}

impl CommandRunner {
    pub fn new(specs: Vec<CommandSpec>) -> Self {
        let commands = specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { commands }
    }

    pub async fn run(&self, id: &str) -> Result<CommandOutcome, CommandError> {
        let spec = self
            .commands
            .get(id)
            .ok_or_else(|| CommandError::NotAllowed(id.to_string()))?;

        info!(command = %spec.id, path = %spec.path.display(), "Running allow-listed command");
        let output = Command::new(&spec.path)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Failed {
                id: id.to_string(),
                source,
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(command = %spec.id, exit_code, "Command exited non-zero");
        }
        Ok(CommandOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
