//! Daemon configuration — loaded once at startup from a YAML file.
//!
//! The file is the single source of truth for identity, rate limiting,
//! filesystem policy, and the privileged command allow-list. A missing or
//! invalid file is fatal: a provisioning daemon with a half-formed policy
//! must not serve.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_sentinel_file")]
    pub sentinel_file: PathBuf,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    /// Opaque SRP salt, base64-encoded in the file.
    pub salt_base64: String,
    /// External helper whose stdout is the device-specific secret.
    pub password_generator: PathBuf,
    #[serde(default = "default_generator_timeout")]
    pub generator_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Failure count at which responses switch from 401 to 429.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_base_lockout")]
    pub base_lockout_secs: u64,
    #[serde(default = "default_escalated_lockout")]
    pub escalated_lockout_secs: u64,
    #[serde(default = "default_max_lockout")]
    pub max_lockout_secs: u64,
    /// Idle records older than this are swept.
    #[serde(default = "default_idle_expiry")]
    pub idle_expiry_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_lockout_secs: default_base_lockout(),
            escalated_lockout_secs: default_escalated_lockout(),
            max_lockout_secs: default_max_lockout(),
            idle_expiry_secs: default_idle_expiry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Absolute directory prefixes under which bundle files may land.
    pub allow_list: Vec<String>,
    /// Chroot-style prefix applied to every target path. Empty = real root.
    #[serde(default)]
    pub root_directory: PathBuf,
    /// Base directory for apply-* staging dirs. Empty = system temp dir.
    #[serde(default)]
    pub staging_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Decode the configured salt. Validated at load time, so this cannot
    /// fail afterwards.
    pub fn salt(&self) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.auth.salt_base64)
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.auth.username.is_empty() {
            bail!("auth.username must not be empty");
        }
        let salt = base64::engine::general_purpose::STANDARD
            .decode(&self.auth.salt_base64)
            .context("auth.salt_base64 is not valid base64")?;
        if salt.is_empty() {
            bail!("auth.salt_base64 must decode to at least one byte");
        }
        if self.auth.password_generator.as_os_str().is_empty() {
            bail!("auth.password_generator must be set");
        }
        if self.paths.allow_list.iter().any(|p| !p.starts_with('/')) {
            bail!("paths.allow_list entries must be absolute directory prefixes");
        }
        // The lockout progression must be monotone non-decreasing.
        let rl = &self.rate_limit;
        if rl.failure_threshold == 0 {
            bail!("rate_limit.failure_threshold must be at least 1");
        }
        if rl.base_lockout_secs > rl.escalated_lockout_secs
            || rl.escalated_lockout_secs > rl.max_lockout_secs
        {
            bail!("rate_limit lockouts must be monotone: base <= escalated <= max");
        }
        let mut seen = std::collections::HashSet::new();
        for cmd in &self.commands {
            if cmd.id.is_empty() {
                bail!("commands entries must have a non-empty id");
            }
            if !seen.insert(cmd.id.as_str()) {
                bail!("duplicate command id '{}'", cmd.id);
            }
        }
        Ok(())
    }
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8443".parse().unwrap()
}
fn default_session_ttl() -> u64 {
    1800
}
fn default_inactivity_timeout() -> u64 {
    900
}
fn default_sentinel_file() -> PathBuf {
    PathBuf::from("/etc/boardingpass/issued")
}
fn default_drain_timeout() -> u64 {
    30
}
fn default_generator_timeout() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    4
}
fn default_base_lockout() -> u64 {
    1
}
fn default_escalated_lockout() -> u64 {
    8
}
fn default_max_lockout() -> u64 {
    300
}
fn default_idle_expiry() -> u64 {
    900
}
