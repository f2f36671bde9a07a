//! Per-client-IP rate limiter with failure-proportional backoff.
//!
//! Below the escalation threshold a failure only stamps an advisory
//! cooldown (the 401 carries `Retry-After`); once the threshold is
//! reached the client is actually locked out and requests are refused
//! with 429 until the window passes. Success clears the record, and a
//! background sweeper drops records that have been idle too long.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Outcome of recording one more authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// Still below the threshold: respond 401 with this advisory cooldown.
    Backoff { retry_after_secs: u64 },
    /// At or past the threshold: respond 429, locked for this long.
    Lockout { retry_after_secs: u64 },
}

impl Penalty {
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Penalty::Backoff { retry_after_secs } | Penalty::Lockout { retry_after_secs } => {
                *retry_after_secs
            }
        }
    }
}

struct ClientRecord {
    failures: u32,
    locked_until: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    records: Mutex<HashMap<IpAddr, ClientRecord>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Pre-flight check. `Err(remaining)` when the client is locked out.
    pub fn check(&self, client: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&client) {
            record.last_seen = now;
            if record.failures >= self.config.failure_threshold && record.locked_until > now {
                let remaining = (record.locked_until - now).as_secs().max(1);
                return Err(remaining);
            }
        }
        Ok(())
    }

    /// Record a failed authentication attempt and compute the penalty.
    pub fn record_failure(&self, client: IpAddr) -> Penalty {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        let record = records.entry(client).or_insert(ClientRecord {
            failures: 0,
            locked_until: now,
            last_seen: now,
        });
        record.failures += 1;
        record.last_seen = now;

        let lockout_secs = self.lockout_secs(record.failures);
        record.locked_until = now + Duration::from_secs(lockout_secs);

        if record.failures >= self.config.failure_threshold {
            Penalty::Lockout {
                retry_after_secs: lockout_secs,
            }
        } else {
            Penalty::Backoff {
                retry_after_secs: lockout_secs,
            }
        }
    }

    /// A successful authentication clears the client's record.
    pub fn record_success(&self, client: IpAddr) {
        self.records.lock().unwrap().remove(&client);
    }

    /// Drop records idle longer than the configured window.
    pub fn sweep_idle(&self) -> usize {
        let idle = Duration::from_secs(self.config.idle_expiry_secs);
        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| now.duration_since(r.last_seen) <= idle);
        before - records.len()
    }

    /// Lockout duration after the n-th consecutive failure. Doubles from
    /// the base below the threshold and from the escalated base above it,
    /// capped; monotone non-decreasing by construction (config-validated).
    fn lockout_secs(&self, failures: u32) -> u64 {
        let cfg = &self.config;
        if failures < cfg.failure_threshold {
            let doublings = (failures - 1).min(32);
            (cfg.base_lockout_secs << doublings).min(cfg.max_lockout_secs)
        } else {
            let doublings = (failures - cfg.failure_threshold).min(32);
            cfg.escalated_lockout_secs
                .checked_shl(doublings)
                .unwrap_or(cfg.max_lockout_secs)
                .min(cfg.max_lockout_secs)
        }
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

/// Periodically sweep idle records until shutdown fires.
pub async fn run_sweeper(
    limiter: std::sync::Arc<RateLimiter>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = limiter.sweep_idle();
                if removed > 0 {
                    debug!(removed, "Idle rate-limit records swept");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
