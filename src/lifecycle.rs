//! Lifecycle control — the one-shot sentinel, graceful shutdown, and the
//! inactivity timeout.
//!
//! The sentinel file is the "already provisioned" gate: present at
//! startup means the daemon must refuse to serve and exit non-zero.
//! Shutdown is a shared watch channel that fires exactly once; signals,
//! `/complete`, and the inactivity monitor all funnel into it, first
//! reason wins.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ── Sentinel ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the sentinel with an informational payload. Parent dirs are
    /// 0755, the file 0600. Creating an already-present sentinel is
    /// success: completion is idempotent.
    pub fn create(&self, note: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                set_mode(parent, 0o755)?;
            }
        }

        use std::os::unix::fs::OpenOptionsExt;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                info!(path = %self.path.display(), "Sentinel already present");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let payload = format!(
            "provisioned at {}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            note
        );
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        info!(path = %self.path.display(), "Sentinel created");
        Ok(())
    }
}

// ── Shutdown manager ────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("drain did not complete within {0:?}")]
pub struct DrainTimeout(pub Duration);

pub struct ShutdownManager {
    tx: watch::Sender<bool>,
    reason: Mutex<Option<String>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            reason: Mutex::new(None),
        }
    }

    /// Fire the shutdown signal. Only the first caller's reason is kept;
    /// repeat triggers are no-ops. Returns whether this call fired it.
    pub fn shutdown(&self, reason: &str) -> bool {
        let mut guard = self.reason.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        drop(guard);
        info!(reason, "Shutdown initiated");
        self.tx.send_replace(true);
        true
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the shutdown signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Route SIGTERM and SIGINT into the shutdown signal.
    pub fn install_signal_handlers(self: std::sync::Arc<Self>) -> io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let manager = self;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => manager.shutdown("SIGTERM"),
                _ = sigint.recv() => manager.shutdown("SIGINT"),
            };
        });
        Ok(())
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a drain future under a hard deadline. The caller decides whether a
/// timeout forces the process down.
pub async fn drain_with_deadline<F>(drain: F, deadline: Duration) -> Result<(), DrainTimeout>
where
    F: std::future::Future<Output = ()>,
{
    tokio::time::timeout(deadline, drain)
        .await
        .map_err(|_| DrainTimeout(deadline))
}

// ── Inactivity tracker ──────────────────────────────────────────────

pub struct InactivityTracker {
    last_activity: Mutex<Instant>,
    timeout: Duration,
}

impl InactivityTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            timeout,
        }
    }

    /// Stamp activity; called by the middleware on every authenticated
    /// request.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Fire shutdown after the configured idle interval with no activity.
pub async fn run_inactivity_monitor(
    tracker: std::sync::Arc<InactivityTracker>,
    manager: std::sync::Arc<ShutdownManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = (tracker.timeout() / 4).max(Duration::from_millis(250));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if tracker.idle_for() >= tracker.timeout() {
                    warn!(idle_secs = tracker.idle_for().as_secs(), "No activity — shutting down");
                    manager.shutdown("inactivity timeout");
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
