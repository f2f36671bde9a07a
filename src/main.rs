//! Boardingpass daemon — startup, wiring, and graceful drain.
//!
//! Boot order matters: the sentinel gate runs before anything listens
//! (an already-provisioned device must exit non-zero without serving a
//! single request), background reapers start before the listener, and
//! shutdown funnels every trigger — signal, `/complete`, inactivity —
//! through one channel.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use boardingpass::apply::Applier;
use boardingpass::auth::{ratelimit, ratelimit::RateLimiter, SessionManager};
use boardingpass::commands::CommandRunner;
use boardingpass::config::Config;
use boardingpass::lifecycle::{self, InactivityTracker, Sentinel, ShutdownManager};
use boardingpass::password::PasswordGenerator;
use boardingpass::server::{router, AppState};
use boardingpass::srp::server::SrpServer;
use boardingpass::srp::store::{self, HandshakeStore, DEFAULT_HANDSHAKE_TTL};
use boardingpass::sysinfo::HostInspector;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file.
    #[arg(long, default_value = "/etc/boardingpass/config.yaml")]
    config: PathBuf,
    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boardingpass=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    info!("🎫 Boardingpass v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let listen = args.listen.unwrap_or(config.service.listen);

    // ── One-shot gate ───────────────────────────────────────────────
    let sentinel = Sentinel::new(config.service.sentinel_file.clone());
    if sentinel.exists() {
        error!(
            sentinel = %sentinel.path().display(),
            "Device is already provisioned — refusing to start"
        );
        bail!("sentinel file exists; reimage the device to provision again");
    }

    // ── Shutdown plumbing ───────────────────────────────────────────
    let shutdown = Arc::new(ShutdownManager::new());
    Arc::clone(&shutdown)
        .install_signal_handlers()
        .context("Failed to install signal handlers")?;

    // ── Core subsystems ─────────────────────────────────────────────
    let generator = PasswordGenerator::new(
        config.auth.password_generator.clone(),
        Duration::from_secs(config.auth.generator_timeout_secs),
    );
    let handshakes = Arc::new(HandshakeStore::new(DEFAULT_HANDSHAKE_TTL));
    let srp = SrpServer::new(
        config.auth.username.clone(),
        config.salt(),
        generator,
        Arc::clone(&handshakes),
    );

    let sessions = Arc::new(SessionManager::new(Duration::from_secs(
        config.service.session_ttl_secs,
    )));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let inactivity = Arc::new(InactivityTracker::new(Duration::from_secs(
        config.service.inactivity_timeout_secs,
    )));

    // ── Background reapers ──────────────────────────────────────────
    tokio::spawn(store::run_reaper(
        Arc::clone(&handshakes),
        shutdown.subscribe(),
    ));
    tokio::spawn(boardingpass::auth::run_session_reaper(
        Arc::clone(&sessions),
        shutdown.subscribe(),
    ));
    tokio::spawn(ratelimit::run_sweeper(
        Arc::clone(&limiter),
        Duration::from_secs(config.rate_limit.idle_expiry_secs.max(1)),
        shutdown.subscribe(),
    ));
    tokio::spawn(lifecycle::run_inactivity_monitor(
        Arc::clone(&inactivity),
        Arc::clone(&shutdown),
        shutdown.subscribe(),
    ));

    // ── HTTP surface ────────────────────────────────────────────────
    let state = Arc::new(AppState {
        srp,
        sessions,
        limiter,
        applier: Applier::new(
            config.paths.root_directory.clone(),
            config
                .paths
                .staging_base
                .clone()
                .filter(|p| !p.as_os_str().is_empty()),
        ),
        allow_list: config.paths.allow_list.clone(),
        inspector: Arc::new(HostInspector::new(PathBuf::from("/"))),
        runner: CommandRunner::new(config.commands.clone()),
        sentinel,
        shutdown: Arc::clone(&shutdown),
        inactivity: Arc::clone(&inactivity),
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(listen = %listen, "Boardingpass ready — awaiting operator");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = Arc::clone(&shutdown);
        async move { shutdown.wait().await }
    });
    let server = tokio::spawn(serve.into_future());

    // ── Drain ───────────────────────────────────────────────────────
    shutdown.wait().await;
    let reason = shutdown.reason().unwrap_or_else(|| "unknown".into());
    info!(reason = %reason, "Draining in-flight requests");

    let deadline = Duration::from_secs(config.service.drain_timeout_secs);
    match lifecycle::drain_with_deadline(
        async {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Server error during drain: {}", err),
                Err(err) => error!("Server task panicked: {}", err),
            }
        },
        deadline,
    )
    .await
    {
        Ok(()) => info!("Shutdown complete"),
        Err(err) => error!("{} — forcing exit", err),
    }

    Ok(())
}
