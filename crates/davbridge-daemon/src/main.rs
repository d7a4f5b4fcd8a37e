//! davbridged - Cloud drive to local file server bridge
//!
//! This binary runs as a user service and handles:
//! - Logging in to the storage backend and keeping the session alive
//! - Running the local file server while the session is connected
//! - The admin-gated control API
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! `davbridged login` performs a one-off interactive login instead and
//! stores the resulting session token for the next daemon start.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use davbridge_core::{
    config::{Config, ConfigBuilder, TokenStorage},
    ports::{event_channel, AlwaysReachable, NetworkProbe, StorageBackend, TokenStore},
    usecases::AdminAuth,
};
use davbridge_daemon::{
    api::{self, AppState},
    credentials::{self, EnvCredentials, ProcessEnv, TerminalPrompt},
    SessionOrchestrator,
};
use davbridge_local::{LocalBackend, LocalFileService};
use davbridge_server::{Backoff, HttpProbe, ServerLifecycle};
use davbridge_store::{FileAdminCredentialStore, FileTokenStore, KeyringTokenStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "davbridged", version, about = "Serve a cloud drive as a local file server")]
struct Cli {
    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// File server listen address
    #[arg(long)]
    listen: Option<String>,

    /// Control API listen address
    #[arg(long)]
    admin_listen: Option<String>,

    /// Forget the admin password; the control API requires setup again
    #[arg(long)]
    reset_admin_password: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in interactively and store the session token
    Login,
}

// ============================================================================
// Setup
// ============================================================================

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let mut builder = ConfigBuilder::from_config(config);
    if let Some(listen) = &cli.listen {
        builder = builder.server_listen(listen.clone());
    }
    if let Some(listen) = &cli.admin_listen {
        builder = builder.admin_listen(listen.clone());
    }

    builder.build_validated().map_err(|errors| {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::anyhow!("Invalid configuration: {}", details.join("; "))
    })
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn token_store(config: &Config, data_dir: &std::path::Path) -> Arc<dyn TokenStore> {
    match config.store.tokens {
        TokenStorage::File => Arc::new(FileTokenStore::new(data_dir)),
        TokenStorage::Keyring => Arc::new(KeyringTokenStore::default()),
    }
}

fn network_probe(config: &Config) -> Result<Arc<dyn NetworkProbe>> {
    match &config.network.probe_url {
        Some(url) => {
            let probe = HttpProbe::new(url.clone(), config.network.probe_timeout())
                .context("Failed to create network probe")?;
            Ok(Arc::new(probe))
        }
        None => Ok(Arc::new(AlwaysReachable)),
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Modes
// ============================================================================

/// `davbridged login`: resolve credentials, log in once, store the token
async fn run_login(config: &Config, data_dir: &std::path::Path) -> Result<()> {
    let backend = LocalBackend::new(&config.backend);

    let credentials = EnvCredentials::from_env(&ProcessEnv)
        .resolve(&mut TerminalPrompt)
        .context("Failed to read credentials")?;

    let token = backend
        .login(&credentials)
        .await
        .context("Login failed")?;
    token_store(config, data_dir)
        .store(&token)
        .context("Failed to store session token")?;

    info!(username = %credentials.username, "Login successful, session token stored");
    println!("Login successful");
    Ok(())
}

async fn run_daemon(cli: &Cli, config: Config, data_dir: PathBuf) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    // Admin auth
    let admin_store = Arc::new(FileAdminCredentialStore::new(&data_dir));
    let admin = Arc::new(AdminAuth::load(admin_store, config.admin.session_ttl()));
    if cli.reset_admin_password || credentials::admin_reset_requested(&ProcessEnv) {
        admin.reset();
        warn!("Admin password reset, setup required");
    }

    // Backend, file server and session
    let (events_tx, events_rx) = event_channel();
    let backend: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(&config.backend));
    let server = Arc::new(
        ServerLifecycle::new(config.server.listen.clone(), Arc::new(LocalFileService))
            .with_probe(network_probe(&config)?)
            .with_backoff(Backoff::new(config.network.retry_initial(), config.network.retry_max()))
            .with_grace_period(config.server.grace_period())
            .with_parent(shutdown.clone()),
    );
    let auto_login = EnvCredentials::from_env(&ProcessEnv).auto_login();
    let session = Arc::new(
        SessionOrchestrator::new(backend, token_store(&config, &data_dir), server)
            .with_events(events_tx)
            .with_auto_login(auto_login)
            .with_failure_policy(config.session.auto_login_failure)
            .with_parent(shutdown.clone()),
    );

    // Control API
    let listener = TcpListener::bind(&config.admin.listen)
        .await
        .with_context(|| format!("Failed to bind control API on {}", config.admin.listen))?;
    info!(
        addr = %config.admin.listen,
        initialized = admin.is_initialized(),
        "Control API listening"
    );
    let state = Arc::new(AppState::new(Arc::clone(&session), Arc::clone(&admin)));
    let api_task = tokio::spawn(api::serve(listener, state, shutdown.clone()));
    let sweep_task = tokio::spawn(api::sweep_sessions(
        Arc::clone(&admin),
        config.admin.sweep_interval(),
        shutdown.clone(),
    ));

    // Session
    let result = match session.startup().await {
        Ok(()) => session.run(events_rx, shutdown.clone()).await,
        Err(e) => Err(e),
    };

    shutdown.cancel();
    session.shutdown().await;
    if let Err(e) = api_task.await {
        warn!(error = %e, "Control API task failed");
    }
    if let Err(e) = sweep_task.await {
        warn!(error = %e, "Session sweep task failed");
    }

    result.context("Session orchestration failed")
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config, cli.verbose);

    info!("davbridge daemon starting (davbridged)");

    let data_dir = config
        .data_dir()
        .context("Could not determine the data directory")?;

    let result = match cli.command {
        Some(Command::Login) => run_login(&config, &data_dir).await,
        None => run_daemon(&cli, config.clone(), data_dir).await,
    };

    match &result {
        Ok(()) => info!("davbridge daemon shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "davbridge daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
