//! nofail CLI - run the failover gateway or probe the whitelist once.

use clap::{Parser, Subcommand};
use nofail::api::{create_router_with_state, AppState};
use nofail::config::{Config, LogFormat, LoggingConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nofail")]
#[command(about = "Chat-completion gateway with provider failover")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Probe every whitelisted provider once and report which ones work
    Probe {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, config }) => run_server(port, config).await?,
        Some(Commands::Probe { config }) => return run_probe(config).await,
        Some(Commands::Config { path }) => show_config(path)?,
        None => run_server(None, None).await?,
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config.with_env_overrides())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(false)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run_server(port_override: Option<u16>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path.as_ref())?;
    init_tracing(&config.logging);

    let port = port_override.unwrap_or(config.gateway.port);
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, port).parse()?;

    let state = AppState::from_config(&config, config_path)?;
    if state.router.whitelist().snapshot().is_empty() {
        tracing::warn!("whitelist is empty; every request will be rejected until providers are configured");
    }

    let shutdown = CancellationToken::new();
    let prober = if config.probe.enabled {
        Some(state.prober.clone().spawn(config.probe.interval(), shutdown.clone()))
    } else {
        None
    };

    let app = create_router_with_state(state);

    println!("→ nofail starting on http://{}", addr);
    println!("→ Completions: http://{}/api/completions", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(prober) = prober {
        prober.await?;
    }

    println!("\nGateway stopped.");
    Ok(())
}

async fn run_probe(config_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path.as_ref())?;
    init_tracing(&config.logging);

    let state = AppState::from_config(&config, config_path)?;
    let Some(report) = state.prober.probe_all().await else {
        anyhow::bail!("probe run already in progress");
    };

    for id in &report.working {
        println!("✓ {}", id);
    }
    for failure in &report.failed {
        println!(
            "✗ {} ({}): {}",
            failure.provider_id, failure.error_type, failure.error_message
        );
    }
    println!(
        "\n{} working, {} failed",
        report.working.len(),
        report.failed.len()
    );

    Ok(if report.any_working() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn show_config(show_path: bool) -> anyhow::Result<()> {
    if show_path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let config = Config::load()?.with_env_overrides();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
