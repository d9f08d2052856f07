//! Entry point for the mapping engine's HTTP server.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mapping_engine::config::Config;
use mapping_engine::discovery::SchemaDiscoveryService;
use mapping_engine::engine::MappingEngine;
use mapping_engine::error::Result;
use mapping_engine::metrics::MetricsCollector;
use mapping_engine::server::{self, MappingRepository};

/// Command line arguments for the mapping engine server.
#[derive(Parser, Debug)]
#[command(name = "mapping-engine-server")]
#[command(about = "Enhanced data-mapping engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file path (unused placeholder; configuration is
    /// otherwise sourced from environment variables under MAPPING_ENGINE__*)
    #[arg(short, long)]
    config: Option<String>,

    /// Server host address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable development mode (more verbose logging, shorter health intervals)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args.log_level)?;

    info!("starting mapping engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&args)?;
    override_config_from_args(&mut config, &args);

    if let Err(e) = config.validate() {
        error!("configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(host = %config.server.host, port = config.server.port, "configuration loaded and validated");

    let config = Arc::new(config);
    let engine = Arc::new(MappingEngine::new(config.clone()));
    let mappings = Arc::new(MappingRepository::new());
    let discovery = Arc::new(SchemaDiscoveryService::new());
    let metrics = Arc::new(MetricsCollector::new(&config).map_err(|e| {
        error!("failed to initialize metrics collector: {e}");
        e
    })?);

    let server_handle = {
        let config = config.clone();
        let engine = engine.clone();
        let mappings = mappings.clone();
        let discovery = discovery.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(config, engine, mappings, discovery, metrics).await {
                error!("HTTP server error: {}", e);
            }
        })
    };

    print_startup_banner(&config);

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = server_handle => {
            if let Err(e) = result {
                error!("server task failed: {}", e);
            }
        }
    }

    info!("initiating graceful shutdown");
    engine.shutdown().await;
    info!("mapping engine shutdown complete");
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("invalid log level: {log_level}, using 'info'");
            tracing::Level::INFO
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mapping_engine={level},tower_http=debug,axum=debug").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    if let Some(config_file) = &args.config {
        info!(config_file, "loading configuration from file (falling back to environment layering)");
    } else {
        info!("loading configuration from environment variables");
    }
    Config::from_env()
}

fn override_config_from_args(config: &mut Config, args: &Args) {
    config.server.host = args.host.clone();
    config.server.port = args.port;

    if args.dev {
        info!("development mode enabled");
        config.monitoring.log_level = "debug".to_string();
        config.monitoring.collection_interval_secs = 5;
        config.engine.enable_performance_optimization = false;
    }
}

fn print_startup_banner(config: &Config) {
    println!("\nMapping Engine");
    println!("==========================================");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Configuration:");
    println!("  HTTP server: {}:{}", config.server.host, config.server.port);
    println!("  Cache enabled: {}", config.engine.enable_cache);
    println!("  Performance optimization: {}", config.engine.enable_performance_optimization);
    println!("  Connection pooling: {}", config.engine.enable_connection_pooling);
    println!();
    println!("Endpoints:");
    println!("  Health: http://{}:{}/health", config.server.host, config.server.port);
    println!("  Metrics: http://{}:{}/metrics", config.server.host, config.server.port);
    println!("  Execute: http://{}:{}/enhanced-mappings/:id/execute", config.server.host, config.server.port);
    println!("==========================================\n");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
