//! shellgate: WebSocket gateway with sticky backend selection and failover
//!
//! Built on Cloudflare's Pingora framework. Browsers upgrade against the
//! gateway; it picks a backend from a fixed allow-list, signs the client's
//! address into a token and relays messages both ways.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use pingora::prelude::*;
use proxy::{gateway_service, wait_for_sessions_drain, AccessLogger, Gateway, LogFormat, BACKENDS};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod telemetry;

#[derive(Parser)]
#[command(name = "shellgate")]
#[command(author, version, about = "WebSocket gateway with sticky backend selection and failover")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "shellgate.toml")]
    config: PathBuf,

    /// Log level (overrides the config file; RUST_LOG overrides both)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(short, long)]
    test: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        #[arg(short, long, default_value = "shellgate.toml")]
        config: PathBuf,
    },
    /// Validate configuration
    Validate {
        #[arg(short, long, default_value = "shellgate.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Validate { config }) => validate_config(config),
        Some(Commands::Run { config }) => run_server(config, cli.log_level),
        None => {
            if cli.test {
                validate_config(cli.config)
            } else {
                run_server(cli.config, cli.log_level)
            }
        }
    }
}

#[allow(unreachable_code)]
fn run_server(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Batch span export runs on this runtime; Pingora brings its own
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let _rt_guard = rt.enter();

    let level = log_level.unwrap_or_else(|| config.global.log_level.clone());
    let telemetry_provider = telemetry::init(&level, &config.global.tracing)?;

    info!("Starting shellgate");
    info!(
        config = ?config_path,
        backends = BACKENDS.len(),
        max_attempts = config.proxy.max_attempts,
        scheme = %config.proxy.upstream_scheme,
        "Configuration loaded"
    );

    let mut gateway = Gateway::new(config.proxy.clone());
    if let Some(path) = &config.global.access_log {
        let format: LogFormat = config.global.access_log_format.parse().unwrap_or_default();
        let logger = AccessLogger::new(path, format.clone())
            .with_context(|| format!("Failed to open access log {:?}", path))?;
        info!(path = %path, format = ?format, "Access log enabled");
        gateway = gateway.with_access_log(logger);
    }
    let gateway = Arc::new(gateway);

    let mut server = Server::new(None).context("Failed to create Pingora server")?;
    server.bootstrap();

    let mut service = gateway_service("shellgate", gateway);
    for listen_addr in &config.server.listen {
        let addr = if listen_addr.starts_with(':') {
            format!("0.0.0.0{}", listen_addr)
        } else {
            listen_addr.clone()
        };

        match config.server.tls_paths() {
            Some((cert, key)) => {
                let cert_str = cert.to_str().unwrap_or("");
                let key_str = key.to_str().unwrap_or("");
                match service.add_tls(&addr, cert_str, key_str) {
                    Ok(_) => info!(address = %addr, "Listening (WSS)"),
                    Err(e) => {
                        warn!(address = %addr, error = %e, "TLS failed, using plain WS");
                        service.add_tcp(&addr);
                        info!(address = %addr, "Listening (WS)");
                    }
                }
            }
            None => {
                service.add_tcp(&addr);
                info!(address = %addr, "Listening (WS)");
            }
        }
    }
    server.add_service(service);

    let grace_period = Duration::from_secs(config.global.grace_period);
    let provider_for_shutdown = telemetry_provider;
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");

        info!(grace_period_secs = grace_period.as_secs(), "Waiting for relay sessions to drain...");
        if wait_for_sessions_drain(grace_period) {
            info!("All sessions drained");
        } else {
            warn!("Grace period expired, remaining sessions will be dropped");
        }

        telemetry::shutdown(provider_for_shutdown.clone());
        info!("Shutdown complete");
        std::process::exit(0);
    })
    .ok();

    info!("shellgate started successfully");
    server.run_forever();

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    println!("Configuration is valid!");
    for addr in &config.server.listen {
        println!("  Listen: {}", addr);
    }
    if let Some((cert, key)) = config.server.tls_paths() {
        println!("  TLS: {} / {}", cert.display(), key.display());
    }
    println!(
        "  Upstream: {}://<backend>:{} ({} backends, {} attempts max)",
        config.proxy.upstream_scheme,
        config.proxy.effective_upstream_port(),
        BACKENDS.len(),
        config.proxy.max_attempts
    );
    if config.proxy.secret().is_none() {
        println!(
            "  Warning: no HMAC secret (set proxy.hmac_secret or ${}); requests will fail with 500",
            config.proxy.hmac_secret_env
        );
    }

    Ok(())
}
