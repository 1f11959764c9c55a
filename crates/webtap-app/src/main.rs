//! Webtap - MITM proxy that taps vendor web-chat streams.
//!
//! Runs one proxy instance per configured entry, all sharing a single
//! in-memory root CA:
//! - Exports the root certificate for the browser trust store
//! - Binds every instance's sniff port (a failure only affects that instance)
//! - Optionally dumps decoded events as JSON lines
//! - Stops all instances on Ctrl-C

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webtap_core::AdapterRegistry;
use webtap_proxy::{CertificateAuthority, ProxyConfig, ProxyHandle, ProxyServer};

use crate::config::{AppConfig, InstanceConfig};

/// Webtap - MITM proxy that taps vendor web-chat streams
#[derive(Parser, Debug)]
#[command(name = "webtap", version, about)]
struct Args {
    /// Path to the YAML configuration
    #[arg(short, long, default_value = "webtap.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write daily rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the root CA certificate (PEM) to this path
    #[arg(long)]
    export_ca: Option<PathBuf>,

    /// Enable sniffing on every instance and print events as JSON lines
    #[arg(long)]
    dump_events: bool,
}

/// Initialize logging, optionally with file rotation.
fn init_logging(args: &Args, debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug || debug {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "webtap={0},webtap_core={0},webtap_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("webtap")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

/// Binds one instance. Errors are reported and only skip this instance.
async fn start_instance(
    instance: &InstanceConfig,
    ca: &Arc<CertificateAuthority>,
    registry: &AdapterRegistry,
) -> Option<ProxyHandle> {
    let config = ProxyConfig::new()
        .with_port(instance.sniff_port)
        .with_adapter(instance.adapter_name())
        .with_policy(Arc::new(instance.policy()))
        .with_insecure_upstream(instance.insecure_upstream);

    let server = match ProxyServer::bind(config, Arc::clone(ca), registry).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Instance {} failed to start: {}", instance.name, e);
            return None;
        }
    };

    match server.start() {
        Ok(handle) => {
            tracing::info!(
                "Instance {} on {} sniffing {:?}",
                instance.name,
                handle.addr(),
                instance.domains()
            );
            Some(handle)
        }
        Err(e) => {
            tracing::error!("Instance {} failed to start: {}", instance.name, e);
            None
        }
    }
}

/// Prints every event of one instance as a JSON line.
fn spawn_event_dump(name: String, handle: &ProxyHandle) {
    let control = handle.sniff_control();
    control.start_sniffing();

    tokio::spawn(async move {
        loop {
            let event = control.get_data_async().await;
            let mut line = match serde_json::to_value(&event) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            line["instance"] = serde_json::Value::String(name.clone());
            println!("{}", line);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let registry = AdapterRegistry::with_defaults();

    let app_config = AppConfig::load(&args.config, &registry)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    let _log_guard = init_logging(&args, app_config.debug);
    tracing::info!("Starting webtap v{}", env!("CARGO_PKG_VERSION"));

    let ca = Arc::new(CertificateAuthority::new().context("failed to create root CA")?);
    if let Some(path) = args.export_ca.as_ref().or(app_config.ca_export_path.as_ref()) {
        ca.export_root_pem(path)
            .with_context(|| format!("failed to export root CA to {}", path.display()))?;
    }

    let mut handles = Vec::new();
    for instance in &app_config.instance {
        if let Some(handle) = start_instance(instance, &ca, &registry).await {
            if args.dump_events {
                spawn_event_dump(instance.name.clone(), &handle);
            }
            handles.push(handle);
        }
    }

    if handles.is_empty() {
        bail!("no proxy instance could be started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down {} instance(s)", handles.len());

    for handle in handles {
        handle.stop().await;
    }

    tracing::info!("Issued {} leaf certificate(s) this session", ca.issued());
    Ok(())
}
