// MIT License - Copyright (c) 2026 Peter Wright
// Bus monitor: prints gateway events as JSON lines

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;
use tracing::{info, warn};

use lcn_pck::{BusEvent, ConnectionConfig, DimMode, PckConnection, SessionState, StatusMode};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "pck-monitor")]
#[command(about = "Monitor an LCN bus through an LCN-PCHK gateway")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "pck.toml")]
    config: String,

    /// Discover modules and fetch their serial numbers after connecting
    #[arg(long)]
    scan_modules: bool,

    /// Print the cached module state as JSON and exit
    #[arg(long)]
    dump: bool,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    gateway: GatewayToml,
}

#[derive(Debug, Deserialize)]
struct GatewayToml {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_credential")]
    username: String,
    #[serde(default = "default_credential")]
    password: String,
    #[serde(default = "default_num_retries")]
    num_retries: u32,
    #[serde(default = "default_request_timeout")]
    request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval_secs: u64,
    #[serde(default)]
    segment_scan_interval_secs: Option<u64>,
    #[serde(default = "default_dim_steps")]
    dim_steps: u16,
    #[serde(default = "default_status_mode")]
    status_mode: String,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    #[serde(default = "default_max_connect_retries")]
    max_connect_retries: u32,
    #[serde(default = "default_scan_window")]
    scan_window_ms: u64,
}

fn default_port() -> u16 {
    lcn_pck::constants::DEFAULT_PORT
}
fn default_credential() -> String {
    "lcn".to_string()
}
fn default_num_retries() -> u32 {
    lcn_pck::constants::DEFAULT_NUM_RETRIES
}
fn default_request_timeout() -> u64 {
    3500
}
fn default_connect_timeout() -> u64 {
    30000
}
fn default_heartbeat_interval() -> u64 {
    600
}
fn default_dim_steps() -> u16 {
    50
}
fn default_status_mode() -> String {
    "native".to_string()
}
fn default_reconnect_delay() -> u64 {
    10000
}
fn default_max_connect_retries() -> u32 {
    3
}
fn default_scan_window() -> u64 {
    3000
}

fn build_connection_config(gateway: &GatewayToml) -> Result<ConnectionConfig> {
    let dim_mode = match gateway.dim_steps {
        50 => DimMode::Steps50,
        200 => DimMode::Steps200,
        other => anyhow::bail!("Invalid dim_steps {other} (expected 50 or 200)"),
    };
    let status_mode = match gateway.status_mode.to_ascii_lowercase().as_str() {
        "percent" => StatusMode::Percent,
        "native" => StatusMode::Native,
        other => anyhow::bail!("Invalid status_mode '{other}' (expected percent or native)"),
    };

    Ok(ConnectionConfig::builder()
        .host(gateway.host.clone())
        .port(gateway.port)
        .username(gateway.username.clone())
        .password(gateway.password.clone())
        .num_retries(gateway.num_retries)
        .request_timeout(Duration::from_millis(gateway.request_timeout_ms))
        .connect_timeout(Duration::from_millis(gateway.connect_timeout_ms))
        .heartbeat_interval(Duration::from_secs(gateway.heartbeat_interval_secs))
        .segment_scan_interval(gateway.segment_scan_interval_secs.map(Duration::from_secs))
        .dim_mode(dim_mode)
        .status_mode(status_mode)
        .reconnect_delay(Duration::from_millis(gateway.reconnect_delay_ms))
        .max_connect_retries(gateway.max_connect_retries)
        .build())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn print_event(event: &BusEvent) {
    let mut value = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to serialize event {:?}: {}", event, e);
            return;
        }
    };
    if let Some(object) = value.as_object_mut() {
        object.insert("now".to_string(), now_epoch_ms().into());
    }
    println!("{value}");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=lcn_pck=trace). Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt()
            .without_time()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();

    let config_text = std::fs::read_to_string(&cli.config).context("Failed to read config file")?;
    let config: Config = toml::from_str(&config_text).context("Failed to parse config file")?;
    let connection_config = build_connection_config(&config.gateway)?;
    let scan_window = Duration::from_millis(config.gateway.scan_window_ms);

    let mut sigterm = signal(SignalKind::terminate())?;

    let connection = PckConnection::new(connection_config);
    let mut events = connection.subscribe();

    info!(
        "Connecting to gateway at {}:{}",
        config.gateway.host, config.gateway.port
    );
    connection
        .connect_with_retry()
        .await
        .context("Failed to connect to gateway")?;

    if cli.scan_modules || cli.dump {
        let modules = connection
            .scan_modules(1, scan_window)
            .await
            .context("Module scan failed")?;
        info!("Found {} modules", modules.len());
    }

    if cli.dump {
        let dump = connection.dump_modules().await;
        println!("{}", serde_json::to_string_pretty(&dump)?);
        connection.close().await;
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => {
                    print_event(&event);
                    // Stale Disconnected events from failed attempts are ignored.
                    if event == BusEvent::Disconnected
                        && connection.state() == SessionState::Disconnected
                    {
                        warn!("Gateway connection lost, reconnecting");
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => break,
                            result = connection.connect_with_retry() => {
                                result.context("Failed to reconnect to gateway")?;
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Event stream lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    connection.close().await;
    Ok(())
}
