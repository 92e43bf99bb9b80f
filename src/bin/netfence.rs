//! netfence standalone host.
//!
//! Runs the filtering proxy on loopback the way the packet-tunnel host
//! would embed it: seeds the policy store, starts the proxy, prints the
//! bound port, and keeps serving until interrupted.
//!
//! Usage: netfence [-c config.toml] [-t telemetry.json]

use std::env;
use std::sync::Arc;

use netfence::server::ProxyConfigFile;
use netfence::{FilterProxy, PolicyStore, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config_path: Option<String> = None;
    let mut telemetry_path: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-c" | "--config" => {
                config_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a file path"))?,
                );
            }
            "-t" | "--telemetry" => {
                telemetry_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--telemetry requires a file path"))?,
                );
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                return Ok(());
            }
        }
    }

    let policy = Arc::new(PolicyStore::new());
    let mut config = ProxyConfig::default();

    if let Some(path) = config_path {
        let content = std::fs::read_to_string(&path)?;
        let file: ProxyConfigFile = toml::from_str(&content)?;
        config = file.to_config()?;
        if let Some(section) = file.policy {
            if let Some(enabled) = section.enabled {
                policy.set_enabled(enabled);
            }
            policy.replace(section.thresholds);
            tracing::info!("policy loaded: {} domain rules", policy.len());
        }
    }
    if let Some(path) = telemetry_path {
        config.telemetry_path = path.into();
    }

    tracing::info!("telemetry artifact: {}", config.telemetry_path.display());

    let proxy = FilterProxy::new(config, policy)?;
    proxy.start(|port| println!("PORT={port}")).await?;

    tokio::signal::ctrl_c().await?;
    proxy.stop().await;

    Ok(())
}

fn print_usage() {
    println!(
        r#"netfence - filtering SOCKS5 proxy

USAGE:
    netfence [OPTIONS]

OPTIONS:
    -c, --config <FILE>      TOML configuration (limits, timeouts, [policy] table)
    -t, --telemetry <FILE>   Telemetry artifact path (overrides config)
    -h, --help               Print help information

The proxy listens on an ephemeral loopback port and prints `PORT=<n>` on
stdout once ready; point tun2socks at that port."#
    );
}
