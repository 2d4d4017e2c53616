//! HTTP service for boot LUN provisioning
//!
//! Serves the clone, ZFS and target endpoints over the host's zfs, udevadm
//! and configfs.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::sync::Arc;

use lun_provision::{api, Config, Provisioner};

#[derive(Parser)]
#[command(name = "lun-web")]
#[command(about = "HTTP API for cloning and exporting boot LUNs")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for web server (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(level) = cli.log_level {
        config.server.log_level = level;
    }
    config.validate()?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str()))
        .init();

    let provisioner = Provisioner::from_config(&config)
        .context("Failed to read target subsystem state")?;

    let addr = config.bind_addr()?;
    println!("LUN provisioning API starting on http://{}", addr);
    println!("  zfs:      {}", config.zfs.command);
    println!("  configfs: {}", config.target.configfs_root);
    println!("  portal:   {}:{}", config.target.portal_ip, config.target.portal_port);
    println!("  rollback: {:?}", config.provisioning.rollback);

    let app = api::router(Arc::new(provisioner));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
