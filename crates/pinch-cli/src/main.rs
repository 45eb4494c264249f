//! pinchd - HTTP-addressable streaming compression/decompression daemon

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pinch_server::{Service, ServiceConfig};

#[derive(Parser)]
#[command(name = "pinchd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Directory to create input pipes in
    #[arg(long, default_value = "/run/pinch/in")]
    input_dir: PathBuf,

    /// Directory to create output pipes in
    #[arg(long, default_value = "/run/pinch/out")]
    output_dir: PathBuf,

    /// Directory holding age identity files
    #[arg(long, default_value = "/run/pinch/keys")]
    keys_dir: PathBuf,

    /// Handle entropy in bytes (hex-doubled on the wire)
    #[arg(long, default_value_t = 8)]
    token_length: usize,

    /// Kernel pipe buffer target in bytes
    #[arg(long, default_value_t = 1 << 20)]
    pipe_buffer: usize,

    /// Base URL advertised in mint responses (defaults from --listen)
    #[arg(long)]
    public_url: Option<String>,

    /// Self-terminate after this long (testing aid)
    #[arg(long)]
    exit_after: Option<humantime::Duration>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig {
        listen: cli.listen,
        input_dir: cli.input_dir,
        output_dir: cli.output_dir,
        keys_dir: cli.keys_dir,
        token_length: cli.token_length,
        pipe_buffer: cli.pipe_buffer,
        public_url: cli
            .public_url
            .unwrap_or_else(|| format!("http://{}", cli.listen)),
    };
    config.validate().context("invalid configuration")?;

    for dir in [&config.input_dir, &config.output_dir, &config.keys_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    let service = Service::new(config);
    let swept = service
        .sweep()
        .context("could not sweep fifo directories")?;
    if swept > 0 {
        info!(swept, "cleaned up leftover fifo entries");
    }

    let exit_after: Option<std::time::Duration> = cli.exit_after.map(|limit| *limit);
    let shutdown = async move {
        match exit_after {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("shutting down on ctrl-c"),
                    _ = tokio::time::sleep(limit) => info!(?limit, "shutting down on --exit-after"),
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down on ctrl-c");
            }
        }
    };

    service.serve(shutdown).await?;
    Ok(())
}
