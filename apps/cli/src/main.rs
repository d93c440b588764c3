mod ports;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use updi_core::protocol::constants::BAUD_TABLE;
use updi_core::{Bridge, BridgeConfig};

use crate::ports::{SerialHostPort, SerialTargetPort, StdClock, StdinEdge};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serial bridge between a debug host and a UPDI target", long_about = None)]
struct Args {
    /// Serial port facing the controlling host
    #[arg(long)]
    host: String,

    /// Serial port wired to the target's UPDI pad
    #[arg(long)]
    target: String,

    /// Target-side line speed in baud
    #[arg(long, default_value_t = 225_000)]
    target_baud: u32,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Write the effective configuration to a file and exit
    #[arg(long)]
    write_config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => BridgeConfig::default(),
    };

    if let Some(path) = &args.write_config {
        config
            .save_to_file(path)
            .with_context(|| format!("writing config to {path}"))?;
        info!(path = %path, "configuration written");
        return Ok(());
    }

    let host_baud = BAUD_TABLE[config.default_baud_id as usize];
    let host = SerialHostPort::open(&args.host, host_baud)
        .with_context(|| format!("opening host port {}", args.host))?;
    let target = SerialTargetPort::open(&args.target, args.target_baud)
        .with_context(|| format!("opening target port {}", args.target))?;
    let pins = target.control_handle().context("cloning control handle")?;

    info!(
        host = %args.host,
        host_baud,
        target = %args.target,
        target_baud = args.target_baud,
        "ports open"
    );

    let mut bridge = Bridge::new(
        Box::new(host),
        Box::new(target),
        Box::new(pins),
        Arc::new(StdClock::new()),
        Arc::new(StdinEdge::spawn()),
        config,
    );
    bridge.run()?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
