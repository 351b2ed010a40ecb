use std::env;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fetch every source once, diff against the previous snapshot and persist the result.
#[derive(Debug, Parser)]
#[command(name = "cosmic-cli", version)]
#[command(about = "Cosmic exploration progress tracker")]
struct Cli {}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("COSMIC_LOG")
        .unwrap_or_else(|_| EnvFilter::new("cosmic=info,warn"));
    let format = env::var("COSMIC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false)).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    init_tracing();

    let summary = cosmic_sync::run_sync_once_from_env().await?;
    println!("{summary}");

    Ok(())
}
