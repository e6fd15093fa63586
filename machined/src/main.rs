//! Entry point for the machined daemon.

use anyhow::{Context, Result};
use machined::config::parse_args;
use machined::service;
use std::env;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let opts = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            // --help is not a failure
            if msg.starts_with("Usage:") {
                return Ok(());
            }
            std::process::exit(2);
        }
    };

    // fork before any runtime threads exist
    if !opts.foreground {
        nix::unistd::daemon(false, true).context("detaching from terminal")?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(service::run(opts))
}
