// Main CLI entrypoint
// (c) 2024 Ross Younger

use std::process::ExitCode;

use clap::Parser;

use super::args::CliArgs;
use crate::{client::client_main, config::Manager, util::setup_tracing};

/// Main CLI entrypoint
pub fn cli() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();
    run_client(&args)
}

#[tokio::main]
async fn run_client(args: &CliArgs) -> anyhow::Result<ExitCode> {
    let trace_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };
    setup_tracing(trace_level).inspect_err(|e| anstream::eprintln!("{e:?}"))?;

    let mut manager = Manager::new();
    if let Some(path) = &args.config {
        manager.apply_file(path)?;
    }
    if let Some(server) = &args.server {
        manager.set_override("server", server);
    }
    if let Some(addr) = &args.socks5 {
        manager.set_override("socks5_addr", addr);
    }
    if let Some(addr) = &args.http {
        manager.set_override("http_addr", addr);
    }
    if args.insecure {
        manager.set_override("insecure", true);
    }

    let config = manager.get()?;
    config.check()?;

    match client_main(config).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!("{e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}
