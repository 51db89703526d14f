use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use flowtap::config::Config;
use flowtap::engine::{open_source, FlowEngine};

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(author, version, about = "Flow metering sensor: packets in, per-flow feature records out")]
pub struct Cli {
    /// Interface for live capture
    #[arg(short, long, conflicts_with = "read")]
    pub interface: Option<String>,

    /// Replay a pcap file instead of capturing live
    #[arg(short, long, value_name = "FILE")]
    pub read: Option<PathBuf>,

    /// Write records to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// BPF filter expression
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

/// Merge CLI flags over the config file and run the engine to completion
pub fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    if cli.interface.is_some() {
        config.capture.interface = cli.interface;
        config.capture.read_file = None;
    }
    if cli.read.is_some() {
        config.capture.read_file = cli.read;
    }
    if cli.filter.is_some() {
        config.capture.filter = cli.filter;
    }
    if cli.output.is_some() {
        config.output.path = cli.output;
    }

    config.validate()?;

    let source = open_source(&config.capture)?;

    let out: Box<dyn Write + Send> = match &config.output.path {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    let engine = FlowEngine::new(config);

    // Stop signal: halt ingestion, drain every open flow, close the output
    let stop = engine.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    }) {
        // Without a handler the engine still drains on source EOF
        warn!(error = %e, "could not register stop handler");
    }

    let snapshot = engine.run(source, out)?;

    info!(
        packets = snapshot.packets_seen,
        parsed = snapshot.packets_parsed,
        parse_failures = snapshot.parse_failures,
        non_ip = snapshot.non_ip,
        records = snapshot.records_emitted,
        dropped = snapshot.records_dropped,
        "session summary"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_replay_invocation() {
        let cli = Cli::parse_from(["flowtap", "-r", "capture.pcap", "-o", "flows.csv"]);
        assert_eq!(cli.read.as_deref(), Some(std::path::Path::new("capture.pcap")));
        assert_eq!(cli.output.as_deref(), Some(std::path::Path::new("flows.csv")));
        assert!(cli.interface.is_none());
    }

    #[test]
    fn test_cli_rejects_interface_with_read() {
        let result = Cli::try_parse_from(["flowtap", "-i", "eth0", "-r", "capture.pcap"]);
        assert!(result.is_err());
    }
}
