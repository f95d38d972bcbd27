//! LAN Emulation Client Daemon
//!
//! Connects to the LE service daemon over its control socket, applies the
//! indications it sends and forwards the client's requests back to it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - TOML configuration file
//! - SC-7: Boundary Protection - Local control socket only

use clap::Parser;
use sonic_lecd::{
    ChannelGateway, LecClient, LecConfig, LecError, Result, read_control_stream,
    write_control_stream,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Default control socket of the LE service daemon
/// NIST: CM-6 - Configuration settings
const DEFAULT_CONTROL_SOCKET: &str = "/var/run/lecd/control.sock";

/// Outbound control messages buffered before requests are dropped
const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "lecd", version, about = "LAN emulation client daemon")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket of the LE service daemon
    #[arg(short = 's', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: PathBuf,

    /// Depth of the outbound control queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    // NIST: AU-3, AU-12 - Audit logging setup
    init_logging()?;

    info!("lecd: Starting LAN emulation client");

    match run_daemon(args).await {
        Ok(()) => {
            info!("lecd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "lecd: Daemon exiting with error");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LecError::Config(format!("Failed to set logger: {}", e)))
}

/// Main daemon loop
///
/// # NIST Controls
/// - SI-4: System Monitoring - Control channel processing
/// - AU-12: Audit Record Generation - Log shutdown events
async fn run_daemon(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            // NIST: CM-6 - Configuration settings
            info!(path = %path.display(), "lecd: Loading configuration");
            LecConfig::from_file(path)?
        }
        None => LecConfig::default(),
    };

    let stream = UnixStream::connect(&args.control_socket).await?;
    info!(socket = %args.control_socket.display(), "lecd: Connected to LE service");
    let (reader, writer) = stream.into_split();

    let (gateway, requests) = ChannelGateway::new(args.queue_depth);
    let client = LecClient::new(config, Arc::new(gateway))?;
    client.start_aging();

    let outbound = tokio::spawn(write_control_stream(requests, writer));

    let result = tokio::select! {
        r = read_control_stream(&client, reader) => {
            match &r {
                Ok(()) => warn!("lecd: LE service closed the control socket"),
                Err(e) => error!(error = %e, "lecd: Control socket failed"),
            }
            r
        }
        _ = signal::ctrl_c() => {
            info!("lecd: Received SIGINT/SIGTERM");
            Ok(())
        }
    };

    client.shutdown();
    outbound.abort();
    info!("lecd: Graceful shutdown complete");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["lecd"]);
        assert_eq!(args.control_socket, PathBuf::from(DEFAULT_CONTROL_SOCKET));
        assert_eq!(args.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from(["lecd", "-c", "/etc/lecd.toml", "-s", "/tmp/les.sock"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/lecd.toml")));
        assert_eq!(args.control_socket, PathBuf::from("/tmp/les.sock"));
    }
}
