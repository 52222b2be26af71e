//! Bridge server binary.
//!
//! Starts both listeners and serves until Ctrl+C.
//!
//! ```text
//! tab-bridge --browser-port 9333 --cli-port 9334 --debug
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tab_bridge::config::bridge::{
    DEFAULT_BROWSER_PORT, DEFAULT_CLI_PORT, DEFAULT_MAX_PENDING, DEFAULT_MAX_TIMEOUT,
    DEFAULT_TIMEOUT,
};
use tab_bridge::{BridgeConfig, BridgeServer, Result};

// ============================================================================
// Types
// ============================================================================

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "tab-bridge")]
#[command(about = "Run JavaScript in the front browser tab", long_about = None)]
#[command(version)]
struct Args {
    /// Loopback address both listeners bind to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port browser tabs connect to
    #[arg(long, default_value_t = DEFAULT_BROWSER_PORT)]
    browser_port: u16,

    /// Port the CLI posts execution requests to
    #[arg(long, default_value_t = DEFAULT_CLI_PORT)]
    cli_port: u16,

    /// Timeout for requests that name none, in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Largest timeout a request may ask for, in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAX_TIMEOUT.as_millis() as u64)]
    max_timeout_ms: u64,

    /// Bound on in-flight requests
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING)]
    max_pending: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing. `RUST_LOG` wins over `--debug`.
fn init_logging(debug: bool) {
    let fallback = if debug {
        "tab_bridge=debug"
    } else {
        "tab_bridge=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = BridgeConfig::builder()
        .bind_ip(args.bind)
        .browser_port(args.browser_port)
        .cli_port(args.cli_port)
        .default_timeout(Duration::from_millis(args.timeout_ms))
        .max_timeout(Duration::from_millis(args.max_timeout_ms))
        .max_pending(args.max_pending)
        .build()?;

    let server = BridgeServer::start(config).await?;

    info!(browser = %server.browser_url(), cli = %server.cli_url(), "Ready");
    println!("Browser tabs connect to {}", server.browser_url());
    println!("POST execution requests to {}/execute", server.cli_url());
    println!("Press Ctrl+C to exit...");

    tokio::signal::ctrl_c().await?;

    server.shutdown().await;
    Ok(())
}
