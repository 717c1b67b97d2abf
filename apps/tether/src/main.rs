//! # tether
//!
//! The command-line binary for the tether link/append engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │             apps/tether (THE BINARY)         │
//! │                                              │
//! │  ┌─────────────┐        ┌────────────────┐   │
//! │  │    CLI      │        │  tether.toml   │   │
//! │  │   (clap)    │        │ (toml + serde) │   │
//! │  └──────┬──────┘        └───────┬────────┘   │
//! │         └───────────┬───────────┘            │
//! │                     ▼                        │
//! │             ┌───────────────┐                │
//! │             │  tether-core  │                │
//! │             │ (THE ENGINE)  │                │
//! │             └───────────────┘                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Build an archive from a JSON description
//! tether build -i props.json -o props.tether
//!
//! # Inspect and import
//! tether list props.tether -k Object
//! tether link -l props.tether -i Object:Chair --overrides
//! tether append -l props.tether -l shared.tether -i Collection:Room -f recursive --instantiate
//! tether resolve -a props.tether -i Material:Oak --json
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = tether::cli::Cli::parse();

    // TETHER_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TETHER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    // The `tether` target also covers `tether_core`.
    let default_filter = if cli.verbose { "tether=debug" } else { "tether=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("TETHER_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json {
        print_banner();
    }

    if let Err(e) = tether::cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    eprintln!("tether v{} - link & append", env!("CARGO_PKG_VERSION"));
}
