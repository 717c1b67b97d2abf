//! # Tether CLI Module
//!
//! This module implements the CLI interface for tether.
//!
//! ## Available Commands
//!
//! - `list` - List the blocks of an archive
//! - `link` - Link blocks from archives into a fresh session
//! - `append` - Append blocks from archives into a fresh session
//! - `build` - Build an archive from a JSON description
//! - `resolve` - Resolve a weak reference into an archive

mod commands;

use crate::config::Config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tether_core::TetherError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// tether - link and append data-blocks from archives
///
/// Brings named blocks and everything they depend on out of archive files,
/// either linked (owned by the archive) or appended as local data.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a tether.toml configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the blocks of an archive
    List {
        /// Archive path
        library: String,

        /// Only list these kinds (repeatable, e.g. -k Mesh -k Material)
        #[arg(short, long = "kind")]
        kinds: Vec<String>,

        /// Only list blocks carrying asset metadata
        #[arg(long)]
        assets_only: bool,
    },

    /// Link blocks from archives
    Link {
        #[command(flatten)]
        request: ImportArgs,

        /// Create a local override for every linked item
        #[arg(long)]
        overrides: bool,

        /// Reuse existing overrides instead of creating new ones
        #[arg(long, requires = "overrides")]
        use_existing: bool,

        /// Make the overrides runtime-only
        #[arg(long, requires = "overrides")]
        runtime: bool,
    },

    /// Append blocks from archives as local data
    Append {
        #[command(flatten)]
        request: ImportArgs,
    },

    /// Build an archive from a JSON description
    Build {
        /// JSON description of the archive's blocks
        #[arg(short, long)]
        input: PathBuf,

        /// Output archive path
        #[arg(short, long)]
        output: PathBuf,

        /// Archive format (tether, redb)
        #[arg(short = 't', long, default_value = "tether")]
        format: String,
    },

    /// Resolve a weak reference into an archive
    Resolve {
        /// Archive path, relative to the configured asset root
        #[arg(short, long)]
        archive: String,

        /// Block to resolve, as Kind:Name
        #[arg(short, long)]
        item: String,
    },
}

/// Options shared by `link` and `append`.
#[derive(Args, Debug, Clone, Default)]
pub struct ImportArgs {
    /// Archive to read from (repeatable; earlier archives win)
    #[arg(short, long = "library", required = true)]
    pub libraries: Vec<String>,

    /// Block to import, as Kind:Name (repeatable)
    #[arg(short, long = "item")]
    pub items: Vec<String>,

    /// Import every block of this kind from every archive (repeatable)
    #[arg(long = "all-of")]
    pub all_of: Vec<String>,

    /// Extra flag by name, e.g. recursive or no_rename_on_collision (repeatable)
    #[arg(short, long = "flag")]
    pub flags: Vec<String>,

    /// Place the imported content in a new scene
    #[arg(long)]
    pub instantiate: bool,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), TetherError> {
    let config = Config::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::List {
            library,
            kinds,
            assets_only,
        } => cmd_list(&config, &library, &kinds, assets_only, json),
        Commands::Link {
            request,
            overrides,
            use_existing,
            runtime,
        } => {
            let overrides = overrides.then(|| override_flags(use_existing, runtime));
            cmd_import(&config, &request, ImportMode::Link { overrides }, json)
        }
        Commands::Append { request } => cmd_import(&config, &request, ImportMode::Append, json),
        Commands::Build {
            input,
            output,
            format,
        } => cmd_build(&input, &output, &format, json),
        Commands::Resolve { archive, item } => cmd_resolve(&config, &archive, &item, json),
    }
}
