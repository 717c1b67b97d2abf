//! # Configuration
//!
//! Optional `tether.toml` holding defaults for every command:
//!
//! ```toml
//! flags = ["recursive", "reuse_local"]
//! search_paths = ["assets", "/srv/shared/archives"]
//! asset_root = "/srv/shared/archives"
//! ```
//!
//! Command-line switches are added on top of `flags`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tether_core::{LinkFlags, TetherError};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Flag names applied to every link/append run (see `LinkFlags::NAMES`).
    pub flags: Vec<String>,
    /// Directories searched for archive paths that do not exist as given.
    pub search_paths: Vec<PathBuf>,
    /// Root directory for weak references into archives.
    pub asset_root: Option<String>,
}

impl Config {
    /// Load `path`, or `tether.toml` from the working directory if present.
    ///
    /// An explicit path must exist; a missing default file yields the
    /// default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, TetherError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            TetherError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), flags = ?config.flags, "loaded config");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, TetherError> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| TetherError::DeserializationError(format!("Invalid config: {}", e)))?;
        config.link_flags()?;
        Ok(config)
    }

    /// The configured flags, on top of the engine defaults.
    pub fn link_flags(&self) -> Result<LinkFlags, TetherError> {
        parse_flags(LinkFlags::default(), &self.flags)
    }

    /// Find `path` as given, or inside the first search path that has it.
    pub fn resolve_library(&self, path: &str) -> String {
        let given = Path::new(path);
        if given.is_absolute() || given.exists() {
            return path.to_string();
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(given))
            .find(|candidate| candidate.exists())
            .map(|found| found.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    }
}

/// Add each named flag to `base`. A `no_` prefix removes the flag instead.
pub fn parse_flags(base: LinkFlags, names: &[String]) -> Result<LinkFlags, TetherError> {
    let mut flags = base;
    for name in names {
        let (clear, bare) = match name.strip_prefix("no_") {
            Some(bare) => (true, bare),
            None => (false, name.as_str()),
        };
        let flag = LinkFlags::from_config_name(bare)
            .ok_or_else(|| TetherError::InvalidOperation(format!("Unknown flag: {}", name)))?;
        flags.set(flag, !clear);
    }
    Ok(flags)
}

// =============================================================================
// TESTS
// =============================================================================
