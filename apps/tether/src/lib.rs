//! # tether
//!
//! Command-line front end of the tether link/append engine.
//!
//! - [`cli`] - argument parsing and command implementations
//! - [`config`] - optional `tether.toml` defaults

pub mod cli;
pub mod config;
