//! # Storage Module
//!
//! Disk-backed archive storage using the redb embedded database.

mod redb_archive;

pub use redb_archive::*;
