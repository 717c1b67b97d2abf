//! # Formats Module
//!
//! Binary archive file format.
//!
//! Conversion between [`crate::archive::ArchiveContents`] and bytes is pure;
//! the small file helpers exist for tools that write archives.

mod archive_file;

pub use archive_file::*;
