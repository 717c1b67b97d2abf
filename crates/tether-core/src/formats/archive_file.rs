//! # Archive File Format
//!
//! Binary serialization for tether archives.
//!
//! Format: Header (5 bytes) + postcard-serialized archive contents.
//! - 4 bytes: Magic ("TETH")
//! - 1 byte: Version
//!
//! ## Validation
//!
//! Size limits and the header are checked before the payload is decoded,
//! and the decoded block count is bounded by `MAX_ARCHIVE_BLOCKS`.

use crate::archive::ArchiveContents;
use crate::{TetherError, primitives};
use std::path::Path;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum accepted archive file size.
pub const MAX_ARCHIVE_PAYLOAD_SIZE: usize = 256 * 1024 * 1024; // 256 MB

const HEADER_SIZE: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The header preceding every archive payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl ArchiveHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(TetherError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(TetherError::DeserializationError(format!(
                "Unsupported archive version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TetherError> {
        match bytes {
            [a, b, c, d, version, ..] => Ok(Self {
                magic: [*a, *b, *c, *d],
                version: *version,
            }),
            _ => Err(TetherError::DeserializationError(
                "Header too short".to_string(),
            )),
        }
    }
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `bytes` start with the archive magic.
#[must_use]
pub fn is_archive_bytes(bytes: &[u8]) -> bool {
    bytes.starts_with(primitives::MAGIC_BYTES)
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Serialize archive contents (header + payload).
pub fn archive_to_bytes(contents: &ArchiveContents) -> Result<Vec<u8>, TetherError> {
    let payload =
        postcard::to_stdvec(contents).map_err(|e| TetherError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&ArchiveHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize archive contents.
pub fn archive_from_bytes(bytes: &[u8]) -> Result<ArchiveContents, TetherError> {
    if bytes.len() > MAX_ARCHIVE_PAYLOAD_SIZE {
        return Err(TetherError::DeserializationError(format!(
            "Archive size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_ARCHIVE_PAYLOAD_SIZE
        )));
    }

    let header = ArchiveHeader::from_bytes(bytes)?;
    header.validate()?;

    let payload = bytes.get(HEADER_SIZE..).unwrap_or_default();
    let contents: ArchiveContents = postcard::from_bytes(payload).map_err(|e| {
        TetherError::DeserializationError(format!("Failed to decode archive: {}", e))
    })?;

    if contents.blocks.len() > primitives::MAX_ARCHIVE_BLOCKS {
        return Err(TetherError::DeserializationError(format!(
            "Archive holds {} blocks, maximum is {}",
            contents.blocks.len(),
            primitives::MAX_ARCHIVE_BLOCKS
        )));
    }
    Ok(contents)
}

/// Write an archive file.
pub fn write_archive_file(
    path: impl AsRef<Path>,
    contents: &ArchiveContents,
) -> Result<(), TetherError> {
    let bytes = archive_to_bytes(contents)?;
    std::fs::write(path, bytes).map_err(|e| TetherError::IoError(e.to_string()))
}

/// Read an archive file.
pub fn read_archive_file(path: impl AsRef<Path>) -> Result<ArchiveContents, TetherError> {
    let bytes = std::fs::read(path).map_err(|e| TetherError::IoError(e.to_string()))?;
    archive_from_bytes(&bytes)
}

// =============================================================================
// TESTS
// =============================================================================
