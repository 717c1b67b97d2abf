//! # Engine Constants
//!
//! Fixed limits, reserved names and reference slot names shared by the
//! database, the archive formats and the import stages.

/// Magic bytes for the tether archive format header.
///
/// - File Header = Magic Bytes ("TETH") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"TETH";

/// Current archive serialization format version.
///
/// Increment this when making breaking changes to the archive format.
pub const FORMAT_VERSION: u8 = 1;

/// Name of the collection created to receive appended data when the caller
/// did not provide an active collection.
pub const APPENDED_COLLECTION_NAME: &str = "Appended Data";

/// Same as [`APPENDED_COLLECTION_NAME`], for link mode.
pub const LINKED_COLLECTION_NAME: &str = "Linked Data";

// =============================================================================
// NAME LIMITS
// =============================================================================

/// Maximum length of a block name, in bytes.
pub const MAX_NAME_LENGTH: usize = 63;

/// Highest numeric suffix tried when making a name unique (`Name.999`).
pub const MAX_NAME_SUFFIX: u32 = 999;

/// Prefix of the suffix given to stale blocks kept alive by a library
/// relocation (`Name~000`).
pub const STALE_SUFFIX_MARKER: char = '~';

// =============================================================================
// REFERENCE SLOTS
// =============================================================================

/// Collection/master-collection slot listing member objects.
pub const SLOT_OBJECT: &str = "object";

/// Collection/master-collection slot listing child collections.
pub const SLOT_CHILD: &str = "child";

/// Object slot holding its object-data.
pub const SLOT_DATA: &str = "data";

/// Object slot holding the collection it instances.
pub const SLOT_INSTANCE_COLLECTION: &str = "instance_collection";

/// Name of the embedded record holding a scene's master collection.
pub const MASTER_COLLECTION: &str = "master_collection";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum number of blocks accepted from a single archive.
pub const MAX_ARCHIVE_BLOCKS: usize = 1_000_000;

/// Maximum accepted weak-reference path length, in bytes.
pub const MAX_WEAK_REFERENCE_LENGTH: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_collection_names_differ() {
        assert_ne!(APPENDED_COLLECTION_NAME, LINKED_COLLECTION_NAME);
    }

    #[test]
    fn default_collection_names_fit() {
        assert!(APPENDED_COLLECTION_NAME.len() <= MAX_NAME_LENGTH);
        assert!(LINKED_COLLECTION_NAME.len() <= MAX_NAME_LENGTH);
    }
}
