//! # Archive Boundary
//!
//! Everything the engine knows about library archives goes through the two
//! traits in this module:
//!
//! - [`ArchiveCodec`] opens an archive by path.
//! - [`ArchiveReader`] reads one named block or enumerates the blocks of an
//!   open archive. Dropping the reader closes it.
//!
//! Archive-side blocks are described by [`RawBlock`]: references are
//! symbolic (`kind`, `name`, optional library path) and only become
//! [`crate::BlockId`]s once the Linking stage materializes them.
//!
//! Two codecs ship with the crate: [`MemoryCodec`] (archives held in memory,
//! used by tests and by callers that build archives on the fly) and
//! [`FileCodec`] (postcard archive files and redb archive databases on disk).

use crate::formats::{archive_from_bytes, is_archive_bytes};
use crate::storage::RedbArchive;
use crate::{AssetMetadata, BlockKind, KindFilter, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// RAW ARCHIVE DATA
// =============================================================================

/// Symbolic target of a reference inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawTarget {
    pub kind: BlockKind,
    pub name: String,
    /// Path of another archive, or `None` for the archive holding the reference.
    pub library: Option<String>,
}

impl RawTarget {
    /// A target in the same archive.
    #[must_use]
    pub fn local(kind: BlockKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            library: None,
        }
    }

    /// A target in another archive.
    #[must_use]
    pub fn external(library: &str, kind: BlockKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            library: Some(library.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReference {
    pub slot: String,
    pub target: RawTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawEmbedded {
    pub name: String,
    pub references: Vec<RawReference>,
}

/// One block as stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub kind: BlockKind,
    pub name: String,
    pub references: Vec<RawReference>,
    pub embedded: Vec<RawEmbedded>,
    /// Set when the archived block is itself a liboverride.
    pub override_reference: Option<RawTarget>,
    pub asset: Option<AssetMetadata>,
    pub properties: BTreeMap<String, String>,
}

impl RawBlock {
    #[must_use]
    pub fn new(kind: BlockKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            references: Vec::new(),
            embedded: Vec::new(),
            override_reference: None,
            asset: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builder: add a reference to a block of the same archive.
    #[must_use]
    pub fn with_ref(mut self, slot: &str, kind: BlockKind, name: &str) -> Self {
        self.references.push(RawReference {
            slot: slot.to_string(),
            target: RawTarget::local(kind, name),
        });
        self
    }

    /// Builder: add a reference to a block of another archive.
    #[must_use]
    pub fn with_external_ref(
        mut self,
        slot: &str,
        library: &str,
        kind: BlockKind,
        name: &str,
    ) -> Self {
        self.references.push(RawReference {
            slot: slot.to_string(),
            target: RawTarget::external(library, kind, name),
        });
        self
    }

    /// Builder: add a reference held by the embedded record `record`.
    #[must_use]
    pub fn with_embedded_ref(
        mut self,
        record: &str,
        slot: &str,
        kind: BlockKind,
        name: &str,
    ) -> Self {
        let reference = RawReference {
            slot: slot.to_string(),
            target: RawTarget::local(kind, name),
        };
        match self.embedded.iter_mut().find(|e| e.name == record) {
            Some(embedded) => embedded.references.push(reference),
            None => self.embedded.push(RawEmbedded {
                name: record.to_string(),
                references: vec![reference],
            }),
        }
        self
    }

    /// Builder: mark as a liboverride of `target`.
    #[must_use]
    pub fn with_override_of(mut self, target: RawTarget) -> Self {
        self.override_reference = Some(target);
        self
    }

    /// Builder: attach asset metadata.
    #[must_use]
    pub fn as_asset(mut self, description: &str) -> Self {
        self.asset = Some(AssetMetadata {
            description: Some(description.to_string()),
            tags: Vec::new(),
        });
        self
    }

    /// Every symbolic target, override reference included.
    pub fn targets(&self) -> impl Iterator<Item = &RawTarget> {
        self.references
            .iter()
            .chain(self.embedded.iter().flat_map(|e| e.references.iter()))
            .map(|r| &r.target)
            .chain(self.override_reference.iter())
    }
}

/// Lightweight description of an archived block, for enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockListing {
    pub kind: BlockKind,
    pub name: String,
    pub asset: Option<AssetMetadata>,
}

impl From<&RawBlock> for BlockListing {
    fn from(raw: &RawBlock) -> Self {
        Self {
            kind: raw.kind,
            name: raw.name.clone(),
            asset: raw.asset.clone(),
        }
    }
}

/// The full contents of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveContents {
    pub blocks: Vec<RawBlock>,
}

impl ArchiveContents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a block.
    #[must_use]
    pub fn with(mut self, block: RawBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn push(&mut self, block: RawBlock) {
        self.blocks.push(block);
    }

    #[must_use]
    pub fn find(&self, kind: BlockKind, name: &str) -> Option<&RawBlock> {
        self.blocks
            .iter()
            .find(|b| b.kind == kind && b.name == name)
    }

    /// Listings of the blocks passing `filter`, sorted by kind then name.
    #[must_use]
    pub fn listings(&self, filter: KindFilter, assets_only: bool) -> Vec<BlockListing> {
        let mut out: Vec<BlockListing> = self
            .blocks
            .iter()
            .filter(|b| b.kind.is_linkable() && filter.matches(b.kind))
            .filter(|b| !assets_only || b.asset.is_some())
            .map(BlockListing::from)
            .collect();
        out.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        out
    }
}

// =============================================================================
// CODEC TRAITS
// =============================================================================

/// An open archive.
pub trait ArchiveReader: fmt::Debug {
    /// Path the archive was opened from.
    fn path(&self) -> &str;

    /// Read one block. `Ok(None)` if the archive has no such block.
    fn read_named_block(
        &mut self,
        kind: BlockKind,
        name: &str,
    ) -> Result<Option<RawBlock>, TetherError>;

    /// List the linkable blocks passing `filter`, sorted by kind then name.
    fn enumerate_blocks(
        &mut self,
        filter: KindFilter,
        assets_only: bool,
    ) -> Result<Vec<BlockListing>, TetherError>;
}

/// Opens archives by path.
pub trait ArchiveCodec {
    fn open(&self, path: &str) -> Result<Box<dyn ArchiveReader>, TetherError>;
}

// =============================================================================
// IN-MEMORY ARCHIVES
// =============================================================================

/// An archive whose contents are fully loaded.
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    path: String,
    contents: ArchiveContents,
}

impl MemoryArchive {
    #[must_use]
    pub fn new(path: &str, contents: ArchiveContents) -> Self {
        Self {
            path: path.to_string(),
            contents,
        }
    }
}

impl ArchiveReader for MemoryArchive {
    fn path(&self) -> &str {
        &self.path
    }

    fn read_named_block(
        &mut self,
        kind: BlockKind,
        name: &str,
    ) -> Result<Option<RawBlock>, TetherError> {
        Ok(self.contents.find(kind, name).cloned())
    }

    fn enumerate_blocks(
        &mut self,
        filter: KindFilter,
        assets_only: bool,
    ) -> Result<Vec<BlockListing>, TetherError> {
        Ok(self.contents.listings(filter, assets_only))
    }
}

/// A codec serving archives registered in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCodec {
    archives: BTreeMap<String, ArchiveContents>,
}

impl MemoryCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the archive at `path`.
    pub fn insert(&mut self, path: &str, contents: ArchiveContents) {
        self.archives.insert(path.to_string(), contents);
    }

    /// Builder form of [`MemoryCodec::insert`].
    #[must_use]
    pub fn with(mut self, path: &str, contents: ArchiveContents) -> Self {
        self.insert(path, contents);
        self
    }
}

impl ArchiveCodec for MemoryCodec {
    fn open(&self, path: &str) -> Result<Box<dyn ArchiveReader>, TetherError> {
        let contents = self
            .archives
            .get(path)
            .ok_or_else(|| TetherError::ArchiveUnreadable {
                path: path.to_string(),
                reason: "no such archive".to_string(),
            })?;
        Ok(Box::new(MemoryArchive::new(path, contents.clone())))
    }
}

// =============================================================================
// ON-DISK ARCHIVES
// =============================================================================

/// Opens archives from the file system.
///
/// Files starting with the tether magic bytes are postcard archive files and
/// are loaded whole; anything else is opened as a redb archive database.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCodec;

impl ArchiveCodec for FileCodec {
    fn open(&self, path: &str) -> Result<Box<dyn ArchiveReader>, TetherError> {
        let unreadable = |reason: String| TetherError::ArchiveUnreadable {
            path: path.to_string(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;
        if is_archive_bytes(&bytes) {
            let contents = archive_from_bytes(&bytes).map_err(|e| unreadable(e.to_string()))?;
            return Ok(Box::new(MemoryArchive::new(path, contents)));
        }
        drop(bytes);
        let archive = RedbArchive::open(path).map_err(|e| unreadable(e.to_string()))?;
        Ok(Box::new(archive))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn contents() -> ArchiveContents {
        ArchiveContents::new()
            .with(RawBlock::new(BlockKind::Object, "Chair").with_ref(
                "data",
                BlockKind::Mesh,
                "ChairMesh",
            ))
            .with(RawBlock::new(BlockKind::Mesh, "ChairMesh").as_asset("a chair"))
            .with(RawBlock::new(BlockKind::ShapeKey, "Key"))
    }

    #[test]
    fn memory_codec_reads_named_blocks() {
        let codec = MemoryCodec::new().with("props.tether", contents());
        let mut reader = codec.open("props.tether").expect("open");

        let raw = reader
            .read_named_block(BlockKind::Object, "Chair")
            .expect("read")
            .expect("present");
        assert_eq!(raw.targets().count(), 1);
        assert!(
            reader
                .read_named_block(BlockKind::Object, "Table")
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn missing_archive_is_unreadable() {
        let codec = MemoryCodec::new();
        assert!(matches!(
            codec.open("nowhere.tether"),
            Err(TetherError::ArchiveUnreadable { .. })
        ));
    }

    #[test]
    fn enumeration_skips_non_linkable_and_filters_assets() {
        let codec = MemoryCodec::new().with("props.tether", contents());
        let mut reader = codec.open("props.tether").expect("open");

        let all = reader
            .enumerate_blocks(KindFilter::empty(), false)
            .expect("enumerate");
        let names: Vec<&str> = all.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Chair", "ChairMesh"]);

        let assets = reader
            .enumerate_blocks(KindFilter::empty(), true)
            .expect("enumerate");
        assert_eq!(assets.len(), 1);

        let meshes = reader
            .enumerate_blocks(KindFilter::OBJECT, false)
            .expect("enumerate");
        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes.first().map(|l| l.kind), Some(BlockKind::Object));
    }

    #[test]
    fn file_codec_reports_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.tether");
        let result = FileCodec.open(&path.to_string_lossy());
        assert!(matches!(
            result,
            Err(TetherError::ArchiveUnreadable { .. })
        ));
    }
}
