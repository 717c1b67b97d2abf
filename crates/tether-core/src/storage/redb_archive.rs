//! # redb-backed Archives
//!
//! An archive stored as a redb database, for libraries too large to load
//! whole. Blocks are keyed by `(kind code, name)` and read one at a time,
//! so linking a single asset out of a big library only decodes that asset
//! and whatever it pulls in.

use crate::archive::{ArchiveContents, ArchiveReader, BlockListing, RawBlock};
use crate::{BlockKind, KindFilter, TetherError, primitives};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use tracing::debug;

/// Table for blocks: (kind code, name) -> postcard-serialized RawBlock
const BLOCKS: TableDefinition<(u8, &str), &[u8]> = TableDefinition::new("blocks");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const FORMAT_KEY: &str = "format_version";

fn io(e: impl std::fmt::Display) -> TetherError {
    TetherError::IoError(e.to_string())
}

/// A disk-backed archive using redb.
pub struct RedbArchive {
    db: Database,
    path: String,
}

impl std::fmt::Debug for RedbArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbArchive")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbArchive {
    /// Create (or overwrite the blocks of) an archive at `path`.
    pub fn create(path: impl AsRef<Path>, contents: &ArchiveContents) -> Result<Self, TetherError> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let db = Database::create(path.as_ref()).map_err(io)?;
        let archive = Self { db, path: path_str };

        let write_txn = archive.db.begin_write().map_err(io)?;
        {
            let mut meta = write_txn.open_table(METADATA).map_err(io)?;
            meta.insert(FORMAT_KEY, u64::from(primitives::FORMAT_VERSION))
                .map_err(io)?;
            let mut blocks = write_txn.open_table(BLOCKS).map_err(io)?;
            for raw in &contents.blocks {
                let bytes = postcard::to_stdvec(raw)
                    .map_err(|e| TetherError::SerializationError(e.to_string()))?;
                blocks
                    .insert((raw.kind.code(), raw.name.as_str()), bytes.as_slice())
                    .map_err(io)?;
            }
        }
        write_txn.commit().map_err(io)?;
        debug!(path = %archive.path, blocks = contents.blocks.len(), "wrote redb archive");
        Ok(archive)
    }

    /// Open an existing archive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TetherError> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let db = Database::open(path.as_ref()).map_err(io)?;

        let version = {
            let read_txn = db.begin_read().map_err(io)?;
            let meta = read_txn.open_table(METADATA).map_err(io)?;
            meta.get(FORMAT_KEY).map_err(io)?.map(|v| v.value())
        };
        if version != Some(u64::from(primitives::FORMAT_VERSION)) {
            return Err(TetherError::DeserializationError(format!(
                "Unsupported archive version: {:?} (expected {})",
                version,
                primitives::FORMAT_VERSION
            )));
        }

        Ok(Self { db, path: path_str })
    }

    /// Number of blocks stored.
    pub fn block_count(&self) -> Result<usize, TetherError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(BLOCKS).map_err(io)?;
        Ok(table.len().map_err(io)? as usize)
    }

    /// Load everything.
    pub fn to_contents(&self) -> Result<ArchiveContents, TetherError> {
        Ok(ArchiveContents {
            blocks: self.all_blocks()?,
        })
    }

    fn all_blocks(&self) -> Result<Vec<RawBlock>, TetherError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(BLOCKS).map_err(io)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }
}

fn decode(bytes: &[u8]) -> Result<RawBlock, TetherError> {
    postcard::from_bytes(bytes).map_err(|e| TetherError::DeserializationError(e.to_string()))
}

impl ArchiveReader for RedbArchive {
    fn path(&self) -> &str {
        &self.path
    }

    fn read_named_block(
        &mut self,
        kind: BlockKind,
        name: &str,
    ) -> Result<Option<RawBlock>, TetherError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(BLOCKS).map_err(io)?;
        let value = table.get((kind.code(), name)).map_err(io)?;
        value.map(|v| decode(v.value())).transpose()
    }

    fn enumerate_blocks(
        &mut self,
        filter: KindFilter,
        assets_only: bool,
    ) -> Result<Vec<BlockListing>, TetherError> {
        // Keys are ordered by (kind code, name), which is the listing order.
        Ok(ArchiveContents {
            blocks: self.all_blocks()?,
        }
        .listings(filter, assets_only))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_archive() -> (TempDir, String) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("library.redb");
        let contents = ArchiveContents::new()
            .with(RawBlock::new(BlockKind::Material, "Brass").as_asset("shiny"))
            .with(RawBlock::new(BlockKind::Material, "Oak"))
            .with(RawBlock::new(BlockKind::Texture, "Grain"));
        RedbArchive::create(&path, &contents).expect("create");
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn reopen_and_read_named_block() {
        let (_dir, path) = create_archive();
        let mut archive = RedbArchive::open(&path).expect("open");
        assert_eq!(archive.block_count().expect("count"), 3);

        let raw = archive
            .read_named_block(BlockKind::Material, "Oak")
            .expect("read");
        assert_eq!(raw.map(|r| r.name), Some("Oak".to_string()));
        assert!(
            archive
                .read_named_block(BlockKind::Texture, "Oak")
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn enumeration_filters_by_kind() {
        let (_dir, path) = create_archive();
        let mut archive = RedbArchive::open(&path).expect("open");
        let materials = archive
            .enumerate_blocks(KindFilter::MATERIAL, false)
            .expect("enumerate");
        let names: Vec<String> = materials.into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["Brass".to_string(), "Oak".to_string()]);
    }

    #[test]
    fn file_codec_opens_redb_archives() {
        use crate::archive::{ArchiveCodec, FileCodec};

        let (_dir, path) = create_archive();
        let mut reader = FileCodec.open(&path).expect("open via codec");
        let assets = reader
            .enumerate_blocks(KindFilter::empty(), true)
            .expect("enumerate");
        assert_eq!(assets.len(), 1);
    }
}
