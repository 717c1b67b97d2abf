//! # Packing
//!
//! Marks everything a Linking pass brought in as packed, so the session no
//! longer depends on the archives being present.

use super::{ImportContext, ImportItem};
use crate::{BlockId, BlockTags, Database, TetherError};
use std::collections::BTreeSet;
use tracing::debug;

impl ImportContext<'_> {
    pub(crate) fn pack(&mut self, db: &mut Database) -> Result<(), TetherError> {
        let fresh: Vec<BlockId> = db
            .blocks()
            .filter(|b| b.is_linked() && !b.tags.contains(BlockTags::PRE_EXISTING))
            .map(|b| b.id)
            .collect();

        let mut libraries = BTreeSet::new();
        let mut added = 0usize;
        for id in &fresh {
            db.set_tag(*id, BlockTags::PACKED, true)?;
            let Some(block) = db.get(*id) else {
                continue;
            };
            if let Some(library) = block.scope.library() {
                libraries.insert(library);
            }
            if block.kind.is_linkable() && !self.by_block.contains_key(id) {
                let mut item = ImportItem::indirect(block.kind, &block.name);
                item.source_library = self.library_for_scope(db, block.scope);
                let item = self.push_item(item);
                self.bind(item, *id)?;
                added += 1;
            }
        }
        for library in &libraries {
            db.set_library_packed(*library, true)?;
        }
        debug!(blocks = fresh.len(), libraries = libraries.len(), added, "packed linked data");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::archive::{ArchiveContents, MemoryCodec, RawBlock};
    use crate::{BlockKind, BlockTags, Database, ImportContext, LinkFlags, LinkParams, Reports};

    #[test]
    fn linking_with_pack_flags_new_blocks_and_library() {
        let codec = MemoryCodec::new().with(
            "props.tether",
            ArchiveContents::new().with(
                RawBlock::new(BlockKind::Object, "Lamp")
                    .with_ref("data", BlockKind::Light, "Bulb"),
            )
            .with(RawBlock::new(BlockKind::Light, "Bulb")),
        );
        let mut db = Database::new();
        let existing = db
            .create_block(BlockKind::Mesh, "Floor", crate::Scope::Local)
            .expect("local");
        let mut reports = Reports::new();
        let mut ctx =
            ImportContext::new(&codec, LinkParams::new(LinkFlags::LINK | LinkFlags::PACK));
        let lib = ctx.add_library("props.tether").expect("library");
        let lamp = ctx.add_item(BlockKind::Object, "Lamp", None).expect("item");
        ctx.enable_item_for_library(lamp, lib).expect("enable");
        ctx.link(&mut db, &mut reports).expect("link");

        assert!(
            db.blocks()
                .filter(|b| b.is_linked())
                .all(|b| b.tags.contains(BlockTags::PACKED))
        );
        assert!(db.get(existing).is_some_and(|b| !b.tags.contains(BlockTags::PACKED)));
        assert!(db.libraries().all(|l| l.packed));
        assert_eq!(ctx.item_count(), 2);
    }
}
