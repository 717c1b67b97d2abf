//! # Library Overrides
//!
//! Creates local, editable overrides of linked items while a link-only
//! context is in its Linking stage.

use super::{ImportContext, ProcessStage};
use crate::{BlockId, BlockTags, Database, Reports, TetherError};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

bitflags! {
    /// Options of [`ImportContext::create_overrides`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OverrideFlags: u8 {
        /// Reuse the first local override of a block instead of creating one.
        const USE_EXISTING = 1 << 0;
        /// Overrides are runtime-only and never saved.
        const RUNTIME = 1 << 1;
    }
}

impl ImportContext<'_> {
    /// Give every resolved, linked item a local override. Returns how many
    /// overrides were created.
    pub fn create_overrides(
        &mut self,
        db: &mut Database,
        flags: OverrideFlags,
        reports: &mut Reports,
    ) -> Result<usize, TetherError> {
        self.stage.require(ProcessStage::Linking)?;
        if !self.params.is_link() {
            return Err(TetherError::InvalidOperation(
                "overrides can only be created by a link-only context".to_string(),
            ));
        }
        let runtime = flags.contains(OverrideFlags::RUNTIME);

        let targets: Vec<_> = self
            .items()
            .filter_map(|(id, item)| item.resolved.map(|block| (id, block)))
            .filter(|(_, block)| db.get(*block).is_some_and(|b| b.is_linked()))
            .collect();

        let mut created = 0;
        for (id, block) in targets {
            let existing = if flags.contains(OverrideFlags::USE_EXISTING) {
                existing_override(db, block)
            } else {
                None
            };
            let override_block = match existing {
                Some(existing) => existing,
                None => {
                    let new = db.create_override(block, runtime)?;
                    created += 1;
                    reports.resolved_overrides += 1;
                    new
                }
            };

            if runtime {
                let fresh = db
                    .get(block)
                    .is_some_and(|b| !b.tags.contains(BlockTags::PRE_EXISTING));
                if fresh {
                    db.set_tag(block, BlockTags::EXTERN, false)?;
                    db.set_tag(block, BlockTags::INDIRECT, true)?;
                }
            }

            self.item_mut(id)?.override_block = Some(override_block);
            debug!(item = %id, %block, %override_block, "override ready");
        }
        Ok(created)
    }
}

/// First local override of `reference`, in id order.
fn existing_override(db: &Database, reference: BlockId) -> Option<BlockId> {
    db.blocks()
        .filter(|b| b.scope.is_local())
        .find(|b| b.override_meta.is_some_and(|m| m.reference == Some(reference)))
        .map(|b| b.id)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveContents, MemoryCodec, RawBlock};
    use crate::{BlockKind, LinkFlags, LinkParams};

    fn codec() -> MemoryCodec {
        MemoryCodec::new().with(
            "chars.tether",
            ArchiveContents::new().with(RawBlock::new(BlockKind::Object, "Hero")),
        )
    }

    fn linked_context<'c>(
        codec: &'c MemoryCodec,
        db: &mut Database,
        reports: &mut Reports,
    ) -> (ImportContext<'c>, crate::context::ItemId) {
        let mut ctx = ImportContext::new(codec, LinkParams::new(LinkFlags::LINK));
        let lib = ctx.add_library("chars.tether").expect("library");
        let hero = ctx.add_item(BlockKind::Object, "Hero", None).expect("item");
        ctx.enable_item_for_library(hero, lib).expect("enable");
        ctx.link(db, reports).expect("link");
        (ctx, hero)
    }

    #[test]
    fn creates_local_override_of_linked_item() {
        let codec = codec();
        let mut db = Database::new();
        let mut reports = Reports::new();
        let (mut ctx, hero) = linked_context(&codec, &mut db, &mut reports);

        let created = ctx
            .create_overrides(&mut db, OverrideFlags::empty(), &mut reports)
            .expect("overrides");
        assert_eq!(created, 1);
        assert_eq!(reports.resolved_overrides, 1);

        let linked = ctx.item_resolved(hero).expect("resolved");
        let ov = ctx.item_override(hero).expect("override");
        let block = db.get(ov).expect("block");
        assert!(block.scope.is_local());
        assert_eq!(block.override_meta.and_then(|m| m.reference), Some(linked));
    }

    #[test]
    fn use_existing_reuses_previous_override() {
        let codec = codec();
        let mut db = Database::new();
        let mut reports = Reports::new();
        let first = {
            let (mut ctx, hero) = linked_context(&codec, &mut db, &mut reports);
            ctx.create_overrides(&mut db, OverrideFlags::empty(), &mut reports)
                .expect("overrides");
            let ov = ctx.item_override(hero);
            ctx.finalize(&mut db).expect("finalize");
            ov
        };

        let (mut ctx, hero) = linked_context(&codec, &mut db, &mut reports);
        let created = ctx
            .create_overrides(&mut db, OverrideFlags::USE_EXISTING, &mut reports)
            .expect("overrides");
        assert_eq!(created, 0);
        assert_eq!(ctx.item_override(hero), first);
    }

    #[test]
    fn runtime_override_demotes_fresh_reference() {
        let codec = codec();
        let mut db = Database::new();
        let mut reports = Reports::new();
        let (mut ctx, hero) = linked_context(&codec, &mut db, &mut reports);
        ctx.create_overrides(&mut db, OverrideFlags::RUNTIME, &mut reports)
            .expect("overrides");

        let linked = db.get(ctx.item_resolved(hero).expect("resolved")).expect("block");
        assert!(linked.tags.contains(BlockTags::INDIRECT));
        assert!(!linked.tags.contains(BlockTags::EXTERN));
        let ov = db.get(ctx.item_override(hero).expect("override")).expect("block");
        assert!(ov.tags.contains(BlockTags::RUNTIME));
    }

    #[test]
    fn append_context_cannot_create_overrides() {
        let codec = codec();
        let mut db = Database::new();
        let mut reports = Reports::new();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        ctx.link(&mut db, &mut reports).expect("link");
        assert!(matches!(
            ctx.create_overrides(&mut db, OverrideFlags::empty(), &mut reports),
            Err(TetherError::InvalidOperation(_))
        ));
    }
}
