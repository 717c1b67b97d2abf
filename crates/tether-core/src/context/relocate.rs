//! # Library Relocation
//!
//! Points everything linked from one library at another archive, or reloads
//! it from the same one.
//!
//! The blocks of the library are hidden from name lookups, requested again
//! from the new path by a link-only context, and every reference in the
//! database is remapped from the old blocks to their replacements. Old
//! blocks nobody uses afterwards are destroyed; one that somehow keeps users
//! is renamed with a `~NNN` suffix and kept.

use super::ImportContext;
use crate::archive::ArchiveCodec;
use crate::report::DiagnosticKind;
use crate::{
    BlockId, BlockTags, Database, LibraryId, LinkFlags, LinkParams, RemapScope, Remapper, Reports,
    Scope, TetherError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// What a relocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateOutcome {
    /// Old blocks replaced by a block of the new archive.
    pub relocated: usize,
    /// Replaced blocks that still had users and were kept under a stale name.
    pub kept_stale: Vec<BlockId>,
    /// Old blocks the new archive does not contain.
    pub missing: usize,
}

/// Relocate `library` to `new_path`. Passing the library's own path reloads it.
pub fn relocate_library(
    db: &mut Database,
    library: LibraryId,
    new_path: &str,
    codec: &dyn ArchiveCodec,
    params: LinkParams,
    reports: &mut Reports,
) -> Result<RelocateOutcome, TetherError> {
    let old_path = db
        .library(library)
        .ok_or(TetherError::LibraryNotFound(library))?
        .path
        .clone();
    let reload = old_path == new_path;
    let mut params = params;
    params.flags |= LinkFlags::LINK;
    if reload {
        params.flags |= LinkFlags::USE_PLACEHOLDERS;
    }
    info!(from = %old_path, to = %new_path, reload, "relocating library");

    let old_blocks: Vec<BlockId> = db.blocks_in_scope(Scope::Library(library));
    let requests: Vec<(BlockId, crate::BlockKind, String)> = old_blocks
        .iter()
        .filter_map(|id| db.get(*id))
        .filter(|b| b.kind.is_linkable())
        .map(|b| (b.id, b.kind, b.name.clone()))
        .collect();
    for id in &old_blocks {
        db.detach_name(*id);
    }

    let mut ctx = ImportContext::new(codec, params);
    let lib = ctx.add_library(new_path)?;
    for (old, kind, name) in &requests {
        let item = ctx.add_item(*kind, name, Some(Box::new(*old)))?;
        ctx.enable_item_for_library(item, lib)?;
    }
    ctx.link(db, reports)?;

    let mut outcome = RelocateOutcome::default();
    let mut remapper = Remapper::new();
    let mut replacements = Vec::new();
    for (_, item) in ctx.items() {
        let Some(old) = item.user_context::<BlockId>().copied() else {
            continue;
        };
        match item.resolved() {
            Some(new) if new != old => {
                remapper.add(old, Some(new));
                replacements.push((old, new));
                outcome.relocated += 1;
            }
            _ => outcome.missing += 1,
        }
    }

    for (old, new) in &replacements {
        let Some(previous) = db.get(*old).map(|b| (b.tags, b.fake_user)) else {
            continue;
        };
        let (tags, fake_user) = previous;
        db.set_tag(*new, BlockTags::EXTERN, tags.contains(BlockTags::EXTERN))?;
        db.set_tag(*new, BlockTags::INDIRECT, tags.contains(BlockTags::INDIRECT))?;
        if fake_user {
            db.set_fake_user(*old, false)?;
            db.set_fake_user(*new, true)?;
        }
    }

    let remap = remapper.apply(db, RemapScope::All)?;

    let replaced: BTreeSet<BlockId> = replacements.iter().map(|(old, _)| *old).collect();
    let owned: BTreeSet<BlockId> = old_blocks
        .iter()
        .copied()
        .filter(|id| db.get(*id).is_some_and(|b| !b.kind.is_linkable()))
        .collect();
    let destroyed = db.purge_unused(replaced.iter().copied(), |b| {
        replaced.contains(&b.id) || owned.contains(&b.id)
    });

    for old in old_blocks {
        if !db.is_detached(old) {
            continue;
        }
        if replaced.contains(&old) {
            let stale = db.reattach_as_stale(old)?;
            reports.warning(
                DiagnosticKind::Relocation,
                format!("Old {old} is still in use, kept as '{stale}'"),
            );
            outcome.kept_stale.push(old);
        } else {
            db.reattach(old)?;
        }
    }

    let dropped = db.remove_unused_libraries();
    ctx.finalize(db)?;
    debug!(
        relocated = outcome.relocated,
        missing = outcome.missing,
        stale = outcome.kept_stale.len(),
        rewritten = remap.rewritten,
        destroyed = destroyed.len(),
        dropped_libraries = dropped.len(),
        "relocation done"
    );
    Ok(outcome)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveContents, MemoryCodec, RawBlock};
    use crate::primitives::{SLOT_DATA, SLOT_OBJECT};
    use crate::BlockKind;

    fn chair_archive(seat: &str) -> ArchiveContents {
        ArchiveContents::new()
            .with(RawBlock::new(BlockKind::Object, "Chair").with_ref(SLOT_DATA, BlockKind::Mesh, seat))
            .with(RawBlock::new(BlockKind::Mesh, seat))
    }

    /// Link `Chair` from `old.tether` and place it in a local collection.
    fn linked_session(codec: &MemoryCodec) -> (Database, BlockId, LibraryId) {
        let mut db = Database::new();
        let mut reports = Reports::new();
        let mut ctx = ImportContext::new(codec, LinkParams::new(LinkFlags::LINK));
        let lib = ctx.add_library("old.tether").expect("library");
        let chair = ctx.add_item(BlockKind::Object, "Chair", None).expect("item");
        ctx.enable_item_for_library(chair, lib).expect("enable");
        ctx.link(&mut db, &mut reports).expect("link");
        let chair_block = ctx.item_resolved(chair).expect("resolved");
        ctx.finalize(&mut db).expect("finalize");

        let room = db
            .create_block(BlockKind::Collection, "Room", Scope::Local)
            .expect("room");
        db.add_reference(room, SLOT_OBJECT, chair_block).expect("place");
        let library = db.library_by_path("old.tether").expect("record");
        (db, room, library)
    }

    #[test]
    fn relocation_remaps_local_users_and_drops_old_library() {
        let codec = MemoryCodec::new()
            .with("old.tether", chair_archive("Seat"))
            .with("new.tether", chair_archive("Seat"));
        let (mut db, room, library) = linked_session(&codec);
        let mut reports = Reports::new();

        let outcome =
            relocate_library(&mut db, library, "new.tether", &codec, LinkParams::default(), &mut reports)
                .expect("relocate");
        assert_eq!(outcome.relocated, 2);
        assert!(outcome.kept_stale.is_empty());

        let chair = db
            .get(room)
            .and_then(|r| r.targets_in_slot(SLOT_OBJECT).next())
            .expect("placed chair");
        assert_eq!(db.library_path_of(chair), Some("new.tether"));
        assert!(db.library_by_path("old.tether").is_none());
        db.check_references().expect("consistent");
    }

    #[test]
    fn reload_fills_missing_blocks_with_placeholders() {
        let before = MemoryCodec::new().with("old.tether", chair_archive("Seat"));
        let (mut db, _, library) = linked_session(&before);
        let after = MemoryCodec::new().with(
            "old.tether",
            ArchiveContents::new().with(RawBlock::new(BlockKind::Mesh, "Seat")),
        );
        let mut reports = Reports::new();

        let outcome =
            relocate_library(&mut db, library, "old.tether", &after, LinkParams::default(), &mut reports)
                .expect("reload");
        assert_eq!(outcome.missing, 0);
        assert_eq!(reports.placeholders, 1);
        let chair = db
            .find_by_name(Scope::Library(library), BlockKind::Object, "Chair")
            .expect("placeholder chair");
        assert!(db.get(chair).is_some_and(|b| b.tags.contains(BlockTags::MISSING)));
    }

    #[test]
    fn old_block_with_users_is_kept_stale() {
        let codec = MemoryCodec::new()
            .with("old.tether", chair_archive("Seat"))
            .with("new.tether", chair_archive("Seat"));
        let (mut db, _, library) = linked_session(&codec);
        let old_seat = db
            .find_by_name(Scope::Library(library), BlockKind::Mesh, "Seat")
            .expect("seat");
        db.incref(old_seat);
        let mut reports = Reports::new();

        let outcome =
            relocate_library(&mut db, library, "new.tether", &codec, LinkParams::default(), &mut reports)
                .expect("relocate");
        assert_eq!(outcome.kept_stale, vec![old_seat]);
        assert_eq!(db.get(old_seat).map(|b| b.name.as_str()), Some("Seat~000"));
        assert_eq!(reports.count(DiagnosticKind::Relocation), 1);
    }

    #[test]
    fn unknown_library_is_an_error() {
        let codec = MemoryCodec::new();
        let mut db = Database::new();
        let mut reports = Reports::new();
        assert!(matches!(
            relocate_library(&mut db, LibraryId(9), "x.tether", &codec, LinkParams::default(), &mut reports),
            Err(TetherError::LibraryNotFound(_))
        ));
    }
}
