//! # Linking Stage
//!
//! Materializes every requested block, and everything it references, from
//! the archives into library scopes of the session database.
//!
//! Items are processed in registration order. For each unresolved item the
//! candidate libraries are tried in registration order and the first one
//! holding the block wins. References to blocks that are not in the
//! database yet become new `INDIRECT` items appended to the same pass; the
//! reference fields are wired once the pass is over. Non-linkable blocks
//! (shape keys) are read together with their owner.

use super::{ImportContext, ImportItem, ItemId, ProcessStage};
use crate::archive::{RawBlock, RawTarget};
use crate::{
    BlockId, BlockKind, BlockTags, Database, EmbeddedRecord, LibraryId, LinkFlags, OverrideMeta,
    RefLocation, Reference, Reports, Scope, TetherError,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A reference field waiting for an item to resolve.
struct PendingReference {
    owner: BlockId,
    location: RefLocation,
    item: ItemId,
}

/// Bookkeeping of one Linking pass.
#[derive(Default)]
struct LinkPass {
    pending: Vec<PendingReference>,
    /// Items by (library index, kind, name).
    index: BTreeMap<(usize, BlockKind, String), ItemId>,
    /// Libraries whose open failure was already reported.
    reported: BTreeSet<usize>,
}

enum Materialized {
    Found(BlockId),
    Absent,
    Unreadable(String),
}

impl ImportContext<'_> {
    /// Run the Linking stage.
    pub fn link(&mut self, db: &mut Database, reports: &mut Reports) -> Result<(), TetherError> {
        self.stage.advance(ProcessStage::Linking)?;
        db.tag_all(|_| true, BlockTags::PRE_EXISTING, true);

        let mut pass = LinkPass::default();
        for (id, item) in self.items() {
            if let Some(first) = item.candidates.iter().next() {
                pass.index
                    .entry((first, item.kind, item.name.clone()))
                    .or_insert(id);
            }
        }

        let mut position = 0;
        while let Some(id) = self.item_at(position) {
            position += 1;
            self.link_item(db, id, &mut pass, reports)?;
        }

        let mut wired = 0usize;
        for reference in pass.pending {
            if let Some(target) = self.item(reference.item).and_then(ImportItem::resolved) {
                db.set_reference_at(reference.owner, reference.location, Some(target))?;
                wired += 1;
            }
        }

        if self.params.flags.contains(LinkFlags::PACK) {
            self.pack(db)?;
        }

        debug!(
            items = self.item_count(),
            libraries = self.library_count(),
            wired,
            "linking done"
        );
        Ok(())
    }

    fn link_item(
        &mut self,
        db: &mut Database,
        id: ItemId,
        pass: &mut LinkPass,
        reports: &mut Reports,
    ) -> Result<(), TetherError> {
        let (kind, name, candidates, indirect) = {
            let item = self.item(id).ok_or_else(|| super::unknown_item(id))?;
            if item.resolved.is_some() {
                return Ok(());
            }
            (
                item.kind,
                item.name.clone(),
                item.candidates.iter().collect::<Vec<_>>(),
                item.is_indirect(),
            )
        };
        let tags = if indirect || self.params.flags.contains(LinkFlags::FORCE_INDIRECT) {
            BlockTags::INDIRECT
        } else {
            BlockTags::EXTERN
        };

        for &library in &candidates {
            match self.materialize(db, library, kind, &name, tags, pass)? {
                Materialized::Found(block) => {
                    let item = self.item_mut(id)?;
                    item.source_library = Some(library);
                    item.candidates.clear_all();
                    if !self.by_block.contains_key(&block) {
                        self.bind(id, block)?;
                    } else {
                        self.item_mut(id)?.resolved = Some(block);
                    }
                    debug!(%id, %kind, name, library, %block, "linked");
                    return Ok(());
                }
                Materialized::Absent => {}
                Materialized::Unreadable(reason) => {
                    if pass.reported.insert(library) {
                        let path = self.library_path(library);
                        reports.library_not_found(&path, &reason);
                    }
                }
            }
        }

        let paths: Vec<String> = candidates.iter().map(|l| self.library_path(*l)).collect();
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        reports.item_not_found(kind, &name, &path_refs);

        if self.params.flags.contains(LinkFlags::USE_PLACEHOLDERS) {
            if let Some(&library) = candidates.first() {
                self.link_placeholder(db, id, library, kind, &name, tags, reports)?;
            }
        }
        Ok(())
    }

    fn link_placeholder(
        &mut self,
        db: &mut Database,
        id: ItemId,
        library: usize,
        kind: BlockKind,
        name: &str,
        tags: BlockTags,
        reports: &mut Reports,
    ) -> Result<(), TetherError> {
        let path = self.library_path(library);
        let lib_id = db.ensure_library(&path);
        let block = match db.find_by_name(Scope::Library(lib_id), kind, name) {
            Some(existing) => existing,
            None => {
                let block = db.create_block(kind, name, Scope::Library(lib_id))?;
                db.set_tag(block, tags | BlockTags::MISSING, true)?;
                block
            }
        };
        self.item_mut(id)?.source_library = Some(library);
        self.bind(id, block)?;
        reports.placeholder(kind, name, &path);
        Ok(())
    }

    /// Find or read `kind:name` from library `library`.
    fn materialize(
        &mut self,
        db: &mut Database,
        library: usize,
        kind: BlockKind,
        name: &str,
        tags: BlockTags,
        pass: &mut LinkPass,
    ) -> Result<Materialized, TetherError> {
        let codec = self.codec;
        let descriptor = self
            .libraries
            .get_mut(library)
            .ok_or(TetherError::InvalidLibraryIndex(library))?;
        if let Err(e) = descriptor.open(codec) {
            return Ok(Materialized::Unreadable(match e {
                TetherError::ArchiveUnreadable { reason, .. } => reason,
                other => other.to_string(),
            }));
        }
        let path = descriptor.path().to_string();
        let parent_path = descriptor
            .parent()
            .and_then(|p| self.libraries.get(p))
            .map(|p| p.path().to_string());

        let lib_id = db.ensure_library(&path);
        if let Some(parent_path) = parent_path {
            if db.library(lib_id).is_some_and(|r| r.parent.is_none()) {
                let parent = db.library_by_path(&parent_path);
                db.set_library_parent(lib_id, parent)?;
            }
        }

        if let Some(existing) = db.find_by_name(Scope::Library(lib_id), kind, name) {
            return Ok(Materialized::Found(existing));
        }

        let read = self
            .libraries
            .get_mut(library)
            .ok_or(TetherError::InvalidLibraryIndex(library))?
            .read_block(kind, name);
        let raw = match read {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Materialized::Absent),
            Err(e) => {
                warn!(path = %path, %kind, name, error = %e, "archive read failed");
                return Ok(Materialized::Unreadable(e.to_string()));
            }
        };
        let block = self.insert_raw(db, library, lib_id, raw, tags, pass)?;
        Ok(Materialized::Found(block))
    }

    /// Create the database block for `raw` and wire (or schedule) its references.
    fn insert_raw(
        &mut self,
        db: &mut Database,
        library: usize,
        lib_id: LibraryId,
        raw: RawBlock,
        tags: BlockTags,
        pass: &mut LinkPass,
    ) -> Result<BlockId, TetherError> {
        let id = db.create_block(raw.kind, &raw.name, Scope::Library(lib_id))?;
        if let Some(block) = db.get_mut(id) {
            block.tags = tags;
            block.asset = raw.asset.clone();
            block.properties = raw.properties.clone();
            block.references = raw
                .references
                .iter()
                .map(|r| Reference::new(r.slot.as_str(), None))
                .collect();
            block.embedded = raw
                .embedded
                .iter()
                .map(|e| EmbeddedRecord {
                    name: e.name.clone(),
                    references: e
                        .references
                        .iter()
                        .map(|r| Reference::new(r.slot.as_str(), None))
                        .collect(),
                })
                .collect();
            if raw.override_reference.is_some() {
                block.override_meta = Some(OverrideMeta {
                    reference: None,
                    runtime: false,
                });
            }
        }

        let mut fields: Vec<(RefLocation, &RawTarget)> = raw
            .references
            .iter()
            .enumerate()
            .map(|(i, r)| (RefLocation::Direct(i), &r.target))
            .collect();
        for (record, embedded) in raw.embedded.iter().enumerate() {
            fields.extend(
                embedded
                    .references
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (RefLocation::Embedded(record, i), &r.target)),
            );
        }
        if let Some(target) = &raw.override_reference {
            fields.push((RefLocation::Override, target));
        }

        for (location, target) in fields {
            self.wire_reference(db, library, id, location, target, pass)?;
        }
        Ok(id)
    }

    fn wire_reference(
        &mut self,
        db: &mut Database,
        library: usize,
        owner: BlockId,
        location: RefLocation,
        target: &RawTarget,
        pass: &mut LinkPass,
    ) -> Result<(), TetherError> {
        let target_library = match &target.library {
            None => library,
            Some(path) => self.library_for_path(path, library),
        };
        let target_path = self.library_path(target_library);
        if let Some(lib_id) = db.library_by_path(&target_path) {
            if let Some(existing) = db.find_by_name(Scope::Library(lib_id), target.kind, &target.name)
            {
                return db.set_reference_at(owner, location, Some(existing));
            }
        }

        if !target.kind.is_linkable() {
            match self.materialize(
                db,
                target_library,
                target.kind,
                &target.name,
                BlockTags::INDIRECT,
                pass,
            )? {
                Materialized::Found(block) => db.set_reference_at(owner, location, Some(block))?,
                Materialized::Absent | Materialized::Unreadable(_) => {
                    warn!(%owner, kind = %target.kind, name = %target.name, "owned sub-data missing");
                }
            }
            return Ok(());
        }

        let key = (target_library, target.kind, target.name.clone());
        let item = match pass.index.get(&key) {
            Some(item) => *item,
            None => {
                let mut dependency = ImportItem::indirect(target.kind, &target.name);
                dependency.candidates.set(target_library);
                let item = self.push_item(dependency);
                pass.index.insert(key, item);
                item
            }
        };
        pass.pending.push(PendingReference {
            owner,
            location,
            item,
        });
        Ok(())
    }

    pub(crate) fn library_path(&self, library: usize) -> String {
        self.libraries
            .get(library)
            .map(|l| l.path().to_string())
            .unwrap_or_default()
    }
}

// =============================================================================
// TESTS
// =============================================================================
