//! # Appending Stage
//!
//! Turns linked items into local data.
//!
//! Every resolved item gets an [`AppendAction`]:
//!
//! | Action       | Effect                                                      |
//! |--------------|-------------------------------------------------------------|
//! | `KeepLinked` | left as is                                                  |
//! | `ReuseLocal` | points at a local block produced by an earlier append       |
//! | `MakeLocal`  | the linked block itself moves into the local scope          |
//! | `CopyLocal`  | a local duplicate is created, the linked original stays     |
//!
//! Once every action is applied, references held by the new local blocks are
//! redirected from the linked originals to their local counterparts.

use super::{AppendAction, ImportContext, ItemId, OverrideClass, ProcessStage};
use crate::{
    AppendProvenance, BlockId, BlockKind, BlockTags, Database, LinkFlags, RemapScope, Remapper,
    Reports, TetherError,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// =============================================================================
// PROVENANCE INDEX
// =============================================================================

/// Local blocks produced by earlier appends, keyed by where they came from.
#[derive(Debug, Clone, Default)]
pub struct ProvenanceIndex {
    entries: BTreeMap<(String, BlockKind, String), BlockId>,
}

impl ProvenanceIndex {
    /// Index every local block of `db` that carries append provenance.
    #[must_use]
    pub fn build(db: &Database) -> Self {
        let mut index = Self::default();
        for block in db.blocks().filter(|b| b.scope.is_local()) {
            if let Some(provenance) = &block.provenance {
                index.insert(&provenance.library_path, block.kind, &provenance.name, block.id);
            }
        }
        index
    }

    pub fn lookup(&self, library_path: &str, kind: BlockKind, name: &str) -> Option<BlockId> {
        self.entries
            .get(&(library_path.to_string(), kind, name.to_string()))
            .copied()
    }

    pub fn insert(&mut self, library_path: &str, kind: BlockKind, name: &str, block: BlockId) {
        self.entries
            .insert((library_path.to_string(), kind, name.to_string()), block);
    }

    pub fn remove(&mut self, library_path: &str, kind: BlockKind, name: &str) -> Option<BlockId> {
        self.entries
            .remove(&(library_path.to_string(), kind, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// STAGE
// =============================================================================

/// An item taking part in action selection.
struct Candidate {
    id: ItemId,
    block: BlockId,
    kind: BlockKind,
    class: OverrideClass,
}

impl ImportContext<'_> {
    /// Run the Appending stage.
    pub fn append(&mut self, db: &mut Database, reports: &mut Reports) -> Result<(), TetherError> {
        if self.params.is_link() {
            return Err(TetherError::InvalidOperation(
                "append requested on a link-only context".to_string(),
            ));
        }
        self.stage.advance(ProcessStage::Appending)?;
        self.provenance = Some(ProvenanceIndex::build(db));

        self.discover_dependencies(db)?;
        self.classify_override_dependencies(db)?;

        let candidates = self.collect_candidates(db)?;
        self.decide_actions(db, &candidates, reports)?;
        self.apply_actions(db, &candidates)?;
        self.share_bound_results()?;
        Ok(())
    }

    /// Items resolved to a block another item is bound to take over that
    /// item's outcome.
    fn share_bound_results(&mut self) -> Result<(), TetherError> {
        let followers: Vec<(ItemId, ItemId)> = self
            .items()
            .filter_map(|(id, item)| {
                let bound = *self.by_block.get(&item.resolved?)?;
                (bound != id).then_some((id, bound))
            })
            .collect();
        for (id, bound) in followers {
            let Some(source) = self.item(bound) else {
                continue;
            };
            let (action, resolved, linked_source) =
                (source.action, source.resolved, source.linked_source);
            let item = self.item_mut(id)?;
            item.action = action;
            item.resolved = resolved;
            item.linked_source = linked_source;
        }
        Ok(())
    }

    /// Resolved items whose block is still linked, one per block.
    fn collect_candidates(&self, db: &Database) -> Result<Vec<Candidate>, TetherError> {
        let mut out = Vec::new();
        for (id, item) in self.items() {
            let Some(block) = item.resolved else {
                continue;
            };
            if self.by_block.get(&block) != Some(&id) {
                continue;
            }
            if !db.get(block).is_some_and(|b| b.is_linked()) {
                continue;
            }
            out.push(Candidate {
                id,
                block,
                kind: item.kind,
                class: item.tags.override_class()?,
            });
        }
        Ok(out)
    }

    fn decide_actions(
        &mut self,
        db: &Database,
        candidates: &[Candidate],
        reports: &mut Reports,
    ) -> Result<(), TetherError> {
        let flags = self.params.flags;
        let direct_libraries: BTreeSet<usize> = self
            .items()
            .filter(|(_, item)| !item.is_indirect())
            .filter_map(|(_, item)| item.source_library)
            .collect();

        // Items that never leave their library, and reusable local matches.
        for candidate in candidates {
            let data = db.require(candidate.block)?;
            let source = self.item(candidate.id).and_then(|i| i.source_library);
            let keep = if candidate.class == OverrideClass::DependencyOnly {
                true
            } else if data.tags.contains(BlockTags::MISSING) {
                warn!(block = %data.display_name(), "placeholder cannot be appended");
                true
            } else {
                !flags.contains(LinkFlags::RECURSIVE)
                    && source.is_none_or(|s| !direct_libraries.contains(&s))
            };

            let reusable = if candidate.kind.append_is_reusable() {
                db.library_path_of(candidate.block)
                    .and_then(|path| {
                        self.provenance
                            .as_ref()
                            .and_then(|p| p.lookup(path, data.kind, &data.name))
                    })
                    .filter(|local| {
                        db.get(*local)
                            .is_some_and(|b| !b.tags.contains(BlockTags::MODIFIED))
                    })
            } else {
                None
            };

            let item = self.item_mut(candidate.id)?;
            item.reusable_existing = reusable;
            if keep {
                item.action = AppendAction::KeepLinked;
            }
        }

        if flags.contains(LinkFlags::REUSE_LOCAL) {
            self.invalidate_reuse(db, candidates);
        }

        let appending: BTreeSet<BlockId> = candidates
            .iter()
            .filter(|c| self.action_of(c.id) != AppendAction::KeepLinked)
            .map(|c| c.block)
            .collect();

        for candidate in candidates {
            if self.action_of(candidate.id) != AppendAction::Unset {
                continue;
            }
            let data = db.require(candidate.block)?;
            let reusable = self.item(candidate.id).and_then(|i| i.reusable_existing);
            let mut action = if flags.contains(LinkFlags::REUSE_LOCAL) && reusable.is_some() {
                AppendAction::ReuseLocal
            } else if data.tags.contains(BlockTags::PRE_EXISTING)
                || candidate.class == OverrideClass::Dependency
                || data.is_override()
                || has_external_referrers(db, candidate.block, &appending)
            {
                AppendAction::CopyLocal
            } else {
                AppendAction::MakeLocal
            };

            if action.promotes()
                && !flags.contains(LinkFlags::RENAME_ON_COLLISION)
                && db.find_local(data.kind, &data.name).is_some()
            {
                reports.name_collision(data.kind, &data.name);
                action = AppendAction::KeepLinked;
            }
            self.item_mut(candidate.id)?.action = action;
        }

        // A block still needed by a linked referrer is duplicated, not moved.
        let still_linked: Vec<BlockId> = candidates
            .iter()
            .filter(|c| {
                matches!(
                    self.action_of(c.id),
                    AppendAction::KeepLinked | AppendAction::ReuseLocal
                )
            })
            .map(|c| c.block)
            .collect();
        for block in still_linked {
            let Some(data) = db.get(block) else {
                continue;
            };
            for (target, _) in data.targets() {
                let Some(target_item) = self.by_block.get(&target).copied() else {
                    continue;
                };
                if self.action_of(target_item) == AppendAction::MakeLocal {
                    debug!(%target, referrer = %block, "kept-linked referrer forces copy");
                    self.item_mut(target_item)?.action = AppendAction::CopyLocal;
                }
            }
        }

        for candidate in candidates {
            if let Some(item) = self.item(candidate.id) {
                debug!(
                    item = %candidate.id,
                    kind = %candidate.kind,
                    name = %item.name,
                    action = %item.action,
                    "append action"
                );
            }
        }
        Ok(())
    }

    /// Fixed point: a block cannot reuse a local copy while it depends on a
    /// block that is appended without one.
    fn invalidate_reuse(&mut self, db: &Database, candidates: &[Candidate]) {
        loop {
            let mut changed = false;
            for candidate in candidates {
                let Some(item) = self.item(candidate.id) else {
                    continue;
                };
                if item.reusable_existing.is_none() || item.action == AppendAction::KeepLinked {
                    continue;
                }
                let blocked = db.get(candidate.block).is_some_and(|data| {
                    data.targets().iter().any(|(target, _)| {
                        self.by_block
                            .get(target)
                            .and_then(|dep| self.item(*dep))
                            .is_some_and(|dep| {
                                dep.action != AppendAction::KeepLinked
                                    && dep.reusable_existing.is_none()
                            })
                    })
                });
                if blocked {
                    if let Some(item) = self.items.get_mut(candidate.id.0) {
                        item.reusable_existing = None;
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn apply_actions(&mut self, db: &mut Database, candidates: &[Candidate]) -> Result<(), TetherError> {
        let flags = self.params.flags;
        let clear_overrides = flags.contains(LinkFlags::CLEAR_OVERRIDES);
        let mut remapper = Remapper::new();
        let mut new_local: BTreeSet<BlockId> = BTreeSet::new();
        let mut reused_sources: Vec<BlockId> = Vec::new();
        let mut counts: BTreeMap<AppendAction, usize> = BTreeMap::new();

        for candidate in candidates {
            let (action, reusable) = match self.item(candidate.id) {
                Some(item) => (item.action, item.reusable_existing),
                None => continue,
            };
            let source_path = db.library_path_of(candidate.block).map(str::to_string);
            let source_name = db.require(candidate.block)?.name.clone();

            let local = match action {
                AppendAction::MakeLocal => {
                    db.make_local(candidate.block, clear_overrides)?;
                    new_local.insert(candidate.block);
                    new_local.extend(db.owned_blocks(candidate.block));
                    candidate.block
                }
                AppendAction::CopyLocal => {
                    let copy = db.duplicate_local(candidate.block, clear_overrides)?;
                    remapper.add(candidate.block, Some(copy));
                    new_local.insert(copy);
                    new_local.extend(db.owned_blocks(copy));
                    copy
                }
                AppendAction::ReuseLocal => {
                    let Some(local) = reusable else {
                        continue;
                    };
                    remapper.add(candidate.block, Some(local));
                    reused_sources.push(candidate.block);
                    local
                }
                AppendAction::KeepLinked | AppendAction::Unset => continue,
            };
            *counts.entry(action).or_default() += 1;

            if action.promotes() {
                if let Some(path) = &source_path {
                    self.finish_promoted(db, candidate, local, path, &source_name, reusable)?;
                }
            }

            let item = self.item_mut(candidate.id)?;
            item.linked_source = Some(candidate.block);
            item.resolved = Some(local);
            self.by_block.insert(local, candidate.id);
        }

        let outcome = remapper.apply(db, RemapScope::Blocks(&new_local))?;

        let keep: BTreeSet<BlockId> = candidates
            .iter()
            .filter(|c| c.class != OverrideClass::None)
            .map(|c| c.block)
            .collect();
        let purged = db.purge_unused(reused_sources, |b| {
            b.is_linked() && !b.tags.contains(BlockTags::PRE_EXISTING) && !keep.contains(&b.id)
        });

        debug!(
            made_local = counts.get(&AppendAction::MakeLocal).copied().unwrap_or(0),
            copied = counts.get(&AppendAction::CopyLocal).copied().unwrap_or(0),
            reused = counts.get(&AppendAction::ReuseLocal).copied().unwrap_or(0),
            rewritten = outcome.rewritten,
            purged = purged.len(),
            "appending done"
        );
        Ok(())
    }

    /// Provenance, fake user and asset handling of a freshly promoted block.
    fn finish_promoted(
        &mut self,
        db: &mut Database,
        candidate: &Candidate,
        local: BlockId,
        source_path: &str,
        source_name: &str,
        unused_match: Option<BlockId>,
    ) -> Result<(), TetherError> {
        let flags = self.params.flags;
        if candidate.kind.append_is_reusable() {
            if let Some(stale) = unused_match {
                if let Some(block) = db.get_mut(stale) {
                    block.provenance = None;
                }
            }
            if let Some(block) = db.get_mut(local) {
                block.provenance = Some(AppendProvenance {
                    library_path: source_path.to_string(),
                    name: source_name.to_string(),
                });
            }
            if let Some(index) = self.provenance.as_mut() {
                index.insert(source_path, candidate.kind, source_name, local);
            }
        }
        if flags.contains(LinkFlags::SET_FAKE_USER)
            && !matches!(candidate.kind, BlockKind::Object | BlockKind::Collection)
        {
            db.set_fake_user(local, true)?;
        }
        if flags.contains(LinkFlags::CLEAR_ASSET_DATA) {
            if let Some(block) = db.get_mut(local) {
                block.asset = None;
            }
        }
        Ok(())
    }

    fn action_of(&self, id: ItemId) -> AppendAction {
        self.item(id).map_or(AppendAction::Unset, |item| item.action)
    }
}

/// Whether anything outside `appending` references `block`. Non-linkable
/// referrers stand for whoever owns them.
fn has_external_referrers(db: &Database, block: BlockId, appending: &BTreeSet<BlockId>) -> bool {
    let mut visited = BTreeSet::from([block]);
    let mut stack = vec![block];
    while let Some(current) = stack.pop() {
        for (referrer, _) in db.referrers(current) {
            if !visited.insert(referrer) {
                continue;
            }
            match db.get(referrer) {
                Some(r) if !r.kind.is_linkable() => stack.push(referrer),
                Some(_) if !appending.contains(&referrer) => return true,
                _ => {}
            }
        }
    }
    false
}

// =============================================================================
// TESTS
// =============================================================================
