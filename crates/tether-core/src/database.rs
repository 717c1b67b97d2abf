//! # Session Database
//!
//! The in-memory store of data-blocks and library records the engine
//! imports into.
//!
//! All data structures use `BTreeMap` for deterministic ordering.
//! Names are unique per `(scope, kind)`; use counts are maintained by every
//! reference mutation so `users` always equals the number of incoming
//! references plus one for a fake user.

use crate::primitives::{
    MASTER_COLLECTION, MAX_NAME_LENGTH, MAX_NAME_SUFFIX, STALE_SUFFIX_MARKER,
};
use crate::{
    BlockId, BlockKind, BlockTags, DataBlock, EdgeKind, EmbeddedRecord, LibraryId, OverrideMeta,
    RefLocation, Reference, Scope, TetherError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

// =============================================================================
// LIBRARY RECORDS
// =============================================================================

/// A source library known to the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub id: LibraryId,
    pub path: String,
    /// The library whose data first pulled this one in, for indirect libraries.
    pub parent: Option<LibraryId>,
    pub packed: bool,
}

type NameKey = (Scope, BlockKind, String);

// =============================================================================
// DATABASE
// =============================================================================

/// The session database.
#[derive(Debug, Clone, Default)]
pub struct Database {
    blocks: BTreeMap<BlockId, DataBlock>,
    names: BTreeMap<NameKey, BlockId>,
    /// Blocks temporarily removed from the name index (library reload).
    detached: BTreeSet<BlockId>,
    libraries: BTreeMap<LibraryId, LibraryRecord>,
    library_paths: BTreeMap<String, LibraryId>,
    next_block_id: u64,
    next_library_id: u64,
    active_scene: Option<BlockId>,
}

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<&DataBlock> {
        self.blocks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut DataBlock> {
        self.blocks.get_mut(&id)
    }

    /// Like [`Database::get`], failing with `BlockNotFound`.
    pub fn require(&self, id: BlockId) -> Result<&DataBlock, TetherError> {
        self.blocks.get(&id).ok_or(TetherError::BlockNotFound(id))
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Find a block by name within a scope.
    #[must_use]
    pub fn find_by_name(&self, scope: Scope, kind: BlockKind, name: &str) -> Option<BlockId> {
        self.names
            .get(&(scope, kind, name.to_string()))
            .copied()
    }

    /// Find a local block by name.
    #[must_use]
    pub fn find_local(&self, kind: BlockKind, name: &str) -> Option<BlockId> {
        self.find_by_name(Scope::Local, kind, name)
    }

    /// All blocks, in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &DataBlock> {
        self.blocks.values()
    }

    /// All blocks of one kind, in id order.
    pub fn blocks_of_kind(&self, kind: BlockKind) -> impl Iterator<Item = &DataBlock> {
        self.blocks.values().filter(move |b| b.kind == kind)
    }

    /// Ids of all blocks in `scope`, in id order.
    #[must_use]
    pub fn blocks_in_scope(&self, scope: Scope) -> Vec<BlockId> {
        self.blocks
            .values()
            .filter(|b| b.scope == scope)
            .map(|b| b.id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every block referencing `target`, with the edge kind, in id order.
    #[must_use]
    pub fn referrers(&self, target: BlockId) -> Vec<(BlockId, EdgeKind)> {
        let mut out = Vec::new();
        for block in self.blocks.values() {
            for (to, edge) in block.targets() {
                if to == target {
                    out.push((block.id, edge));
                }
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Creation & naming
    // -------------------------------------------------------------------------

    /// Create a block with exactly `name`; fails with `NameCollision` if taken.
    pub fn create_block(
        &mut self,
        kind: BlockKind,
        name: &str,
        scope: Scope,
    ) -> Result<BlockId, TetherError> {
        validate_name(name)?;
        if let Some(lib) = scope.library() {
            if !self.libraries.contains_key(&lib) {
                return Err(TetherError::LibraryNotFound(lib));
            }
        }
        let key = (scope, kind, name.to_string());
        if self.names.contains_key(&key) {
            return Err(TetherError::NameCollision {
                kind,
                name: name.to_string(),
            });
        }

        let id = BlockId(self.next_block_id);
        self.next_block_id = self.next_block_id.saturating_add(1);
        self.blocks
            .insert(id, DataBlock::new(id, kind, name.to_string(), scope));
        self.names.insert(key, id);
        trace!(%id, %kind, name, "created block");
        Ok(id)
    }

    /// Create a block, renaming it (`Name.001`, ...) if `name` is taken.
    pub fn create_block_unique(
        &mut self,
        kind: BlockKind,
        name: &str,
        scope: Scope,
    ) -> Result<BlockId, TetherError> {
        let name = self.unique_name(scope, kind, name)?;
        self.create_block(kind, &name, scope)
    }

    /// Create a local scene with an empty master collection and make it
    /// active if no scene is active yet.
    pub fn create_scene(&mut self, name: &str) -> Result<BlockId, TetherError> {
        let id = self.create_block_unique(BlockKind::Scene, name, Scope::Local)?;
        if let Some(block) = self.blocks.get_mut(&id) {
            block.embedded.push(EmbeddedRecord {
                name: MASTER_COLLECTION.to_string(),
                references: Vec::new(),
            });
        }
        if self.active_scene.is_none() {
            self.active_scene = Some(id);
        }
        Ok(id)
    }

    /// First free name for `base` in `(scope, kind)`.
    pub fn unique_name(
        &self,
        scope: Scope,
        kind: BlockKind,
        base: &str,
    ) -> Result<String, TetherError> {
        validate_name(base)?;
        if !self.name_taken(scope, kind, base) {
            return Ok(base.to_string());
        }
        let stem = strip_numeric_suffix(base);
        for n in 1..=MAX_NAME_SUFFIX {
            let suffix = format!(".{n:03}");
            let candidate = format!(
                "{}{}",
                truncate_name(stem, MAX_NAME_LENGTH.saturating_sub(suffix.len())),
                suffix
            );
            if !self.name_taken(scope, kind, &candidate) {
                return Ok(candidate);
            }
        }
        Err(TetherError::NameCollision {
            kind,
            name: base.to_string(),
        })
    }

    fn name_taken(&self, scope: Scope, kind: BlockKind, name: &str) -> bool {
        self.names.contains_key(&(scope, kind, name.to_string()))
    }

    /// Rename a block in place.
    pub fn rename(&mut self, id: BlockId, new_name: &str) -> Result<(), TetherError> {
        validate_name(new_name)?;
        let (scope, kind, old_name) = {
            let block = self.require(id)?;
            (block.scope, block.kind, block.name.clone())
        };
        if old_name == new_name {
            return Ok(());
        }
        if self.name_taken(scope, kind, new_name) {
            return Err(TetherError::NameCollision {
                kind,
                name: new_name.to_string(),
            });
        }
        self.unindex(id);
        if let Some(block) = self.blocks.get_mut(&id) {
            block.name = new_name.to_string();
        }
        self.names.insert((scope, kind, new_name.to_string()), id);
        Ok(())
    }

    fn unindex(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get(&id) {
            let key = (block.scope, block.kind, block.name.clone());
            if self.names.get(&key) == Some(&id) {
                self.names.remove(&key);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tags & properties
    // -------------------------------------------------------------------------

    /// Set or clear `tag` on every block matching `predicate`.
    ///
    /// Returns the number of blocks whose tags changed.
    pub fn tag_all(
        &mut self,
        predicate: impl Fn(&DataBlock) -> bool,
        tag: BlockTags,
        value: bool,
    ) -> usize {
        let mut changed = 0;
        for block in self.blocks.values_mut() {
            if predicate(block) && block.tags.contains(tag) != value {
                block.tags.set(tag, value);
                changed += 1;
            }
        }
        changed
    }

    pub fn set_tag(&mut self, id: BlockId, tag: BlockTags, value: bool) -> Result<(), TetherError> {
        let block = self.blocks.get_mut(&id).ok_or(TetherError::BlockNotFound(id))?;
        block.tags.set(tag, value);
        Ok(())
    }

    /// Set a free-form property. Editing local data marks it modified.
    pub fn set_property(
        &mut self,
        id: BlockId,
        key: &str,
        value: &str,
    ) -> Result<(), TetherError> {
        let block = self.blocks.get_mut(&id).ok_or(TetherError::BlockNotFound(id))?;
        block.properties.insert(key.to_string(), value.to_string());
        if block.scope.is_local() {
            block.tags.insert(BlockTags::MODIFIED);
        }
        Ok(())
    }

    pub fn mark_modified(&mut self, id: BlockId) -> Result<(), TetherError> {
        self.set_tag(id, BlockTags::MODIFIED, true)
    }

    pub fn set_fake_user(&mut self, id: BlockId, value: bool) -> Result<(), TetherError> {
        let block = self.blocks.get_mut(&id).ok_or(TetherError::BlockNotFound(id))?;
        if block.fake_user == value {
            return Ok(());
        }
        block.fake_user = value;
        if value {
            block.users = block.users.saturating_add(1);
        } else {
            block.users = block.users.saturating_sub(1);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // References
    // -------------------------------------------------------------------------

    pub(crate) fn incref(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.users = block.users.saturating_add(1);
        }
    }

    pub(crate) fn decref(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.users = block.users.saturating_sub(1);
        }
    }

    /// Append a reference in `slot` from `owner` to `target`.
    pub fn add_reference(
        &mut self,
        owner: BlockId,
        slot: &str,
        target: BlockId,
    ) -> Result<(), TetherError> {
        self.require(target)?;
        let block = self
            .blocks
            .get_mut(&owner)
            .ok_or(TetherError::BlockNotFound(owner))?;
        block.references.push(Reference::new(slot, Some(target)));
        self.incref(target);
        Ok(())
    }

    /// Point the first reference in `slot` at `target`, creating the slot if needed.
    pub fn set_reference(
        &mut self,
        owner: BlockId,
        slot: &str,
        target: Option<BlockId>,
    ) -> Result<(), TetherError> {
        if let Some(target) = target {
            self.require(target)?;
        }
        let block = self
            .blocks
            .get_mut(&owner)
            .ok_or(TetherError::BlockNotFound(owner))?;
        let previous = match block.references.iter_mut().find(|r| r.slot == slot) {
            Some(reference) => std::mem::replace(&mut reference.target, target),
            None => {
                block.references.push(Reference::new(slot, target));
                None
            }
        };
        if let Some(previous) = previous {
            self.decref(previous);
        }
        if let Some(target) = target {
            self.incref(target);
        }
        Ok(())
    }

    /// Point the reference field at `location` at `target`.
    pub(crate) fn set_reference_at(
        &mut self,
        owner: BlockId,
        location: RefLocation,
        target: Option<BlockId>,
    ) -> Result<(), TetherError> {
        if let Some(target) = target {
            self.require(target)?;
        }
        let block = self
            .blocks
            .get_mut(&owner)
            .ok_or(TetherError::BlockNotFound(owner))?;
        let field = block.reference_at_mut(location).ok_or_else(|| {
            TetherError::InvalidItem(format!("no reference at {location:?} in {owner}"))
        })?;
        let previous = std::mem::replace(field, target);
        if let Some(previous) = previous {
            self.decref(previous);
        }
        if let Some(target) = target {
            self.incref(target);
        }
        Ok(())
    }

    /// Append a reference inside the embedded record `record` of `owner`.
    pub fn add_embedded_reference(
        &mut self,
        owner: BlockId,
        record: &str,
        slot: &str,
        target: BlockId,
    ) -> Result<(), TetherError> {
        self.require(target)?;
        let block = self
            .blocks
            .get_mut(&owner)
            .ok_or(TetherError::BlockNotFound(owner))?;
        let index = match block.embedded.iter().position(|e| e.name == record) {
            Some(index) => index,
            None => {
                block.embedded.push(EmbeddedRecord {
                    name: record.to_string(),
                    references: Vec::new(),
                });
                block.embedded.len() - 1
            }
        };
        if let Some(embedded) = block.embedded.get_mut(index) {
            embedded.references.push(Reference::new(slot, Some(target)));
        }
        self.incref(target);
        Ok(())
    }

    /// Turn `owner` into an override of `reference`.
    pub fn set_override(
        &mut self,
        owner: BlockId,
        reference: BlockId,
        runtime: bool,
    ) -> Result<(), TetherError> {
        self.require(reference)?;
        let block = self
            .blocks
            .get_mut(&owner)
            .ok_or(TetherError::BlockNotFound(owner))?;
        let previous = block
            .override_meta
            .replace(OverrideMeta {
                reference: Some(reference),
                runtime,
            })
            .and_then(|meta| meta.reference);
        block.tags.set(BlockTags::RUNTIME, runtime);
        if let Some(previous) = previous {
            self.decref(previous);
        }
        self.incref(reference);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Destruction
    // -------------------------------------------------------------------------

    /// Destroy `id` if nothing uses it. Returns whether it was destroyed.
    pub fn destroy_if_unused(&mut self, id: BlockId) -> Result<bool, TetherError> {
        let block = self.require(id)?;
        if block.users > 0 {
            return Ok(false);
        }
        let targets = block.targets();
        self.unindex(id);
        self.detached.remove(&id);
        self.blocks.remove(&id);
        for (target, _) in targets {
            self.decref(target);
        }
        if self.active_scene == Some(id) {
            self.active_scene = None;
        }
        trace!(%id, "destroyed unused block");
        Ok(true)
    }

    /// Destroy unused blocks starting at `seeds`, cascading into the targets of
    /// destroyed blocks that satisfy `allow`.
    pub fn purge_unused(
        &mut self,
        seeds: impl IntoIterator<Item = BlockId>,
        allow: impl Fn(&DataBlock) -> bool,
    ) -> Vec<BlockId> {
        let mut pending: BTreeSet<BlockId> = seeds.into_iter().collect();
        let mut destroyed = Vec::new();
        while let Some(id) = pending.pop_first() {
            let Some(block) = self.blocks.get(&id) else {
                continue;
            };
            if block.users > 0 || !allow(block) {
                continue;
            }
            let targets = block.targets();
            if matches!(self.destroy_if_unused(id), Ok(true)) {
                destroyed.push(id);
                pending.extend(targets.into_iter().map(|(t, _)| t));
            }
        }
        destroyed
    }

    // -------------------------------------------------------------------------
    // Local promotion
    // -------------------------------------------------------------------------

    /// Non-linkable blocks owned by `id`, nested ones included.
    pub fn owned_blocks(&self, id: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::from([id]);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(block) = self.blocks.get(&current) else {
                continue;
            };
            for (_, target) in block.content_locations() {
                if !visited.insert(target) {
                    continue;
                }
                if self.blocks.get(&target).is_some_and(|t| !t.kind.is_linkable()) {
                    out.push(target);
                    stack.push(target);
                }
            }
        }
        out
    }

    /// Promote a linked block into the local scope, renaming it on collision.
    /// Owned non-linkable blocks are promoted with it.
    pub fn make_local(&mut self, id: BlockId, clear_override: bool) -> Result<(), TetherError> {
        self.promote_in_place(id, clear_override)?;
        for owned in self.owned_blocks(id) {
            self.promote_in_place(owned, clear_override)?;
        }
        Ok(())
    }

    fn promote_in_place(&mut self, id: BlockId, clear_override: bool) -> Result<(), TetherError> {
        let (kind, name, scope) = {
            let block = self.require(id)?;
            (block.kind, block.name.clone(), block.scope)
        };
        if scope.is_local() {
            return Ok(());
        }
        let local_name = self.unique_name(Scope::Local, kind, &name)?;
        if local_name != name {
            debug!(%id, %kind, from = %name, to = %local_name, "renamed on make-local");
        }
        self.unindex(id);
        let mut dropped_reference = None;
        if let Some(block) = self.blocks.get_mut(&id) {
            block.scope = Scope::Local;
            block.name = local_name.clone();
            block
                .tags
                .remove(BlockTags::EXTERN | BlockTags::INDIRECT | BlockTags::MISSING);
            if clear_override {
                dropped_reference = block.override_meta.take().and_then(|m| m.reference);
            }
        }
        if let Some(reference) = dropped_reference {
            self.decref(reference);
        }
        self.names.insert((Scope::Local, kind, local_name), id);
        Ok(())
    }

    /// Create a local copy of `id`. The source is left untouched.
    ///
    /// Owned non-linkable blocks are duplicated too and the copy points at
    /// the duplicates.
    pub fn duplicate_local(
        &mut self,
        id: BlockId,
        clear_override: bool,
    ) -> Result<BlockId, TetherError> {
        let new_id = self.duplicate_one(id, clear_override)?;
        let owned: Vec<(RefLocation, BlockId)> = self
            .require(new_id)?
            .content_locations()
            .into_iter()
            .filter(|(_, target)| self.blocks.get(target).is_some_and(|t| !t.kind.is_linkable()))
            .collect();
        for (location, target) in owned {
            let copy = self.duplicate_local(target, clear_override)?;
            self.set_reference_at(new_id, location, Some(copy))?;
        }
        Ok(new_id)
    }

    fn duplicate_one(&mut self, id: BlockId, clear_override: bool) -> Result<BlockId, TetherError> {
        let source = self.require(id)?.clone();
        let new_id = self.create_block_unique(source.kind, &source.name, Scope::Local)?;
        let mut copy = source;
        copy.id = new_id;
        copy.scope = Scope::Local;
        copy.users = 0;
        copy.fake_user = false;
        copy.tags = BlockTags::empty();
        copy.provenance = None;
        if clear_override {
            copy.override_meta = None;
        }
        if let Some(slot) = self.blocks.get_mut(&new_id) {
            copy.name = slot.name.clone();
            *slot = copy;
        }
        let targets = self
            .blocks
            .get(&new_id)
            .map(DataBlock::targets)
            .unwrap_or_default();
        for (target, _) in targets {
            self.incref(target);
        }
        Ok(new_id)
    }

    /// Create a local liboverride of the linked block `reference`.
    pub fn create_override(
        &mut self,
        reference: BlockId,
        runtime: bool,
    ) -> Result<BlockId, TetherError> {
        if !self.require(reference)?.is_linked() {
            return Err(TetherError::InvalidOperation(format!(
                "cannot override local block {reference}"
            )));
        }
        let id = self.duplicate_local(reference, true)?;
        self.set_override(id, reference, runtime)?;
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Detached names (library reload)
    // -------------------------------------------------------------------------

    /// Hide a block from name lookups while keeping it alive.
    pub(crate) fn detach_name(&mut self, id: BlockId) {
        if self.blocks.contains_key(&id) {
            self.unindex(id);
            self.detached.insert(id);
        }
    }

    /// Re-index a detached block under its own name, falling back to a stale
    /// name when another block took it meanwhile.
    pub(crate) fn reattach(&mut self, id: BlockId) -> Result<String, TetherError> {
        let (scope, kind, name) = {
            let block = self.require(id)?;
            (block.scope, block.kind, block.name.clone())
        };
        if self.name_taken(scope, kind, &name) {
            return self.reattach_as_stale(id);
        }
        self.names.insert((scope, kind, name.clone()), id);
        self.detached.remove(&id);
        Ok(name)
    }

    pub(crate) fn is_detached(&self, id: BlockId) -> bool {
        self.detached.contains(&id)
    }

    /// Re-index a detached block under the first free `Name~NNN` name.
    pub(crate) fn reattach_as_stale(&mut self, id: BlockId) -> Result<String, TetherError> {
        let (scope, kind, name) = {
            let block = self.require(id)?;
            (block.scope, block.kind, block.name.clone())
        };
        for n in 0..=MAX_NAME_SUFFIX {
            let suffix = format!("{STALE_SUFFIX_MARKER}{n:03}");
            let candidate = format!(
                "{}{}",
                truncate_name(&name, MAX_NAME_LENGTH.saturating_sub(suffix.len())),
                suffix
            );
            if !self.name_taken(scope, kind, &candidate) {
                if let Some(block) = self.blocks.get_mut(&id) {
                    block.name = candidate.clone();
                }
                self.names.insert((scope, kind, candidate.clone()), id);
                self.detached.remove(&id);
                return Ok(candidate);
            }
        }
        Err(TetherError::NameCollision { kind, name })
    }

    // -------------------------------------------------------------------------
    // Libraries
    // -------------------------------------------------------------------------

    /// Find or create the library record for `path`.
    pub fn ensure_library(&mut self, path: &str) -> LibraryId {
        if let Some(id) = self.library_paths.get(path) {
            return *id;
        }
        let id = LibraryId(self.next_library_id);
        self.next_library_id = self.next_library_id.saturating_add(1);
        self.libraries.insert(
            id,
            LibraryRecord {
                id,
                path: path.to_string(),
                parent: None,
                packed: false,
            },
        );
        self.library_paths.insert(path.to_string(), id);
        debug!(%id, path, "registered library");
        id
    }

    #[must_use]
    pub fn library(&self, id: LibraryId) -> Option<&LibraryRecord> {
        self.libraries.get(&id)
    }

    #[must_use]
    pub fn library_by_path(&self, path: &str) -> Option<LibraryId> {
        self.library_paths.get(path).copied()
    }

    pub fn libraries(&self) -> impl Iterator<Item = &LibraryRecord> {
        self.libraries.values()
    }

    /// Path of the library owning `id`, if it is linked.
    #[must_use]
    pub fn library_path_of(&self, id: BlockId) -> Option<&str> {
        let lib = self.blocks.get(&id)?.scope.library()?;
        self.libraries.get(&lib).map(|r| r.path.as_str())
    }

    pub fn set_library_parent(
        &mut self,
        library: LibraryId,
        parent: Option<LibraryId>,
    ) -> Result<(), TetherError> {
        let record = self
            .libraries
            .get_mut(&library)
            .ok_or(TetherError::LibraryNotFound(library))?;
        record.parent = parent;
        Ok(())
    }

    pub fn set_library_packed(
        &mut self,
        library: LibraryId,
        packed: bool,
    ) -> Result<(), TetherError> {
        let record = self
            .libraries
            .get_mut(&library)
            .ok_or(TetherError::LibraryNotFound(library))?;
        record.packed = packed;
        Ok(())
    }

    /// Drop library records no block belongs to anymore.
    pub fn remove_unused_libraries(&mut self) -> Vec<LibraryId> {
        let used: BTreeSet<LibraryId> = self
            .blocks
            .values()
            .filter_map(|b| b.scope.library())
            .collect();
        let unused: Vec<LibraryId> = self
            .libraries
            .keys()
            .filter(|id| !used.contains(id))
            .copied()
            .collect();
        for id in &unused {
            if let Some(record) = self.libraries.remove(id) {
                self.library_paths.remove(&record.path);
                debug!(%id, path = %record.path, "removed unused library");
            }
        }
        for record in self.libraries.values_mut() {
            if record.parent.is_some_and(|p| unused.contains(&p)) {
                record.parent = None;
            }
        }
        unused
    }

    // -------------------------------------------------------------------------
    // Scene
    // -------------------------------------------------------------------------

    pub fn set_active_scene(&mut self, scene: BlockId) -> Result<(), TetherError> {
        if self.require(scene)?.kind != BlockKind::Scene {
            return Err(TetherError::InvalidOperation(format!(
                "{scene} is not a scene"
            )));
        }
        self.active_scene = Some(scene);
        Ok(())
    }

    #[must_use]
    pub fn active_scene(&self) -> Option<BlockId> {
        self.active_scene
    }

    // -------------------------------------------------------------------------
    // Integrity
    // -------------------------------------------------------------------------

    /// Use counts as implied by the current references.
    #[must_use]
    pub fn computed_users(&self) -> BTreeMap<BlockId, u32> {
        let mut counts: BTreeMap<BlockId, u32> = self
            .blocks
            .values()
            .map(|b| (b.id, u32::from(b.fake_user)))
            .collect();
        for block in self.blocks.values() {
            for (target, _) in block.targets() {
                if let Some(count) = counts.get_mut(&target) {
                    *count = count.saturating_add(1);
                }
            }
        }
        counts
    }

    /// Reset every use count from the current references.
    pub fn recompute_users(&mut self) {
        let counts = self.computed_users();
        for (id, count) in counts {
            if let Some(block) = self.blocks.get_mut(&id) {
                block.users = count;
            }
        }
    }

    /// Fail if any reference points at a block that does not exist.
    pub fn check_references(&self) -> Result<(), TetherError> {
        for block in self.blocks.values() {
            for (target, _) in block.targets() {
                if !self.blocks.contains_key(&target) {
                    return Err(TetherError::DanglingReferenceAfterRemap {
                        owner: block.id,
                        target,
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// NAME HELPERS
// =============================================================================

fn validate_name(name: &str) -> Result<(), TetherError> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || name.contains('\0') {
        return Err(TetherError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `"Cube.004"` -> `"Cube"`.
fn strip_numeric_suffix(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, digits))
            if !stem.is_empty()
                && !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit()) =>
        {
            stem
        }
        _ => name,
    }
}

fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    name.get(..end).unwrap_or(name)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_scope_and_kind() {
        let mut db = Database::new();
        let lib = db.ensure_library("assets/props.tether");
        db.create_block(BlockKind::Mesh, "Cube", Scope::Local)
            .expect("local");
        db.create_block(BlockKind::Mesh, "Cube", Scope::Library(lib))
            .expect("same name in library scope");
        db.create_block(BlockKind::Object, "Cube", Scope::Local)
            .expect("same name, other kind");

        let err = db.create_block(BlockKind::Mesh, "Cube", Scope::Local);
        assert!(matches!(err, Err(TetherError::NameCollision { .. })));
    }

    #[test]
    fn unique_name_appends_numeric_suffix() {
        let mut db = Database::new();
        db.create_block(BlockKind::Mesh, "Cube", Scope::Local)
            .expect("create");
        db.create_block(BlockKind::Mesh, "Cube.001", Scope::Local)
            .expect("create");

        let name = db
            .unique_name(Scope::Local, BlockKind::Mesh, "Cube")
            .expect("unique");
        assert_eq!(name, "Cube.002");

        let name = db
            .unique_name(Scope::Local, BlockKind::Mesh, "Cube.001")
            .expect("unique");
        assert_eq!(name, "Cube.002");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut db = Database::new();
        assert!(matches!(
            db.create_block(BlockKind::Mesh, "", Scope::Local),
            Err(TetherError::InvalidName(_))
        ));
        let long = "x".repeat(MAX_NAME_LENGTH + 1);
        assert!(matches!(
            db.create_block(BlockKind::Mesh, &long, Scope::Local),
            Err(TetherError::InvalidName(_))
        ));
    }

    #[test]
    fn user_counts_follow_references() {
        let mut db = Database::new();
        let ob = db
            .create_block(BlockKind::Object, "Ob", Scope::Local)
            .expect("create");
        let me = db
            .create_block(BlockKind::Mesh, "Me", Scope::Local)
            .expect("create");
        let me2 = db
            .create_block(BlockKind::Mesh, "Me2", Scope::Local)
            .expect("create");

        db.set_reference(ob, "data", Some(me)).expect("set");
        assert_eq!(db.get(me).map(|b| b.users), Some(1));

        db.set_reference(ob, "data", Some(me2)).expect("swap");
        assert_eq!(db.get(me).map(|b| b.users), Some(0));
        assert_eq!(db.get(me2).map(|b| b.users), Some(1));

        db.set_fake_user(me, true).expect("fake user");
        assert_eq!(db.get(me).map(|b| b.users), Some(1));
        let stored: BTreeMap<BlockId, u32> = db.blocks().map(|b| (b.id, b.users)).collect();
        assert_eq!(db.computed_users(), stored);
    }

    #[test]
    fn destroy_if_unused_releases_targets() {
        let mut db = Database::new();
        let ob = db
            .create_block(BlockKind::Object, "Ob", Scope::Local)
            .expect("create");
        let me = db
            .create_block(BlockKind::Mesh, "Me", Scope::Local)
            .expect("create");
        db.add_reference(ob, "data", me).expect("ref");

        assert!(!db.destroy_if_unused(me).expect("in use"));
        assert!(db.destroy_if_unused(ob).expect("unused"));
        assert_eq!(db.get(me).map(|b| b.users), Some(0));
        assert!(db.find_local(BlockKind::Object, "Ob").is_none());
    }

    #[test]
    fn purge_cascades_through_allowed_targets() {
        let mut db = Database::new();
        let ob = db
            .create_block(BlockKind::Object, "Ob", Scope::Local)
            .expect("create");
        let me = db
            .create_block(BlockKind::Mesh, "Me", Scope::Local)
            .expect("create");
        let ma = db
            .create_block(BlockKind::Material, "Ma", Scope::Local)
            .expect("create");
        db.add_reference(ob, "data", me).expect("ref");
        db.add_reference(me, "material", ma).expect("ref");

        let destroyed = db.purge_unused([ob], |b| b.kind != BlockKind::Material);
        assert_eq!(destroyed, vec![ob, me]);
        assert!(db.contains(ma));
    }

    #[test]
    fn make_local_renames_on_collision() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        db.create_block(BlockKind::Material, "Steel", Scope::Local)
            .expect("local");
        let linked = db
            .create_block(BlockKind::Material, "Steel", Scope::Library(lib))
            .expect("linked");
        db.set_tag(linked, BlockTags::EXTERN, true).expect("tag");

        db.make_local(linked, true).expect("make local");
        let block = db.get(linked).expect("exists");
        assert_eq!(block.scope, Scope::Local);
        assert_eq!(block.name, "Steel.001");
        assert!(!block.tags.contains(BlockTags::EXTERN));
        assert_eq!(db.find_local(BlockKind::Material, "Steel.001"), Some(linked));
    }

    #[test]
    fn duplicate_local_copies_references() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        let me = db
            .create_block(BlockKind::Mesh, "Me", Scope::Library(lib))
            .expect("create");
        let ma = db
            .create_block(BlockKind::Material, "Ma", Scope::Library(lib))
            .expect("create");
        db.add_reference(me, "material", ma).expect("ref");

        let copy = db.duplicate_local(me, true).expect("copy");
        assert_ne!(copy, me);
        let block = db.get(copy).expect("copy exists");
        assert!(block.scope.is_local());
        assert_eq!(block.references.len(), 1);
        assert_eq!(db.get(ma).map(|b| b.users), Some(2));
    }

    #[test]
    fn create_override_points_at_reference() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        let ob = db
            .create_block(BlockKind::Object, "Rig", Scope::Library(lib))
            .expect("create");

        let ov = db.create_override(ob, false).expect("override");
        let block = db.get(ov).expect("exists");
        assert!(block.is_override());
        assert_eq!(db.referrers(ob), vec![(ov, EdgeKind::OverrideReference)]);
    }

    #[test]
    fn stale_blocks_get_tilde_suffix() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        let old = db
            .create_block(BlockKind::Mesh, "Me", Scope::Library(lib))
            .expect("create");
        db.detach_name(old);
        db.create_block(BlockKind::Mesh, "Me", Scope::Library(lib))
            .expect("new block with same name");

        let name = db.reattach_as_stale(old).expect("reattach");
        assert_eq!(name, "Me~000");
    }

    #[test]
    fn unused_libraries_are_removed() {
        let mut db = Database::new();
        let used = db.ensure_library("used.tether");
        let unused = db.ensure_library("unused.tether");
        db.create_block(BlockKind::Mesh, "Me", Scope::Library(used))
            .expect("create");

        assert_eq!(db.remove_unused_libraries(), vec![unused]);
        assert!(db.library_by_path("unused.tether").is_none());
        assert!(db.library(used).is_some());
    }

    #[test]
    fn check_references_detects_dangling_targets() {
        let mut db = Database::new();
        let ob = db
            .create_block(BlockKind::Object, "Ob", Scope::Local)
            .expect("create");
        if let Some(block) = db.get_mut(ob) {
            block.references.push(Reference::new("data", Some(BlockId(999))));
        }
        assert!(matches!(
            db.check_references(),
            Err(TetherError::DanglingReferenceAfterRemap { .. })
        ));
    }
}
