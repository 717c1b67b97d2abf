//! # Instantiating Stage
//!
//! Gives placeable content a place in the working scene.
//!
//! - Collections requested directly (and, when appending, loose indirect
//!   collections holding unplaced objects) become children of the active
//!   collection, or are instanced through a new empty object with
//!   `COLLECTION_INSTANCE`.
//! - Objects that belong to no collection are added to the active collection.
//! - With `OBDATA_INSTANCE`, object-data no object uses gets a new object.
//!
//! Content already reachable from the scene is left alone, so running the
//! stage again places nothing new.

use super::{AppendAction, ImportContext, ImportItem, ProcessStage};
use crate::primitives::{
    APPENDED_COLLECTION_NAME, LINKED_COLLECTION_NAME, MASTER_COLLECTION, SLOT_CHILD, SLOT_DATA,
    SLOT_INSTANCE_COLLECTION, SLOT_OBJECT,
};
use crate::report::DiagnosticKind;
use crate::{BlockId, BlockKind, Database, LinkFlags, Reports, Scope, TetherError};
use std::collections::BTreeSet;
use tracing::debug;

impl ImportContext<'_> {
    /// Run the Instantiating stage. Returns the number of placements made.
    ///
    /// May be called again while the context is still Instantiating.
    pub fn instantiate(
        &mut self,
        db: &mut Database,
        reports: &mut Reports,
    ) -> Result<usize, TetherError> {
        if self.stage != ProcessStage::Instantiating {
            self.stage.advance(ProcessStage::Instantiating)?;
            if self.params.is_link() {
                self.finalize_link_mode(db)?;
            }
        }

        let target = self.params.instantiate;
        let Some(scene) = target
            .map(|t| t.scene)
            .or_else(|| db.active_scene())
        else {
            debug!("no scene to instantiate into");
            return Ok(0);
        };
        if db.get(scene).is_none_or(|b| b.kind != BlockKind::Scene) {
            reports.warning(
                DiagnosticKind::Internal,
                format!("Cannot instantiate into {scene}: not a scene"),
            );
            return Ok(0);
        }
        let active = target.and_then(|t| t.active_collection);

        let mut placed = self.instantiate_collections(db, scene, active)?;
        placed += self.instantiate_objects(db, scene, active)?;
        if self.params.flags.contains(LinkFlags::OBDATA_INSTANCE) {
            placed += self.instantiate_object_data(db, scene, active)?;
        }
        debug!(placed, %scene, "instantiating done");
        Ok(placed)
    }

    /// Register every linked dependency missing from the item set as a
    /// kept-linked indirect item.
    fn finalize_link_mode(&mut self, db: &Database) -> Result<(), TetherError> {
        self.discover_dependencies(db)?;
        let ids: Vec<_> = self.items().map(|(id, _)| id).collect();
        for id in ids {
            let item = self.item_mut(id)?;
            if item.resolved.is_some() && item.action == AppendAction::Unset {
                item.action = AppendAction::KeepLinked;
            }
        }
        Ok(())
    }

    fn instantiate_collections(
        &mut self,
        db: &mut Database,
        scene: BlockId,
        active: Option<BlockId>,
    ) -> Result<usize, TetherError> {
        let view: &Database = db;
        let in_scene = scene_collections(view, scene);
        let scene_objects = scene_objects(view, scene, &in_scene);
        let appending = !self.params.is_link();

        let mut eligible: BTreeSet<BlockId> = BTreeSet::new();
        for (_, item) in self.items() {
            let Some(coll) = self.placeable(view, item, BlockKind::Collection) else {
                continue;
            };
            if in_scene.contains(&coll) || is_instanced(view, coll) {
                continue;
            }
            let wanted = !item.is_indirect()
                || (appending
                    && parents(view, coll).is_empty()
                    && view.get(coll).is_some_and(|c| {
                        c.targets_in_slot(SLOT_OBJECT)
                            .any(|o| !scene_objects.contains(&o))
                    }));
            if wanted {
                eligible.insert(coll);
            }
        }

        let roots: Vec<BlockId> = eligible
            .iter()
            .copied()
            .filter(|coll| !has_ancestor_in(view, *coll, &eligible))
            .collect();

        let mut placed = 0;
        for coll in roots {
            let destination = self.placement_collection(db, scene, active)?;
            if self.params.flags.contains(LinkFlags::COLLECTION_INSTANCE) {
                let name = db.require(coll)?.name.clone();
                let empty = db.create_block_unique(BlockKind::Object, &name, Scope::Local)?;
                db.add_reference(empty, SLOT_INSTANCE_COLLECTION, coll)?;
                db.add_reference(destination, SLOT_OBJECT, empty)?;
                debug!(%coll, %empty, "instanced collection");
            } else {
                db.add_reference(destination, SLOT_CHILD, coll)?;
                debug!(%coll, %destination, "placed collection");
            }
            placed += 1;
        }
        Ok(placed)
    }

    fn instantiate_objects(
        &mut self,
        db: &mut Database,
        scene: BlockId,
        active: Option<BlockId>,
    ) -> Result<usize, TetherError> {
        let link_mode = self.params.is_link();
        let view: &Database = db;
        let loose: Vec<BlockId> = self
            .items()
            .filter(|(_, item)| !(link_mode && item.is_indirect()))
            .filter_map(|(_, item)| self.placeable(view, item, BlockKind::Object))
            .filter(|obj| !in_any_collection(view, *obj))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for obj in &loose {
            let destination = self.placement_collection(db, scene, active)?;
            db.add_reference(destination, SLOT_OBJECT, *obj)?;
            debug!(object = %obj, %destination, "placed object");
        }
        Ok(loose.len())
    }

    fn instantiate_object_data(
        &mut self,
        db: &mut Database,
        scene: BlockId,
        active: Option<BlockId>,
    ) -> Result<usize, TetherError> {
        let link_mode = self.params.is_link();
        let view: &Database = db;
        let unused: BTreeSet<BlockId> = self
            .items()
            .filter(|(_, item)| item.kind.is_object_data() && !(link_mode && item.is_indirect()))
            .filter_map(|(_, item)| self.placeable(view, item, item.kind))
            .filter(|data| !used_by_object(view, *data))
            .collect();

        for data in &unused {
            let name = db.require(*data)?.name.clone();
            let destination = self.placement_collection(db, scene, active)?;
            let obj = db.create_block_unique(BlockKind::Object, &name, Scope::Local)?;
            db.add_reference(obj, SLOT_DATA, *data)?;
            db.add_reference(destination, SLOT_OBJECT, obj)?;
            debug!(%data, object = %obj, "instanced object-data");
        }
        Ok(unused.len())
    }

    /// The item's block, when it is a live block of `kind` owned by the item.
    fn placeable(&self, db: &Database, item: &ImportItem, kind: BlockKind) -> Option<BlockId> {
        if item.kind != kind || (item.action == AppendAction::Unset && !self.params.is_link()) {
            return None;
        }
        let block = item.resolved?;
        db.get(block).filter(|b| b.kind == kind).map(|b| b.id)
    }

    /// The collection receiving placements, created on first use.
    fn placement_collection(
        &mut self,
        db: &mut Database,
        scene: BlockId,
        active: Option<BlockId>,
    ) -> Result<BlockId, TetherError> {
        if let Some(existing) = self.placement_collection.filter(|c| db.contains(*c)) {
            return Ok(existing);
        }
        let collection = match active {
            Some(active) => {
                if db.require(active)?.kind != BlockKind::Collection {
                    return Err(TetherError::InvalidOperation(format!(
                        "{active} is not a collection"
                    )));
                }
                active
            }
            None => {
                let name = if self.params.is_link() {
                    LINKED_COLLECTION_NAME
                } else {
                    APPENDED_COLLECTION_NAME
                };
                let collection = db.create_block_unique(BlockKind::Collection, name, Scope::Local)?;
                db.add_embedded_reference(scene, MASTER_COLLECTION, SLOT_CHILD, collection)?;
                debug!(%collection, %scene, "created placement collection");
                collection
            }
        };
        self.placement_collection = Some(collection);
        Ok(collection)
    }
}

/// Collections reachable from the scene's master collection.
fn scene_collections(db: &Database, scene: BlockId) -> BTreeSet<BlockId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<BlockId> = db
        .get(scene)
        .map(|s| {
            s.embedded
                .iter()
                .filter(|e| e.name == MASTER_COLLECTION)
                .flat_map(|e| e.references.iter())
                .filter(|r| r.slot == SLOT_CHILD)
                .filter_map(|r| r.target)
                .collect()
        })
        .unwrap_or_default();
    while let Some(coll) = stack.pop() {
        if !seen.insert(coll) {
            continue;
        }
        if let Some(block) = db.get(coll) {
            stack.extend(block.targets_in_slot(SLOT_CHILD));
        }
    }
    seen
}

/// Objects placed in the scene, directly or through its collections.
fn scene_objects(db: &Database, scene: BlockId, collections: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
    let mut out: BTreeSet<BlockId> = db
        .get(scene)
        .map(|s| {
            s.embedded
                .iter()
                .filter(|e| e.name == MASTER_COLLECTION)
                .flat_map(|e| e.references.iter())
                .filter(|r| r.slot == SLOT_OBJECT)
                .filter_map(|r| r.target)
                .collect()
        })
        .unwrap_or_default();
    for coll in collections {
        if let Some(block) = db.get(*coll) {
            out.extend(block.targets_in_slot(SLOT_OBJECT));
        }
    }
    out
}

fn parents(db: &Database, coll: BlockId) -> Vec<BlockId> {
    db.referrers(coll)
        .into_iter()
        .map(|(r, _)| r)
        .filter(|r| {
            db.get(*r)
                .is_some_and(|b| b.kind == BlockKind::Collection && b.references_in_slot(SLOT_CHILD, coll))
        })
        .collect()
}

fn has_ancestor_in(db: &Database, coll: BlockId, set: &BTreeSet<BlockId>) -> bool {
    let mut seen = BTreeSet::from([coll]);
    let mut stack = parents(db, coll);
    while let Some(parent) = stack.pop() {
        if !seen.insert(parent) {
            continue;
        }
        if set.contains(&parent) {
            return true;
        }
        stack.extend(parents(db, parent));
    }
    false
}

fn is_instanced(db: &Database, coll: BlockId) -> bool {
    db.referrers(coll).iter().any(|(r, _)| {
        db.get(*r)
            .is_some_and(|b| b.references_in_slot(SLOT_INSTANCE_COLLECTION, coll))
    })
}

fn in_any_collection(db: &Database, obj: BlockId) -> bool {
    db.referrers(obj).iter().any(|(r, _)| {
        db.get(*r).is_some_and(|b| {
            matches!(b.kind, BlockKind::Collection | BlockKind::Scene)
                && b.references_in_slot(SLOT_OBJECT, obj)
        })
    })
}

fn used_by_object(db: &Database, data: BlockId) -> bool {
    db.referrers(data).iter().any(|(r, _)| {
        db.get(*r)
            .is_some_and(|b| b.kind == BlockKind::Object && b.references_in_slot(SLOT_DATA, data))
    })
}

// =============================================================================
// TESTS
// =============================================================================
