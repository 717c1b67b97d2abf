//! # Dependency Classifier
//!
//! Two passes run at the start of Appending:
//!
//! 1. **Discovery** walks the resolved block of every item and registers each
//!    linked block it references that is not an item yet as a new
//!    `INDIRECT` item. Non-linkable blocks are walked through, not registered.
//! 2. **Override classification** runs once discovery is complete. A block
//!    reachable from the requested items only through override-reference
//!    edges is tagged `OVERRIDE_DEPENDENCY_ONLY`; one reachable through both
//!    kinds of edge is tagged `OVERRIDE_DEPENDENCY`.

use super::{ImportContext, ImportItem, OverrideClass};
use crate::{BlockId, Database, EdgeKind, TetherError};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, error};

impl ImportContext<'_> {
    /// Register missing linked dependencies as indirect items.
    ///
    /// Returns the number of items added.
    pub(crate) fn discover_dependencies(&mut self, db: &Database) -> Result<usize, TetherError> {
        let mut added = 0;
        let mut position = 0;
        while let Some(id) = self.item_at(position) {
            position += 1;
            let Some(block) = self.item(id).and_then(ImportItem::resolved) else {
                continue;
            };
            if db.get(block).is_none_or(|b| !b.is_linked()) {
                continue;
            }

            for (target, _) in linkable_targets(db, block) {
                if self.by_block.contains_key(&target) {
                    continue;
                }
                let Some(data) = db.get(target) else {
                    continue;
                };
                if data.scope.is_local() {
                    error!(
                        owner = %block,
                        target = %data.display_name(),
                        "local data referenced from a linked hierarchy"
                    );
                    continue;
                }
                let mut dependency = ImportItem::indirect(data.kind, &data.name);
                dependency.source_library = self.library_for_scope(db, data.scope);
                if let Some(library) = dependency.source_library {
                    dependency.candidates.set(library);
                }
                let new = self.push_item(dependency);
                self.bind(new, target)?;
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, "discovered indirect dependencies");
        }
        Ok(added)
    }

    /// Tag items reachable through override-reference edges.
    pub(crate) fn classify_override_dependencies(&mut self, db: &Database) -> Result<(), TetherError> {
        let roots: Vec<BlockId> = self
            .items()
            .filter(|(_, item)| !item.is_indirect())
            .filter_map(|(_, item)| item.resolved)
            .collect();

        let content = reachable(db, roots.iter().copied(), |edge| edge == EdgeKind::Content);
        let everything = reachable(db, roots.iter().copied(), |_| true);
        let seeds: Vec<BlockId> = everything
            .iter()
            .filter_map(|id| db.get(*id))
            .flat_map(|b| b.targets())
            .filter(|(_, edge)| *edge == EdgeKind::OverrideReference)
            .map(|(target, _)| target)
            .collect();
        let through_overrides = reachable(db, seeds, |_| true);

        let ids: Vec<_> = self.items().map(|(id, _)| id).collect();
        let mut tagged = 0;
        for id in ids {
            let item = self.item_mut(id)?;
            let Some(block) = item.resolved else {
                continue;
            };
            let class = match (through_overrides.contains(&block), content.contains(&block)) {
                (true, false) => OverrideClass::DependencyOnly,
                (true, true) => OverrideClass::Dependency,
                (false, _) => OverrideClass::None,
            };
            if class != OverrideClass::None {
                tagged += 1;
            }
            item.set_override_class(class);
            item.tags.validate()?;
        }
        if tagged > 0 {
            debug!(tagged, "classified override dependencies");
        }
        Ok(())
    }
}

/// Linkable blocks referenced by `block`, looking through non-linkable ones.
fn linkable_targets(db: &Database, block: BlockId) -> Vec<(BlockId, EdgeKind)> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::from([block]);
    let mut stack = vec![block];
    while let Some(current) = stack.pop() {
        let Some(data) = db.get(current) else {
            continue;
        };
        for (target, edge) in data.targets() {
            if !visited.insert(target) {
                continue;
            }
            match db.get(target) {
                Some(t) if !t.kind.is_linkable() => stack.push(target),
                Some(_) => out.push((target, edge)),
                None => {}
            }
        }
    }
    out
}

/// Blocks reachable from `seeds` (included) following edges accepted by `follow`.
fn reachable(
    db: &Database,
    seeds: impl IntoIterator<Item = BlockId>,
    follow: impl Fn(EdgeKind) -> bool,
) -> BTreeSet<BlockId> {
    let mut seen: BTreeSet<BlockId> = BTreeSet::new();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    for seed in seeds {
        if seen.insert(seed) {
            queue.push_back(seed);
        }
    }
    while let Some(current) = queue.pop_front() {
        let Some(data) = db.get(current) else {
            continue;
        };
        for (target, edge) in data.targets() {
            if follow(edge) && seen.insert(target) {
                queue.push_back(target);
            }
        }
    }
    seen
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockKind, Scope};

    #[test]
    fn linkable_targets_look_through_shape_keys() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        let me = db
            .create_block(BlockKind::Mesh, "Me", Scope::Library(lib))
            .expect("create");
        let key = db
            .create_block(BlockKind::ShapeKey, "Key", Scope::Library(lib))
            .expect("create");
        let act = db
            .create_block(BlockKind::Action, "Wobble", Scope::Library(lib))
            .expect("create");
        db.add_reference(me, "shape_key", key).expect("ref");
        db.add_reference(key, "action", act).expect("ref");

        assert_eq!(
            linkable_targets(&db, me),
            vec![(act, EdgeKind::Content)]
        );
    }

    #[test]
    fn reachable_respects_edge_filter() {
        let mut db = Database::new();
        let lib = db.ensure_library("lib.tether");
        let ov = db
            .create_block(BlockKind::Object, "RigOverride", Scope::Library(lib))
            .expect("create");
        let rig = db
            .create_block(BlockKind::Object, "Rig", Scope::Library(lib))
            .expect("create");
        db.set_override(ov, rig, false).expect("override");

        let content = reachable(&db, [ov], |e| e == EdgeKind::Content);
        assert!(!content.contains(&rig));
        let all = reachable(&db, [ov], |_| true);
        assert!(all.contains(&rig));
    }
}
