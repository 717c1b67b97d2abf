//! # Remapper
//!
//! Batch rewrite of references from old blocks to their replacements.
//!
//! A remapper collects `old -> Some(new)` or `old -> None` (clear) pairs and
//! then applies all of them in one pass over the requested scope: plain
//! references, references held by embedded records and override
//! references. Use counts are adjusted for every rewritten field.
//!
//! After applying, no reference inside the scope may still point at a
//! remapped block; a survivor is reported as
//! [`TetherError::DanglingReferenceAfterRemap`].

use crate::{BlockId, Database, TetherError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Which blocks a remap pass rewrites.
#[derive(Debug, Clone, Copy)]
pub enum RemapScope<'a> {
    /// Every block of the database.
    All,
    /// Only the given blocks.
    Blocks(&'a BTreeSet<BlockId>),
}

/// Summary of one remap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapOutcome {
    /// Reference fields pointed at a replacement.
    pub rewritten: usize,
    /// Reference fields cleared.
    pub cleared: usize,
    /// Remapped-away blocks left with no users, in id order.
    pub unused: Vec<BlockId>,
}

/// A batch of reference substitutions.
#[derive(Debug, Clone, Default)]
pub struct Remapper {
    mappings: BTreeMap<BlockId, Option<BlockId>>,
}

impl Remapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `old -> new`. A later registration for the same `old` wins.
    pub fn add(&mut self, old: BlockId, new: Option<BlockId>) {
        self.mappings.insert(old, new);
    }

    #[must_use]
    pub fn get(&self, old: BlockId) -> Option<Option<BlockId>> {
        self.mappings.get(&old).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Apply every mapping to the blocks in `scope`.
    pub fn apply(
        &self,
        db: &mut Database,
        scope: RemapScope<'_>,
    ) -> Result<RemapOutcome, TetherError> {
        for new in self.mappings.values().flatten() {
            db.require(*new)?;
        }

        let owners: Vec<BlockId> = match scope {
            RemapScope::All => db.blocks().map(|b| b.id).collect(),
            RemapScope::Blocks(set) => set.iter().copied().filter(|id| db.contains(*id)).collect(),
        };

        let mut outcome = RemapOutcome::default();
        let mut deltas: BTreeMap<BlockId, (u32, u32)> = BTreeMap::new();
        for owner in &owners {
            let Some(block) = db.get_mut(*owner) else {
                continue;
            };
            block.for_each_reference_mut(|_, _, field| {
                let Some(old) = *field else {
                    return;
                };
                let Some(new) = self.mappings.get(&old).copied() else {
                    return;
                };
                if new == Some(old) {
                    return;
                }
                *field = new;
                deltas.entry(old).or_default().1 += 1;
                match new {
                    Some(new) => {
                        deltas.entry(new).or_default().0 += 1;
                        outcome.rewritten += 1;
                    }
                    None => outcome.cleared += 1,
                }
            });
        }

        for (id, (gained, lost)) in deltas {
            for _ in 0..gained {
                db.incref(id);
            }
            for _ in 0..lost {
                db.decref(id);
            }
        }

        self.verify(db, &owners)?;

        outcome.unused = self
            .mappings
            .iter()
            .filter(|(old, new)| **new != Some(**old))
            .filter_map(|(old, _)| db.get(*old))
            .filter(|b| b.users == 0)
            .map(|b| b.id)
            .collect();

        debug!(
            mappings = self.mappings.len(),
            rewritten = outcome.rewritten,
            cleared = outcome.cleared,
            "remap applied"
        );
        Ok(outcome)
    }

    fn verify(&self, db: &Database, owners: &[BlockId]) -> Result<(), TetherError> {
        for owner in owners {
            let Some(block) = db.get(*owner) else {
                continue;
            };
            for (target, _) in block.targets() {
                let remapped = self
                    .mappings
                    .get(&target)
                    .is_some_and(|new| *new != Some(target));
                if remapped || !db.contains(target) {
                    return Err(TetherError::DanglingReferenceAfterRemap {
                        owner: *owner,
                        target,
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
