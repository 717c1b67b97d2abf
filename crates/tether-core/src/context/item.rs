//! # Import Items
//!
//! A request to bring one named, typed block into the session, and what
//! became of it.

use crate::{BlockId, BlockKind, TetherError};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Stable handle of an item inside its context.
///
/// Handles stay valid while the context grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub(crate) usize);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

// =============================================================================
// LIBRARY MASK
// =============================================================================

/// Bitset over library indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryMask {
    words: Vec<u64>,
}

impl LibraryMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        if let Some(w) = self.words.get_mut(word) {
            *w |= 1u64 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(w) = self.words.get_mut(index / 64) {
            *w &= !(1u64 << (index % 64));
        }
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word, bits)| {
            (0..64usize)
                .filter(move |bit| bits & (1u64 << bit) != 0)
                .map(move |bit| word * 64 + bit)
        })
    }
}

// =============================================================================
// ACTIONS & TAGS
// =============================================================================

/// What the Appending stage does with an item's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum AppendAction {
    #[default]
    Unset,
    KeepLinked,
    ReuseLocal,
    MakeLocal,
    CopyLocal,
}

impl AppendAction {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AppendAction::Unset => "unset",
            AppendAction::KeepLinked => "keep-linked",
            AppendAction::ReuseLocal => "reuse-local",
            AppendAction::MakeLocal => "make-local",
            AppendAction::CopyLocal => "copy-local",
        }
    }

    /// Whether the item ends up with a new local block of its own.
    #[must_use]
    pub fn promotes(&self) -> bool {
        matches!(self, AppendAction::MakeLocal | AppendAction::CopyLocal)
    }
}

impl fmt::Display for AppendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Classification tags of an item.
    ///
    /// The two override tags are mutually exclusive; write them through
    /// [`ItemTags::with_override_class`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ItemTags: u8 {
        /// Discovered as a dependency, not requested.
        const INDIRECT = 1 << 0;
        /// Reachable through both override and content edges.
        const OVERRIDE_DEPENDENCY = 1 << 1;
        /// Reachable through override edges only.
        const OVERRIDE_DEPENDENCY_ONLY = 1 << 2;
    }
}

/// The override classification held by [`ItemTags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideClass {
    None,
    Dependency,
    DependencyOnly,
}

impl ItemTags {
    /// Read the override classification, rejecting an invalid combination.
    pub fn override_class(self) -> Result<OverrideClass, TetherError> {
        self.validate()?;
        Ok(
            if self.contains(ItemTags::OVERRIDE_DEPENDENCY_ONLY) {
                OverrideClass::DependencyOnly
            } else if self.contains(ItemTags::OVERRIDE_DEPENDENCY) {
                OverrideClass::Dependency
            } else {
                OverrideClass::None
            },
        )
    }

    /// Replace the override classification, keeping other tags.
    #[must_use]
    pub fn with_override_class(self, class: OverrideClass) -> Self {
        let base = self - (ItemTags::OVERRIDE_DEPENDENCY | ItemTags::OVERRIDE_DEPENDENCY_ONLY);
        match class {
            OverrideClass::None => base,
            OverrideClass::Dependency => base | ItemTags::OVERRIDE_DEPENDENCY,
            OverrideClass::DependencyOnly => base | ItemTags::OVERRIDE_DEPENDENCY_ONLY,
        }
    }

    pub fn validate(self) -> Result<(), TetherError> {
        if self.contains(ItemTags::OVERRIDE_DEPENDENCY | ItemTags::OVERRIDE_DEPENDENCY_ONLY) {
            return Err(TetherError::InvalidItem(
                "override dependency tags are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// IMPORT ITEM
// =============================================================================

/// One import request.
pub struct ImportItem {
    pub(crate) name: String,
    pub(crate) kind: BlockKind,
    pub(crate) candidates: LibraryMask,
    pub(crate) action: AppendAction,
    pub(crate) tags: ItemTags,
    pub(crate) resolved: Option<BlockId>,
    /// The linked block an item was resolved from, once Appending replaced it.
    pub(crate) linked_source: Option<BlockId>,
    pub(crate) source_library: Option<usize>,
    pub(crate) override_block: Option<BlockId>,
    pub(crate) reusable_existing: Option<BlockId>,
    pub(crate) user_context: Option<Box<dyn Any>>,
}

impl fmt::Debug for ImportItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportItem")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("action", &self.action)
            .field("tags", &self.tags)
            .field("resolved", &self.resolved)
            .field("source_library", &self.source_library)
            .finish_non_exhaustive()
    }
}

impl ImportItem {
    pub(crate) fn new(kind: BlockKind, name: &str, user_context: Option<Box<dyn Any>>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            candidates: LibraryMask::new(),
            action: AppendAction::Unset,
            tags: ItemTags::empty(),
            resolved: None,
            linked_source: None,
            source_library: None,
            override_block: None,
            reusable_existing: None,
            user_context,
        }
    }

    /// An item discovered while resolving another one.
    pub(crate) fn indirect(kind: BlockKind, name: &str) -> Self {
        let mut item = Self::new(kind, name, None);
        item.tags = ItemTags::INDIRECT;
        item
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn action(&self) -> AppendAction {
        self.action
    }

    pub fn tags(&self) -> ItemTags {
        self.tags
    }

    pub fn is_indirect(&self) -> bool {
        self.tags.contains(ItemTags::INDIRECT)
    }

    /// The block this item resolved to. After Appending this is the local
    /// block (the copy or the reused block, where applicable).
    pub fn resolved(&self) -> Option<BlockId> {
        self.resolved
    }

    /// The linked block the item resolved to before Appending replaced it.
    pub fn linked_source(&self) -> Option<BlockId> {
        self.linked_source
    }

    pub fn source_library(&self) -> Option<usize> {
        self.source_library
    }

    pub fn override_block(&self) -> Option<BlockId> {
        self.override_block
    }

    pub fn reusable_existing(&self) -> Option<BlockId> {
        self.reusable_existing
    }

    pub fn candidates(&self) -> &LibraryMask {
        &self.candidates
    }

    /// Downcast the caller-supplied context.
    pub fn user_context<T: Any>(&self) -> Option<&T> {
        self.user_context.as_deref()?.downcast_ref::<T>()
    }

    pub(crate) fn set_override_class(&mut self, class: OverrideClass) {
        self.tags = self.tags.with_override_class(class);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_iterates_in_ascending_order() {
        let mut mask = LibraryMask::new();
        mask.set(70);
        mask.set(3);
        mask.set(0);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3, 70]);
        mask.clear(3);
        assert!(!mask.contains(3));
        assert!(mask.contains(70));
        mask.clear_all();
        assert!(mask.is_empty());
    }

    #[test]
    fn override_class_writes_are_exclusive() {
        let tags = ItemTags::INDIRECT
            .with_override_class(OverrideClass::Dependency)
            .with_override_class(OverrideClass::DependencyOnly);
        assert!(tags.contains(ItemTags::INDIRECT));
        assert!(!tags.contains(ItemTags::OVERRIDE_DEPENDENCY));
        assert_eq!(
            tags.override_class().expect("valid"),
            OverrideClass::DependencyOnly
        );
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let tags = ItemTags::OVERRIDE_DEPENDENCY | ItemTags::OVERRIDE_DEPENDENCY_ONLY;
        assert!(tags.validate().is_err());
        assert!(tags.override_class().is_err());
    }

    #[test]
    fn user_context_downcasts() {
        let item = ImportItem::new(BlockKind::Mesh, "Cube", Some(Box::new(7u32)));
        assert_eq!(item.user_context::<u32>(), Some(&7));
        assert_eq!(item.user_context::<String>(), None);
    }
}
