//! # Import Context
//!
//! The orchestrator of one link, append or relocate operation.
//!
//! A context owns the registered libraries and import items and moves
//! through the stages of [`ProcessStage`]:
//!
//! ```text
//! Init -> Linking -> (Appending) -> (Instantiating) -> Done
//! ```
//!
//! Items live in a slab and are addressed by [`ItemId`]; registration order
//! is kept in a separate list. Stages walk that list by position while
//! appending newly discovered dependencies to it, so growth during a pass
//! never invalidates an item handle.
//!
//! Stage methods take the session [`Database`] and a [`Reports`](crate::Reports) sink
//! explicitly; the context never holds on to either between calls.

mod append;
mod classify;
mod instantiate;
mod item;
mod library;
mod link;
mod override_create;
mod pack;
mod relocate;
mod stage;

pub use append::ProvenanceIndex;
pub use item::{AppendAction, ImportItem, ItemId, ItemTags, LibraryMask, OverrideClass};
pub use library::{ArchiveHandle, LibraryDescriptor, ReadDiagnostics};
pub use override_create::OverrideFlags;
pub use relocate::{RelocateOutcome, relocate_library};
pub use stage::ProcessStage;

use crate::archive::ArchiveCodec;
use crate::{
    BlockId, BlockKind, BlockTags, Database, KindFilter, LinkFlags, LinkParams, Scope,
    TetherError,
};
use bitflags::bitflags;
use slab::Slab;
use std::any::Any;
use std::collections::BTreeMap;
use tracing::debug;

bitflags! {
    /// Which items [`ImportContext::foreach_item`] visits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ForeachFilter: u8 {
        const DIRECT = 1 << 0;
        const INDIRECT = 1 << 1;
    }
}

/// State of one import operation.
pub struct ImportContext<'c> {
    codec: &'c dyn ArchiveCodec,
    params: LinkParams,
    stage: ProcessStage,
    libraries: Vec<LibraryDescriptor>,
    items: Slab<ImportItem>,
    order: Vec<ItemId>,
    by_block: BTreeMap<BlockId, ItemId>,
    /// Local blocks produced by earlier appends, while Appending runs.
    provenance: Option<ProvenanceIndex>,
    /// Collection receiving placements, once created or chosen.
    placement_collection: Option<BlockId>,
}

impl std::fmt::Debug for ImportContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportContext")
            .field("stage", &self.stage)
            .field("flags", &self.params.flags)
            .field("libraries", &self.libraries.len())
            .field("items", &self.order.len())
            .finish_non_exhaustive()
    }
}

impl<'c> ImportContext<'c> {
    #[must_use]
    pub fn new(codec: &'c dyn ArchiveCodec, params: LinkParams) -> Self {
        Self {
            codec,
            params,
            stage: ProcessStage::Init,
            libraries: Vec::new(),
            items: Slab::new(),
            order: Vec::new(),
            by_block: BTreeMap::new(),
            provenance: None,
            placement_collection: None,
        }
    }

    // =========================================================================
    // INIT STAGE
    // =========================================================================

    /// Register a library the context opens itself. Returns its index.
    ///
    /// Registering the same path twice returns the existing index.
    pub fn add_library(&mut self, path: &str) -> Result<usize, TetherError> {
        self.register_library(path, None)
    }

    /// Register a library with an already open handle.
    pub fn add_library_with_handle(
        &mut self,
        path: &str,
        handle: ArchiveHandle,
    ) -> Result<usize, TetherError> {
        self.register_library(path, Some(handle))
    }

    fn register_library(
        &mut self,
        path: &str,
        handle: Option<ArchiveHandle>,
    ) -> Result<usize, TetherError> {
        self.stage.require(ProcessStage::Init)?;
        if !self.order.is_empty() {
            return Err(TetherError::LibraryAfterItems);
        }
        if path.is_empty() {
            return Err(TetherError::InvalidOperation(
                "empty library path".to_string(),
            ));
        }
        if let Some(index) = self.libraries.iter().position(|l| l.path() == path) {
            return Ok(index);
        }
        self.libraries.push(LibraryDescriptor::new(path, handle));
        Ok(self.libraries.len() - 1)
    }

    /// Register a request for `kind:name`. Enable it for libraries with
    /// [`ImportContext::enable_item_for_library`].
    pub fn add_item(
        &mut self,
        kind: BlockKind,
        name: &str,
        user_context: Option<Box<dyn Any>>,
    ) -> Result<ItemId, TetherError> {
        self.stage.require(ProcessStage::Init)?;
        if !kind.is_linkable() {
            return Err(TetherError::InvalidItem(format!(
                "{kind} blocks cannot be requested directly"
            )));
        }
        if name.is_empty() {
            return Err(TetherError::InvalidName(name.to_string()));
        }
        Ok(self.push_item(ImportItem::new(kind, name, user_context)))
    }

    pub fn enable_item_for_library(
        &mut self,
        item: ItemId,
        library: usize,
    ) -> Result<(), TetherError> {
        self.stage.require(ProcessStage::Init)?;
        if library >= self.libraries.len() {
            return Err(TetherError::InvalidLibraryIndex(library));
        }
        self.item_mut(item)?.candidates.set(library);
        Ok(())
    }

    /// Register every block of `library` passing `filter` as an item enabled
    /// for that library. Returns how many items were added.
    ///
    /// Fails with `ArchiveUnreadable` when the archive cannot be opened, which
    /// is distinct from `Ok(0)`.
    pub fn enumerate_items_of_type(
        &mut self,
        library: usize,
        filter: KindFilter,
    ) -> Result<usize, TetherError> {
        self.stage.require(ProcessStage::Init)?;
        let assets_only = self.params.flags.contains(LinkFlags::ASSETS_ONLY);
        let codec = self.codec;
        let descriptor = self
            .libraries
            .get_mut(library)
            .ok_or(TetherError::InvalidLibraryIndex(library))?;
        descriptor.open(codec)?;
        let listings = descriptor.enumerate(filter, assets_only)?;

        for listing in &listings {
            let id = self.push_item(ImportItem::new(listing.kind, &listing.name, None));
            self.item_mut(id)?.candidates.set(library);
        }
        debug!(library, count = listings.len(), "enumerated items");
        Ok(listings.len())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn stage(&self) -> ProcessStage {
        self.stage
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn flags(&self) -> LinkFlags {
        self.params.flags
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.order.len()
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    pub fn library(&self, index: usize) -> Option<&LibraryDescriptor> {
        self.libraries.get(index)
    }

    pub fn libraries(&self) -> &[LibraryDescriptor] {
        &self.libraries
    }

    pub fn item(&self, id: ItemId) -> Option<&ImportItem> {
        self.items.get(id.0)
    }

    /// Items in registration order.
    pub fn items(&self) -> impl Iterator<Item = (ItemId, &ImportItem)> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id.0).map(|item| (*id, item)))
    }

    /// Visit items in registration order until `f` returns `false`.
    pub fn foreach_item(
        &self,
        filter: ForeachFilter,
        mut f: impl FnMut(ItemId, &ImportItem) -> bool,
    ) {
        for (id, item) in self.items() {
            let wanted = if item.is_indirect() {
                filter.contains(ForeachFilter::INDIRECT)
            } else {
                filter.contains(ForeachFilter::DIRECT)
            };
            if wanted && !f(id, item) {
                break;
            }
        }
    }

    pub fn item_kind(&self, id: ItemId) -> Option<BlockKind> {
        self.item(id).map(ImportItem::kind)
    }

    pub fn item_resolved(&self, id: ItemId) -> Option<BlockId> {
        self.item(id).and_then(ImportItem::resolved)
    }

    pub fn item_override(&self, id: ItemId) -> Option<BlockId> {
        self.item(id).and_then(ImportItem::override_block)
    }

    pub fn item_user_context<T: Any>(&self, id: ItemId) -> Option<&T> {
        self.item(id).and_then(|item| item.user_context::<T>())
    }

    /// The item whose resolved (or original linked) block is `block`.
    pub fn item_for_block(&self, block: BlockId) -> Option<ItemId> {
        self.by_block.get(&block).copied()
    }

    /// Point an item at a different linked block of the same library.
    pub fn set_item_resolved(
        &mut self,
        id: ItemId,
        block: BlockId,
        db: &Database,
    ) -> Result<(), TetherError> {
        if matches!(self.stage, ProcessStage::Init | ProcessStage::Done) {
            return Err(TetherError::StageViolation {
                expected: "Linking or later".to_string(),
                found: self.stage.name().to_string(),
            });
        }
        let data = db.require(block)?;
        let item = self.item(id).ok_or_else(|| unknown_item(id))?;
        if data.kind != item.kind {
            return Err(TetherError::InvalidItem(format!(
                "{id} expects a {}, got {}",
                item.kind,
                data.display_name()
            )));
        }
        let expected = item
            .source_library
            .and_then(|index| self.libraries.get(index))
            .map(|lib| lib.path().to_string());
        let actual = db.library_path_of(block).map(str::to_string);
        if actual.is_none() || (expected.is_some() && expected != actual) {
            return Err(TetherError::InvalidItem(format!(
                "{} does not belong to the item's library",
                data.display_name()
            )));
        }
        let previous = self.item(id).and_then(ImportItem::resolved);
        if let Some(previous) = previous {
            self.by_block.remove(&previous);
        }
        self.item_mut(id)?.resolved = Some(block);
        self.by_block.insert(block, id);
        Ok(())
    }

    // =========================================================================
    // DONE
    // =========================================================================

    /// Close the operation: clear per-operation tags and check the database.
    pub fn finalize(&mut self, db: &mut Database) -> Result<(), TetherError> {
        self.stage.advance(ProcessStage::Done)?;
        db.tag_all(|_| true, BlockTags::PRE_EXISTING, false);
        self.provenance = None;
        db.check_references()
    }

    // =========================================================================
    // INTERNAL HELPERS
    // =========================================================================

    pub(crate) fn push_item(&mut self, item: ImportItem) -> ItemId {
        let id = ItemId(self.items.insert(item));
        self.order.push(id);
        id
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> Result<&mut ImportItem, TetherError> {
        self.items.get_mut(id.0).ok_or_else(|| unknown_item(id))
    }

    /// Item handle at `position` of the registration order.
    pub(crate) fn item_at(&self, position: usize) -> Option<ItemId> {
        self.order.get(position).copied()
    }

    /// Record that `item` resolved to `block`.
    pub(crate) fn bind(&mut self, id: ItemId, block: BlockId) -> Result<(), TetherError> {
        self.item_mut(id)?.resolved = Some(block);
        self.by_block.insert(block, id);
        Ok(())
    }

    /// Index of the descriptor for `path`, registering an indirect one if needed.
    pub(crate) fn library_for_path(&mut self, path: &str, parent: usize) -> usize {
        if let Some(index) = self.libraries.iter().position(|l| l.path() == path) {
            return index;
        }
        debug!(path, parent, "registering indirect library");
        self.libraries
            .push(LibraryDescriptor::new_indirect(path, parent));
        self.libraries.len() - 1
    }

    /// Index of the descriptor owning a linked block's scope.
    pub(crate) fn library_for_scope(&self, db: &Database, scope: Scope) -> Option<usize> {
        let record = db.library(scope.library()?)?;
        self.libraries.iter().position(|l| l.path() == record.path)
    }
}

impl Drop for ImportContext<'_> {
    fn drop(&mut self) {
        for library in &mut self.libraries {
            library.release();
        }
    }
}

fn unknown_item(id: ItemId) -> TetherError {
    TetherError::InvalidItem(format!("{id} does not belong to this context"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveContents, MemoryCodec, RawBlock};

    fn codec() -> MemoryCodec {
        MemoryCodec::new().with(
            "props.tether",
            ArchiveContents::new()
                .with(RawBlock::new(BlockKind::Mesh, "Cube").as_asset("cube"))
                .with(RawBlock::new(BlockKind::Mesh, "Cone"))
                .with(RawBlock::new(BlockKind::Material, "Steel")),
        )
    }

    #[test]
    fn library_after_items_is_rejected() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        ctx.add_library("props.tether").expect("library");
        ctx.add_item(BlockKind::Mesh, "Cube", None).expect("item");
        assert!(matches!(
            ctx.add_library("other.tether"),
            Err(TetherError::LibraryAfterItems)
        ));
        assert_eq!(ctx.library_count(), 1);
    }

    #[test]
    fn duplicate_library_paths_share_an_index() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        let a = ctx.add_library("props.tether").expect("library");
        let b = ctx.add_library("props.tether").expect("library");
        assert_eq!(a, b);
    }

    #[test]
    fn enable_rejects_unknown_library() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        ctx.add_library("props.tether").expect("library");
        let item = ctx.add_item(BlockKind::Mesh, "Cube", None).expect("item");
        assert!(matches!(
            ctx.enable_item_for_library(item, 3),
            Err(TetherError::InvalidLibraryIndex(3))
        ));
    }

    #[test]
    fn non_linkable_kinds_cannot_be_requested() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        assert!(ctx.add_item(BlockKind::ShapeKey, "Key", None).is_err());
    }

    #[test]
    fn enumerate_filters_and_counts() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        let lib = ctx.add_library("props.tether").expect("library");
        let count = ctx
            .enumerate_items_of_type(lib, KindFilter::MESH)
            .expect("enumerate");
        assert_eq!(count, 2);
        let names: Vec<&str> = ctx.items().map(|(_, item)| item.name()).collect();
        assert_eq!(names, vec!["Cone", "Cube"]);
    }

    #[test]
    fn enumerate_assets_only() {
        let codec = codec();
        let mut ctx =
            ImportContext::new(&codec, LinkParams::new(LinkFlags::ASSETS_ONLY));
        let lib = ctx.add_library("props.tether").expect("library");
        assert_eq!(
            ctx.enumerate_items_of_type(lib, KindFilter::empty())
                .expect("enumerate"),
            1
        );
    }

    #[test]
    fn enumerate_unreadable_library_is_an_error() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        let lib = ctx.add_library("missing.tether").expect("library");
        assert!(matches!(
            ctx.enumerate_items_of_type(lib, KindFilter::empty()),
            Err(TetherError::ArchiveUnreadable { .. })
        ));
    }

    #[test]
    fn foreach_item_stops_early() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        ctx.add_item(BlockKind::Mesh, "A", None).expect("item");
        ctx.add_item(BlockKind::Mesh, "B", None).expect("item");
        ctx.add_item(BlockKind::Mesh, "C", None).expect("item");

        let mut seen = Vec::new();
        ctx.foreach_item(ForeachFilter::all(), |_, item| {
            seen.push(item.name().to_string());
            seen.len() < 2
        });
        assert_eq!(seen, vec!["A".to_string(), "B".to_string()]);

        let mut indirect = 0;
        ctx.foreach_item(ForeachFilter::INDIRECT, |_, _| {
            indirect += 1;
            true
        });
        assert_eq!(indirect, 0);
    }

    #[test]
    fn user_context_is_returned_verbatim() {
        let codec = codec();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        let item = ctx
            .add_item(BlockKind::Mesh, "Cube", Some(Box::new("request-7".to_string())))
            .expect("item");
        assert_eq!(
            ctx.item_user_context::<String>(item).map(String::as_str),
            Some("request-7")
        );
    }

    #[test]
    fn stage_calls_out_of_order_fail() {
        let codec = codec();
        let mut db = Database::new();
        let mut ctx = ImportContext::new(&codec, LinkParams::default());
        assert!(matches!(
            ctx.finalize(&mut db),
            Err(TetherError::StageViolation { .. })
        ));
    }
}
