//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the link/append engine:
//! - Identifiers (`BlockId`, `LibraryId`)
//! - Data-block kinds and kind filters (`BlockKind`, `KindFilter`)
//! - Ownership scopes (`Scope`) and reference edges (`Reference`, `EdgeKind`)
//! - The data-block record itself (`DataBlock`)
//! - Error types (`TetherError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers implement `Ord` so they can key `BTreeMap`/`BTreeSet`.
//! Iteration over any collection in this crate is therefore stable between runs.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identity of a data-block inside one [`crate::Database`].
///
/// Ids are never reused within a database, so a stale id simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a source library record inside one [`crate::Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LibraryId(pub u64);

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lib#{}", self.0)
    }
}

// =============================================================================
// BLOCK KINDS
// =============================================================================

/// The type of a data-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Scene,
    Collection,
    Object,
    Mesh,
    Curve,
    Light,
    Camera,
    Material,
    Texture,
    Image,
    NodeTree,
    Action,
    World,
    /// Owned by its object-data; never requested on its own.
    ShapeKey,
}

impl BlockKind {
    /// Every kind, in code order.
    pub const ALL: [BlockKind; 14] = [
        BlockKind::Scene,
        BlockKind::Collection,
        BlockKind::Object,
        BlockKind::Mesh,
        BlockKind::Curve,
        BlockKind::Light,
        BlockKind::Camera,
        BlockKind::Material,
        BlockKind::Texture,
        BlockKind::Image,
        BlockKind::NodeTree,
        BlockKind::Action,
        BlockKind::World,
        BlockKind::ShapeKey,
    ];

    /// Stable small-integer code used by on-disk archive keys.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            BlockKind::Scene => 1,
            BlockKind::Collection => 2,
            BlockKind::Object => 3,
            BlockKind::Mesh => 4,
            BlockKind::Curve => 5,
            BlockKind::Light => 6,
            BlockKind::Camera => 7,
            BlockKind::Material => 8,
            BlockKind::Texture => 9,
            BlockKind::Image => 10,
            BlockKind::NodeTree => 11,
            BlockKind::Action => 12,
            BlockKind::World => 13,
            BlockKind::ShapeKey => 14,
        }
    }

    /// Inverse of [`BlockKind::code`].
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Group name used in weak-reference paths (`"<archive>/Mesh/Cube"`).
    #[must_use]
    pub const fn group_name(self) -> &'static str {
        match self {
            BlockKind::Scene => "Scene",
            BlockKind::Collection => "Collection",
            BlockKind::Object => "Object",
            BlockKind::Mesh => "Mesh",
            BlockKind::Curve => "Curve",
            BlockKind::Light => "Light",
            BlockKind::Camera => "Camera",
            BlockKind::Material => "Material",
            BlockKind::Texture => "Texture",
            BlockKind::Image => "Image",
            BlockKind::NodeTree => "NodeTree",
            BlockKind::Action => "Action",
            BlockKind::World => "World",
            BlockKind::ShapeKey => "ShapeKey",
        }
    }

    /// Parse a group name, case-insensitively.
    #[must_use]
    pub fn from_group_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.group_name().eq_ignore_ascii_case(name))
    }

    /// Whether blocks of this kind can be requested from a library directly.
    ///
    /// Non-linkable kinds come in with the block that owns them.
    #[must_use]
    pub const fn is_linkable(self) -> bool {
        !matches!(self, BlockKind::ShapeKey)
    }

    /// Whether this kind is object-data (something an object instances).
    #[must_use]
    pub const fn is_object_data(self) -> bool {
        matches!(
            self,
            BlockKind::Mesh | BlockKind::Curve | BlockKind::Light | BlockKind::Camera
        )
    }

    /// Whether a previously appended local copy of this kind may be reused
    /// instead of appending it again.
    #[must_use]
    pub const fn append_is_reusable(self) -> bool {
        matches!(
            self,
            BlockKind::Material
                | BlockKind::Texture
                | BlockKind::Image
                | BlockKind::NodeTree
                | BlockKind::Action
                | BlockKind::World
        )
    }

    /// Whether the Instantiating stage places blocks of this kind.
    #[must_use]
    pub const fn is_placeable(self) -> bool {
        matches!(self, BlockKind::Object | BlockKind::Collection) || self.is_object_data()
    }

    /// The filter bit for this kind.
    #[must_use]
    pub const fn filter(self) -> KindFilter {
        match self {
            BlockKind::Scene => KindFilter::SCENE,
            BlockKind::Collection => KindFilter::COLLECTION,
            BlockKind::Object => KindFilter::OBJECT,
            BlockKind::Mesh => KindFilter::MESH,
            BlockKind::Curve => KindFilter::CURVE,
            BlockKind::Light => KindFilter::LIGHT,
            BlockKind::Camera => KindFilter::CAMERA,
            BlockKind::Material => KindFilter::MATERIAL,
            BlockKind::Texture => KindFilter::TEXTURE,
            BlockKind::Image => KindFilter::IMAGE,
            BlockKind::NodeTree => KindFilter::NODE_TREE,
            BlockKind::Action => KindFilter::ACTION,
            BlockKind::World => KindFilter::WORLD,
            BlockKind::ShapeKey => KindFilter::SHAPE_KEY,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

impl FromStr for BlockKind {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_group_name(s).ok_or_else(|| TetherError::UnknownKind(s.to_string()))
    }
}

bitflags! {
    /// A set of block kinds, used to filter bulk enumeration.
    ///
    /// The empty set means "every linkable kind".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
    pub struct KindFilter: u32 {
        const SCENE = 1 << 0;
        const COLLECTION = 1 << 1;
        const OBJECT = 1 << 2;
        const MESH = 1 << 3;
        const CURVE = 1 << 4;
        const LIGHT = 1 << 5;
        const CAMERA = 1 << 6;
        const MATERIAL = 1 << 7;
        const TEXTURE = 1 << 8;
        const IMAGE = 1 << 9;
        const NODE_TREE = 1 << 10;
        const ACTION = 1 << 11;
        const WORLD = 1 << 12;
        const SHAPE_KEY = 1 << 13;
    }
}

impl KindFilter {
    /// Check whether `kind` passes this filter.
    #[must_use]
    pub fn matches(self, kind: BlockKind) -> bool {
        self.is_empty() || self.contains(kind.filter())
    }
}

// =============================================================================
// SCOPES & REFERENCES
// =============================================================================

/// Ownership scope of a data-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Owned and editable by the current session.
    Local,
    /// Read-only data owned by a source library.
    Library(LibraryId),
}

impl Scope {
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Scope::Local)
    }

    #[must_use]
    pub const fn library(self) -> Option<LibraryId> {
        match self {
            Scope::Local => None,
            Scope::Library(lib) => Some(lib),
        }
    }
}

/// The kind of edge an outgoing reference forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Plain content usage (a mesh used by an object, a child collection, ...).
    Content,
    /// From a liboverride to the linked block it overrides.
    OverrideReference,
}

/// A named outgoing reference slot.
///
/// `target == None` is a cleared reference; the slot itself is kept so the
/// owner's layout does not change under remapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub slot: String,
    pub target: Option<BlockId>,
}

impl Reference {
    #[must_use]
    pub fn new(slot: impl Into<String>, target: Option<BlockId>) -> Self {
        Self {
            slot: slot.into(),
            target,
        }
    }
}

/// A sub-record owned by its container block (a scene's master collection,
/// a material's node tree, ...). It is not a data-block on its own but its
/// references are remapped like the owner's.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub name: String,
    pub references: Vec<Reference>,
}

/// Liboverride metadata of a local shadow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideMeta {
    /// The linked block this override shadows.
    pub reference: Option<BlockId>,
    /// Runtime-only overrides are never written back to an archive.
    pub runtime: bool,
}

/// Where a reference lives inside its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefLocation {
    /// Index into `DataBlock::references`.
    Direct(usize),
    /// Record index into `DataBlock::embedded`, then reference index.
    Embedded(usize, usize),
    /// The override reference.
    Override,
}

// =============================================================================
// BLOCK TAGS & METADATA
// =============================================================================

bitflags! {
    /// Runtime status tags of a data-block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BlockTags: u32 {
        /// Existed before the current link/append operation started.
        const PRE_EXISTING = 1 << 0;
        /// Linked because it was explicitly requested.
        const EXTERN = 1 << 1;
        /// Linked only as a dependency of other data.
        const INDIRECT = 1 << 2;
        /// Placeholder for a block absent from its archive.
        const MISSING = 1 << 3;
        /// Edited since it was appended; disqualifies local reuse.
        const MODIFIED = 1 << 4;
        /// Self-contained copy that no longer needs its archive.
        const PACKED = 1 << 5;
        /// Runtime-only data (runtime liboverrides).
        const RUNTIME = 1 << 6;
        /// Imported into a per-library asset database.
        const ASSET_LIBRARY_DATA = 1 << 7;
    }
}

/// Where an appended local block came from.
///
/// Used to find previously appended data that can be reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppendProvenance {
    pub library_path: String,
    pub name: String,
}

/// Asset metadata carried by some blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub description: Option<String>,
    pub tags: Vec<String>,
}

// =============================================================================
// DATA-BLOCK
// =============================================================================

/// A typed, named, reference-counted record of the session database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    pub name: String,
    pub scope: Scope,
    /// Number of references pointing at this block, plus one for a fake user.
    pub users: u32,
    pub fake_user: bool,
    pub references: Vec<Reference>,
    pub embedded: Vec<EmbeddedRecord>,
    pub override_meta: Option<OverrideMeta>,
    pub tags: BlockTags,
    pub provenance: Option<AppendProvenance>,
    pub asset: Option<AssetMetadata>,
    pub properties: BTreeMap<String, String>,
}

impl DataBlock {
    /// Create an unreferenced block. Only the database assigns ids.
    pub(crate) fn new(id: BlockId, kind: BlockKind, name: String, scope: Scope) -> Self {
        Self {
            id,
            kind,
            name,
            scope,
            users: 0,
            fake_user: false,
            references: Vec::new(),
            embedded: Vec::new(),
            override_meta: None,
            tags: BlockTags::empty(),
            provenance: None,
            asset: None,
            properties: BTreeMap::new(),
        }
    }

    /// Whether the block belongs to a library scope.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        !self.scope.is_local()
    }

    /// Whether the block is a liboverride of some linked block.
    #[must_use]
    pub fn is_override(&self) -> bool {
        self.override_meta
            .is_some_and(|meta| meta.reference.is_some())
    }

    /// `Kind:Name`, for diagnostics.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// Every non-empty outgoing reference, including embedded records and the
    /// override reference, in a stable order.
    #[must_use]
    pub fn targets(&self) -> Vec<(BlockId, EdgeKind)> {
        let mut out = Vec::with_capacity(self.references.len());
        out.extend(
            self.references
                .iter()
                .filter_map(|r| r.target.map(|t| (t, EdgeKind::Content))),
        );
        for record in &self.embedded {
            out.extend(
                record
                    .references
                    .iter()
                    .filter_map(|r| r.target.map(|t| (t, EdgeKind::Content))),
            );
        }
        if let Some(reference) = self.override_meta.and_then(|meta| meta.reference) {
            out.push((reference, EdgeKind::OverrideReference));
        }
        out
    }

    /// Targets of plain references in `slot`.
    pub fn targets_in_slot<'a>(&'a self, slot: &'a str) -> impl Iterator<Item = BlockId> + 'a {
        self.references
            .iter()
            .filter(move |r| r.slot == slot)
            .filter_map(|r| r.target)
    }

    /// Check whether any reference (embedded ones included) in `slot` points at `target`.
    #[must_use]
    pub fn references_in_slot(&self, slot: &str, target: BlockId) -> bool {
        let hit = |r: &Reference| r.slot == slot && r.target == Some(target);
        self.references.iter().any(hit)
            || self
                .embedded
                .iter()
                .any(|record| record.references.iter().any(hit))
    }

    /// Content references that point somewhere, with where they live.
    pub fn content_locations(&self) -> Vec<(RefLocation, BlockId)> {
        let mut out = Vec::new();
        for (index, reference) in self.references.iter().enumerate() {
            if let Some(target) = reference.target {
                out.push((RefLocation::Direct(index), target));
            }
        }
        for (record_index, record) in self.embedded.iter().enumerate() {
            for (index, reference) in record.references.iter().enumerate() {
                if let Some(target) = reference.target {
                    out.push((RefLocation::Embedded(record_index, index), target));
                }
            }
        }
        out
    }

    /// Visit every reference field mutably.
    pub fn for_each_reference_mut(
        &mut self,
        mut f: impl FnMut(RefLocation, EdgeKind, &mut Option<BlockId>),
    ) {
        for (index, reference) in self.references.iter_mut().enumerate() {
            f(RefLocation::Direct(index), EdgeKind::Content, &mut reference.target);
        }
        for (record_index, record) in self.embedded.iter_mut().enumerate() {
            for (index, reference) in record.references.iter_mut().enumerate() {
                f(
                    RefLocation::Embedded(record_index, index),
                    EdgeKind::Content,
                    &mut reference.target,
                );
            }
        }
        if let Some(meta) = self.override_meta.as_mut() {
            f(
                RefLocation::Override,
                EdgeKind::OverrideReference,
                &mut meta.reference,
            );
        }
    }

    /// Mutable access to the reference field at `location`.
    pub(crate) fn reference_at_mut(&mut self, location: RefLocation) -> Option<&mut Option<BlockId>> {
        match location {
            RefLocation::Direct(index) => self.references.get_mut(index).map(|r| &mut r.target),
            RefLocation::Embedded(record, index) => self
                .embedded
                .get_mut(record)
                .and_then(|rec| rec.references.get_mut(index))
                .map(|r| &mut r.target),
            RefLocation::Override => self.override_meta.as_mut().map(|meta| &mut meta.reference),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the link/append engine.
///
/// Per-item failures never surface as `Err` from a stage; they are recorded
/// in [`crate::Reports`]. `Err` is reserved for contract violations, codec
/// failures and broken invariants.
#[derive(Debug, Error)]
pub enum TetherError {
    /// A library archive could not be opened or read.
    #[error("Archive unreadable: {path}: {reason}")]
    ArchiveUnreadable { path: String, reason: String },

    /// A named block is absent from every candidate library.
    #[error("Item not found: {kind}:{name}")]
    ItemNotFound { kind: BlockKind, name: String },

    /// A name is already taken in the target scope.
    #[error("Name collision: {kind}:{name}")]
    NameCollision { kind: BlockKind, name: String },

    /// A remap left a reference pointing at a remapped or destroyed block.
    #[error("Dangling reference after remap: {owner} -> {target}")]
    DanglingReferenceAfterRemap { owner: BlockId, target: BlockId },

    /// An operation was called in the wrong process stage.
    #[error("Stage violation: expected {expected}, context is in {found}")]
    StageViolation { expected: String, found: String },

    /// A library was registered after items already exist.
    #[error("Libraries cannot be added once items are registered")]
    LibraryAfterItems,

    /// A library index outside the registered range.
    #[error("Invalid library index: {0}")]
    InvalidLibraryIndex(usize),

    /// An item handle that does not belong to this context, or an invalid request.
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// An operation that the context's mode does not support.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The requested block does not exist in the database.
    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    /// The requested library does not exist in the database.
    #[error("Library not found: {0}")]
    LibraryNotFound(LibraryId),

    /// Empty, oversized or otherwise unusable block name.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// Unrecognized block kind name.
    #[error("Unknown block kind: {0}")]
    UnknownKind(String),

    /// Malformed weak reference.
    #[error("Invalid weak reference: {0}")]
    InvalidWeakReference(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in BlockKind::ALL {
            assert_eq!(BlockKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(BlockKind::from_code(0), None);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("mesh".parse::<BlockKind>().ok(), Some(BlockKind::Mesh));
        assert_eq!("NodeTree".parse::<BlockKind>().ok(), Some(BlockKind::NodeTree));
        assert!(matches!(
            "Spaceship".parse::<BlockKind>(),
            Err(TetherError::UnknownKind(_))
        ));
    }

    #[test]
    fn shape_keys_are_not_linkable() {
        assert!(!BlockKind::ShapeKey.is_linkable());
        assert!(BlockKind::Mesh.is_linkable());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = KindFilter::empty();
        assert!(BlockKind::ALL.iter().all(|k| filter.matches(*k)));

        let meshes = KindFilter::MESH;
        assert!(meshes.matches(BlockKind::Mesh));
        assert!(!meshes.matches(BlockKind::Object));
    }

    #[test]
    fn targets_include_embedded_and_override_edges() {
        let mut block = DataBlock::new(
            BlockId(1),
            BlockKind::Object,
            "Suzanne".to_string(),
            Scope::Local,
        );
        block.references.push(Reference::new("data", Some(BlockId(2))));
        block.references.push(Reference::new("material", None));
        block.embedded.push(EmbeddedRecord {
            name: "modifiers".to_string(),
            references: vec![Reference::new("target", Some(BlockId(3)))],
        });
        block.override_meta = Some(OverrideMeta {
            reference: Some(BlockId(4)),
            runtime: false,
        });

        assert_eq!(
            block.targets(),
            vec![
                (BlockId(2), EdgeKind::Content),
                (BlockId(3), EdgeKind::Content),
                (BlockId(4), EdgeKind::OverrideReference),
            ]
        );
        assert!(block.is_override());
        assert!(block.references_in_slot("target", BlockId(3)));
    }
}
