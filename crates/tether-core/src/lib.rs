//! # tether-core
//!
//! The link/append resolution engine for tether.
//!
//! Given a set of source archives and a list of named, typed data-blocks,
//! this crate brings those blocks into a session [`Database`]: either as
//! linked data owned by the archive's library, or appended as local data.
//! Indirect dependencies are discovered and resolved along the way, and
//! every reference is rewritten so nothing dangles afterwards.
//!
//! ## Workflow
//!
//! ```text
//! ImportContext::new(codec, params)
//!   add_library / add_item / enable_item_for_library      (Init)
//!   link                                                  (Linking)
//!   append                                                (Appending, not in link mode)
//!   instantiate                                           (Instantiating, optional)
//!   finalize                                              (Done)
//! ```
//!
//! Per-item failures (unreadable libraries, missing blocks, name clashes)
//! never abort a stage; they are collected in [`Reports`].
//!
//! ## Architectural Constraints
//!
//! - Synchronous and single-threaded: stages run to completion on the caller's thread
//! - Deterministic: ordered maps only, ids assigned in creation order
//! - Archives are only touched through the [`archive::ArchiveCodec`] boundary

// =============================================================================
// MODULES
// =============================================================================

pub mod archive;
pub mod asset_registry;
pub mod context;
pub mod database;
pub mod formats;
pub mod params;
pub mod primitives;
pub mod remap;
pub mod report;
pub mod storage;
pub mod types;
pub mod weak_ref;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AppendProvenance, AssetMetadata, BlockId, BlockKind, BlockTags, DataBlock, EdgeKind,
    EmbeddedRecord, KindFilter, LibraryId, OverrideMeta, RefLocation, Reference, Scope,
    TetherError,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use asset_registry::{AssetDatabases, ResolvedBlock};
pub use context::{
    AppendAction, ArchiveHandle, ForeachFilter, ImportContext, ImportItem, ItemId, ItemTags,
    LibraryDescriptor, LibraryMask, OverrideClass, OverrideFlags, ProcessStage, ProvenanceIndex,
    ReadDiagnostics, RelocateOutcome, relocate_library,
};
pub use database::{Database, LibraryRecord};
pub use params::{InstantiateTarget, LinkFlags, LinkParams};
pub use remap::{RemapOutcome, RemapScope, Remapper};
pub use report::{DiagnosticKind, ReportEntry, ReportLevel, Reports};
pub use weak_ref::{LibraryKind, WeakReference, WeakReferenceParts, make_reference};

// =============================================================================
// RE-EXPORTS: Archives (from archive, formats and storage modules)
// =============================================================================

pub use archive::{
    ArchiveCodec, ArchiveContents, ArchiveReader, BlockListing, FileCodec, MemoryArchive,
    MemoryCodec, RawBlock, RawTarget,
};
pub use formats::{
    ArchiveHeader, archive_from_bytes, archive_to_bytes, read_archive_file, write_archive_file,
};
pub use storage::RedbArchive;
