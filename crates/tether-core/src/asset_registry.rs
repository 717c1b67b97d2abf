//! # Asset Library Registry
//!
//! Resolves [`WeakReference`]s back to data-blocks.
//!
//! References to local data are looked up in the caller's database and never
//! import anything. References into an archive are served from a secondary
//! database kept per archive path; on a miss, a one-item append fills it.
//! Secondary databases are never merged into the caller's database, so asset
//! names cannot collide with unrelated local names.
//!
//! A process-wide registry is available through [`global`]. Tear it down
//! explicitly with [`clear_all`].

use crate::archive::ArchiveCodec;
use crate::report::DiagnosticKind;
use crate::weak_ref::WeakReference;
use crate::{BlockId, BlockKind, BlockTags, Database, ImportContext, LinkParams, Reports, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace};

/// Secondary databases keyed by archive path.
#[derive(Debug, Default)]
pub struct AssetDatabases {
    databases: BTreeMap<String, Database>,
}

impl AssetDatabases {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self, path: &str) -> Option<&Database> {
        self.databases.get(path)
    }

    /// The database for `path`, created empty on first use.
    pub fn ensure(&mut self, path: &str) -> &mut Database {
        self.databases.entry(path.to_string()).or_default()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Drop every secondary database.
    pub fn clear_all(&mut self) {
        debug!(count = self.databases.len(), "clearing asset databases");
        self.databases.clear();
    }
}

static REGISTRY: OnceLock<Mutex<AssetDatabases>> = OnceLock::new();

/// Lock the process-wide registry.
pub fn global() -> MutexGuard<'static, AssetDatabases> {
    REGISTRY
        .get_or_init(|| Mutex::new(AssetDatabases::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Tear down the process-wide registry.
pub fn clear_all() {
    global().clear_all();
}

/// Where a weak reference resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedBlock {
    /// A block of the caller's database.
    Local(BlockId),
    /// A block of the secondary database for `path`.
    Library { path: String, block: BlockId },
}

impl ResolvedBlock {
    #[must_use]
    pub fn block(&self) -> BlockId {
        match self {
            ResolvedBlock::Local(block) | ResolvedBlock::Library { block, .. } => *block,
        }
    }
}

/// Resolve `weak` to a block of `kind`.
///
/// Returns `Ok(None)` when the named block does not exist; an archive that
/// cannot be read is reported in `reports`, not returned as an error.
pub fn resolve(
    weak: &WeakReference,
    kind: BlockKind,
    target: &Database,
    registry: &mut AssetDatabases,
    codec: &dyn ArchiveCodec,
    reports: &mut Reports,
) -> Result<Option<ResolvedBlock>, TetherError> {
    let parts = weak.split()?;
    if parts.kind != kind {
        return Err(TetherError::InvalidWeakReference(format!(
            "{weak} names a {}, expected {kind}",
            parts.kind
        )));
    }

    let Some(path) = parts.library_path else {
        return Ok(target.find_local(kind, &parts.name).map(ResolvedBlock::Local));
    };

    let db = registry.ensure(&path);
    if let Some(block) = db.find_local(kind, &parts.name) {
        trace!(%path, %kind, name = %parts.name, "asset cache hit");
        return Ok(Some(ResolvedBlock::Library { path, block }));
    }

    let mut ctx = ImportContext::new(codec, LinkParams::default());
    let library = ctx.add_library(&path)?;
    let item = ctx.add_item(kind, &parts.name, None)?;
    ctx.enable_item_for_library(item, library)?;
    ctx.link(db, reports)?;
    ctx.append(db, reports)?;
    let resolved = ctx.item_resolved(item);
    ctx.finalize(db)?;
    db.tag_all(|_| true, BlockTags::ASSET_LIBRARY_DATA, true);

    match resolved {
        Some(block) => {
            debug!(%path, %kind, name = %parts.name, %block, "asset imported");
            Ok(Some(ResolvedBlock::Library { path, block }))
        }
        None => {
            reports.warning(
                DiagnosticKind::AssetResolution,
                format!("Cannot resolve {weak}"),
            );
            Ok(None)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveContents, MemoryCodec, RawBlock};
    use crate::weak_ref::make_reference;
    use crate::Scope;

    fn codec() -> MemoryCodec {
        MemoryCodec::new().with(
            "/lib/materials.tether",
            ArchiveContents::new().with(
                RawBlock::new(BlockKind::Material, "Brick")
                    .with_ref("texture", BlockKind::Image, "BrickColor"),
            )
            .with(RawBlock::new(BlockKind::Image, "BrickColor")),
        )
    }

    #[test]
    fn local_reference_round_trips_without_import() {
        let mut db = Database::new();
        let cube = db
            .create_block(BlockKind::Mesh, "Cube", Scope::Local)
            .expect("cube");
        let weak = make_reference(&db, cube).expect("reference");
        let mut registry = AssetDatabases::new();
        let mut reports = Reports::new();

        let resolved = resolve(
            &weak,
            BlockKind::Mesh,
            &db,
            &mut registry,
            &MemoryCodec::new(),
            &mut reports,
        )
        .expect("resolve");
        assert_eq!(resolved, Some(ResolvedBlock::Local(cube)));
        assert!(registry.is_empty());
    }

    #[test]
    fn library_reference_imports_once_then_hits_cache() {
        let codec = codec();
        let db = Database::new();
        let weak = WeakReference::in_library(
            Some("/lib"),
            "materials.tether",
            BlockKind::Material,
            "Brick",
        );
        let mut registry = AssetDatabases::new();
        let mut reports = Reports::new();

        let first = resolve(&weak, BlockKind::Material, &db, &mut registry, &codec, &mut reports)
            .expect("resolve")
            .expect("found");
        let cached = resolve(
            &weak,
            BlockKind::Material,
            &db,
            &mut registry,
            &MemoryCodec::new(),
            &mut reports,
        )
        .expect("resolve")
        .expect("cached");
        assert_eq!(first, cached);
        assert!(db.is_empty());

        let secondary = registry.database("/lib/materials.tether").expect("secondary");
        assert!(
            secondary
                .blocks()
                .all(|b| b.tags.contains(BlockTags::ASSET_LIBRARY_DATA))
        );
        assert!(secondary.find_local(BlockKind::Image, "BrickColor").is_some());
    }

    #[test]
    fn absent_asset_resolves_to_none() {
        let codec = codec();
        let db = Database::new();
        let weak = WeakReference::in_library(
            Some("/lib"),
            "materials.tether",
            BlockKind::Material,
            "Marble",
        );
        let mut registry = AssetDatabases::new();
        let mut reports = Reports::new();

        let resolved = resolve(&weak, BlockKind::Material, &db, &mut registry, &codec, &mut reports)
            .expect("resolve");
        assert_eq!(resolved, None);
        assert_eq!(reports.count(DiagnosticKind::AssetResolution), 1);
        assert_eq!(reports.count(DiagnosticKind::ItemNotFound), 1);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let weak = WeakReference::local(BlockKind::Mesh, "Cube");
        let mut registry = AssetDatabases::new();
        let mut reports = Reports::new();
        assert!(matches!(
            resolve(
                &weak,
                BlockKind::Material,
                &Database::new(),
                &mut registry,
                &MemoryCodec::new(),
                &mut reports
            ),
            Err(TetherError::InvalidWeakReference(_))
        ));
    }

    #[test]
    fn global_registry_clears() {
        global().ensure("/tmp/a.tether");
        assert!(!global().is_empty());
        clear_all();
        assert!(global().is_empty());
    }
}
