//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! Each command has a `run_*` function returning a serializable summary and
//! a `cmd_*` wrapper printing it as text or JSON.

use super::ImportArgs;
use crate::config::{Config, parse_flags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tether_core::asset_registry::{self, resolve};
use tether_core::{
    ArchiveCodec, ArchiveContents, BlockKind, BlockListing, BlockTags, Database, DiagnosticKind,
    FileCodec, ImportContext, KindFilter, LinkFlags, LinkParams, OverrideFlags, RawBlock,
    RawTarget, RedbArchive, Reports, TetherError, WeakReference, write_archive_file,
};
use tracing::{debug, info};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a JSON archive description (50 MB).
const MAX_DESCRIPTION_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TetherError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TetherError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(TetherError::SerializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Validate output path: the parent directory must exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, TetherError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let canonical_parent = parent.canonicalize().map_err(|e| {
        TetherError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;
    let filename = path
        .file_name()
        .ok_or_else(|| TetherError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn print_reports(reports: &Reports) {
    if reports.is_empty() {
        return;
    }
    println!();
    println!("Diagnostics:");
    for entry in reports.entries() {
        println!("  [{:?}] {:?}: {}", entry.level, entry.kind, entry.message);
    }
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

/// Parse `Kind:Name`. The kind is matched case-insensitively.
pub fn parse_item_spec(spec: &str) -> Result<(BlockKind, String), TetherError> {
    let (kind, name) = spec.split_once(':').ok_or_else(|| {
        TetherError::InvalidItem(format!("Expected Kind:Name, got '{}'", spec))
    })?;
    let kind = parse_kind(kind)?;
    if name.is_empty() {
        return Err(TetherError::InvalidName(name.to_string()));
    }
    Ok((kind, name.to_string()))
}

pub fn parse_kind(name: &str) -> Result<BlockKind, TetherError> {
    BlockKind::from_group_name(name.trim()).ok_or_else(|| TetherError::UnknownKind(name.to_string()))
}

fn kind_filter(kinds: &[String]) -> Result<KindFilter, TetherError> {
    kinds
        .iter()
        .try_fold(KindFilter::empty(), |filter, kind| Ok(filter | parse_kind(kind)?.filter()))
}

pub fn override_flags(use_existing: bool, runtime: bool) -> OverrideFlags {
    let mut flags = OverrideFlags::empty();
    flags.set(OverrideFlags::USE_EXISTING, use_existing);
    flags.set(OverrideFlags::RUNTIME, runtime);
    flags
}

// =============================================================================
// LIST COMMAND
// =============================================================================

/// List the blocks of `library`.
pub fn run_list(
    config: &Config,
    library: &str,
    kinds: &[String],
    assets_only: bool,
) -> Result<Vec<BlockListing>, TetherError> {
    let path = config.resolve_library(library);
    let filter = kind_filter(kinds)?;
    let mut reader = FileCodec.open(&path)?;
    let listings = reader.enumerate_blocks(filter, assets_only)?;
    debug!(path = %path, count = listings.len(), "listed archive");
    Ok(listings)
}

pub fn cmd_list(
    config: &Config,
    library: &str,
    kinds: &[String],
    assets_only: bool,
    json_mode: bool,
) -> Result<(), TetherError> {
    let listings = run_list(config, library, kinds, assets_only)?;

    if json_mode {
        print_json(&listings);
        return Ok(());
    }

    println!("Archive: {}", library);
    println!("Blocks:  {}", listings.len());
    println!();
    for listing in &listings {
        match listing.asset.as_ref().and_then(|a| a.description.as_deref()) {
            Some(description) => println!(
                "  {:<12} {}  ({})",
                listing.kind.to_string(),
                listing.name,
                description
            ),
            None => println!("  {:<12} {}", listing.kind.to_string(), listing.name),
        }
    }
    Ok(())
}

// =============================================================================
// LINK / APPEND COMMANDS
// =============================================================================

/// Which stages an import run goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Link only, optionally creating overrides of the linked items.
    Link { overrides: Option<OverrideFlags> },
    Append,
}

/// One item of an import run, as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub kind: BlockKind,
    pub name: String,
    pub indirect: bool,
    pub action: String,
    /// Name of the block the item resolved to, if any.
    pub block: Option<String>,
    /// Archive path of a linked result, `None` for local data.
    pub library: Option<String>,
    pub placeholder: bool,
    pub override_block: Option<String>,
}

/// Result of a `link` or `append` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub mode: String,
    pub flags: Vec<String>,
    pub items: Vec<ItemReport>,
    pub overrides: usize,
    pub placed: usize,
    pub local_blocks: usize,
    pub linked_blocks: usize,
    pub reports: Reports,
}

/// Link or append the requested blocks into a fresh session.
pub fn run_import(
    config: &Config,
    args: &ImportArgs,
    mode: ImportMode,
) -> Result<ImportSummary, TetherError> {
    let mut flags = parse_flags(config.link_flags()?, &args.flags)?;
    flags.set(LinkFlags::LINK, matches!(mode, ImportMode::Link { .. }));

    let codec = FileCodec;
    let mut db = Database::new();
    let mut reports = Reports::new();
    let mut params = LinkParams::new(flags);
    if args.instantiate {
        let scene = db.create_scene("Scene")?;
        params = params.with_scene(scene, None);
    }

    let mut ctx = ImportContext::new(&codec, params);
    let mut libraries = Vec::new();
    for library in &args.libraries {
        libraries.push(ctx.add_library(&config.resolve_library(library))?);
    }

    for kind in &args.all_of {
        let filter = parse_kind(kind)?.filter();
        for library in &libraries {
            if let Err(e) = ctx.enumerate_items_of_type(*library, filter) {
                reports.warning(DiagnosticKind::LibraryNotFound, e.to_string());
            }
        }
    }
    for spec in &args.items {
        let (kind, name) = parse_item_spec(spec)?;
        let item = ctx.add_item(kind, &name, None)?;
        for library in &libraries {
            ctx.enable_item_for_library(item, *library)?;
        }
    }
    if ctx.is_empty() {
        return Err(TetherError::InvalidOperation(
            "Nothing to import: pass --item or --all-of".to_string(),
        ));
    }
    info!(items = ctx.item_count(), libraries = ctx.library_count(), "importing");

    ctx.link(&mut db, &mut reports)?;
    let overrides = match mode {
        ImportMode::Link {
            overrides: Some(override_flags),
        } => ctx.create_overrides(&mut db, override_flags, &mut reports)?,
        ImportMode::Link { overrides: None } => 0,
        ImportMode::Append => {
            ctx.append(&mut db, &mut reports)?;
            0
        }
    };
    let placed = if args.instantiate {
        ctx.instantiate(&mut db, &mut reports)?
    } else {
        0
    };

    let items = ctx
        .items()
        .map(|(_, item)| {
            let block = item.resolved().and_then(|id| db.get(id));
            ItemReport {
                kind: item.kind(),
                name: item.name().to_string(),
                indirect: item.is_indirect(),
                action: item.action().name().to_string(),
                block: block.map(|b| b.name.clone()),
                library: item
                    .resolved()
                    .and_then(|id| db.library_path_of(id))
                    .map(str::to_string),
                placeholder: block.is_some_and(|b| b.tags.contains(BlockTags::MISSING)),
                override_block: item
                    .override_block()
                    .and_then(|id| db.get(id))
                    .map(|b| b.name.clone()),
            }
        })
        .collect();
    ctx.finalize(&mut db)?;

    Ok(ImportSummary {
        mode: match mode {
            ImportMode::Link { .. } => "link".to_string(),
            ImportMode::Append => "append".to_string(),
        },
        flags: LinkFlags::NAMES
            .iter()
            .filter(|(_, flag)| flags.contains(*flag))
            .map(|(name, _)| name.to_string())
            .collect(),
        items,
        overrides,
        placed,
        local_blocks: db.blocks().filter(|b| b.scope.is_local()).count(),
        linked_blocks: db.blocks().filter(|b| b.is_linked()).count(),
        reports,
    })
}

pub fn cmd_import(
    config: &Config,
    args: &ImportArgs,
    mode: ImportMode,
    json_mode: bool,
) -> Result<(), TetherError> {
    let summary = run_import(config, args, mode)?;

    if json_mode {
        print_json(&summary);
        return Ok(());
    }

    println!("Mode:   {}", summary.mode);
    println!("Flags:  {}", summary.flags.join(", "));
    println!();
    println!(
        "  {:<10} {:<24} {:<12} {:<9} SOURCE",
        "KIND", "NAME", "ACTION", "INDIRECT"
    );
    for item in &summary.items {
        let source = match (&item.block, &item.library) {
            (None, _) => "unresolved".to_string(),
            (Some(_), Some(library)) if item.placeholder => format!("{} (placeholder)", library),
            (Some(_), Some(library)) => library.clone(),
            (Some(block), None) => format!("local '{}'", block),
        };
        println!(
            "  {:<10} {:<24} {:<12} {:<9} {}",
            item.kind.to_string(),
            item.name,
            item.action,
            if item.indirect { "yes" } else { "no" },
            source
        );
    }
    println!();
    println!("Local blocks:  {}", summary.local_blocks);
    println!("Linked blocks: {}", summary.linked_blocks);
    if summary.overrides > 0 {
        println!("Overrides:     {}", summary.overrides);
    }
    if summary.placed > 0 {
        println!("Placed:        {}", summary.placed);
    }
    print_reports(&summary.reports);
    Ok(())
}

// =============================================================================
// BUILD COMMAND
// =============================================================================

/// JSON description of an archive, as read by `tether build`.
///
/// ```json
/// { "blocks": [
///     { "kind": "Object", "name": "Chair",
///       "refs": [ { "slot": "data", "target": "Mesh:Seat" } ] },
///     { "kind": "Mesh", "name": "Seat", "asset": "A plain seat" }
/// ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveDescription {
    pub blocks: Vec<BlockDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockDescription {
    pub kind: String,
    pub name: String,
    pub refs: Vec<RefDescription>,
    pub embedded: Vec<EmbeddedDescription>,
    /// `Kind:Name` of the block this one overrides.
    pub override_of: Option<String>,
    /// Asset description; marks the block as an asset.
    pub asset: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefDescription {
    pub slot: String,
    /// `Kind:Name`.
    pub target: String,
    /// Other archive holding the target.
    #[serde(default)]
    pub library: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddedDescription {
    pub record: String,
    pub slot: String,
    pub target: String,
}

impl ArchiveDescription {
    /// Turn the description into archive contents.
    pub fn to_contents(&self) -> Result<ArchiveContents, TetherError> {
        let mut contents = ArchiveContents::new();
        for description in &self.blocks {
            contents.push(description.to_raw()?);
        }
        Ok(contents)
    }
}

impl BlockDescription {
    fn to_raw(&self) -> Result<RawBlock, TetherError> {
        let mut raw = RawBlock::new(parse_kind(&self.kind)?, &self.name);
        for reference in &self.refs {
            let (kind, name) = parse_item_spec(&reference.target)?;
            raw = match &reference.library {
                Some(library) => raw.with_external_ref(&reference.slot, library, kind, &name),
                None => raw.with_ref(&reference.slot, kind, &name),
            };
        }
        for embedded in &self.embedded {
            let (kind, name) = parse_item_spec(&embedded.target)?;
            raw = raw.with_embedded_ref(&embedded.record, &embedded.slot, kind, &name);
        }
        if let Some(target) = &self.override_of {
            let (kind, name) = parse_item_spec(target)?;
            raw = raw.with_override_of(RawTarget::local(kind, &name));
        }
        if let Some(description) = &self.asset {
            raw = raw.as_asset(description);
        }
        raw.properties = self.properties.clone();
        Ok(raw)
    }
}

/// Result of a `build` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub output: String,
    pub format: String,
    pub blocks: usize,
}

/// Build an archive at `output` from the JSON description at `input`.
pub fn run_build(input: &Path, output: &Path, format: &str) -> Result<BuildSummary, TetherError> {
    validate_file_size(input, MAX_DESCRIPTION_FILE_SIZE)?;
    let raw = std::fs::read_to_string(input)
        .map_err(|e| TetherError::IoError(format!("Cannot read '{}': {}", input.display(), e)))?;
    let description: ArchiveDescription = serde_json::from_str(&raw)
        .map_err(|e| TetherError::DeserializationError(format!("Invalid description: {}", e)))?;
    let contents = description.to_contents()?;
    let output = validate_output_path(output)?;

    match format {
        "tether" => write_archive_file(&output, &contents)?,
        "redb" => {
            RedbArchive::create(&output, &contents)?;
        }
        _ => {
            return Err(TetherError::SerializationError(format!(
                "Unknown format: {}",
                format
            )));
        }
    }
    info!(output = %output.display(), format, blocks = contents.blocks.len(), "archive built");

    Ok(BuildSummary {
        output: output.to_string_lossy().into_owned(),
        format: format.to_string(),
        blocks: contents.blocks.len(),
    })
}

pub fn cmd_build(
    input: &Path,
    output: &Path,
    format: &str,
    json_mode: bool,
) -> Result<(), TetherError> {
    let summary = run_build(input, output, format)?;

    if json_mode {
        print_json(&summary);
        return Ok(());
    }

    println!("Wrote {} blocks to {} ({})", summary.blocks, summary.output, summary.format);
    Ok(())
}

// =============================================================================
// RESOLVE COMMAND
// =============================================================================

/// Result of a `resolve` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveSummary {
    pub reference: WeakReference,
    pub found: bool,
    pub kind: BlockKind,
    pub name: String,
    /// Blocks imported into the archive's asset database.
    pub imported: usize,
    pub reports: Reports,
}

/// Resolve `Kind:Name` inside `archive` through the process-wide asset registry.
pub fn run_resolve(config: &Config, archive: &str, item: &str) -> Result<ResolveSummary, TetherError> {
    let (kind, name) = parse_item_spec(item)?;
    let weak = WeakReference::in_library(config.asset_root.as_deref(), archive, kind, &name);
    let path = weak
        .split()?
        .library_path
        .ok_or_else(|| TetherError::InvalidWeakReference(weak.to_string()))?;
    let mut reports = Reports::new();

    let (resolved, imported) = {
        let mut registry = asset_registry::global();
        let resolved = resolve(&weak, kind, &Database::new(), &mut registry, &FileCodec, &mut reports)?;
        let imported = registry.database(&path).map_or(0, Database::len);
        (resolved, imported)
    };
    asset_registry::clear_all();

    Ok(ResolveSummary {
        reference: weak,
        found: resolved.is_some(),
        kind,
        name,
        imported,
        reports,
    })
}

pub fn cmd_resolve(
    config: &Config,
    archive: &str,
    item: &str,
    json_mode: bool,
) -> Result<(), TetherError> {
    let summary = run_resolve(config, archive, item)?;

    if json_mode {
        print_json(&summary);
        return Ok(());
    }

    println!("Reference: {}", summary.reference);
    if summary.found {
        println!("Resolved:  {} '{}'", summary.kind, summary.name);
        println!("Imported:  {} blocks", summary.imported);
    } else {
        println!("Not found: {} '{}'", summary.kind, summary.name);
    }
    print_reports(&summary.reports);
    Ok(())
}
