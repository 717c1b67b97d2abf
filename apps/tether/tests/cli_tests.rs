//! Integration tests for the tether command implementations.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use clap::Parser;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tether::cli::{
    Cli, Commands, ImportArgs, ImportMode, override_flags, parse_item_spec, run_build,
    run_import, run_list, run_resolve,
};
use tether::config::Config;
use tether_core::{BlockKind, DiagnosticKind, OverrideFlags, TetherError};

const PROPS: &str = r#"{
  "blocks": [
    { "kind": "Collection", "name": "Room",
      "refs": [ { "slot": "object", "target": "Object:Chair" },
                { "slot": "object", "target": "Object:Table" } ] },
    { "kind": "Object", "name": "Chair",
      "refs": [ { "slot": "data", "target": "Mesh:Seat" } ] },
    { "kind": "Object", "name": "Table",
      "refs": [ { "slot": "data", "target": "Mesh:Top" } ] },
    { "kind": "Mesh", "name": "Seat",
      "refs": [ { "slot": "material", "target": "Material:Oak" } ] },
    { "kind": "Mesh", "name": "Top",
      "refs": [ { "slot": "material", "target": "Material:Oak" } ] },
    { "kind": "Material", "name": "Oak", "asset": "Oiled oak" }
  ]
}"#;

/// Build `props.<ext>` in a fresh directory.
fn props_archive(format: &str, extension: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("props.json");
    std::fs::write(&input, PROPS).unwrap();
    let output = dir.path().join(format!("props.{}", extension));
    let summary = run_build(&input, &output, format).unwrap();
    assert_eq!(summary.blocks, 6);
    (dir, output)
}

fn request(library: &Path, items: &[&str]) -> ImportArgs {
    ImportArgs {
        libraries: vec![library.to_string_lossy().into_owned()],
        items: items.iter().map(|s| s.to_string()).collect(),
        ..ImportArgs::default()
    }
}

// =============================================================================
// ARGUMENT PARSING TESTS
// =============================================================================

#[test]
fn test_parse_item_spec() {
    assert_eq!(
        parse_item_spec("mesh:Cube.001").unwrap(),
        (BlockKind::Mesh, "Cube.001".to_string())
    );
    assert!(matches!(
        parse_item_spec("Cube"),
        Err(TetherError::InvalidItem(_))
    ));
    assert!(matches!(
        parse_item_spec("Gadget:Cube"),
        Err(TetherError::UnknownKind(_))
    ));
    assert!(matches!(
        parse_item_spec("Mesh:"),
        Err(TetherError::InvalidName(_))
    ));
}

#[test]
fn test_cli_parses_append_request() {
    let cli = Cli::try_parse_from([
        "tether", "--json", "append", "-l", "a.tether", "-l", "b.tether", "-i", "Mesh:Cube",
        "-f", "recursive", "--instantiate",
    ])
    .unwrap();

    assert!(cli.json);
    match cli.command {
        Commands::Append { request } => {
            assert_eq!(request.libraries, vec!["a.tether", "b.tether"]);
            assert_eq!(request.items, vec!["Mesh:Cube"]);
            assert_eq!(request.flags, vec!["recursive"]);
            assert!(request.instantiate);
        }
        other => panic!("unexpected command: {:?}", other),
    }
}

#[test]
fn test_cli_override_options_require_overrides() {
    assert!(
        Cli::try_parse_from(["tether", "link", "-l", "a.tether", "-i", "Mesh:Cube", "--runtime"])
            .is_err()
    );
    assert_eq!(
        override_flags(true, true),
        OverrideFlags::USE_EXISTING | OverrideFlags::RUNTIME
    );
}

// =============================================================================
// BUILD & LIST TESTS
// =============================================================================

#[test]
fn test_build_and_list_both_formats() {
    for (format, extension) in [("tether", "tether"), ("redb", "redb")] {
        let (_dir, archive) = props_archive(format, extension);
        let config = Config::default();
        let path = archive.to_string_lossy();

        let all = run_list(&config, &path, &[], false).unwrap();
        assert_eq!(all.len(), 6, "{format}");

        let objects = run_list(&config, &path, &["object".to_string()], false).unwrap();
        assert!(objects.iter().all(|l| l.kind == BlockKind::Object));
        assert_eq!(objects.len(), 2);

        let assets = run_list(&config, &path, &[], true).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "Oak");
    }
}

#[test]
fn test_build_rejects_unknown_format_and_bad_json() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("props.json");
    std::fs::write(&input, PROPS).unwrap();
    assert!(run_build(&input, &dir.path().join("out.zip"), "zip").is_err());

    std::fs::write(&input, r#"{ "blocks": [ { "kind": "Mesh", "nmae": "x" } ] }"#).unwrap();
    assert!(matches!(
        run_build(&input, &dir.path().join("out.tether"), "tether"),
        Err(TetherError::DeserializationError(_))
    ));
}

#[test]
fn test_list_missing_archive_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nowhere.tether");
    assert!(matches!(
        run_list(&Config::default(), &missing.to_string_lossy(), &[], false),
        Err(TetherError::ArchiveUnreadable { .. })
    ));
}

// =============================================================================
// LINK & APPEND TESTS
// =============================================================================

#[test]
fn test_append_makes_hierarchy_local() {
    let (_dir, archive) = props_archive("tether", "tether");
    let summary = run_import(
        &Config::default(),
        &request(&archive, &["Collection:Room"]),
        ImportMode::Append,
    )
    .unwrap();

    assert_eq!(summary.mode, "append");
    assert_eq!(summary.items.len(), 6);
    assert!(summary.items.iter().all(|i| i.action == "make-local"));
    assert!(summary.items.iter().all(|i| i.library.is_none()));
    assert_eq!(summary.local_blocks, 6);
    assert_eq!(summary.linked_blocks, 0);
    assert!(summary.reports.is_empty());
}

#[test]
fn test_link_with_overrides() {
    let (_dir, archive) = props_archive("tether", "tether");
    let summary = run_import(
        &Config::default(),
        &request(&archive, &["Object:Chair"]),
        ImportMode::Link {
            overrides: Some(OverrideFlags::empty()),
        },
    )
    .unwrap();

    assert_eq!(summary.mode, "link");
    assert!(summary.flags.contains(&"link".to_string()));
    let chair = summary.items.iter().find(|i| i.name == "Chair").unwrap();
    assert!(!chair.indirect);
    assert_eq!(chair.library.as_deref(), Some(archive.to_string_lossy().as_ref()));
    assert!(chair.override_block.is_some());
    // Chair, Seat and Oak each get an override.
    assert_eq!(summary.overrides, 3);
    assert_eq!(summary.reports.resolved_overrides, 3);
}

#[test]
fn test_link_instantiates_into_scene() {
    let (_dir, archive) = props_archive("tether", "tether");
    let mut args = request(&archive, &["Collection:Room"]);
    args.instantiate = true;

    let summary = run_import(&Config::default(), &args, ImportMode::Link { overrides: None }).unwrap();
    assert_eq!(summary.placed, 1);
    assert!(summary.items.iter().all(|i| i.action == "keep-linked"));
}

#[test]
fn test_missing_library_and_item_are_reported() {
    let (dir, archive) = props_archive("tether", "tether");
    let args = ImportArgs {
        libraries: vec![
            dir.path().join("gone.tether").to_string_lossy().into_owned(),
            archive.to_string_lossy().into_owned(),
        ],
        items: vec!["Object:Chair".to_string(), "Object:Sofa".to_string()],
        ..ImportArgs::default()
    };

    let summary = run_import(&Config::default(), &args, ImportMode::Append).unwrap();
    assert_eq!(summary.reports.missing_libraries, 1);
    assert_eq!(summary.reports.missing_items, 1);
    let sofa = summary.items.iter().find(|i| i.name == "Sofa").unwrap();
    assert!(sofa.block.is_none());
    let chair = summary.items.iter().find(|i| i.name == "Chair").unwrap();
    assert_eq!(chair.action, "make-local");
}

#[test]
fn test_all_of_enumerates_kind() {
    let (_dir, archive) = props_archive("redb", "redb");
    let args = ImportArgs {
        libraries: vec![archive.to_string_lossy().into_owned()],
        all_of: vec!["Mesh".to_string()],
        ..ImportArgs::default()
    };

    let summary = run_import(&Config::default(), &args, ImportMode::Link { overrides: None }).unwrap();
    let direct: Vec<_> = summary.items.iter().filter(|i| !i.indirect).collect();
    assert_eq!(direct.len(), 2);
    assert!(direct.iter().all(|i| i.kind == BlockKind::Mesh));
}

#[test]
fn test_empty_request_is_rejected() {
    let (_dir, archive) = props_archive("tether", "tether");
    assert!(matches!(
        run_import(&Config::default(), &request(&archive, &[]), ImportMode::Append),
        Err(TetherError::InvalidOperation(_))
    ));
}

#[test]
fn test_config_flags_apply_and_search_paths_find_archives() {
    let (dir, _archive) = props_archive("tether", "tether");
    let config = Config::parse(&format!(
        "flags = [\"no_rename_on_collision\"]\nsearch_paths = [{:?}]\n",
        dir.path().to_string_lossy()
    ))
    .unwrap();

    let summary = run_import(
        &config,
        &request(Path::new("props.tether"), &["Material:Oak"]),
        ImportMode::Append,
    )
    .unwrap();
    assert!(!summary.flags.contains(&"rename_on_collision".to_string()));
    assert_eq!(summary.items[0].action, "make-local");
}

// =============================================================================
// RESOLVE TESTS
// =============================================================================

#[test]
fn test_resolve_against_asset_root() {
    let (dir, _archive) = props_archive("tether", "tether");
    let config = Config {
        asset_root: Some(dir.path().to_string_lossy().into_owned()),
        ..Config::default()
    };

    let found = run_resolve(&config, "props.tether", "Mesh:Seat").unwrap();
    assert!(found.found);
    // Seat brings Oak along.
    assert_eq!(found.imported, 2);
    assert_eq!(found.reference.to_string(), format!("{}:props.tether/Mesh/Seat", dir.path().to_string_lossy()));

    let missing = run_resolve(&config, "props.tether", "Mesh:Sofa").unwrap();
    assert!(!missing.found);
    assert_eq!(missing.reports.count(DiagnosticKind::AssetResolution), 1);
}
