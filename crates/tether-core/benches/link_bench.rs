//! # Link Benchmarks
//!
//! Performance benchmarks for tether-core linking and appending.
//!
//! Run with: `cargo bench -p tether-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tether_core::primitives::{SLOT_CHILD, SLOT_DATA, SLOT_OBJECT};
use tether_core::{
    ArchiveContents, BlockKind, Database, ImportContext, LinkFlags, LinkParams, MemoryCodec,
    RawBlock, RemapScope, Remapper, Reports, Scope,
};

/// One collection holding `size` objects that all share one mesh.
fn wide_archive(size: usize) -> ArchiveContents {
    let mut root = RawBlock::new(BlockKind::Collection, "Root");
    let mut contents = ArchiveContents::new().with(RawBlock::new(BlockKind::Mesh, "Shared"));
    for i in 0..size {
        let name = format!("Ob{i}");
        root = root.with_ref(SLOT_OBJECT, BlockKind::Object, &name);
        contents.push(RawBlock::new(BlockKind::Object, &name).with_ref(
            SLOT_DATA,
            BlockKind::Mesh,
            "Shared",
        ));
    }
    contents.with(root)
}

/// A chain of `size` nested collections.
fn deep_archive(size: usize) -> ArchiveContents {
    let mut contents = ArchiveContents::new();
    for i in 0..size {
        let mut block = RawBlock::new(BlockKind::Collection, &format!("Level{i}"));
        if i + 1 < size {
            block = block.with_ref(SLOT_CHILD, BlockKind::Collection, &format!("Level{}", i + 1));
        }
        contents.push(block);
    }
    contents
}

/// Request `root` from `codec` and run the stages up to `append` if asked.
fn import(codec: &MemoryCodec, root: &str, flags: LinkFlags, append: bool) -> Database {
    let mut db = Database::new();
    let mut reports = Reports::new();
    let mut ctx = ImportContext::new(codec, LinkParams::new(flags));
    let lib = ctx.add_library("bench.tether").expect("library");
    let item = ctx
        .add_item(BlockKind::Collection, root, None)
        .expect("item");
    ctx.enable_item_for_library(item, lib).expect("enable");
    ctx.link(&mut db, &mut reports).expect("link");
    if append {
        ctx.append(&mut db, &mut reports).expect("append");
    }
    ctx.finalize(&mut db).expect("finalize");
    db
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_link_wide(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_wide");

    for size in [10, 100, 1000].iter() {
        let codec = MemoryCodec::new().with("bench.tether", wide_archive(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(import(&codec, "Root", LinkFlags::LINK, false)));
        });
    }

    group.finish();
}

fn bench_link_deep(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_deep");

    for size in [10, 100, 500].iter() {
        let codec = MemoryCodec::new().with("bench.tether", deep_archive(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(import(&codec, "Level0", LinkFlags::LINK, false)));
        });
    }

    group.finish();
}

fn bench_append_wide(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_wide");

    for size in [10, 100, 1000].iter() {
        let codec = MemoryCodec::new().with("bench.tether", wide_archive(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(import(&codec, "Root", LinkFlags::default(), true)));
        });
    }

    group.finish();
}

fn bench_remap(c: &mut Criterion) {
    let mut group = c.benchmark_group("remap_all");

    for size in [100, 1000, 10000].iter() {
        let mut db = Database::new();
        let old = db
            .create_block(BlockKind::Mesh, "Old", Scope::Local)
            .expect("old");
        let new = db
            .create_block(BlockKind::Mesh, "New", Scope::Local)
            .expect("new");
        for i in 0..*size {
            let ob = db
                .create_block(BlockKind::Object, &format!("Ob{i}"), Scope::Local)
                .expect("object");
            db.add_reference(ob, SLOT_DATA, old).expect("reference");
        }
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut db = db.clone();
                let mut remapper = Remapper::new();
                remapper.add(old, Some(new));
                black_box(remapper.apply(&mut db, RemapScope::All).expect("remap"))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_link_wide,
    bench_link_deep,
    bench_append_wide,
    bench_remap,
);
criterion_main!(benches);
