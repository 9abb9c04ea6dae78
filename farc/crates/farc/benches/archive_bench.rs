//! FARC Benchmarks
//!
//! Build, write and load throughput over synthetic graphs.
//! Run with: `cargo bench --package farc`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use farc::{
    ArchiveBuilder, ArchiveConfig, ArchiveFile, LiveVtables, MapOptions, MappedArchive,
    MemoryGraph, MetaKind, PtrMap,
};

fn config() -> ArchiveConfig {
    ArchiveConfig {
        heap_archiving: false,
        core_region_alignment: 4096,
        ..Default::default()
    }
}

/// `classes` classes, each with a name, a method and a constant pool
fn graph(classes: usize) -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    for i in 0..classes {
        let name = format!("bench/Class{i:06}");
        let class = graph.add_class(MetaKind::InstanceClass, &name, 48).unwrap();
        let symbol = graph.add_symbol(&name);
        let method = graph.add_metadata(MetaKind::Method, 32).unwrap();
        let pool = graph.add_metadata(MetaKind::ConstantPool, 32).unwrap();
        graph.set_pointer(class, 8, symbol).unwrap();
        graph.set_pointer(class, 16, method).unwrap();
        graph.set_pointer(method, 8, pool).unwrap();
        graph.set_pointer(pool, 8, class).unwrap();
        graph.set_pointer(pool, 16, symbol).unwrap();
    }
    graph
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    let live = LiveVtables::standard();

    for classes in [100usize, 1_000, 10_000] {
        let graph = graph(classes);
        group.throughput(Throughput::Elements(graph.metadata_count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(classes), &graph, |b, graph| {
            b.iter(|| {
                let built = ArchiveBuilder::new(config(), graph, &live)
                    .unwrap()
                    .build()
                    .unwrap();
                black_box(built.core_size())
            })
        });
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    let live = LiveVtables::standard();
    let dir = tempfile::tempdir().unwrap();

    for classes in [1_000usize, 10_000] {
        let built = ArchiveBuilder::new(config(), &graph(classes), &live)
            .unwrap()
            .build()
            .unwrap();
        let path = dir.path().join(format!("bench-{classes}.farc"));
        built.write(&path).unwrap();
        group.throughput(Throughput::Bytes(built.core_size() as u64));

        group.bench_with_input(BenchmarkId::new("open", classes), &path, |b, path| {
            b.iter(|| black_box(ArchiveFile::open(path, &config()).unwrap()))
        });

        let file = ArchiveFile::open(&path, &config()).unwrap();
        group.bench_with_input(BenchmarkId::new("map_relocated", classes), &file, |b, file| {
            b.iter(|| {
                let options = MapOptions {
                    relocate_to: Some(0x20_0000_0000),
                    ..Default::default()
                };
                let mut mapped = MappedArchive::map(file, options).unwrap();
                mapped.splice_vtables(&live).unwrap();
                black_box(mapped.relocated_pointers())
            })
        });
    }

    group.finish();
}

fn bench_ptrmap(c: &mut Criterion) {
    let mut group = c.benchmark_group("ptrmap");
    let bits = 1 << 20;

    group.bench_function("mark_every_third", |b| {
        b.iter(|| {
            let mut map = PtrMap::with_size(bits);
            for bit in (0..bits).step_by(3) {
                map.mark(bit).unwrap();
            }
            black_box(map.compact().unwrap())
        })
    });

    let mut sparse = PtrMap::with_size(bits);
    for bit in (0..bits).step_by(97) {
        sparse.mark(bit).unwrap();
    }
    group.bench_function("iter_sparse", |b| {
        b.iter(|| black_box(sparse.iter_set().count()))
    });

    group.finish();
}

criterion_group!(benches, bench_build, bench_load, bench_ptrmap);
criterion_main!(benches);
