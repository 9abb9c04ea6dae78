//! Loader Tests
//!
//! Write archives to disk, open them again and map them at requested and
//! foreign bases.

mod common;

use common::*;
use farc::vtable::{methods, MethodFn};
use farc::{
    ArchiveError, ArchiveOffset, DispatchTable, LiveVtables, MapOptions, MappedArchive,
    MemoryGraph, RegionIndex, SourceAddr, VtableKind,
};

fn word(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn map_at(written: &WrittenArchive, base: u64) -> MappedArchive {
    let file = written.open(&core_config());
    let options = MapOptions {
        relocate_to: Some(base),
        ..Default::default()
    };
    MappedArchive::map(&file, options).expect("archive should map")
}

/// Mapping at the requested base touches nothing
///
/// **Bug this finds:** relocation pass running with a zero delta
#[test]
fn test_requested_base_needs_no_patching() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let mapped = map_at(&written, built.requested_base.raw());

    assert!(!mapped.was_relocated());
    assert_eq!(mapped.relocated_pointers(), 0);
    let image: Vec<u8> = built.rw.iter().chain(&built.ro).copied().collect();
    assert_eq!(mapped.bytes(), &image[..]);
}

/// Every pointer moves by exactly the base delta
///
/// **Bug this finds:** unmarked pointer slots, marked data slots
#[test]
fn test_foreign_base_shifts_every_pointer() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let requested = built.requested_base.raw();
    let actual = 0x12_3456_7000;
    let mapped = map_at(&written, actual);

    let image: Vec<u8> = built.rw.iter().chain(&built.ro).copied().collect();
    for offset in (0..image.len()).step_by(8) {
        let before = word(&image, offset);
        let after = word(mapped.bytes(), offset);
        if built.ptrmap.is_set(offset / 8) {
            assert_eq!(after - actual, before - requested, "pointer at {offset:#x}");
        } else {
            assert_eq!(after, before, "data at {offset:#x}");
        }
    }
    assert_eq!(mapped.relocated_pointers(), built.ptrmap.count_set());
}

/// Class and symbol tables decode at any base
#[test]
fn test_tables_survive_relocation() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let mapped = map_at(&written, 0x20_0000_0000);

    let names: Vec<_> = mapped.classes().unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["app/Main", "app/Util"]);
    assert_eq!(mapped.symbols().unwrap().len(), 2);
    assert!(mapped.subgraph_records().unwrap().is_empty());
}

fn tagged(_: &[u8]) -> u64 {
    42
}

fn zero(_: &[u8]) -> u64 {
    0
}

/// Archive built with one set of tables, loaded with another
///
/// **Bug this finds:** code addresses of the building process leaking into
/// the loading process
#[test]
fn test_loader_tables_replace_builder_tables() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let mut mapped = map_at(&written, 0x30_0000_0000);

    let mut live = LiveVtables::standard();
    live.register(DispatchTable::new(
        VtableKind::InstanceClass,
        vec![tagged as MethodFn, zero, zero],
    ));
    mapped.splice_vtables(&live).unwrap();

    let main = mapped.classes().unwrap()[0].offset;
    assert_eq!(mapped.dispatch(main, methods::KIND_TAG, &live).unwrap(), 42);
    assert_eq!(mapped.dispatch(main, methods::IS_ARRAY, &live).unwrap(), 0);
}

/// **Bug this finds:** splicing a table of a different shape
#[test]
fn test_table_length_mismatch_is_rejected() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let mut mapped = map_at(&written, 0x30_0000_0000);

    let mut live = LiveVtables::standard();
    live.register(DispatchTable::new(VtableKind::Method, vec![tagged as MethodFn]));
    let err = mapped.splice_vtables(&live).unwrap_err();
    assert!(matches!(err, ArchiveError::VtableMismatch { archived: 3, live: 1, .. }), "{err}");
}

/// **Bug this finds:** header fields read without checksum verification
#[test]
fn test_header_corruption_is_detected() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let mut bytes = written.bytes();
    bytes[200] ^= 0x01;
    std::fs::write(&written.path, &bytes).unwrap();

    let err = farc::ArchiveFile::open(&written.path, &core_config()).unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { ref what, .. } if what == "header"));
}

/// Build base, map it, layer a dynamic archive over it, map that too
///
/// **Bug this finds:** pointers into the base archive relocated with the
/// top archive's delta
#[test]
fn test_dynamic_archive_points_into_mapped_base() {
    let base_built = build(&GraphFixture::new(false).graph, core_config());
    let base_file = WrittenArchive::new(&base_built);
    let base_mapped = map_at(&base_file, 0x3_0000_0000);
    let base_main = base_mapped.classes().unwrap()[0].offset;
    let base = base_mapped.as_base_archive("base.farc");

    let mut graph = MemoryGraph::new();
    let plugin = add_class(&mut graph, "app/Plugin");
    graph
        .set_pointer(plugin, 16, SourceAddr(base_main.at(0x3_0000_0000)))
        .unwrap();
    let live = LiveVtables::standard();
    let top_built = farc::ArchiveBuilder::new(core_config(), &graph, &live)
        .unwrap()
        .with_base_archive(base.clone())
        .build()
        .unwrap();
    assert_eq!(top_built.stats.redirected, 1);
    assert_eq!(
        top_built.requested_base.raw(),
        base_built.requested_base.raw() + base_built.core_size() as u64
    );

    let written = WrittenArchive::new(&top_built);
    let file = written.open(&core_config());
    assert!(file.header().is_dynamic());
    assert_eq!(file.base_archive_name(), Some("base.farc"));

    let options = MapOptions {
        relocate_to: Some(0x40_0000_0000),
        base_archive: Some(base.clone()),
    };
    let mapped = MappedArchive::map(&file, options).unwrap();
    let plugin_offset = mapped.classes().unwrap()[0].offset;
    assert_eq!(
        mapped.read_word(plugin_offset.add(16)).unwrap(),
        base_main.at(0x3_0000_0000)
    );

    assert!(matches!(
        MappedArchive::map(&file, MapOptions::default()),
        Err(ArchiveError::InvalidArgument(_))
    ));
    let stale = farc::BaseArchive {
        header_crc: base.header_crc ^ 1,
        ..base
    };
    let options = MapOptions {
        relocate_to: None,
        base_archive: Some(stale),
    };
    assert!(matches!(
        MappedArchive::map(&file, options),
        Err(ArchiveError::ChecksumMismatch { .. })
    ));
}

/// Region records are what the writer placed
#[test]
fn test_region_records_cover_the_file() {
    let built = build(&GraphFixture::new(false).graph, core_config());
    let written = WrittenArchive::new(&built);
    let file = written.open(&core_config());
    let header = file.header();

    assert_eq!(file.region_bytes(RegionIndex::ReadWrite), &built.rw[..]);
    assert_eq!(file.region_bytes(RegionIndex::ReadOnly), &built.ro[..]);
    assert_eq!(file.ptrmap().unwrap(), built.ptrmap);
    assert!(RegionIndex::HEAP.iter().all(|&i| header.region(i).is_empty()));
    assert_eq!(
        header.fields().cloned_vtables_offset,
        built.cloned_vtables_offset.0
    );
    assert_eq!(ArchiveOffset(header.fields().serialized_data_offset), built.serialized_data_offset);
}
