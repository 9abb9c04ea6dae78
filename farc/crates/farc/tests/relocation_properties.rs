//! Property Tests for Relocation and the Pointer Bitmap

mod common;

use common::*;
use farc::{MapOptions, MappedArchive, MemoryGraph, MetaKind, PtrMap};
use quickcheck_macros::quickcheck;

/// Wide graph: `classes` classes, each with a method pointing back at it
fn wide_graph(classes: u8) -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    for i in 0..classes.max(1) {
        let name = format!("gen/C{i:03}");
        let class = add_class(&mut graph, &name);
        let symbol = graph.add_symbol(&name);
        let method = graph.add_metadata(MetaKind::Method, 24).unwrap();
        graph.set_pointer(class, 8, symbol).unwrap();
        graph.set_pointer(class, 16, method).unwrap();
        graph.set_pointer(method, 8, class).unwrap();
    }
    graph
}

/// Any page-aligned base keeps every pointer inside the mapping at the
/// same offset
///
/// **Bug this finds:** delta applied to data words, or applied twice
#[quickcheck]
fn prop_any_base_preserves_offsets(classes: u8, page: u32) -> bool {
    let built = build(&wide_graph(classes % 40), core_config());
    let written = WrittenArchive::new(&built);
    let file = written.open(&core_config());
    let actual = 0x10_0000_0000 + page as u64 * TEST_ALIGNMENT as u64;
    let options = MapOptions {
        relocate_to: Some(actual),
        ..Default::default()
    };
    let mapped = MappedArchive::map(&file, options).unwrap();

    let requested = built.requested_base.raw();
    let image: Vec<u8> = built.rw.iter().chain(&built.ro).copied().collect();
    built.ptrmap.iter_set().all(|bit| {
        let at = bit * 8;
        let before = u64::from_le_bytes(image[at..at + 8].try_into().unwrap());
        let after = u64::from_le_bytes(mapped.bytes()[at..at + 8].try_into().unwrap());
        after.wrapping_sub(actual) == before - requested
            && after.wrapping_sub(actual) < mapped.size() as u64
    })
}

/// Set bits come back sorted, unique and complete
#[quickcheck]
fn prop_set_bits_are_exact(bits: Vec<u16>) -> bool {
    let mut map = PtrMap::with_size(1 << 16);
    for &bit in &bits {
        map.mark(bit as usize).unwrap();
    }
    let mut expected: Vec<usize> = bits.iter().map(|&b| b as usize).collect();
    expected.sort_unstable();
    expected.dedup();

    map.iter_set().collect::<Vec<_>>() == expected && map.count_set() == expected.len()
}

/// Compaction keeps every bit and cuts trailing zeros
#[quickcheck]
fn prop_compaction_keeps_bits(bits: Vec<u16>) -> bool {
    let mut map = PtrMap::with_size(1 << 16);
    for &bit in &bits {
        map.mark(bit as usize).unwrap();
    }
    let before: Vec<usize> = map.iter_set().collect();
    let size = map.compact().unwrap();

    let expected_size = before.last().map_or(0, |b| b + 1);
    size == expected_size
        && map.iter_set().collect::<Vec<_>>() == before
        && map.mark(0).is_err()
}
