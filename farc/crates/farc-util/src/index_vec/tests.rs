//! Tests for the IndexVec module.

use super::*;
use quickcheck_macros::quickcheck;

crate::define_idx!(TestId);

#[test]
fn test_new_and_empty() {
    let vec: IndexVec<TestId, i32> = IndexVec::new();
    assert!(vec.is_empty());
    assert_eq!(vec.len(), 0);
    assert_eq!(vec.next_index(), TestId(0));
}

#[test]
fn test_push_and_index() {
    let mut vec: IndexVec<TestId, i32> = IndexVec::new();
    let idx1 = vec.push(10);
    let idx2 = vec.push(20);

    assert_eq!(vec[idx1], 10);
    assert_eq!(vec[idx2], 20);
    assert_eq!(idx2, TestId(1));

    vec[idx1] = 11;
    assert_eq!(vec.get(idx1), Some(&11));
    assert_eq!(vec.get(TestId(7)), None);
}

#[test]
fn test_iter_enumerated_preserves_order() {
    let vec: IndexVec<TestId, &str> = ["rw", "ro", "bm"].into_iter().collect();
    let pairs: Vec<_> = vec.iter_enumerated().map(|(i, s)| (i.0, *s)).collect();
    assert_eq!(pairs, vec![(0, "rw"), (1, "ro"), (2, "bm")]);
    assert_eq!(vec.indices().count(), 3);
}

#[test]
fn test_ids_stable_across_growth() {
    let mut vec: IndexVec<TestId, u64> = IndexVec::with_capacity(1);
    let first = vec.push(0xdead);
    for i in 0..10_000 {
        vec.push(i);
    }
    assert_eq!(vec[first], 0xdead);
}

#[quickcheck]
fn prop_push_returns_sequential_ids(values: Vec<u16>) -> bool {
    let mut vec: IndexVec<TestId, u16> = IndexVec::new();
    values
        .iter()
        .enumerate()
        .all(|(i, v)| vec.push(*v) == TestId(i as u32))
}
