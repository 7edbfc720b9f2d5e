// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use alloc::vec::Vec;
use bolero::check;

fn collect(set: &RangeSet) -> Vec<(u64, u64)> {
    set.iter().map(|i| (i.start, i.end)).collect()
}

#[test]
fn merge_overlapping_and_adjacent() {
    let mut set = RangeSet::new();

    assert!(set.insert(0, 4).updated);
    assert!(set.insert(8, 12).updated);
    assert_eq!(set.interval_len(), 2);

    // fill the gap, all three merge
    let insertion = set.insert(4, 8);
    assert!(insertion.updated);
    assert_eq!(insertion.index, 0);
    assert_eq!(collect(&set), [(0, 12)]);

    // fully covered insert reports no update
    let insertion = set.insert(3, 9);
    assert!(!insertion.updated);
    assert_eq!(collect(&set), [(0, 12)]);

    // partial overlap extends and reports an update
    assert!(set.insert(10, 15).updated);
    assert_eq!(collect(&set), [(0, 15)]);
}

#[test]
fn insert_reports_merged_index() {
    let mut set = RangeSet::new();
    set.insert(0, 2);
    set.insert(10, 12);
    set.insert(20, 22);

    let insertion = set.insert(11, 15);
    assert_eq!(insertion.index, 1);
    assert_eq!(set.get(insertion.index), Some(Interval::new(10, 15)));
}

#[test]
fn remove_below_trims_straddler() {
    let mut set = RangeSet::new();
    set.insert(0, 5);
    set.insert(8, 12);
    set.insert(20, 21);

    set.remove_below(9);
    assert_eq!(collect(&set), [(9, 12), (20, 21)]);

    set.remove_below(100);
    assert!(set.is_empty());
}

#[test]
fn eviction_drops_lowest() {
    let mut set = RangeSet::with_limit(2);
    set.insert(0, 1);
    set.insert(10, 11);
    set.insert(20, 21);
    assert_eq!(collect(&set), [(10, 11), (20, 21)]);
    assert!(!set.contains(0));
}

#[test]
fn contains_and_first_above() {
    let mut set = RangeSet::new();
    set.insert(5, 10);
    set.insert(15, 20);

    assert!(!set.contains(4));
    assert!(set.contains(5));
    assert!(set.contains(9));
    assert!(!set.contains(10));

    assert_eq!(set.first_above(0), Some((0, Interval::new(5, 10))));
    assert_eq!(set.first_above(9), Some((0, Interval::new(5, 10))));
    assert_eq!(set.first_above(10), Some((1, Interval::new(15, 20))));
    assert_eq!(set.first_above(20), None);
}

#[test]
fn count_and_max_value() {
    let mut set = RangeSet::new();
    assert_eq!(set.max_value(), None);
    set.insert(1, 4);
    set.insert(10, 11);
    assert_eq!(set.count(), 4);
    assert_eq!(set.max_value(), Some(10));
}

/// Inserting the same multiset of ranges in any order yields the same set
#[test]
#[cfg_attr(miri, ignore)] // too expensive for miri
fn insertion_is_commutative() {
    check!()
        .with_type::<(Vec<(u8, u8)>, u8)>()
        .cloned()
        .for_each(|(ranges, pivot)| {
            let ranges: Vec<_> = ranges
                .iter()
                .filter(|(start, len)| *len > 0 && (*start as u64 + *len as u64) < u64::MAX)
                .map(|(start, len)| (*start as u64, *start as u64 + *len as u64))
                .collect();

            let mut forward = RangeSet::new();
            for (start, end) in ranges.iter() {
                forward.insert(*start, *end);
            }

            let mut rotated = RangeSet::new();
            let pivot = if ranges.is_empty() {
                0
            } else {
                pivot as usize % ranges.len()
            };
            for (start, end) in ranges[pivot..].iter().chain(ranges[..pivot].iter()) {
                rotated.insert(*start, *end);
            }

            assert_eq!(collect(&forward), collect(&rotated));
        });
}
