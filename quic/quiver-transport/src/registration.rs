// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide library state.
//!
//! Initialized lazily on first use and shared by every registration:
//! the partition layout, the correlation-id allocator, and the per-partition
//! performance counters (summed on query so the hot path never contends on
//! a single cache line).

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters each partition maintains independently
#[derive(Debug, Default)]
pub struct PartitionCounters {
    pub connections_created: AtomicU64,
    pub connections_destroyed: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
}

#[derive(Debug)]
pub struct LibraryState {
    partition_count: usize,
    next_correlation_id: AtomicU64,
    counters: Vec<PartitionCounters>,
}

impl LibraryState {
    fn new() -> Self {
        let partition_count = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let counters = (0..partition_count)
            .map(|_| PartitionCounters::default())
            .collect();
        Self {
            partition_count,
            next_correlation_id: AtomicU64::new(1),
            counters,
        }
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Allocates a process-unique correlation id
    #[inline]
    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn counters(&self, partition: usize) -> &PartitionCounters {
        &self.counters[partition % self.partition_count]
    }

    /// Sums one counter across every partition
    pub fn sum<F: Fn(&PartitionCounters) -> &AtomicU64>(&self, field: F) -> u64 {
        self.counters
            .iter()
            .map(|counters| field(counters).load(Ordering::Relaxed))
            .sum()
    }
}

/// The process-wide instance
pub fn library() -> &'static LibraryState {
    static LIBRARY: Lazy<LibraryState> = Lazy::new(LibraryState::new);
    &LIBRARY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let library = library();
        let first = library.next_correlation_id();
        let second = library.next_correlation_id();
        assert_ne!(first, second);
    }

    #[test]
    fn counters_sum_across_partitions() {
        let library = library();
        let partitions = library.partition_count();

        library
            .counters(0)
            .packets_sent
            .fetch_add(2, Ordering::Relaxed);
        library
            .counters(partitions.saturating_sub(1))
            .packets_sent
            .fetch_add(3, Ordering::Relaxed);

        assert!(library.sum(|counters| &counters.packets_sent) >= 5);
    }
}
