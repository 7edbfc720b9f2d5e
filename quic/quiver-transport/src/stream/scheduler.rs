// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Priority-ordered send scheduling.
//!
//! Streams with pending data queue in descending priority order; equal
//! priorities round-robin, each stream keeping the head for
//! `STREAM_SEND_BATCH_COUNT` packets before yielding to its class.

use crate::config::STREAM_SEND_BATCH_COUNT;
use quiver_core::stream::StreamId;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct Entry {
    id: StreamId,
    priority: u16,
    batch_remaining: u32,
}

/// The connection's priority-ordered list of sendable streams
#[derive(Debug, Default)]
pub struct SendScheduler {
    queue: VecDeque<Entry>,
}

impl SendScheduler {
    /// Queues a stream at its priority; a no-op if already queued
    pub fn insert(&mut self, id: StreamId, priority: u16) {
        if self.queue.iter().any(|entry| entry.id == id) {
            return;
        }
        // after every entry of equal priority, before the first lower one
        let index = self
            .queue
            .partition_point(|entry| entry.priority >= priority);
        self.queue.insert(
            index,
            Entry {
                id,
                priority,
                batch_remaining: STREAM_SEND_BATCH_COUNT,
            },
        );
    }

    /// Removes a stream (it has nothing left to send)
    pub fn remove(&mut self, id: StreamId) {
        self.queue.retain(|entry| entry.id != id);
    }

    /// Moves a queued stream to its new priority position
    pub fn update_priority(&mut self, id: StreamId, priority: u16) {
        if self.queue.iter().any(|entry| entry.id == id) {
            self.remove(id);
            self.insert(id, priority);
        }
    }

    /// The stream that should send next
    #[inline]
    pub fn peek(&self) -> Option<StreamId> {
        self.queue.front().map(|entry| entry.id)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Iterates the queue in send order
    pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.queue.iter().map(|entry| entry.id)
    }

    /// Records that the head stream contributed to a packet; after a full
    /// batch it rotates behind its priority peers
    pub fn on_packet_written(&mut self, id: StreamId) {
        let Some(front) = self.queue.front_mut() else {
            return;
        };
        if front.id != id {
            return;
        }

        front.batch_remaining = front.batch_remaining.saturating_sub(1);
        if front.batch_remaining > 0 {
            return;
        }

        let mut entry = self.queue.pop_front().expect("checked above");
        entry.batch_remaining = STREAM_SEND_BATCH_COUNT;

        // re-insert after the last entry of the same priority
        let index = self
            .queue
            .partition_point(|other| other.priority >= entry.priority);
        self.queue.insert(index, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{endpoint, stream::StreamType};

    fn id(n: u64) -> StreamId {
        StreamId::nth(endpoint::Type::Client, StreamType::Bidirectional, n).unwrap()
    }

    #[test]
    fn orders_by_priority() {
        let mut scheduler = SendScheduler::default();
        scheduler.insert(id(0), 10);
        scheduler.insert(id(1), 30);
        scheduler.insert(id(2), 20);

        let order: Vec<_> = scheduler.iter().collect();
        assert_eq!(order, [id(1), id(2), id(0)]);
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let mut scheduler = SendScheduler::default();
        scheduler.insert(id(0), 10);
        scheduler.insert(id(1), 10);
        scheduler.insert(id(2), 10);

        let order: Vec<_> = scheduler.iter().collect();
        assert_eq!(order, [id(0), id(1), id(2)]);
    }

    #[test]
    fn batch_exhaustion_rotates_within_class() {
        let mut scheduler = SendScheduler::default();
        scheduler.insert(id(0), 10);
        scheduler.insert(id(1), 10);
        scheduler.insert(id(2), 5);

        for _ in 0..STREAM_SEND_BATCH_COUNT {
            assert_eq!(scheduler.peek(), Some(id(0)));
            scheduler.on_packet_written(id(0));
        }

        // the exhausted stream rotated behind its equal-priority peer but
        // stays ahead of the lower class
        let order: Vec<_> = scheduler.iter().collect();
        assert_eq!(order, [id(1), id(0), id(2)]);
    }

    #[test]
    fn priority_change_moves_entry() {
        let mut scheduler = SendScheduler::default();
        scheduler.insert(id(0), 10);
        scheduler.insert(id(1), 20);

        scheduler.update_priority(id(0), 30);
        assert_eq!(scheduler.peek(), Some(id(0)));
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut scheduler = SendScheduler::default();
        scheduler.insert(id(0), 10);
        scheduler.insert(id(0), 10);
        assert_eq!(scheduler.iter().count(), 1);
    }
}
