// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flow-controlled reassembly buffer.
//!
//! [`RecvBuffer`] accepts stream data at arbitrary offsets, enforces the
//! receive window, reassembles contiguous runs, and adapts the window to the
//! application's drain rate: when the application drains more than
//! `1/DRAIN_RATIO` of the window within one RTT, the window doubles (up to
//! the configured maximum).

use crate::time::Timestamp;
use alloc::{collections::VecDeque, vec::Vec};
use core::time::Duration;

/// The fraction of the window that must be drained within an RTT before the
/// window grows
pub const DRAIN_RATIO: u64 = 4;

/// Storage strategy for received bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMode {
    /// One preallocated ring; the window never grows
    Circular,
    /// Chained chunks allocated on demand; the window adapts to drain rate
    Multiple,
    /// Capacity is provided by the application via `provide_chunks`
    AppOwned,
}

/// The outcome of a successful write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// True if new bytes became readable at the front of the buffer
    pub data_ready: bool,
    /// The new flow-control high-water mark to advertise
    pub flow_control_limit: u64,
}

/// Write failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The write extends beyond the advertised receive window
    FlowControlExceeded,
}

#[derive(Debug)]
struct Slot {
    offset: u64,
    data: Vec<u8>,
}

impl Slot {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Re-assembly buffer with a virtual receive window
#[derive(Debug)]
pub struct RecvBuffer {
    mode: RecvMode,
    /// First byte not yet delivered to the application
    base_offset: u64,
    /// Size of the advertised window beyond `base_offset`
    virtual_len: u64,
    max_virtual_len: u64,
    /// Sorted, non-overlapping runs of received bytes at or above
    /// `base_offset`
    slots: VecDeque<Slot>,
    /// Bytes drained since the window epoch began
    drained_in_epoch: u64,
    epoch_start: Option<Timestamp>,
}

impl RecvBuffer {
    pub fn new(mode: RecvMode, virtual_len: u64, max_virtual_len: u64) -> Self {
        debug_assert!(virtual_len <= max_virtual_len);
        Self {
            mode,
            base_offset: 0,
            virtual_len,
            max_virtual_len,
            slots: VecDeque::new(),
            drained_in_epoch: 0,
            epoch_start: None,
        }
    }

    /// The first byte offset not yet delivered to the application
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The largest offset the peer may send to
    #[inline]
    pub fn flow_control_limit(&self) -> u64 {
        self.base_offset + self.virtual_len
    }

    /// The number of contiguous bytes ready for delivery
    pub fn readable_len(&self) -> usize {
        let mut cursor = self.base_offset;
        let mut len = 0usize;
        for slot in &self.slots {
            if slot.offset != cursor {
                break;
            }
            len += slot.data.len();
            cursor = slot.end();
        }
        len
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.slots
            .front()
            .map(|slot| slot.offset == self.base_offset)
            .unwrap_or(false)
    }

    /// The highest offset that has been written
    pub fn max_received(&self) -> u64 {
        self.slots.back().map(Slot::end).unwrap_or(self.base_offset)
    }

    /// Accepts `data` at the absolute `offset`.
    ///
    /// Duplicate and overlapping bytes are discarded. A write that would
    /// cross the flow-control limit fails and the caller closes the
    /// connection.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<WriteOutcome, Error> {
        let end = offset + data.len() as u64;

        if end > self.flow_control_limit() {
            return Err(Error::FlowControlExceeded);
        }

        let was_readable = self.is_readable();

        if end > self.base_offset && !data.is_empty() {
            // clip the part already delivered
            let (offset, data) = if offset < self.base_offset {
                let skip = (self.base_offset - offset) as usize;
                (self.base_offset, &data[skip..])
            } else {
                (offset, data)
            };
            self.insert(offset, data);
        }

        Ok(WriteOutcome {
            data_ready: self.is_readable() && !was_readable,
            flow_control_limit: self.flow_control_limit(),
        })
    }

    /// Inserts `[offset, offset+len)` skipping any bytes already present
    fn insert(&mut self, mut offset: u64, mut data: &[u8]) {
        let mut index = self.slots.partition_point(|slot| slot.end() < offset);

        while !data.is_empty() {
            let current = self.slots.get(index).map(|slot| (slot.offset, slot.end()));

            match current {
                Some((slot_offset, slot_end)) if slot_offset <= offset => {
                    // starts inside (or at the edge of) an existing slot:
                    // append the non-overlapping tail to it
                    let overlap = (slot_end - offset) as usize;
                    if overlap >= data.len() {
                        return;
                    }
                    let tail = &data[overlap..];
                    offset = slot_end;

                    // absorb into this slot up to the start of the next one
                    let take = match self.slots.get(index + 1) {
                        Some(next) => ((next.offset - offset) as usize).min(tail.len()),
                        None => tail.len(),
                    };
                    self.slots[index].data.extend_from_slice(&tail[..take]);
                    offset += take as u64;
                    data = &tail[take..];
                    index += 1;
                }
                Some((slot_offset, _)) if slot_offset < offset + data.len() as u64 => {
                    // a later slot starts inside the write: fill the gap,
                    // then continue past that slot
                    let gap = (slot_offset - offset) as usize;
                    self.slots.insert(
                        index,
                        Slot {
                            offset,
                            data: data[..gap].to_vec(),
                        },
                    );
                    offset += gap as u64;
                    data = &data[gap..];
                    index += 1;
                }
                _ => {
                    // entirely new tail
                    self.slots.insert(
                        index,
                        Slot {
                            offset,
                            data: data.to_vec(),
                        },
                    );
                    return;
                }
            }
        }
    }

    /// Copies readable bytes into `dest` and drains them, returning the
    /// number of bytes delivered.
    ///
    /// `now` and `smoothed_rtt` drive the window-reopen policy.
    pub fn read(&mut self, dest: &mut [u8], now: Timestamp, smoothed_rtt: Duration) -> usize {
        let mut copied = 0usize;

        while copied < dest.len() {
            let Some(slot) = self.slots.front_mut() else {
                break;
            };
            if slot.offset != self.base_offset {
                break;
            }

            let take = slot.data.len().min(dest.len() - copied);
            dest[copied..copied + take].copy_from_slice(&slot.data[..take]);
            copied += take;

            if take == slot.data.len() {
                self.slots.pop_front();
            } else {
                let slot = self.slots.front_mut().expect("slot still present");
                slot.data.drain(..take);
                slot.offset += take as u64;
            }
            self.base_offset += take as u64;
        }

        if copied > 0 {
            self.on_drain(copied as u64, now, smoothed_rtt);
        }

        copied
    }

    /// Advances the base offset without copying; used when delivery happened
    /// out of band (application-owned chunks)
    pub fn drain(&mut self, len: u64, now: Timestamp, smoothed_rtt: Duration) {
        let target = self.base_offset + len;
        while let Some(slot) = self.slots.front_mut() {
            if slot.end() <= target {
                self.slots.pop_front();
            } else if slot.offset < target {
                let take = (target - slot.offset) as usize;
                slot.data.drain(..take);
                slot.offset = target;
                break;
            } else {
                break;
            }
        }
        self.base_offset = self.base_offset.max(target);
        self.on_drain(len, now, smoothed_rtt);
    }

    /// Window-reopen policy: double the window if the application drained
    /// more than `1/DRAIN_RATIO` of it within one RTT
    fn on_drain(&mut self, len: u64, now: Timestamp, smoothed_rtt: Duration) {
        if matches!(self.mode, RecvMode::Circular | RecvMode::AppOwned) {
            // fixed-capacity modes never grow on their own
            return;
        }

        let epoch_start = *self.epoch_start.get_or_insert(now);
        self.drained_in_epoch += len;

        if now.saturating_duration_since(epoch_start) > smoothed_rtt {
            // stale epoch; restart measurement with this drain
            self.epoch_start = Some(now);
            self.drained_in_epoch = len;
        }

        if self.drained_in_epoch > self.virtual_len / DRAIN_RATIO {
            self.virtual_len = (self.virtual_len * 2).min(self.max_virtual_len);
            self.epoch_start = Some(now);
            self.drained_in_epoch = 0;
        }
    }

    /// Adds application-provided capacity (app-owned mode), returning the
    /// new flow-control limit to advertise
    pub fn provide_chunks(&mut self, additional: u64) -> u64 {
        debug_assert!(matches!(self.mode, RecvMode::AppOwned));
        self.virtual_len = self.virtual_len.saturating_add(additional);
        self.flow_control_limit()
    }

    /// Releases all buffered data; used when the receive half terminates
    pub fn reset(&mut self) {
        self.slots.clear();
        self.drained_in_epoch = 0;
        self.epoch_start = None;
    }
}
