// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-worker object pools.
//!
//! Workers recycle their datagram buffers (and any other per-operation
//! allocations) through a bounded free list, so the steady-state send path
//! allocates nothing.

/// A bounded free list of reusable buffers
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Vec::new(),
            buffer_capacity,
            max_pooled,
        }
    }

    /// Takes a cleared buffer with the pool's capacity
    pub fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(self.buffer_capacity, 0);
                buffer
            }
            None => vec![0u8; self.buffer_capacity],
        }
    }

    /// Returns a buffer for reuse; excess buffers are dropped
    pub fn put(&mut self, buffer: Vec<u8>) {
        if self.free.len() < self.max_pooled && buffer.capacity() >= self.buffer_capacity {
            self.free.push(buffer);
        }
    }

    #[inline]
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_recycle() {
        let mut pool = BufferPool::new(1500, 4);
        let buffer = pool.take();
        assert_eq!(buffer.len(), 1500);

        pool.put(buffer);
        assert_eq!(pool.pooled(), 1);

        let again = pool.take();
        assert_eq!(again.len(), 1500);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = BufferPool::new(64, 2);
        for _ in 0..5 {
            let buffer = pool.take();
            pool.put(buffer);
        }
        let first = pool.take();
        let second = pool.take();
        let third = pool.take();
        pool.put(first);
        pool.put(second);
        pool.put(third);
        assert_eq!(pool.pooled(), 2);
    }
}
