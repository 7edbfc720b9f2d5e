// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The cooperative connection scheduler.
//!
//! A worker owns its connections outright (the arena replaces the
//! back-pointer graph of a pointer-linked design): external callers refer
//! to a connection by id and talk to it through the worker's operation
//! queues. Each loop iteration fires expired timers, drains one ready
//! connection for a bounded batch of operations, and processes one
//! stateless operation; a connection being processed that gets more work
//! re-queues itself at the batch boundary instead of being entered twice.

pub mod pool;
pub mod timer_wheel;

pub use pool::BufferPool;
pub use timer_wheel::TimerWheel;

use crate::{
    config::{
        MAX_OPERATIONS_PER_DRAIN, STATELESS_OPERATION_EXPIRATION,
        WORKER_QUEUE_DELAY_SMOOTHING_SHIFT,
    },
    connection::Connection,
};
use bytes::Bytes;
use hashbrown::HashMap;
use quiver_core::{
    crypto::tls,
    random,
    stream::{StreamId, StreamType},
    time::Timestamp,
    transport::error::ApplicationError,
};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// An operation posted to a connection from outside its worker
#[derive(Debug)]
pub enum Operation {
    StreamOpen { stream_type: StreamType },
    StreamWrite { id: StreamId, data: Bytes },
    StreamFinish { id: StreamId },
    StreamReset {
        id: StreamId,
        error: ApplicationError,
        reliable_size: Option<u64>,
    },
    StreamPriority { id: StreamId, priority: u16 },
    ConnectionShutdown { error: ApplicationError },
    /// An async TLS provider finished its work
    TlsComplete,
    /// Migrate the connection to another worker at the next boundary
    UpdateWorker { target: u16 },
}

/// Work not tied to any live connection (version negotiation, stateless
/// reset, retry issuance), queued with an expiration
#[derive(Debug)]
pub struct StatelessOperation {
    pub remote_address: SocketAddr,
    pub datagram: Vec<u8>,
    pub queued_at: Timestamp,
}

/// Scheduling bits per connection, the engine-internal equivalent of a
/// worker-lock-protected flag pair
#[derive(Debug, Default)]
struct ScheduleState {
    processing: bool,
    has_queued_work: bool,
    has_priority_work: bool,
    operations: VecDeque<Operation>,
}

/// What one loop iteration accomplished
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    pub did_work: bool,
    /// A connection asked to move to another worker
    pub handoff: Option<(u64, u16)>,
}

pub struct Worker<S: tls::Session> {
    /// The connections this worker owns
    connections: HashMap<u64, Connection<S>>,
    schedule: HashMap<u64, ScheduleState>,
    ready: VecDeque<u64>,
    priority_ready: VecDeque<u64>,
    stateless: VecDeque<StatelessOperation>,
    pub timers: TimerWheel,
    /// Recycled egress datagram buffers
    datagram_pool: BufferPool,
    rng: crate::random::Generator,
    /// Exponentially-smoothed queue delay, in microseconds
    average_queue_delay: u64,
    /// Outbound datagrams produced by connection processing
    pub egress: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl<S: tls::Session> Default for Worker<S> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            schedule: HashMap::new(),
            ready: VecDeque::new(),
            priority_ready: VecDeque::new(),
            stateless: VecDeque::new(),
            timers: TimerWheel::default(),
            datagram_pool: BufferPool::new(1500, 64),
            rng: crate::random::Generator::default(),
            average_queue_delay: 0,
            egress: VecDeque::new(),
        }
    }
}

impl<S: tls::Session> Worker<S> {
    /// Takes ownership of a connection
    pub fn insert_connection(&mut self, id: u64, connection: Connection<S>) {
        if let Some(deadline) = connection.next_timeout() {
            self.timers.arm(id, deadline);
        }
        self.connections.insert(id, connection);
        self.schedule.insert(id, ScheduleState::default());
    }

    /// Releases a connection for handoff to another worker
    pub fn remove_connection(&mut self, id: u64) -> Option<Connection<S>> {
        self.timers.cancel(id);
        self.schedule.remove(&id);
        self.ready.retain(|ready| *ready != id);
        self.priority_ready.retain(|ready| *ready != id);
        self.connections.remove(&id)
    }

    #[inline]
    pub fn connection_mut(&mut self, id: u64) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn rng(&mut self) -> &mut dyn random::Generator {
        &mut self.rng
    }

    /// Posts an operation to a connection and marks it ready.
    ///
    /// Enqueueing is idempotent: a connection currently being processed
    /// only gets its queued-work bit set; the processor re-queues it at
    /// the batch boundary.
    pub fn post(&mut self, id: u64, operation: Operation, priority: bool) {
        let Some(state) = self.schedule.get_mut(&id) else {
            return;
        };
        state.operations.push_back(operation);
        state.has_priority_work |= priority;

        if state.processing {
            state.has_queued_work = true;
            return;
        }
        if !state.has_queued_work {
            state.has_queued_work = true;
            if priority {
                self.priority_ready.push_back(id);
            } else {
                self.ready.push_back(id);
            }
        }
    }

    /// Marks a connection ready without an operation (incoming datagram,
    /// timer, send unblocked)
    pub fn wake(&mut self, id: u64) {
        let Some(state) = self.schedule.get_mut(&id) else {
            return;
        };
        if state.processing {
            state.has_queued_work = true;
            return;
        }
        if !state.has_queued_work {
            state.has_queued_work = true;
            self.ready.push_back(id);
        }
    }

    /// Queues a stateless operation
    pub fn post_stateless(&mut self, operation: StatelessOperation) {
        self.stateless.push_back(operation);
    }

    /// Returns a consumed egress buffer to the pool
    pub fn recycle_buffer(&mut self, buffer: Vec<u8>) {
        self.datagram_pool.put(buffer);
    }

    /// The earliest reason to wake this worker
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Smoothed queue delay, the pool's load-balancing metric
    #[inline]
    pub fn average_queue_delay(&self) -> u64 {
        self.average_queue_delay
    }

    /// Folds a new delay sample into the 7/8-smoothed average
    pub fn record_queue_delay(&mut self, delay_micros: u64) {
        let old = self.average_queue_delay;
        self.average_queue_delay =
            old - (old >> WORKER_QUEUE_DELAY_SMOOTHING_SHIFT)
                + (delay_micros >> WORKER_QUEUE_DELAY_SMOOTHING_SHIFT);
    }

    /// One scheduler iteration: timers, one connection batch, one
    /// stateless operation
    pub fn run_once(&mut self, now: Timestamp) -> LoopOutcome {
        let mut outcome = LoopOutcome::default();

        // expired timers put their connections back on the ready queue
        for id in self.timers.expire(now) {
            if let Some(connection) = self.connections.get_mut(&id) {
                connection.on_timeout(now, &mut self.rng);
                outcome.did_work = true;
            }
            self.wake(id);
        }

        // one connection, bounded batch
        let next = self
            .priority_ready
            .pop_front()
            .or_else(|| self.ready.pop_front());
        if let Some(id) = next {
            outcome.did_work = true;
            if let Some(handoff) = self.process_connection(id, now) {
                outcome.handoff = Some(handoff);
            }
        }

        // one stateless operation, dropping any that expired in queue
        while let Some(op) = self.stateless.pop_front() {
            if now.saturating_duration_since(op.queued_at) > STATELESS_OPERATION_EXPIRATION {
                continue;
            }
            // the endpoint layer turns these into response datagrams; the
            // worker only meters them
            outcome.did_work = true;
            self.egress.push_back((op.datagram, op.remote_address));
            break;
        }

        outcome
    }

    /// Drains one connection's operations and flushes its sends
    fn process_connection(&mut self, id: u64, now: Timestamp) -> Option<(u64, u16)> {
        let state = self.schedule.get_mut(&id)?;
        state.processing = true;
        state.has_queued_work = false;
        state.has_priority_work = false;

        let mut operations: SmallOps = SmallOps::new();
        for _ in 0..MAX_OPERATIONS_PER_DRAIN {
            match state.operations.pop_front() {
                Some(operation) => operations.push(operation),
                None => break,
            }
        }
        let mut handoff = None;

        if let Some(connection) = self.connections.get_mut(&id) {
            for operation in operations.drain() {
                match operation {
                    Operation::StreamOpen { stream_type } => {
                        let _ = connection.streams.open_local(stream_type);
                    }
                    Operation::StreamWrite { id: stream_id, data } => {
                        let _ = connection.streams.write(stream_id, &data);
                        connection.send_pending = true;
                    }
                    Operation::StreamFinish { id: stream_id } => {
                        let _ = connection.streams.finish(stream_id);
                        connection.send_pending = true;
                    }
                    Operation::StreamReset {
                        id: stream_id,
                        error,
                        reliable_size,
                    } => {
                        let _ = connection.streams.reset(stream_id, error, reliable_size);
                        connection.send_pending = true;
                    }
                    Operation::StreamPriority { id: stream_id, priority } => {
                        let _ = connection.streams.set_priority(stream_id, priority);
                    }
                    Operation::ConnectionShutdown { error } => {
                        connection.shutdown(error, now);
                    }
                    Operation::TlsComplete => {
                        // the crypto stream drains queued data on re-entry
                        connection.send_pending = true;
                    }
                    Operation::UpdateWorker { target } => {
                        tracing::debug!(id, target, "worker reassignment requested");
                        connection.on_worker_update(target);
                        handoff = Some((id, target));
                    }
                }
            }

            if connection.send_pending {
                let egress = &mut self.egress;
                let pool = &mut self.datagram_pool;
                let _ = connection.flush(now, &mut self.rng, &mut |datagram, remote| {
                    let mut buffer = pool.take();
                    buffer.truncate(datagram.len());
                    buffer.copy_from_slice(datagram);
                    egress.push_back((buffer, remote));
                });
            }

            if let Some(deadline) = connection.next_timeout() {
                self.timers.arm(id, deadline);
            } else {
                self.timers.cancel(id);
            }
        }

        let state = self.schedule.get_mut(&id)?;
        state.processing = false;
        // work that arrived mid-batch re-queues the connection
        if state.has_queued_work || !state.operations.is_empty() {
            state.has_queued_work = true;
            self.ready.push_back(id);
        }

        handoff
    }
}

/// A tiny fixed-capacity operation batch
struct SmallOps {
    ops: smallvec::SmallVec<[Operation; MAX_OPERATIONS_PER_DRAIN]>,
}

impl SmallOps {
    fn new() -> Self {
        Self {
            ops: smallvec::SmallVec::new(),
        }
    }

    fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    fn drain(&mut self) -> impl Iterator<Item = Operation> + '_ {
        self.ops.drain(..)
    }
}

/// Load metadata the pool keeps per worker
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerLoad {
    pub average_queue_delay: u64,
}

/// Picks workers for new connections by smoothed queue delay, breaking
/// ties round-robin
#[derive(Debug, Default)]
pub struct WorkerPool {
    loads: Vec<WorkerLoad>,
    last_picked: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            loads: vec![WorkerLoad::default(); worker_count],
            last_picked: 0,
        }
    }

    pub fn update_load(&mut self, worker: usize, average_queue_delay: u64) {
        if let Some(load) = self.loads.get_mut(worker) {
            load.average_queue_delay = average_queue_delay;
        }
    }

    /// The least-loaded worker; ties go to the worker following the last
    /// pick in round-robin order
    pub fn pick(&mut self) -> usize {
        debug_assert!(!self.loads.is_empty());
        let count = self.loads.len();
        let mut best = None;

        for offset in 1..=count {
            let index = (self.last_picked + offset) % count;
            let delay = self.loads[index].average_queue_delay;
            let better = match best {
                None => true,
                Some((_, best_delay)) => delay < best_delay,
            };
            if better {
                best = Some((index, delay));
            }
        }

        let (index, _) = best.expect("at least one worker");
        self.last_picked = index;
        index
    }
}
