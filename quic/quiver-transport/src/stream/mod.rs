// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application streams: send/receive halves, the stream table, and the
//! priority send scheduler

pub mod blocked;
pub mod manager;
pub mod recv;
pub mod scheduler;
pub mod send;

pub use manager::StreamManager;
pub use recv::{RecvState, RecvStream};
pub use send::{SendState, SendStream, StreamFrameInfo};

use blocked::BlockedTimings;

/// One application stream: up to two directions plus shared accounting
#[derive(Debug)]
pub struct Stream {
    pub send: Option<send::SendStream>,
    pub recv: Option<recv::RecvStream>,
    pub blocked: BlockedTimings,
    /// The application opted to keep the stream-count slot until it
    /// explicitly releases the stream
    pub delayed_id_release: bool,
    shutdown_complete_delivered: bool,
}

impl Stream {
    pub fn new(send: Option<send::SendStream>, recv: Option<recv::RecvStream>) -> Self {
        Self {
            send,
            recv,
            blocked: BlockedTimings::default(),
            delayed_id_release: false,
            shutdown_complete_delivered: false,
        }
    }

    /// True once both halves (where present) are terminal and nothing is
    /// left for the application to drain
    pub fn is_shutdown_complete(&self) -> bool {
        let send_done = self
            .send
            .as_ref()
            .map_or(true, |send| send.state().is_terminal());
        let recv_done = self.recv.as_ref().map_or(true, |recv| {
            recv.state().is_terminal()
                && (recv.state() == recv::RecvState::ResetRecvd || recv.readable_len() == 0)
        });
        send_done && recv_done
    }

    /// Marks the terminal event delivered; returns false if it already was
    pub fn mark_shutdown_delivered(&mut self) -> bool {
        if self.shutdown_complete_delivered {
            return false;
        }
        self.shutdown_complete_delivered = true;
        true
    }
}
