// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{random, time::Timestamp};
use core::time::Duration;

/// Per-packet context the bandwidth estimator needs from the loss detector
#[derive(Clone, Copy, Debug)]
pub struct AckedPacketInfo {
    pub sent_time: Timestamp,
    /// Bytes of this packet counted toward bytes in flight
    pub packet_length: u32,
    /// True if the sender was application-limited when this packet went out
    pub is_app_limited: bool,
    /// Lifetime bytes sent when this packet went out
    pub total_bytes_sent_then: u64,
    /// State captured from the newest acknowledged packet at send time
    pub last_acked: Option<LastAckedPacketInfo>,
}

/// A snapshot of acknowledgment progress taken when a packet is sent
#[derive(Clone, Copy, Debug)]
pub struct LastAckedPacketInfo {
    pub sent_time: Timestamp,
    pub ack_time: Timestamp,
    /// Ack receipt time minus the peer-reported ack delay
    pub adjusted_ack_time: Timestamp,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
}

/// Everything a congestion controller learns from one incoming ACK
#[derive(Clone, Copy, Debug)]
pub struct AckEvent<'a> {
    pub now: Timestamp,
    /// Send time of the largest newly-acknowledged packet
    pub largest_acked_sent_time: Timestamp,
    /// Receipt time adjusted by the peer's reported ack delay
    pub adjusted_ack_time: Timestamp,
    /// Newly-acknowledged bytes that counted toward bytes in flight
    pub num_retransmittable_bytes: u32,
    /// Lifetime acknowledged bytes on the path
    pub total_bytes_acked: u64,
    /// RTT sample produced by this ACK, if it yielded one
    pub min_rtt_sample: Option<Duration>,
    /// True when the ACK was synthesized (key discard, spurious-loss rewind)
    pub is_implicit: bool,
    /// True if the same ACK also declared packets lost
    pub has_loss: bool,
    pub is_largest_acked_packet_app_limited: bool,
    /// The acknowledged packets, oldest first
    pub acked_packets: &'a [AckedPacketInfo],
}

/// Everything a congestion controller learns from a loss declaration
#[derive(Clone, Copy, Debug)]
pub struct LossEvent {
    pub now: Timestamp,
    /// Lost bytes that counted toward bytes in flight
    pub num_retransmittable_bytes: u32,
    pub persistent_congestion: bool,
}

/// The dispatch surface shared by the BBR and Cubic controllers.
///
/// `on_data_*` methods returning `bool` report whether the connection
/// transitioned from blocked to unblocked, which re-arms the send path.
pub trait CongestionControl {
    fn can_send(&self) -> bool;

    /// Lets the next `packets` packets bypass the congestion window
    /// (probes, close frames)
    fn set_exemption(&mut self, packets: u8);

    fn get_exemptions(&self) -> u8;

    fn reset(&mut self, mtu: u16, full_reset: bool);

    /// Bytes the sender may put on the wire in this flush; enforces both
    /// the window and the pacing schedule
    fn get_send_allowance(&mut self, time_since_last_send: Option<Duration>) -> u32;

    fn on_data_sent(&mut self, bytes: u32, now: Timestamp);

    /// Sent bytes that will never be acknowledged (key discard)
    fn on_data_invalidated(&mut self, bytes: u32) -> bool;

    fn on_data_acknowledged(
        &mut self,
        event: &AckEvent,
        rng: &mut dyn random::Generator,
    ) -> bool;

    fn on_data_lost(&mut self, event: &LossEvent) -> bool;

    /// A previously-declared loss turned out to be reordering
    fn on_spurious_congestion_event(&mut self) -> bool;

    fn get_bytes_in_flight(&self) -> u32;

    fn get_bytes_in_flight_max(&self) -> u32;

    fn get_congestion_window(&self) -> u32;

    fn is_app_limited(&self) -> bool;

    /// The application ran out of data while the window still had room
    fn set_app_limited(&mut self, now: Timestamp);

    fn update_mtu(&mut self, mtu: u16);

    fn log_out_flow_status(&self);
}

/// The two available controllers; the variant is chosen by configuration,
/// so no dynamic dispatch is involved
#[derive(Debug, Clone)]
pub enum CongestionController {
    Bbr(super::bbr::BbrCongestionControl),
    Cubic(super::cubic::CubicCongestionControl),
}

macro_rules! dispatch {
    ($self:ident, |$inner:ident| $call:expr) => {
        match $self {
            CongestionController::Bbr($inner) => $call,
            CongestionController::Cubic($inner) => $call,
        }
    };
}

impl CongestionControl for CongestionController {
    fn can_send(&self) -> bool {
        dispatch!(self, |cc| cc.can_send())
    }

    fn set_exemption(&mut self, packets: u8) {
        dispatch!(self, |cc| cc.set_exemption(packets))
    }

    fn get_exemptions(&self) -> u8 {
        dispatch!(self, |cc| cc.get_exemptions())
    }

    fn reset(&mut self, mtu: u16, full_reset: bool) {
        dispatch!(self, |cc| cc.reset(mtu, full_reset))
    }

    fn get_send_allowance(&mut self, time_since_last_send: Option<Duration>) -> u32 {
        dispatch!(self, |cc| cc.get_send_allowance(time_since_last_send))
    }

    fn on_data_sent(&mut self, bytes: u32, now: Timestamp) {
        dispatch!(self, |cc| cc.on_data_sent(bytes, now))
    }

    fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        dispatch!(self, |cc| cc.on_data_invalidated(bytes))
    }

    fn on_data_acknowledged(&mut self, event: &AckEvent, rng: &mut dyn random::Generator) -> bool {
        dispatch!(self, |cc| cc.on_data_acknowledged(event, rng))
    }

    fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        dispatch!(self, |cc| cc.on_data_lost(event))
    }

    fn on_spurious_congestion_event(&mut self) -> bool {
        dispatch!(self, |cc| cc.on_spurious_congestion_event())
    }

    fn get_bytes_in_flight(&self) -> u32 {
        dispatch!(self, |cc| cc.get_bytes_in_flight())
    }

    fn get_bytes_in_flight_max(&self) -> u32 {
        dispatch!(self, |cc| cc.get_bytes_in_flight_max())
    }

    fn get_congestion_window(&self) -> u32 {
        dispatch!(self, |cc| cc.get_congestion_window())
    }

    fn is_app_limited(&self) -> bool {
        dispatch!(self, |cc| cc.is_app_limited())
    }

    fn set_app_limited(&mut self, now: Timestamp) {
        dispatch!(self, |cc| cc.set_app_limited(now))
    }

    fn update_mtu(&mut self, mtu: u16) {
        dispatch!(self, |cc| cc.update_mtu(mtu))
    }

    fn log_out_flow_status(&self) {
        dispatch!(self, |cc| cc.log_out_flow_status())
    }
}
